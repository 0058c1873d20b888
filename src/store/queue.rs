//-
// Copyright (c) 2020, 2026, Jason Lingle
//
// This file is part of Rookery.
//
// Rookery is free software: you can redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Rookery is distributed in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Rookery. If not, see <http://www.gnu.org/licenses/>.

use rusqlite::OptionalExtension as _;

use super::{types::*, ConnectionExt as _, Store};
use crate::support::error::Error;

impl Store {
    /// Add a message to the outbound queue, ready for immediate delivery.
    pub fn enqueue(
        &self,
        sender: &str,
        recipient: &str,
        blob_key: &str,
    ) -> Result<OutboundMessage, Error> {
        let now = UnixTimestamp::now();
        let row = OutboundMessage {
            id: new_id(),
            sender: sender.to_owned(),
            recipient: recipient.to_owned(),
            blob_key: blob_key.to_owned(),
            status: QueueStatus::Pending,
            retry_count: 0,
            next_retry_at: now,
            last_error: None,
            created_at: now,
            updated_at: now,
        };

        self.cxn().execute(
            "INSERT INTO `queue` (\
               `id`, `sender`, `recipient`, `blob_key`, `status`, \
               `retry_count`, `next_retry_at`, `created_at`, `updated_at`\
             ) VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?)",
            (
                &row.id,
                &row.sender,
                &row.recipient,
                &row.blob_key,
                row.status,
                now,
                now,
                now,
            ),
        )?;

        Ok(row)
    }

    /// Claim the queued message which has been ready the longest, moving it
    /// to `PROCESSING`.
    ///
    /// The selection and the transition happen in one immediate transaction,
    /// so concurrent callers never claim the same row.
    pub fn lock_next_ready(
        &self,
        now: UnixTimestamp,
    ) -> Result<Option<OutboundMessage>, Error> {
        let mut cxn = self.cxn();
        let txn = cxn.write_tx()?;
        let row = txn
            .query_row(
                "UPDATE `queue` SET `status` = 'PROCESSING', `updated_at` = ?1 \
                 WHERE `id` = (\
                   SELECT `id` FROM `queue` \
                   WHERE `status` IN ('PENDING', 'RETRYING') \
                     AND `next_retry_at` <= ?1 \
                   ORDER BY `next_retry_at`, `created_at` \
                   LIMIT 1\
                 ) \
                 RETURNING *",
                (now,),
                from_row::<OutboundMessage>,
            )
            .optional()?;
        txn.commit()?;
        Ok(row)
    }

    /// Transition a queued message.
    ///
    /// Rows in a terminal state are never modified; returns whether the row
    /// was updated.
    pub fn update_status(
        &self,
        id: &str,
        status: QueueStatus,
        retry_count: u32,
        next_retry_at: UnixTimestamp,
        last_error: Option<&str>,
    ) -> Result<bool, Error> {
        let updated = self.cxn().execute(
            "UPDATE `queue` \
             SET `status` = ?, `retry_count` = ?, `next_retry_at` = ?, \
                 `last_error` = COALESCE(?, `last_error`), `updated_at` = ? \
             WHERE `id` = ? AND `status` NOT IN ('SENT', 'FAILED')",
            (
                status,
                retry_count,
                next_retry_at,
                last_error,
                UnixTimestamp::now(),
                id,
            ),
        )?;
        Ok(updated > 0)
    }

    /// Return every row left in `PROCESSING` to `RETRYING`, keeping its retry
    /// count. Used at startup, when no worker can still hold a claim.
    pub fn release_processing(&self) -> Result<usize, Error> {
        Ok(self.cxn().execute(
            "UPDATE `queue` SET `status` = 'RETRYING', `updated_at` = ? \
             WHERE `status` = 'PROCESSING'",
            (UnixTimestamp::now(),),
        )?)
    }

    pub fn find_outbound(&self, id: &str) -> Result<OutboundMessage, Error> {
        self.cxn()
            .prepare_cached("SELECT * FROM `queue` WHERE `id` = ?")?
            .query_row((id,), from_row)
            .optional()?
            .ok_or(Error::NotFound)
    }

    /// The whole queue, oldest first.
    pub fn list_queue(&self) -> Result<Vec<OutboundMessage>, Error> {
        self.cxn()
            .prepare("SELECT * FROM `queue` ORDER BY `created_at`, `id`")?
            .query_map((), from_row)?
            .collect::<Result<Vec<OutboundMessage>, _>>()
            .map_err(Into::into)
    }
}
