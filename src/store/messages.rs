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

use super::{
    mailboxes::{
        allocate_uid, canonical_mailbox_name, ensure_mailbox, new_modseq,
    },
    map_conflict,
    types::*,
    ConnectionExt as _, Store,
};
use crate::support::error::Error;

const DEFAULT_LIST_LIMIT: u32 = 50;
const MAX_LIST_LIMIT: u32 = 500;

/// Insert the metadata row for `row`, assigning its UID and modseq.
///
/// The destination mailbox is created if it does not yet exist. Several rows
/// may share a `Message-ID` (and a blob); only a collision of the
/// server-assigned id is an error.
fn save_message(
    cxn: &rusqlite::Connection,
    row: &NewMessage,
    received_at: UnixTimestamp,
) -> Result<Message, Error> {
    let mailbox = canonical_mailbox_name(&row.mailbox);
    ensure_mailbox(cxn, &row.recipient, mailbox)?;
    let (uid, modseq) = allocate_uid(cxn, &row.recipient, mailbox)?;
    let read_state = has_seen(&row.flags);

    cxn.prepare_cached(
        "INSERT INTO `messages` (\
           `id`, `message_id`, `sender`, `recipient`, `subject`, `snippet`, \
           `body_path`, `size`, `read_state`, `received_at`, `mailbox`, \
           `uid`, `flags`, `modseq`, `spf_result`, `dkim_result`, \
           `dmarc_result`, `dmarc_policy`\
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )?
    .execute(rusqlite::params![
        row.id,
        row.message_id,
        row.sender,
        row.recipient,
        row.subject,
        row.snippet,
        row.body_path,
        row.size as i64,
        read_state,
        received_at,
        mailbox,
        uid,
        join_flags(&row.flags),
        modseq,
        row.auth.spf,
        row.auth.dkim,
        row.auth.dmarc,
        row.auth.dmarc_policy,
    ])
    .map_err(map_conflict)?;

    Ok(Message {
        id: row.id.clone(),
        message_id: row.message_id.clone(),
        sender: row.sender.clone(),
        recipient: row.recipient.clone(),
        subject: row.subject.clone(),
        snippet: row.snippet.clone(),
        body_path: row.body_path.clone(),
        size: row.size,
        read_state,
        received_at,
        mailbox: mailbox.to_owned(),
        uid,
        flags: row.flags.clone(),
        modseq: modseq as u64,
        auth: row.auth,
    })
}

/// Add or replace the full-text entry of `message`.
fn index_message(
    cxn: &rusqlite::Connection,
    message: &Message,
    plaintext: &str,
) -> Result<(), Error> {
    cxn.prepare_cached("DELETE FROM `messages_fts` WHERE `id` = ?")?
        .execute((&message.id,))?;
    cxn.prepare_cached(
        "INSERT INTO `messages_fts` (`id`, `recipient`, `subject`, `body`) \
         VALUES (?, ?, ?, ?)",
    )?
    .execute((&message.id, &message.recipient, &message.subject, plaintext))?;
    Ok(())
}

fn add_used_bytes(
    cxn: &rusqlite::Connection,
    email: &str,
    bytes: u64,
) -> Result<(), Error> {
    cxn.prepare_cached(
        "UPDATE `users` SET `used_bytes` = `used_bytes` + ? WHERE `email` = ?",
    )?
    .execute((bytes as i64, email))?;
    Ok(())
}

fn has_seen(flags: &[String]) -> bool {
    flags.iter().any(|f| f.eq_ignore_ascii_case("\\Seen"))
}

fn fetch_owned(
    cxn: &rusqlite::Connection,
    owner: &str,
    id: &str,
) -> Result<Message, Error> {
    cxn.prepare_cached(
        "SELECT * FROM `messages` WHERE `id` = ? AND `recipient` = ?",
    )?
    .query_row((id, owner), from_row)
    .optional()?
    .ok_or(Error::NotFound)
}

/// Turn free text into an FTS5 query which matches documents containing every
/// word, without exposing the query syntax.
fn fts_query(text: &str) -> String {
    text.split_whitespace()
        .map(|word| format!("\"{}\"", word.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

impl Store {
    /// Insert and index every row in `rows` in a single transaction.
    ///
    /// All rows share one body blob and one plaintext rendition. The blob
    /// must already be durable. On error, nothing was committed and the
    /// caller is responsible for deleting the blob.
    pub fn save_messages(
        &self,
        rows: &[NewMessage],
        plaintext: &str,
    ) -> Result<Vec<Message>, Error> {
        let received_at = UnixTimestamp::now();
        let mut cxn = self.cxn();
        let txn = cxn.write_tx()?;

        let mut saved = Vec::with_capacity(rows.len());
        for row in rows {
            let message = save_message(&txn, row, received_at)?;
            index_message(&txn, &message, plaintext)?;
            add_used_bytes(&txn, &message.recipient, message.size)?;
            saved.push(message);
        }

        txn.commit()?;
        Ok(saved)
    }

    /// Fetch a message of `owner` by its server-assigned id.
    pub fn find_message(
        &self,
        owner: &str,
        id: &str,
    ) -> Result<Message, Error> {
        fetch_owned(&self.cxn(), owner, id)
    }

    /// List messages of `owner`, newest first.
    pub fn list_messages(
        &self,
        owner: &str,
        filter: &MessageFilter,
    ) -> Result<Vec<Message>, Error> {
        let limit = match filter.limit {
            0 => DEFAULT_LIST_LIMIT,
            n => n.min(MAX_LIST_LIMIT),
        };
        let mailbox = filter.mailbox.as_deref().map(canonical_mailbox_name);

        self.cxn()
            .prepare_cached(
                "SELECT * FROM `messages` \
                 WHERE `recipient` = ?1 \
                   AND (?2 IS NULL OR `mailbox` = ?2) \
                   AND (?3 IS NULL OR `read_state` = ?3) \
                 ORDER BY `received_at` DESC, `id` \
                 LIMIT ?4 OFFSET ?5",
            )?
            .query_map(
                (owner, mailbox, filter.is_read, limit, filter.offset),
                from_row,
            )?
            .collect::<Result<Vec<Message>, _>>()
            .map_err(Into::into)
    }

    /// All messages in the mailbox whose UID is in `[low, high]`, in UID
    /// order. `high` of `None` means unbounded.
    pub fn messages_in_uid_range(
        &self,
        owner: &str,
        mailbox: &str,
        low: Uid,
        high: Option<Uid>,
    ) -> Result<Vec<Message>, Error> {
        self.cxn()
            .prepare_cached(
                "SELECT * FROM `messages` \
                 WHERE `recipient` = ?1 AND `mailbox` = ?2 \
                   AND `uid` >= ?3 AND (?4 IS NULL OR `uid` <= ?4) \
                 ORDER BY `uid`",
            )?
            .query_map(
                (owner, canonical_mailbox_name(mailbox), low, high),
                from_row,
            )?
            .collect::<Result<Vec<Message>, _>>()
            .map_err(Into::into)
    }

    /// Replace the flags of the message at `uid`, returning the updated
    /// message. `\Seen` is mirrored into the read state.
    pub fn set_flags(
        &self,
        owner: &str,
        mailbox: &str,
        uid: Uid,
        flags: &[String],
    ) -> Result<Message, Error> {
        let mailbox = canonical_mailbox_name(mailbox);
        let mut cxn = self.cxn();
        let txn = cxn.write_tx()?;

        let id = txn
            .query_row(
                "SELECT `id` FROM `messages` \
                 WHERE `recipient` = ? AND `mailbox` = ? AND `uid` = ?",
                (owner, mailbox, uid),
                from_single::<String>,
            )
            .optional()?
            .ok_or(Error::NotFound)?;

        let modseq = new_modseq(&txn, owner, mailbox)?;
        txn.execute(
            "UPDATE `messages` \
             SET `flags` = ?, `read_state` = ?, `modseq` = ? \
             WHERE `id` = ?",
            (join_flags(flags), has_seen(flags), modseq, &id),
        )?;

        let message = fetch_owned(&txn, owner, &id)?;
        txn.commit()?;
        Ok(message)
    }

    /// Mark a message read or unread. `\Seen` is kept in step.
    pub fn update_read_state(
        &self,
        owner: &str,
        id: &str,
        read: bool,
    ) -> Result<Message, Error> {
        let mut cxn = self.cxn();
        let txn = cxn.write_tx()?;

        let current = fetch_owned(&txn, owner, id)?;
        let mut flags = current
            .flags
            .into_iter()
            .filter(|f| !f.eq_ignore_ascii_case("\\Seen"))
            .collect::<Vec<_>>();
        if read {
            flags.push("\\Seen".to_owned());
        }

        let modseq = new_modseq(&txn, owner, &current.mailbox)?;
        txn.execute(
            "UPDATE `messages` \
             SET `flags` = ?, `read_state` = ?, `modseq` = ? \
             WHERE `id` = ?",
            (join_flags(&flags), read, modseq, id),
        )?;

        let message = fetch_owned(&txn, owner, id)?;
        txn.commit()?;
        Ok(message)
    }

    /// Copy a message into `dest`, which must exist.
    ///
    /// The copy receives a new id and UID but shares the body blob and the
    /// full-text content of the original. Fails with `OverQuota` if the copy
    /// would take the owner over a non-zero quota.
    pub fn copy_message(
        &self,
        owner: &str,
        id: &str,
        dest: &str,
    ) -> Result<Message, Error> {
        let dest = canonical_mailbox_name(dest);
        let mut cxn = self.cxn();
        let txn = cxn.write_tx()?;

        let src = fetch_owned(&txn, owner, id)?;
        let (quota, used) = txn.query_row(
            "SELECT `quota_bytes`, `used_bytes` FROM `users` WHERE `email` = ?",
            (owner,),
            from_row::<(i64, i64)>,
        )?;
        if quota > 0 && used.saturating_add(src.size as i64) > quota {
            return Err(Error::OverQuota);
        }

        if !txn
            .prepare_cached(
                "SELECT 1 FROM `mailboxes` WHERE `owner` = ? AND `name` = ?",
            )?
            .exists((owner, dest))?
        {
            return Err(Error::NotFound);
        }

        let row = NewMessage {
            id: new_id(),
            message_id: src.message_id,
            sender: src.sender,
            recipient: src.recipient,
            subject: src.subject,
            snippet: src.snippet,
            body_path: src.body_path,
            size: src.size,
            mailbox: dest.to_owned(),
            flags: src.flags,
            auth: src.auth,
        };
        let copy = save_message(&txn, &row, src.received_at)?;
        txn.execute(
            "INSERT INTO `messages_fts` (`id`, `recipient`, `subject`, `body`) \
             SELECT ?, `recipient`, `subject`, `body` FROM `messages_fts` \
             WHERE `id` = ?",
            (&copy.id, id),
        )?;
        add_used_bytes(&txn, owner, copy.size)?;

        txn.commit()?;
        Ok(copy)
    }

    /// Move a message into `dest`, which must exist, keeping its id. The
    /// message gets a fresh UID in the destination.
    pub fn move_message(
        &self,
        owner: &str,
        id: &str,
        dest: &str,
    ) -> Result<Message, Error> {
        let dest = canonical_mailbox_name(dest);
        let mut cxn = self.cxn();
        let txn = cxn.write_tx()?;

        let current = fetch_owned(&txn, owner, id)?;
        if current.mailbox == dest {
            return Ok(current);
        }

        let (uid, modseq) = allocate_uid(&txn, owner, dest)?;
        txn.execute(
            "UPDATE `messages` SET `mailbox` = ?, `uid` = ?, `modseq` = ? \
             WHERE `id` = ?",
            (dest, uid, modseq, id),
        )?;

        let message = fetch_owned(&txn, owner, id)?;
        txn.commit()?;
        Ok(message)
    }

    /// The subject and plaintext body indexed for a message, joined into one
    /// string.
    pub fn message_plaintext(
        &self,
        owner: &str,
        id: &str,
    ) -> Result<String, Error> {
        self.cxn()
            .query_row(
                "SELECT `subject`, `body` FROM `messages_fts` \
                 WHERE `id` = ? AND `recipient` = ?",
                (id, owner),
                from_row::<(String, String)>,
            )
            .optional()?
            .map(|(subject, body)| format!("{subject}\n{body}"))
            .ok_or(Error::NotFound)
    }

    /// Full-text search over the messages of `owner`, best match first.
    /// Subject matches weigh ten times as much as body matches.
    pub fn search(
        &self,
        owner: &str,
        text: &str,
        limit: u32,
    ) -> Result<Vec<Message>, Error> {
        let query = fts_query(text);
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let limit = match limit {
            0 => DEFAULT_LIST_LIMIT,
            n => n.min(MAX_LIST_LIMIT),
        };

        self.cxn()
            .prepare_cached(
                "SELECT `m`.* FROM `messages_fts` \
                 JOIN `messages` `m` ON `m`.`id` = `messages_fts`.`id` \
                 WHERE `messages_fts` MATCH ? \
                   AND `messages_fts`.`recipient` = ? \
                 ORDER BY bm25(`messages_fts`, 0.0, 0.0, 10.0, 1.0) \
                 LIMIT ?",
            )?
            .query_map((query, owner, limit), from_row)?
            .collect::<Result<Vec<Message>, _>>()
            .map_err(Into::into)
    }

    /// Whether any row still references the blob at `body_path`.
    pub fn blob_referenced(&self, body_path: &str) -> Result<bool, Error> {
        Ok(self
            .cxn()
            .prepare_cached("SELECT 1 FROM `messages` WHERE `body_path` = ?")?
            .exists((body_path,))?)
    }
}
