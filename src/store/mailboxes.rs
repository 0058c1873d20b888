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

use super::{map_conflict, types::*, ConnectionExt as _, Store};
use crate::support::error::Error;

/// Normalise a mailbox name: any capitalisation of `INBOX` becomes `INBOX`,
/// everything else is taken literally.
pub fn canonical_mailbox_name(name: &str) -> &str {
    if name.eq_ignore_ascii_case("INBOX") {
        "INBOX"
    } else {
        name
    }
}

fn validate_mailbox_name(name: &str) -> Result<(), Error> {
    if name.is_empty()
        || name.len() > 255
        || name.chars().any(|c| c.is_control() || '"' == c)
    {
        return Err(Error::ValidationFailed(format!(
            "bad mailbox name {name:?}"
        )));
    }

    Ok(())
}

fn new_uid_validity() -> u32 {
    ((UnixTimestamp::now().millis() / 1000) as u32 & 0x7FFF_FFFF).max(1)
}

/// Create `(owner, name)` if it does not exist yet.
pub(super) fn ensure_mailbox(
    cxn: &rusqlite::Connection,
    owner: &str,
    name: &str,
) -> Result<(), Error> {
    validate_mailbox_name(name)?;
    cxn.prepare_cached(
        "INSERT OR IGNORE INTO `mailboxes` (`owner`, `name`, `uid_validity`) \
         VALUES (?, ?, ?)",
    )?
    .execute((owner, name, new_uid_validity()))?;
    Ok(())
}

/// Reserve the next UID in the mailbox, also allocating a new modseq.
pub(super) fn allocate_uid(
    cxn: &rusqlite::Connection,
    owner: &str,
    mailbox: &str,
) -> Result<(Uid, i64), Error> {
    cxn.prepare_cached(
        "UPDATE `mailboxes` \
         SET `next_uid` = `next_uid` + 1, `max_modseq` = `max_modseq` + 1 \
         WHERE `owner` = ? AND `name` = ? \
         RETURNING `next_uid` - 1, `max_modseq`",
    )?
    .query_row((owner, mailbox), from_row::<(Uid, i64)>)
    .optional()?
    .ok_or(Error::NotFound)
}

/// Allocate a new modseq in the mailbox without reserving a UID.
pub(super) fn new_modseq(
    cxn: &rusqlite::Connection,
    owner: &str,
    mailbox: &str,
) -> Result<i64, Error> {
    cxn.prepare_cached(
        "UPDATE `mailboxes` SET `max_modseq` = `max_modseq` + 1 \
         WHERE `owner` = ? AND `name` = ? \
         RETURNING `max_modseq`",
    )?
    .query_row((owner, mailbox), from_single)
    .optional()?
    .ok_or(Error::NotFound)
}

impl Store {
    /// Create a new, empty mailbox.
    ///
    /// Fails with `AlreadyExists` if the owner already has a mailbox by that
    /// name.
    pub fn create_mailbox(&self, owner: &str, name: &str) -> Result<(), Error> {
        let name = canonical_mailbox_name(name);
        validate_mailbox_name(name)?;
        self.cxn()
            .execute(
                "INSERT INTO `mailboxes` (`owner`, `name`, `uid_validity`) \
                 VALUES (?, ?, ?)",
                (owner, name, new_uid_validity()),
            )
            .map_err(map_conflict)?;
        Ok(())
    }

    /// Create the mailbox if it does not exist; succeed either way.
    pub fn ensure_mailbox(&self, owner: &str, name: &str) -> Result<(), Error> {
        ensure_mailbox(&self.cxn(), owner, canonical_mailbox_name(name))
    }

    pub fn mailbox_exists(
        &self,
        owner: &str,
        name: &str,
    ) -> Result<bool, Error> {
        Ok(self
            .cxn()
            .prepare_cached(
                "SELECT 1 FROM `mailboxes` WHERE `owner` = ? AND `name` = ?",
            )?
            .exists((owner, canonical_mailbox_name(name)))?)
    }

    /// All mailbox names of `owner`, `INBOX` first then by name.
    pub fn list_mailboxes(&self, owner: &str) -> Result<Vec<String>, Error> {
        self.cxn()
            .prepare(
                "SELECT `name` FROM `mailboxes` WHERE `owner` = ? \
                 ORDER BY `name` != 'INBOX', `name`",
            )?
            .query_map((owner,), from_single)?
            .collect::<Result<Vec<String>, _>>()
            .map_err(Into::into)
    }

    pub fn mailbox_status(
        &self,
        owner: &str,
        name: &str,
    ) -> Result<MailboxStatus, Error> {
        let name = canonical_mailbox_name(name);
        let mut cxn = self.cxn();
        let txn = cxn.read_tx()?;

        let (uid_validity, uid_next) = txn
            .query_row(
                "SELECT `uid_validity`, `next_uid` FROM `mailboxes` \
                 WHERE `owner` = ? AND `name` = ?",
                (owner, name),
                from_row::<(u32, u32)>,
            )
            .optional()?
            .ok_or(Error::NotFound)?;

        let (exists, unseen) = txn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(NOT `read_state`), 0) \
             FROM `messages` WHERE `recipient` = ? AND `mailbox` = ?",
            (owner, name),
            from_row::<(u32, u32)>,
        )?;

        Ok(MailboxStatus {
            name: name.to_owned(),
            exists,
            unseen,
            uid_validity,
            uid_next,
        })
    }

    /// The explicit ACL entries of a mailbox, as `(identifier, rights)`.
    pub fn list_acl(
        &self,
        owner: &str,
        mailbox: &str,
    ) -> Result<Vec<(String, String)>, Error> {
        self.cxn()
            .prepare(
                "SELECT `identifier`, `rights` FROM `mailbox_acl` \
                 WHERE `owner` = ? AND `mailbox` = ? ORDER BY `identifier`",
            )?
            .query_map((owner, canonical_mailbox_name(mailbox)), from_row)?
            .collect::<Result<Vec<(String, String)>, _>>()
            .map_err(Into::into)
    }

    /// Replace the rights of `identifier` on the mailbox. An empty `rights`
    /// string removes the entry.
    pub fn set_acl(
        &self,
        owner: &str,
        mailbox: &str,
        identifier: &str,
        rights: &str,
    ) -> Result<(), Error> {
        if rights.is_empty() {
            return self.delete_acl(owner, mailbox, identifier);
        }

        let mailbox = canonical_mailbox_name(mailbox);
        let mut cxn = self.cxn();
        let txn = cxn.write_tx()?;
        if !txn
            .prepare_cached(
                "SELECT 1 FROM `mailboxes` WHERE `owner` = ? AND `name` = ?",
            )?
            .exists((owner, mailbox))?
        {
            return Err(Error::NotFound);
        }

        txn.execute(
            "INSERT INTO `mailbox_acl` \
               (`owner`, `mailbox`, `identifier`, `rights`) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT (`owner`, `mailbox`, `identifier`) \
             DO UPDATE SET `rights` = `excluded`.`rights`",
            (owner, mailbox, identifier, rights),
        )?;
        txn.commit()?;
        Ok(())
    }

    pub fn delete_acl(
        &self,
        owner: &str,
        mailbox: &str,
        identifier: &str,
    ) -> Result<(), Error> {
        self.cxn().execute(
            "DELETE FROM `mailbox_acl` \
             WHERE `owner` = ? AND `mailbox` = ? AND `identifier` = ?",
            (owner, canonical_mailbox_name(mailbox), identifier),
        )?;
        Ok(())
    }
}
