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

/// A stored Sieve script, as listed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScriptInfo {
    pub name: String,
    pub is_active: bool,
}

impl Store {
    /// Create or replace the script `name`, preserving whether it is active.
    pub fn put_script(
        &self,
        owner: &str,
        name: &str,
        content: &str,
    ) -> Result<(), Error> {
        self.cxn().execute(
            "INSERT INTO `sieve_scripts` \
               (`owner`, `name`, `content`, `updated_at`) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT (`owner`, `name`) DO UPDATE SET \
               `content` = `excluded`.`content`, \
               `updated_at` = `excluded`.`updated_at`",
            (owner, name, content, UnixTimestamp::now()),
        )?;
        Ok(())
    }

    pub fn get_script(&self, owner: &str, name: &str) -> Result<String, Error> {
        self.cxn()
            .prepare_cached(
                "SELECT `content` FROM `sieve_scripts` \
                 WHERE `owner` = ? AND `name` = ?",
            )?
            .query_row((owner, name), from_single)
            .optional()?
            .ok_or(Error::NotFound)
    }

    pub fn list_scripts(&self, owner: &str) -> Result<Vec<ScriptInfo>, Error> {
        self.cxn()
            .prepare(
                "SELECT `name`, `is_active` FROM `sieve_scripts` \
                 WHERE `owner` = ? ORDER BY `name`",
            )?
            .query_map((owner,), |row| {
                Ok(ScriptInfo {
                    name: row.get(0)?,
                    is_active: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Delete a script. The active script cannot be deleted.
    pub fn delete_script(&self, owner: &str, name: &str) -> Result<(), Error> {
        let mut cxn = self.cxn();
        let txn = cxn.write_tx()?;
        let is_active = txn
            .query_row(
                "SELECT `is_active` FROM `sieve_scripts` \
                 WHERE `owner` = ? AND `name` = ?",
                (owner, name),
                from_single::<bool>,
            )
            .optional()?
            .ok_or(Error::NotFound)?;
        if is_active {
            return Err(Error::ActiveScript);
        }

        txn.execute(
            "DELETE FROM `sieve_scripts` WHERE `owner` = ? AND `name` = ?",
            (owner, name),
        )?;
        txn.commit()?;
        Ok(())
    }

    /// Make `name` the only active script, or deactivate all scripts if
    /// `name` is `None`.
    pub fn set_active_script(
        &self,
        owner: &str,
        name: Option<&str>,
    ) -> Result<(), Error> {
        let mut cxn = self.cxn();
        let txn = cxn.write_tx()?;

        txn.execute(
            "UPDATE `sieve_scripts` SET `is_active` = 0 \
             WHERE `owner` = ? AND `is_active`",
            (owner,),
        )?;
        if let Some(name) = name {
            let updated = txn.execute(
                "UPDATE `sieve_scripts` SET `is_active` = 1 \
                 WHERE `owner` = ? AND `name` = ?",
                (owner, name),
            )?;
            if 0 == updated {
                return Err(Error::NotFound);
            }
        }

        txn.commit()?;
        Ok(())
    }

    pub fn rename_script(
        &self,
        owner: &str,
        old_name: &str,
        new_name: &str,
    ) -> Result<(), Error> {
        let updated = self
            .cxn()
            .execute(
                "UPDATE `sieve_scripts` SET `name` = ?, `updated_at` = ? \
                 WHERE `owner` = ? AND `name` = ?",
                (new_name, UnixTimestamp::now(), owner, old_name),
            )
            .map_err(map_conflict)?;
        if 0 == updated {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    /// The content of the active script of `owner`, if any.
    pub fn active_script(&self, owner: &str) -> Result<Option<String>, Error> {
        Ok(self
            .cxn()
            .prepare_cached(
                "SELECT `content` FROM `sieve_scripts` \
                 WHERE `owner` = ? AND `is_active`",
            )?
            .query_row((owner,), from_single)
            .optional()?)
    }

    pub fn vacation_last_sent(
        &self,
        owner: &str,
        sender: &str,
    ) -> Result<Option<UnixTimestamp>, Error> {
        Ok(self
            .cxn()
            .prepare_cached(
                "SELECT `last_sent_at` FROM `vacation_trackers` \
                 WHERE `owner` = ? AND `sender` = ?",
            )?
            .query_row((owner, sender.to_ascii_lowercase()), from_single)
            .optional()?)
    }

    pub fn record_vacation(
        &self,
        owner: &str,
        sender: &str,
        at: UnixTimestamp,
    ) -> Result<(), Error> {
        self.cxn().execute(
            "INSERT INTO `vacation_trackers` \
               (`owner`, `sender`, `last_sent_at`) \
             VALUES (?, ?, ?) \
             ON CONFLICT (`owner`, `sender`) DO UPDATE SET \
               `last_sent_at` = `excluded`.`last_sent_at`",
            (owner, sender.to_ascii_lowercase(), at),
        )?;
        Ok(())
    }
}
