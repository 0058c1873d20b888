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

use log::info;

use super::types::*;
use crate::support::{error::Error, log_prefix::LogPrefix};

/// Apply every migration in `migrations` not yet recorded in the `migration`
/// table.
///
/// Each migration is a `(name, sql)` pair. Migrations run in lexicographic
/// order of their names regardless of the order they are given in, each
/// within the same exclusive transaction.
pub fn apply_migrations(
    log_prefix: &LogPrefix,
    cxn: &mut rusqlite::Connection,
    migrations: &[(&str, &str)],
) -> Result<(), Error> {
    let mut migrations = migrations.to_vec();
    migrations.sort_unstable_by_key(|&(name, _)| name);

    let txn = cxn
        .transaction_with_behavior(rusqlite::TransactionBehavior::Exclusive)?;
    txn.execute(
        "CREATE TABLE IF NOT EXISTS `migration` (\
         `name` TEXT NOT NULL PRIMARY KEY, \
         `applied_at` INTEGER NOT NULL\
         ) STRICT",
        (),
    )?;

    for (name, sql) in migrations {
        let applied = txn
            .prepare_cached("SELECT 1 FROM `migration` WHERE `name` = ?")?
            .exists((name,))?;
        if applied {
            continue;
        }

        info!("{log_prefix} Applying migration {name}");
        txn.execute_batch(sql)?;
        txn.execute(
            "INSERT INTO `migration` (`name`, `applied_at`) VALUES (?, ?)",
            (name, UnixTimestamp::now()),
        )?;
    }

    txn.commit()?;

    Ok(())
}
