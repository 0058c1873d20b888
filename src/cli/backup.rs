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

use chrono::prelude::*;

use super::main::{open_store, BackupSubcommand};
use crate::support::system_config::SystemConfig;

pub(super) fn backup(cmd: BackupSubcommand, config: SystemConfig) {
    let store = open_store(&config);
    let location = cmd.location.unwrap_or(config.backup.location);
    match store.backup(&location, Utc::now()) {
        Ok(path) => println!("{}", path.display()),
        Err(e) => die!(
            EX_CANTCREAT,
            "Backup under '{}' failed: {}",
            location.display(),
            e
        ),
    }
}
