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

//! Online backups of the metadata database and the blob tree.

use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::prelude::*;
use log::info;

use super::Store;
use crate::support::{error::Error, file_ops};

/// The name of the database copy within a backup directory.
const BACKUP_DB: &str = "meta.db";
/// The name of the blob tree copy within a backup directory.
const BACKUP_BLOBS: &str = "blobs";

impl Store {
    /// Snapshot the store into a new `backup-YYYYMMDD-HHMMSS` directory under
    /// `location`, returning the path of that directory.
    ///
    /// The database is copied first, with the connection held, through the
    /// SQLite online backup API. Blobs are durable before any row refers to
    /// them, so the tree copied afterwards holds every blob the database copy
    /// names.
    pub fn backup(
        &self,
        location: &Path,
        now: DateTime<Utc>,
    ) -> Result<PathBuf, Error> {
        file_ops::mkdirs(location, 0o700)?;
        let target =
            location.join(format!("backup-{}", now.format("%Y%m%d-%H%M%S")));
        fs::DirBuilder::new()
            .mode(0o700)
            .create(&target)
            .map_err(|e| {
                if std::io::ErrorKind::AlreadyExists == e.kind() {
                    Error::AlreadyExists
                } else {
                    e.into()
                }
            })?;

        let db_path = target.join(BACKUP_DB);
        {
            let cxn = self.cxn();
            let mut dst = rusqlite::Connection::open(&db_path)?;
            rusqlite::backup::Backup::new(&cxn, &mut dst)?
                .run_to_completion(256, Duration::ZERO, None)?;
        }
        file_ops::chmod(&db_path, 0o600)?;

        let blobs = self.blobs.copy_tree(&target.join(BACKUP_BLOBS))?;
        info!("Backed up database and {blobs} blobs to {}", target.display());
        Ok(target)
    }
}
