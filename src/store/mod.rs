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

//! Persistent state: the SQLite metadata database and the blob tree.
//!
//! The store is the only component that touches either. The general
//! guidelines are:
//!
//! 1. Every operation is atomic unless otherwise noted.
//! 2. The concept of a database transaction does not escape the store.
//!
//! Ingestion is the one place where a caller must sequence store operations:
//! the body is written with `BlobStore::write_blob`, then `save_messages`
//! inserts and indexes every row in one transaction. If that fails, the caller
//! deletes the blob. A blob is never referenced by a row before the blob is
//! durable.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::support::{error::Error, log_prefix::LogPrefix};

mod backup;
mod bayes;
pub mod blob;
mod db_migrations;
mod greylist;
mod mailboxes;
mod messages;
mod queue;
mod sieve;
pub mod types;
mod users;

pub use self::bayes::BayesCounts;
pub use self::blob::BlobStore;
pub use self::mailboxes::canonical_mailbox_name;
pub use self::sieve::ScriptInfo;
pub use self::types::*;
pub use self::users::normalise_email;

const MIGRATIONS: &[(&str, &str)] =
    &[("0001-schema.v1", include_str!("schema.v1.sql"))];

/// The names of the mailboxes every user is created with.
pub const DEFAULT_MAILBOXES: &[&str] =
    &["INBOX", "Sent", "Drafts", "Junk", "Trash"];

pub struct Store {
    cxn: Mutex<rusqlite::Connection>,
    blobs: BlobStore,
}

impl Store {
    /// Open (creating if needed) the database at `db_path` and the blob tree
    /// at `blob_root`, bringing the schema up to date.
    pub fn open(
        log_prefix: &LogPrefix,
        db_path: &Path,
        blob_root: &Path,
    ) -> Result<Self, Error> {
        let cxn = rusqlite::Connection::open_with_flags(
            db_path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        Self::from_connection(log_prefix, cxn, BlobStore::new(blob_root)?)
    }

    fn from_connection(
        log_prefix: &LogPrefix,
        mut cxn: rusqlite::Connection,
        blobs: BlobStore,
    ) -> Result<Self, Error> {
        cxn.pragma_update(None, "foreign_keys", true)?;
        cxn.pragma_update(None, "journal_mode", "WAL")?;
        cxn.pragma_update(None, "synchronous", "FULL")?;
        cxn.busy_timeout(Duration::from_secs(10))?;

        db_migrations::apply_migrations(log_prefix, &mut cxn, MIGRATIONS)?;

        Ok(Self {
            cxn: Mutex::new(cxn),
            blobs,
        })
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Lock the connection. A panic while the lock was held does not leave
    /// the database inconsistent (any open transaction was rolled back when
    /// dropped), so poisoning is ignored.
    fn cxn(&self) -> MutexGuard<'_, rusqlite::Connection> {
        self.cxn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

trait ConnectionExt {
    fn read_tx(&mut self) -> rusqlite::Result<rusqlite::Transaction<'_>>;
    fn write_tx(&mut self) -> rusqlite::Result<rusqlite::Transaction<'_>>;
}

impl ConnectionExt for rusqlite::Connection {
    fn read_tx(&mut self) -> rusqlite::Result<rusqlite::Transaction<'_>> {
        self.transaction_with_behavior(rusqlite::TransactionBehavior::Deferred)
    }

    fn write_tx(&mut self) -> rusqlite::Result<rusqlite::Transaction<'_>> {
        self.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
    }
}

/// Map a `rusqlite` error on an `INSERT` or `UPDATE` to `AlreadyExists` if it
/// was caused by a primary key or uniqueness violation.
fn map_conflict(e: rusqlite::Error) -> Error {
    match e {
        rusqlite::Error::SqliteFailure(ref f, _)
            if rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY == f.extended_code
                || rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    == f.extended_code =>
        {
            Error::AlreadyExists
        },
        e => e.into(),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::*;

    pub struct TestStore {
        pub store: Arc<Store>,
        pub root: TempDir,
    }

    impl std::ops::Deref for TestStore {
        type Target = Store;

        fn deref(&self) -> &Store {
            &self.store
        }
    }

    pub fn test_store() -> TestStore {
        crate::init_test_log();

        let root = TempDir::new().unwrap();
        let store = Store::open(
            &LogPrefix::new("test".to_owned()),
            &root.path().join("meta.sqlite"),
            &root.path().join("blobs"),
        )
        .unwrap();
        TestStore {
            store: Arc::new(store),
            root,
        }
    }

    /// Create `email` with a cheap password hash and a generous quota.
    pub fn add_user(store: &Store, email: &str) {
        store
            .create_user(email, "$argon2id$stub", Role::User, 1 << 30)
            .unwrap();
    }

    /// Make every following message insert fail until
    /// `accept_message_inserts`.
    pub fn reject_message_inserts(store: &Store) {
        store
            .cxn()
            .execute_batch(
                "CREATE TEMP TRIGGER `reject_messages` \
                 BEFORE INSERT ON `messages` \
                 BEGIN SELECT RAISE(ABORT, 'rejected'); END",
            )
            .unwrap();
    }

    pub fn accept_message_inserts(store: &Store) {
        store
            .cxn()
            .execute_batch("DROP TRIGGER temp.`reject_messages`")
            .unwrap();
    }
}
