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

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Not found")]
    NotFound,
    #[error("Already exists")]
    AlreadyExists,
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("Storage failure: {0}")]
    StorageFailure(String),
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
    #[error("Transient delivery failure: {0}")]
    TransientDeliveryFailure(String),
    #[error("Permanent delivery failure: {0}")]
    PermanentDeliveryFailure(String),
    #[error("Rate limit exceeded")]
    RateLimited,
    #[error("Greylisted; try again later")]
    Greylisted,
    #[error("Rejected by policy: {0}")]
    PolicyRejected(String),
    #[error("Malformed message: {0}")]
    MalformedMessage(String),
    #[error("Quota exceeded")]
    OverQuota,
    #[error("Permission denied")]
    PermissionDenied,
    #[error("Script is active")]
    ActiveScript,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Ssl(#[from] openssl::error::ErrorStack),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

impl Error {
    /// Whether this error indicates the store itself misbehaved, as opposed to
    /// a semantic problem with the request.
    pub fn is_storage(&self) -> bool {
        matches!(
            *self,
            Error::StorageFailure(..) | Error::Io(..) | Error::Sqlite(..)
        )
    }
}
