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

use thiserror::Error;

use crate::store::AuthOutcome;

/// Reasons a DKIM signature could not be validated.
#[derive(Error, Debug)]
pub enum Error {
    /// The verdict depends on a DNS lookup which failed; trying again later
    /// may produce a different answer.
    #[error("temporary failure: {0}")]
    Temporary(String),
    /// The signature cannot be evaluated at all.
    #[error(transparent)]
    Permanent(#[from] PermanentError),
    /// The signature is objectively invalid.
    #[error(transparent)]
    Fail(#[from] Failure),
}

#[derive(Error, Debug)]
pub enum PermanentError {
    #[error("unexpected OpenSSL error: {0}")]
    Ssl(openssl::error::ErrorStack),
    #[error("can't parse DKIM-Signature header: {0}")]
    HeaderParse(String),
    #[error("unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("h= does not cover the From header")]
    FromNotSigned,
    #[error("signature expired")]
    Expired,
    #[error("can't parse TXT record {0}: {1}")]
    DnsTxtParse(String, String),
    #[error("can't find TXT record {0}, or it is not DKIM1")]
    DnsTxtNotFound(String),
    #[error("the public key was revoked")]
    PublicKeyRevoked,
    #[error("verification failed, but the selector is in test mode: {0}")]
    TestMode(Failure),
}

#[derive(Error, Debug)]
pub enum Failure {
    #[error("body is shorter than the l= tag indicates")]
    BodyTruncated,
    #[error("the computed body hash does not match the bh= tag")]
    BodyHashMismatch,
    #[error("the computed message hash does not match the signature")]
    SignatureMismatch,
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(e: openssl::error::ErrorStack) -> Self {
        Self::Permanent(PermanentError::Ssl(e))
    }
}

impl Error {
    pub fn auth_outcome(&self) -> AuthOutcome {
        match *self {
            Self::Temporary(..) => AuthOutcome::TempError,
            Self::Permanent(..) => AuthOutcome::PermError,
            Self::Fail(..) => AuthOutcome::Fail,
        }
    }
}
