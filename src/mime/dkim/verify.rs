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

use std::rc::Rc;

use chrono::prelude::*;
use openssl::pkey::PKey;

use super::{
    hash, Algorithm, Error, Failure, Header, PermanentError, TxtRecord,
    HEADER_NAME,
};
use crate::mime::header::{fields, split_message, HeaderField};
use crate::store::AuthOutcome;
use crate::support::dns::CacheError;

/// The verdict on the first `DKIM-Signature` of a message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outcome {
    pub result: AuthOutcome,
    /// The signing domain, if a signature header could be parsed.
    pub sdid: Option<String>,
    /// A description of why the result is not `Pass`, if applicable.
    pub error: Option<String>,
}

/// Verifies the DKIM signature of one message.
///
/// Verification happens in two steps so that the caller can fetch the key
/// record: `txt_record_name` says which TXT record is needed (if any), and
/// `finish` completes verification with whatever the lookup produced.
pub struct Verifier<'a> {
    state: State<'a>,
}

enum State<'a> {
    Unsigned,
    Invalid {
        sdid: Option<String>,
        error: Error,
    },
    Ready {
        header: Header<'a>,
        fields: Vec<HeaderField<'a>>,
        body: &'a [u8],
    },
}

impl<'a> Verifier<'a> {
    pub fn new(message: &'a [u8]) -> Self {
        Self {
            state: Self::prepare(message),
        }
    }

    fn prepare(message: &'a [u8]) -> State<'a> {
        let (header_block, body) = split_message(message);
        let Ok(fields) = fields(header_block) else {
            // Only reachable for messages which would be rejected anyway
            return State::Unsigned;
        };

        let Some(signature_field) = fields.iter().find(|f| f.is(HEADER_NAME))
        else {
            return State::Unsigned;
        };

        let invalid =
            |sdid: Option<&str>, error: PermanentError| State::Invalid {
                sdid: sdid.map(str::to_owned),
                error: error.into(),
            };

        let raw = match std::str::from_utf8(signature_field.raw) {
            Ok(raw) => raw,
            Err(_) => {
                return invalid(
                    None,
                    PermanentError::HeaderParse(
                        "header is not UTF-8".to_owned(),
                    ),
                )
            },
        };

        let header = match Header::parse(raw) {
            Ok(header) => header,
            Err(e) => return invalid(None, PermanentError::HeaderParse(e)),
        };

        if 1 != header.version {
            return invalid(
                Some(header.sdid),
                PermanentError::HeaderParse(format!(
                    "unsupported version {}",
                    header.version
                )),
            );
        }

        if let Algorithm::Other(ref a) = header.algorithm {
            return invalid(
                Some(header.sdid),
                PermanentError::UnsupportedAlgorithm(a.clone()),
            );
        }

        if !header
            .signed_headers
            .iter()
            .any(|h| h.eq_ignore_ascii_case("From"))
        {
            return invalid(Some(header.sdid), PermanentError::FromNotSigned);
        }

        if header.sdid.is_empty() || header.selector.is_empty() {
            return invalid(
                Some(header.sdid),
                PermanentError::HeaderParse("empty d= or s=".to_owned()),
            );
        }

        State::Ready {
            header,
            fields,
            body,
        }
    }

    /// The name of the TXT record holding the public key, if verification
    /// needs one.
    pub fn txt_record_name(&self) -> Option<String> {
        match self.state {
            State::Ready { ref header, .. } => Some(format!(
                "{}._domainkey.{}",
                header.selector, header.sdid,
            )),
            _ => None,
        }
    }

    /// Complete verification given the result of looking up
    /// `txt_record_name()`.
    pub fn finish(
        self,
        txt: Result<&[Rc<str>], CacheError>,
        now: DateTime<Utc>,
    ) -> Outcome {
        match self.state {
            State::Unsigned => Outcome {
                result: AuthOutcome::None,
                sdid: None,
                error: None,
            },

            State::Invalid { sdid, error } => Outcome {
                result: error.auth_outcome(),
                sdid,
                error: Some(error.to_string()),
            },

            State::Ready {
                header,
                fields,
                body,
            } => {
                let sdid = Some(header.sdid.to_owned());
                match verify(&header, &fields, body, txt, now) {
                    Ok(()) => Outcome {
                        result: AuthOutcome::Pass,
                        sdid,
                        error: None,
                    },
                    Err(e) => Outcome {
                        result: e.auth_outcome(),
                        sdid,
                        error: Some(e.to_string()),
                    },
                }
            },
        }
    }
}

fn verify(
    header: &Header<'_>,
    fields: &[HeaderField<'_>],
    body: &[u8],
    txt: Result<&[Rc<str>], CacheError>,
    now: DateTime<Utc>,
) -> Result<(), Error> {
    if header.signature_expiration.is_some_and(|x| x < now) {
        return Err(PermanentError::Expired.into());
    }

    let record_name = format!("{}._domainkey.{}", header.selector, header.sdid);
    let records = match txt {
        Ok(records) => records,
        Err(CacheError::NotFound) => {
            return Err(PermanentError::DnsTxtNotFound(record_name).into())
        },
        Err(CacheError::Error | CacheError::NotReady) => {
            return Err(Error::Temporary(format!(
                "DNS lookup of {record_name} failed"
            )))
        },
    };

    let mut last_parse_error = None;
    let record = records.iter().find_map(|r| match TxtRecord::parse(r) {
        Ok(record) => Some(record),
        Err(e) => {
            last_parse_error = Some(e);
            None
        },
    });
    let Some(record) = record else {
        return Err(match last_parse_error {
            Some(e) => PermanentError::DnsTxtParse(record_name, e),
            None => PermanentError::DnsTxtNotFound(record_name),
        }
        .into());
    };

    if "rsa" != record.key_type {
        return Err(
            PermanentError::UnsupportedAlgorithm(record.key_type).into()
        );
    }
    if record.public_key.is_empty() {
        return Err(PermanentError::PublicKeyRevoked.into());
    }

    match check_signature(header, fields, body, &record.public_key) {
        Err(Error::Fail(failure)) if record.test_mode => {
            Err(PermanentError::TestMode(failure).into())
        },
        r => r,
    }
}

fn check_signature(
    header: &Header<'_>,
    fields: &[HeaderField<'_>],
    body: &[u8],
    public_key: &[u8],
) -> Result<(), Error> {
    if hash::body_hash(header, body)? != header.body_hash {
        return Err(Failure::BodyHashMismatch.into());
    }

    // Keys are normally SubjectPublicKeyInfo, but some publishers use bare
    // PKCS#1.
    let key = match PKey::public_key_from_der(public_key) {
        Ok(key) => key,
        Err(_) => PKey::from_rsa(openssl::rsa::Rsa::public_key_from_der_pkcs1(
            public_key,
        )?)?,
    };

    let hash_data = hash::header_hash_data(header, fields);
    let valid = openssl::sign::Verifier::new(
        openssl::hash::MessageDigest::sha256(),
        &key,
    )?
    .verify_oneshot(&header.signature, &hash_data)?;

    if valid {
        Ok(())
    } else {
        Err(Failure::SignatureMismatch.into())
    }
}
