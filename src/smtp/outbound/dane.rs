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

//! Advisory DANE (RFC 7672) checks.
//!
//! TLSA records for an MX host are looked up before connecting and compared
//! against the certificate the host presents. The outcome only ever reaches
//! the log and the transcript; it never stops a delivery.

use std::fmt;

use hickory_resolver::proto::rr::{RData, RecordType};
use openssl::x509::X509;

use crate::support::dns::{self, Resolver};

const USAGE_DANE_EE: u8 = 3;
const USAGE_PKIX_EE: u8 = 1;
const SELECTOR_FULL: u8 = 0;
const SELECTOR_SPKI: u8 = 1;
const MATCHING_RAW: u8 = 0;
const MATCHING_SHA256: u8 = 1;
const MATCHING_SHA512: u8 = 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub usage: u8,
    pub selector: u8,
    pub matching: u8,
    pub data: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// No TLSA records are published; DANE does not apply.
    NoRecords,
    /// An end-entity record matches the presented certificate.
    Match,
    /// End-entity records exist, but none matches.
    Mismatch,
    /// Only trust-anchor records exist, which are not evaluated, or no
    /// certificate was presented.
    Unchecked,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            Verdict::NoRecords => "no TLSA records",
            Verdict::Match => "TLSA match",
            Verdict::Mismatch => "TLSA MISMATCH",
            Verdict::Unchecked => "TLSA not evaluated",
        })
    }
}

/// The TLSA owner name for `port` on `host`.
pub fn tlsa_name(host: &dns::Name, port: u16) -> Option<dns::Name> {
    let host = host.to_ascii();
    dns::parse_name(&format!(
        "_{port}._tcp.{}",
        host.strip_suffix('.').unwrap_or(&host),
    ))
}

/// Fetch the TLSA records for `port` on `host`.
///
/// Absence of records is an empty list; any other failure is an error
/// message suitable for the transcript.
pub async fn look_up(
    resolver: &Resolver,
    host: &dns::Name,
    port: u16,
) -> Result<Vec<Record>, String> {
    let Some(name) = tlsa_name(host, port) else {
        return Err(format!("invalid TLSA name for {host}"));
    };

    match resolver.lookup(name, RecordType::TLSA).await {
        Ok(lookup) => Ok(lookup
            .iter()
            .filter_map(|rdata| match *rdata {
                RData::TLSA(ref tlsa) => Some(Record {
                    usage: tlsa.cert_usage().into(),
                    selector: tlsa.selector().into(),
                    matching: tlsa.matching().into(),
                    data: tlsa.cert_data().to_vec(),
                }),
                _ => None,
            })
            .collect()),
        Err(e)
            if matches!(
                *e.kind(),
                hickory_resolver::error::ResolveErrorKind::NoRecordsFound { .. }
            ) =>
        {
            Ok(Vec::new())
        },
        Err(e) => Err(e.to_string()),
    }
}

/// Compare `records` against the certificate the server presented.
pub fn check(records: &[Record], cert: Option<&X509>) -> Verdict {
    if records.is_empty() {
        return Verdict::NoRecords;
    }

    let Some(cert) = cert else {
        return Verdict::Unchecked;
    };

    let mut any_end_entity = false;
    for record in records {
        if USAGE_DANE_EE != record.usage && USAGE_PKIX_EE != record.usage {
            continue;
        }

        any_end_entity = true;
        if record_matches(record, cert) {
            return Verdict::Match;
        }
    }

    if any_end_entity {
        Verdict::Mismatch
    } else {
        Verdict::Unchecked
    }
}

fn record_matches(record: &Record, cert: &X509) -> bool {
    let selected = match record.selector {
        SELECTOR_FULL => cert.to_der().ok(),
        SELECTOR_SPKI => cert
            .public_key()
            .and_then(|k| k.public_key_to_der())
            .ok(),
        _ => None,
    };
    let Some(selected) = selected else {
        return false;
    };

    match record.matching {
        MATCHING_RAW => selected == record.data,
        MATCHING_SHA256 => {
            openssl::sha::sha256(&selected)[..] == record.data[..]
        },
        MATCHING_SHA512 => {
            openssl::sha::sha512(&selected)[..] == record.data[..]
        },
        _ => false,
    }
}
