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

//! The DMARC record syntax of RFC 7489 § 6.3, reduced to the tags this
//! server acts on.

use thiserror::Error;

use crate::store::DmarcPolicy;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Record {
    pub dkim: AlignmentMode,
    pub spf: AlignmentMode,
    pub requested_receiver_policy: DmarcPolicy,
    /// `sp=`, defaulting to `p=`.
    pub subdomain_receiver_policy: DmarcPolicy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AlignmentMode {
    #[default]
    Relaxed,
    Strict,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum Error {
    #[error("unsupported DMARC record version")]
    UnsupportedVersion,
    #[error("no DMARC record version")]
    NoVersion,
    #[error("more than one {0}= field")]
    DuplicateField(&'static str),
}

impl Record {
    pub fn parse(s: &str) -> Result<Self, Error> {
        fn set_opt<T>(
            field: &'static str,
            opt: &mut Option<T>,
            value: T,
        ) -> Result<(), Error> {
            if opt.is_some() {
                Err(Error::DuplicateField(field))
            } else {
                *opt = Some(value);
                Ok(())
            }
        }

        let mut version = None::<()>;
        let mut dkim = None::<AlignmentMode>;
        let mut spf = None::<AlignmentMode>;
        let mut requested_receiver_policy = None::<DmarcPolicy>;
        let mut subdomain_receiver_policy = None::<DmarcPolicy>;

        for (ix, pair) in s.split(';').enumerate() {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }

            // DMARC asks for very permissive parsing of everything but the
            // version tag.
            let Some((k, v)) = pair.split_once('=') else {
                if 0 == ix {
                    return Err(Error::NoVersion);
                }
                continue;
            };
            let (k, v) = (k.trim(), v.trim());

            if 0 == ix {
                if "v" != k {
                    return Err(Error::NoVersion);
                }
                if "DMARC1" != v {
                    return Err(Error::UnsupportedVersion);
                }
                version = Some(());
                continue;
            }

            match k {
                "v" => return Err(Error::DuplicateField("v")),
                "adkim" => {
                    set_opt("adkim", &mut dkim, AlignmentMode::parse(v))?
                },
                "aspf" => set_opt("aspf", &mut spf, AlignmentMode::parse(v))?,
                "p" => {
                    // An unknown policy is treated as if p= were absent.
                    if let Some(p) = parse_policy(v) {
                        set_opt("p", &mut requested_receiver_policy, p)?;
                    }
                },
                "sp" => {
                    if let Some(p) = parse_policy(v) {
                        set_opt("sp", &mut subdomain_receiver_policy, p)?;
                    }
                },
                _ => {},
            }
        }

        if version.is_none() {
            return Err(Error::NoVersion);
        }

        let requested_receiver_policy =
            requested_receiver_policy.unwrap_or(DmarcPolicy::None);
        Ok(Self {
            dkim: dkim.unwrap_or_default(),
            spf: spf.unwrap_or_default(),
            requested_receiver_policy,
            subdomain_receiver_policy: subdomain_receiver_policy
                .unwrap_or(requested_receiver_policy),
        })
    }
}

impl AlignmentMode {
    fn parse(s: &str) -> Self {
        if "s" == s {
            Self::Strict
        } else {
            Self::Relaxed
        }
    }
}

fn parse_policy(s: &str) -> Option<DmarcPolicy> {
    match s {
        "none" => Some(DmarcPolicy::None),
        "quarantine" => Some(DmarcPolicy::Quarantine),
        "reject" => Some(DmarcPolicy::Reject),
        _ => None,
    }
}
