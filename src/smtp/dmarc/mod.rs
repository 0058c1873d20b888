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

//! DMARC evaluation (RFC 7489).
//!
//! Evaluation runs synchronously against a `dns::Cache`. A `NotReady` result
//! means the caller must wait for the cache to fill and try again; see
//! `smtp::auth`.

mod psl;
mod syntax;

pub use psl::organisational_domain;
pub use syntax::{AlignmentMode, Error, Record};

use crate::store::{AuthOutcome, DmarcPolicy};
use crate::support::dns::{self, CacheError};

/// What DMARC evaluation needs to know about a message.
#[derive(Clone, Debug)]
pub struct Context<'a> {
    /// The domain of the `From:` header.
    pub from_domain: &'a str,
    pub spf: AuthOutcome,
    /// The domain SPF was evaluated for (`MAIL FROM` or `HELO`).
    pub spf_domain: Option<&'a str>,
    pub dkim: AuthOutcome,
    /// The `d=` of the DKIM signature.
    pub dkim_sdid: Option<&'a str>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Outcome {
    pub result: AuthOutcome,
    /// The policy that applies to the `From:` domain. `None` whenever no
    /// usable record was found.
    pub policy: DmarcPolicy,
}

impl Outcome {
    const NONE: Self = Self {
        result: AuthOutcome::None,
        policy: DmarcPolicy::None,
    };

    /// Whether the message must be refused outright.
    pub fn rejects(&self) -> bool {
        AuthOutcome::Fail == self.result && DmarcPolicy::Reject == self.policy
    }
}

/// Evaluate DMARC for `ctx`.
///
/// The record is looked up at `_dmarc.<from-domain>`; if that does not
/// exist, at `_dmarc.<organisational-domain>`, in which case `sp=` applies.
pub fn eval(
    cache: &mut dns::Cache,
    ctx: &Context<'_>,
) -> Result<Outcome, CacheError> {
    let from_domain =
        ctx.from_domain.trim_end_matches('.').to_ascii_lowercase();
    let org_domain = organisational_domain(&from_domain);

    let (record, is_subdomain) = match find_record(cache, &from_domain) {
        Ok(Some(record)) => (record, false),
        Ok(None) if org_domain != from_domain => {
            match find_record(cache, &org_domain) {
                Ok(Some(record)) => (record, true),
                Ok(None) => return Ok(Outcome::NONE),
                Err(e) => return lookup_error(e),
            }
        },
        Ok(None) => return Ok(Outcome::NONE),
        Err(e) => return lookup_error(e),
    };

    let policy = if is_subdomain {
        record.subdomain_receiver_policy
    } else {
        record.requested_receiver_policy
    };

    let spf_aligned = AuthOutcome::Pass == ctx.spf
        && ctx
            .spf_domain
            .is_some_and(|d| aligned(record.spf, d, &from_domain));
    let dkim_aligned = AuthOutcome::Pass == ctx.dkim
        && ctx
            .dkim_sdid
            .is_some_and(|d| aligned(record.dkim, d, &from_domain));

    Ok(Outcome {
        result: if spf_aligned || dkim_aligned {
            AuthOutcome::Pass
        } else {
            AuthOutcome::Fail
        },
        policy,
    })
}

fn lookup_error(e: CacheError) -> Result<Outcome, CacheError> {
    match e {
        CacheError::NotReady => Err(CacheError::NotReady),
        // A broken DNS answer never causes a rejection.
        _ => Ok(Outcome {
            result: AuthOutcome::TempError,
            policy: DmarcPolicy::None,
        }),
    }
}

/// Find the DMARC record for `domain`.
///
/// Absence and unparsable records are both `Ok(None)`. `CacheError::NotFound`
/// is never returned.
fn find_record(
    cache: &mut dns::Cache,
    domain: &str,
) -> Result<Option<Record>, CacheError> {
    let Some(name) = dns::parse_name(&format!("_dmarc.{domain}")) else {
        return Ok(None);
    };

    let records = match dns::look_up(&mut cache.txt, &name) {
        Ok(records) => records,
        Err(CacheError::NotFound) => return Ok(None),
        Err(e) => return Err(e),
    };

    // RFC 7489 § 6.6.3: exactly one record must look like DMARC.
    let mut candidates = records
        .iter()
        .filter(|r| r.trim_start().starts_with("v=DMARC1"));
    let (Some(record), None) = (candidates.next(), candidates.next()) else {
        return Ok(None);
    };

    Ok(Record::parse(record).ok())
}

fn aligned(
    mode: AlignmentMode,
    authenticated: &str,
    from_domain: &str,
) -> bool {
    let authenticated = authenticated.trim_end_matches('.');
    match mode {
        AlignmentMode::Strict => {
            authenticated.eq_ignore_ascii_case(from_domain)
        },
        AlignmentMode::Relaxed => {
            organisational_domain(authenticated)
                == organisational_domain(from_domain)
        },
    }
}

#[cfg(test)]
mod test {
    use std::rc::Rc;

    use super::*;
    use crate::support::dns::Entry;

    fn cache_with(records: &[(&str, Entry<Vec<Rc<str>>>)]) -> dns::Cache {
        let mut cache = dns::Cache::default();
        for (name, entry) in records {
            let entry = match *entry {
                Entry::Ok(ref v) => Entry::Ok(v.clone()),
                Entry::NotFound => Entry::NotFound,
                _ => Entry::Error,
            };
            dns::put(
                &mut cache.txt,
                &dns::parse_name(name).unwrap(),
                entry,
            );
        }
        cache
    }

    fn txt(s: &str) -> Entry<Vec<Rc<str>>> {
        Entry::Ok(vec![Rc::from(s)])
    }

    fn ctx<'a>(spf: AuthOutcome, dkim: AuthOutcome) -> Context<'a> {
        Context {
            from_domain: "example.net",
            spf,
            spf_domain: Some("example.net"),
            dkim,
            dkim_sdid: Some("mail.example.net"),
        }
    }

    #[test]
    fn reject_policy_with_both_failing() {
        let mut cache =
            cache_with(&[("_dmarc.example.net", txt("v=DMARC1; p=reject;"))]);
        let outcome =
            eval(&mut cache, &ctx(AuthOutcome::Fail, AuthOutcome::Fail))
                .unwrap();
        assert_eq!(
            Outcome {
                result: AuthOutcome::Fail,
                policy: DmarcPolicy::Reject,
            },
            outcome
        );
        assert!(outcome.rejects());
    }

    #[test]
    fn quarantine_does_not_reject() {
        let mut cache = cache_with(&[(
            "_dmarc.example.net",
            txt("v=DMARC1; p=quarantine"),
        )]);
        let outcome =
            eval(&mut cache, &ctx(AuthOutcome::SoftFail, AuthOutcome::None))
                .unwrap();
        assert_eq!(AuthOutcome::Fail, outcome.result);
        assert_eq!(DmarcPolicy::Quarantine, outcome.policy);
        assert!(!outcome.rejects());
    }

    #[test]
    fn aligned_pass() {
        let mut cache =
            cache_with(&[("_dmarc.example.net", txt("v=DMARC1; p=reject"))]);
        assert_eq!(
            AuthOutcome::Pass,
            eval(&mut cache, &ctx(AuthOutcome::Pass, AuthOutcome::Fail))
                .unwrap()
                .result
        );
        // Relaxed alignment accepts a subdomain signature
        assert_eq!(
            AuthOutcome::Pass,
            eval(&mut cache, &ctx(AuthOutcome::Fail, AuthOutcome::Pass))
                .unwrap()
                .result
        );

        // Strict DKIM alignment does not
        let mut cache = cache_with(&[(
            "_dmarc.example.net",
            txt("v=DMARC1; p=reject; adkim=s"),
        )]);
        assert_eq!(
            AuthOutcome::Fail,
            eval(&mut cache, &ctx(AuthOutcome::Fail, AuthOutcome::Pass))
                .unwrap()
                .result
        );

        // An SPF pass for an unrelated domain does not align
        let mut cache =
            cache_with(&[("_dmarc.example.net", txt("v=DMARC1; p=reject"))]);
        let mut c = ctx(AuthOutcome::Pass, AuthOutcome::None);
        c.spf_domain = Some("bulk-sender.example");
        assert_eq!(AuthOutcome::Fail, eval(&mut cache, &c).unwrap().result);
    }

    #[test]
    fn absent_or_broken_records() {
        let mut cache = cache_with(&[
            ("_dmarc.example.net", Entry::NotFound),
            ("_dmarc.other.example", txt("v=DMARC1; p=reject; p=none")),
        ]);
        assert_eq!(
            Ok(Outcome::NONE),
            eval(&mut cache, &ctx(AuthOutcome::Fail, AuthOutcome::Fail))
        );

        let mut c = ctx(AuthOutcome::Fail, AuthOutcome::Fail);
        c.from_domain = "other.example";
        assert_eq!(Ok(Outcome::NONE), eval(&mut cache, &c));

        let mut cache = cache_with(&[("_dmarc.example.net", Entry::Error)]);
        assert_eq!(
            Ok(Outcome {
                result: AuthOutcome::TempError,
                policy: DmarcPolicy::None,
            }),
            eval(&mut cache, &ctx(AuthOutcome::Fail, AuthOutcome::Fail))
        );
    }

    #[test]
    fn subdomain_uses_org_record() {
        let mut cache = cache_with(&[
            ("_dmarc.news.example.net", Entry::NotFound),
            (
                "_dmarc.example.net",
                txt("v=DMARC1; p=reject; sp=quarantine"),
            ),
        ]);
        let mut c = ctx(AuthOutcome::Fail, AuthOutcome::Fail);
        c.from_domain = "news.example.net";
        assert_eq!(
            Ok(Outcome {
                result: AuthOutcome::Fail,
                policy: DmarcPolicy::Quarantine,
            }),
            eval(&mut cache, &c)
        );
    }

    #[test]
    fn missing_entries_are_not_ready() {
        let mut cache = dns::Cache::default();
        assert_eq!(
            Err(CacheError::NotReady),
            eval(&mut cache, &ctx(AuthOutcome::Pass, AuthOutcome::Pass))
        );
    }
}
