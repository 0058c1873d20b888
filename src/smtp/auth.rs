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

//! Computes the SPF, DKIM and DMARC results of an inbound message.

use std::cell::RefCell;
use std::fmt::Write as _;
use std::net::IpAddr;
use std::rc::Rc;

use chrono::prelude::*;
use log::{debug, info};

use super::{dmarc, spf};
use crate::mime::dkim;
use crate::mime::header::{
    address_domain, extract_address, split_message, Headers,
};
use crate::store::{AuthOutcome, AuthResults};
use crate::support::dns::{self, CacheError};
use crate::support::log_prefix::LogPrefix;

/// The envelope facts the validators need.
#[derive(Clone, Debug)]
pub struct Envelope<'a> {
    pub ip: IpAddr,
    pub helo: &'a str,
    /// The `MAIL FROM` address; empty for the null reverse path.
    pub mail_from: &'a str,
}

/// The combined verdict on a message.
#[derive(Clone, Debug)]
pub struct Verdict {
    pub results: AuthResults,
    /// The domain SPF was evaluated for.
    pub spf_domain: String,
    pub dkim_sdid: Option<String>,
    pub from_domain: Option<String>,
}

impl Verdict {
    /// Whether DMARC requires the message to be refused.
    pub fn rejects(&self) -> bool {
        dmarc::Outcome {
            result: self.results.dmarc,
            policy: self.results.dmarc_policy,
        }
        .rejects()
    }

    /// Render an `Authentication-Results` header (RFC 8601), including the
    /// trailing CRLF.
    pub fn header(&self, authserv_id: &str) -> String {
        let mut h = format!("Authentication-Results: {authserv_id};\r\n");
        let _ = write!(
            h,
            "\tspf={} smtp.mailfrom={};\r\n",
            self.results.spf.as_str(),
            self.spf_domain,
        );
        let _ = write!(h, "\tdkim={}", self.results.dkim.as_str());
        if let Some(ref sdid) = self.dkim_sdid {
            let _ = write!(h, " header.d={sdid}");
        }
        let _ = write!(
            h,
            ";\r\n\tdmarc={} (p={})",
            self.results.dmarc.as_str(),
            self.results.dmarc_policy.as_str(),
        );
        if let Some(ref from) = self.from_domain {
            let _ = write!(h, " header.from={from}");
        }
        h.push_str("\r\n");
        h
    }
}

/// Evaluate SPF, DKIM and DMARC for `message`.
///
/// DNS answers are shared through `cache`. No step may run past `deadline`;
/// anything unfinished by then becomes `TempError`.
pub async fn authenticate(
    log_prefix: &LogPrefix,
    cache: &Rc<RefCell<dns::Cache>>,
    resolver: Option<&Rc<dns::Resolver>>,
    envelope: &Envelope<'_>,
    message: &[u8],
    deadline: tokio::time::Instant,
) -> Verdict {
    let spf_domain = address_domain(envelope.mail_from)
        .unwrap_or_else(|| envelope.helo.to_ascii_lowercase());
    let spf = spf::run(
        cache,
        resolver,
        &spf::Context {
            sender_domain: &spf_domain,
            ip: envelope.ip,
        },
        deadline,
    )
    .await;

    let verifier = dkim::Verifier::new(message);
    let dkim_txt = match verifier
        .txt_record_name()
        .and_then(|n| dns::parse_name(&n))
    {
        None => Err(CacheError::NotFound),
        Some(name) => tokio::time::timeout_at(
            deadline,
            dns::wait_for(cache, resolver, |c| {
                dns::look_up(&mut c.txt, &name).map(|v| v.clone())
            }),
        )
        .await
        .unwrap_or(Err(CacheError::Error)),
    };
    let dkim = verifier.finish(
        dkim_txt.as_ref().map(Vec::as_slice).map_err(|&e| e),
        Utc::now(),
    );
    if let Some(ref error) = dkim.error {
        debug!("{log_prefix} DKIM: {error}");
    }

    let from_domain = from_domain(message);
    let dmarc = match from_domain {
        None => dmarc::Outcome {
            result: AuthOutcome::None,
            policy: crate::store::DmarcPolicy::None,
        },
        Some(ref from_domain) => {
            let ctx = dmarc::Context {
                from_domain,
                spf,
                spf_domain: Some(&spf_domain),
                dkim: dkim.result,
                dkim_sdid: dkim.sdid.as_deref(),
            };
            tokio::time::timeout_at(
                deadline,
                dns::wait_for(cache, resolver, |c| dmarc::eval(c, &ctx)),
            )
            .await
            .ok()
            .and_then(Result::ok)
            .unwrap_or(dmarc::Outcome {
                result: AuthOutcome::TempError,
                policy: crate::store::DmarcPolicy::None,
            })
        },
    };

    let verdict = Verdict {
        results: AuthResults {
            spf,
            dkim: dkim.result,
            dmarc: dmarc.result,
            dmarc_policy: dmarc.policy,
        },
        spf_domain,
        dkim_sdid: dkim.sdid,
        from_domain,
    };
    info!(
        "{log_prefix} spf={} dkim={} dmarc={} (p={})",
        verdict.results.spf.as_str(),
        verdict.results.dkim.as_str(),
        verdict.results.dmarc.as_str(),
        verdict.results.dmarc_policy.as_str(),
    );
    verdict
}

fn from_domain(message: &[u8]) -> Option<String> {
    let (header_block, _) = split_message(message);
    let headers = Headers::parse(header_block).ok()?;
    address_domain(&extract_address(headers.get("From")?)?)
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::store::DmarcPolicy;
    use crate::support::dns::Entry;

    fn dn(s: &str) -> dns::Name {
        dns::parse_name(s).unwrap()
    }

    fn run(cache: dns::Cache, message: &[u8]) -> Verdict {
        let cache = Rc::new(RefCell::new(cache));
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(authenticate(
            &LogPrefix::new("test".to_owned()),
            &cache,
            None,
            &Envelope {
                ip: "203.0.113.5".parse().unwrap(),
                helo: "mail.example.net",
                mail_from: "a@example.net",
            },
            message,
            tokio::time::Instant::now() + Duration::from_secs(10),
        ))
    }

    #[test]
    fn dmarc_reject_with_spf_and_dkim_failing() {
        let mut cache = dns::Cache::default();
        dns::put(
            &mut cache.txt,
            &dn("example.net"),
            Entry::Ok(vec![Rc::from("v=spf1 ip4:192.0.2.1 -all")]),
        );
        dns::put(
            &mut cache.txt,
            &dn("_dmarc.example.net"),
            Entry::Ok(vec![Rc::from("v=DMARC1; p=reject;")]),
        );

        let verdict =
            run(cache, b"From: a@example.net\r\nSubject: Hi\r\n\r\nHello.\r\n");
        assert_eq!(
            AuthResults {
                spf: AuthOutcome::Fail,
                dkim: AuthOutcome::None,
                dmarc: AuthOutcome::Fail,
                dmarc_policy: DmarcPolicy::Reject,
            },
            verdict.results
        );
        assert!(verdict.rejects());

        let header = verdict.header("mx.local");
        assert!(header.starts_with("Authentication-Results: mx.local;\r\n"));
        assert!(header.contains("spf=fail smtp.mailfrom=example.net;"));
        assert!(
            header.contains("dmarc=fail (p=reject) header.from=example.net")
        );
        assert!(header.ends_with("\r\n"));
    }

    #[test]
    fn spf_pass_aligns() {
        let mut cache = dns::Cache::default();
        dns::put(
            &mut cache.txt,
            &dn("example.net"),
            Entry::Ok(vec![Rc::from("v=spf1 ip4:203.0.113.0/24 -all")]),
        );
        dns::put(
            &mut cache.txt,
            &dn("_dmarc.example.net"),
            Entry::Ok(vec![Rc::from("v=DMARC1; p=reject")]),
        );

        let verdict = run(cache, b"From: <a@Example.NET>\r\n\r\nbody\r\n");
        assert_eq!(AuthOutcome::Pass, verdict.results.spf);
        assert_eq!(AuthOutcome::Pass, verdict.results.dmarc);
        assert!(!verdict.rejects());
    }

    #[test]
    fn dns_failure_never_rejects() {
        // Without a resolver every lookup fails
        let verdict = run(
            dns::Cache::default(),
            b"From: a@example.net\r\n\r\nbody\r\n",
        );
        assert_eq!(AuthOutcome::TempError, verdict.results.spf);
        assert_eq!(AuthOutcome::TempError, verdict.results.dmarc);
        assert_eq!(DmarcPolicy::None, verdict.results.dmarc_policy);
        assert!(!verdict.rejects());
    }
}
