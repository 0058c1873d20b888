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

//! An evaluator for Sender Policy Framework records (RFC 7208).
//!
//! Evaluation is synchronous over a `dns::Cache`. Each pass either reaches a
//! conclusion or stops at the first name missing from the cache, returning
//! `NotReady`; `run` drives passes until the cache holds everything needed
//! or the deadline expires.

mod syntax;

use std::cell::RefCell;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::rc::Rc;

use log::debug;

use self::syntax as s;
use crate::store::AuthOutcome;
use crate::support::dns::{self, CacheError};

// RFC 7208 § 4.6.4
/// The maximum number of terms which trigger DNS queries that may be
/// processed before the result becomes `PermError`.
const MAX_DNS_DIRECTIVES: u32 = 10;
/// The maximum number of names returned by an MX query. If this limit is
/// exceeded, return `PermError`.
const MAX_MX_SIZE: usize = 10;

/// Immutable context used during the evaluation of an SPF record.
#[derive(Clone, Debug)]
pub struct Context<'a> {
    /// The domain of the `MAIL FROM` address, or the `HELO` name for the null
    /// reverse path.
    pub sender_domain: &'a str,
    /// The connecting IP address.
    pub ip: IpAddr,
}

struct State {
    dns_directives: u32,
}

/// Evaluation halted early. `NotReady` propagates to the caller; anything
/// else is a final result.
enum Halt {
    NotReady,
    Result(AuthOutcome),
}

impl From<CacheError> for Halt {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::NotReady => Halt::NotReady,
            CacheError::NotFound => Halt::Result(AuthOutcome::None),
            CacheError::Error => Halt::Result(AuthOutcome::TempError),
        }
    }
}

/// Run one evaluation pass.
pub fn eval(
    cache: &mut dns::Cache,
    ctx: &Context<'_>,
) -> Result<AuthOutcome, CacheError> {
    let ip = match ctx.ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        ip => ip,
    };

    let mut state = State { dns_directives: 0 };
    match check_host(cache, ip, &mut state, ctx.sender_domain) {
        Ok(result) | Err(Halt::Result(result)) => Ok(result),
        Err(Halt::NotReady) => Err(CacheError::NotReady),
    }
}

/// Evaluate `ctx` to completion, fetching DNS records as needed.
///
/// Running out of time yields `TempError`.
pub async fn run(
    cache: &Rc<RefCell<dns::Cache>>,
    resolver: Option<&Rc<dns::Resolver>>,
    ctx: &Context<'_>,
    deadline: tokio::time::Instant,
) -> AuthOutcome {
    let result = tokio::time::timeout_at(
        deadline,
        dns::wait_for(cache, resolver, |cache| eval(cache, ctx)),
    )
    .await;

    match result {
        Ok(Ok(result)) => result,
        // wait_for only fails once the cache can make no more progress
        Ok(Err(_)) => AuthOutcome::TempError,
        Err(_timeout) => {
            debug!("SPF evaluation for {} timed out", ctx.sender_domain);
            AuthOutcome::TempError
        },
    }
}

/// The `check_host()` function of RFC 7208 § 4.
fn check_host(
    cache: &mut dns::Cache,
    ip: IpAddr,
    state: &mut State,
    domain: &str,
) -> Result<AuthOutcome, Halt> {
    let Some(name) = dns::parse_name(domain) else {
        return Ok(AuthOutcome::None);
    };

    let txt = match dns::look_up(&mut cache.txt, &name) {
        Ok(txt) => txt,
        Err(CacheError::NotFound) => return Ok(AuthOutcome::None),
        Err(e) => return Err(e.into()),
    };

    let mut records = txt.iter().filter(|r| s::is_spf1(r));
    let record = match (records.next(), records.next()) {
        (None, _) => return Ok(AuthOutcome::None),
        (Some(record), None) => Rc::clone(record),
        (Some(_), Some(_)) => return Ok(AuthOutcome::PermError),
    };

    let terms = match s::parse_record(&record) {
        Ok(terms) => terms,
        Err(e) => {
            debug!("Invalid SPF record for {domain}: {e}");
            return Ok(AuthOutcome::PermError);
        },
    };

    let mut redirect = None;
    for term in &terms {
        let directive = match *term {
            s::Term::Directive(ref d) => d,
            s::Term::Modifier(s::Modifier::Redirect(spec)) => {
                redirect = Some(spec);
                continue;
            },
            s::Term::Modifier(_) => continue,
        };

        if eval_mechanism(cache, ip, state, domain, &directive.mechanism)? {
            return Ok(match directive.qualifier {
                s::Qualifier::Pass => AuthOutcome::Pass,
                s::Qualifier::Fail => AuthOutcome::Fail,
                s::Qualifier::SoftFail => AuthOutcome::SoftFail,
                s::Qualifier::Neutral => AuthOutcome::Neutral,
            });
        }
    }

    // RFC 7208 § 6.1: redirect only applies if no mechanism matched.
    if let Some(redirect) = redirect {
        count_dns_directive(state)?;
        let Some(target) = redirect.literal() else {
            return Ok(AuthOutcome::PermError);
        };
        return match check_host(cache, ip, state, target)? {
            AuthOutcome::None => Ok(AuthOutcome::PermError),
            result => Ok(result),
        };
    }

    Ok(AuthOutcome::Neutral)
}

fn count_dns_directive(state: &mut State) -> Result<(), Halt> {
    state.dns_directives += 1;
    if state.dns_directives > MAX_DNS_DIRECTIVES {
        Err(Halt::Result(AuthOutcome::PermError))
    } else {
        Ok(())
    }
}

/// Determine whether `mechanism` matches.
fn eval_mechanism(
    cache: &mut dns::Cache,
    ip: IpAddr,
    state: &mut State,
    domain: &str,
    mechanism: &s::Mechanism<'_>,
) -> Result<bool, Halt> {
    let target = |spec: Option<s::DomainSpec<'_>>| -> Option<String> {
        match spec {
            None => Some(domain.to_owned()),
            Some(spec) => spec.literal().map(str::to_owned),
        }
    };

    match *mechanism {
        s::Mechanism::All => Ok(true),

        s::Mechanism::Ip4(net, cidr_len) => Ok(match ip {
            IpAddr::V4(ip) => ipv4_addr_matches(ip, net, cidr_len),
            IpAddr::V6(_) => false,
        }),

        s::Mechanism::Ip6(net, cidr_len) => Ok(match ip {
            IpAddr::V6(ip) => ipv6_addr_matches(ip, net, cidr_len),
            IpAddr::V4(_) => false,
        }),

        s::Mechanism::Include(spec) => {
            count_dns_directive(state)?;
            let Some(target) = spec.literal() else {
                return Ok(false);
            };

            // RFC 7208 § 5.2
            match check_host(cache, ip, state, target)? {
                AuthOutcome::Pass => Ok(true),
                AuthOutcome::Fail
                | AuthOutcome::SoftFail
                | AuthOutcome::Neutral => Ok(false),
                AuthOutcome::TempError => {
                    Err(Halt::Result(AuthOutcome::TempError))
                },
                AuthOutcome::PermError | AuthOutcome::None => {
                    Err(Halt::Result(AuthOutcome::PermError))
                },
            }
        },

        s::Mechanism::A(spec, v4_len, v6_len) => {
            count_dns_directive(state)?;
            let Some(target) = target(spec) else {
                return Ok(false);
            };
            host_matches(cache, ip, &target, v4_len, v6_len)
        },

        s::Mechanism::Mx(spec, v4_len, v6_len) => {
            count_dns_directive(state)?;
            let Some(target) = target(spec) else {
                return Ok(false);
            };
            let Some(name) = dns::parse_name(&target) else {
                return Ok(false);
            };

            let exchanges = match dns::look_up(&mut cache.mx, &name) {
                Ok(mx) => mx.iter().map(|m| m.1.to_ascii()).collect::<Vec<_>>(),
                Err(CacheError::NotFound) => return Ok(false),
                Err(e) => return Err(e.into()),
            };
            if exchanges.len() > MAX_MX_SIZE {
                return Err(Halt::Result(AuthOutcome::PermError));
            }

            for exchange in exchanges {
                if host_matches(cache, ip, &exchange, v4_len, v6_len)? {
                    return Ok(true);
                }
            }
            Ok(false)
        },

        s::Mechanism::Exists(spec) => {
            count_dns_directive(state)?;
            let Some(name) = spec.literal().and_then(dns::parse_name) else {
                return Ok(false);
            };
            match dns::look_up(&mut cache.a, &name) {
                Ok(_) => Ok(true),
                Err(CacheError::NotFound) => Ok(false),
                Err(e) => Err(e.into()),
            }
        },

        // ptr is deprecated (RFC 7208 § 5.5) and never matches here.
        s::Mechanism::Ptr(_) => {
            count_dns_directive(state)?;
            Ok(false)
        },
    }
}

/// Whether `ip` is one of the addresses of `host`, with the given CIDR
/// lengths applied.
fn host_matches(
    cache: &mut dns::Cache,
    ip: IpAddr,
    host: &str,
    v4_len: Option<u32>,
    v6_len: Option<u32>,
) -> Result<bool, Halt> {
    let Some(name) = dns::parse_name(host) else {
        return Ok(false);
    };

    match ip {
        IpAddr::V4(ip) => match dns::look_up(&mut cache.a, &name) {
            Ok(addrs) => {
                Ok(addrs.iter().any(|&a| ipv4_addr_matches(ip, a, v4_len)))
            },
            Err(CacheError::NotFound) => Ok(false),
            Err(e) => Err(e.into()),
        },
        IpAddr::V6(ip) => match dns::look_up(&mut cache.aaaa, &name) {
            Ok(addrs) => {
                Ok(addrs.iter().any(|&a| ipv6_addr_matches(ip, a, v6_len)))
            },
            Err(CacheError::NotFound) => Ok(false),
            Err(e) => Err(e.into()),
        },
    }
}

fn ipv4_addr_matches(a: Ipv4Addr, b: Ipv4Addr, cidr_len: Option<u32>) -> bool {
    let cidr_len = cidr_len.unwrap_or(32).min(32);
    let mask = u32::MAX.checked_shl(32 - cidr_len).unwrap_or(0);
    (u32::from(a) & mask) == (u32::from(b) & mask)
}

fn ipv6_addr_matches(a: Ipv6Addr, b: Ipv6Addr, cidr_len: Option<u32>) -> bool {
    let cidr_len = cidr_len.unwrap_or(128).min(128);
    let mask = u128::MAX.checked_shl(128 - cidr_len).unwrap_or(0);
    (u128::from(a) & mask) == (u128::from(b) & mask)
}
