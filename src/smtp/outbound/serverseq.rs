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

use std::cell::RefCell;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::time::Duration;

use log::{info, warn};
use rand::seq::SliceRandom;

use super::{
    dane,
    transact::{self, Envelope},
    transcript::Transcript,
};
use crate::support::{
    async_io::SessionIo, dns, log_prefix::LogPrefix,
    system_config::DaneMode,
};

/// The disposition of one delivery attempt across all of a domain's mail
/// exchangers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Delivered,
    /// Every server failed in a way that may resolve itself later.
    Transient,
    /// A server refused the message, or the domain accepts no mail.
    Permanent,
}

pub struct Results {
    pub outcome: Outcome,
    pub transcript: Transcript,
}

pub type TransactResult = Result<transact::Results, transact::Error>;
pub type MockConnect<'a> = &'a dyn Fn(IpAddr) -> TransactResult;

/// Everything about the environment a delivery attempt needs.
pub struct Context {
    pub log_prefix: LogPrefix,
    pub dns_cache: Rc<RefCell<dns::Cache>>,
    pub dns_resolver: Option<Rc<dns::Resolver>>,
    pub local_host_name: String,
    pub port: u16,
    /// The deadline for the complete attempt against one server.
    pub attempt_timeout: Duration,
    pub dane: DaneMode,
}

/// Sends `envelope` by connecting to the mail server(s) for `domain`.
///
/// If `mock_connect` is `Some`, it is invoked for each IP address to be
/// attempted instead of actually connecting to anything. This is used for
/// testing.
pub async fn execute(
    ctx: &Context,
    domain: &Rc<dns::Name>,
    envelope: &Envelope<'_>,
    mock_connect: Option<MockConnect<'_>>,
) -> Results {
    let mut transcript = Transcript::new();
    transcript.line(format_args!(
        "Delivering to <{}> via {domain}",
        envelope.recipient,
    ));

    let outcome = match dns_mx(&mut transcript, ctx, domain).await {
        Err(outcome) => outcome,
        Ok(mx_records) => {
            try_exchangers(
                &mut transcript,
                ctx,
                &mx_records,
                envelope,
                mock_connect,
            )
            .await
        },
    };

    Results {
        outcome,
        transcript,
    }
}

async fn try_exchangers(
    transcript: &mut Transcript,
    ctx: &Context,
    mx_records: &[Rc<dns::Name>],
    envelope: &Envelope<'_>,
    mock_connect: Option<MockConnect<'_>>,
) -> Outcome {
    for mx_domain in mx_records {
        match try_domain(transcript, ctx, mx_domain, envelope, mock_connect)
            .await
        {
            Ok(()) => return Outcome::Delivered,
            Err(transact::Error::TryNextServer) => {},
            Err(transact::Error::TotalFailure) => return Outcome::Permanent,
        }
    }

    Outcome::Transient
}

/// Resolve the mail exchangers of `domain`, most preferred first.
///
/// A domain without MX records is its own exchanger (RFC 5321 §5.1); a
/// domain with a null MX (RFC 7505) accepts no mail at all.
async fn dns_mx(
    transcript: &mut Transcript,
    ctx: &Context,
    domain: &Rc<dns::Name>,
) -> Result<Vec<Rc<dns::Name>>, Outcome> {
    transcript.line(format_args!(">> DNS MX {domain}"));
    let mx_result =
        dns::wait_for(&ctx.dns_cache, ctx.dns_resolver.as_ref(), |dns_cache| {
            dns::look_up(&mut dns_cache.mx, domain).cloned()
        })
        .await;

    let mut mx_records = match mx_result {
        Ok(m) if !m.is_empty() => m,
        Ok(_ /* empty */) | Err(dns::CacheError::NotFound) => {
            transcript.line(format_args!(
                "No MX record found, using {domain} \
                 itself as the mail exchange",
            ));
            return Ok(vec![Rc::clone(domain)]);
        },
        Err(_) => {
            transcript.line(format_args!("DNS lookup error"));
            return Err(Outcome::Transient);
        },
    };

    for &(preference, ref name) in &mx_records {
        transcript.line(format_args!("<< {preference} {name}"));
    }

    if let [(_, ref name)] = mx_records[..] {
        if name.is_root() {
            transcript.line(format_args!("{domain} does not accept mail"));
            return Err(Outcome::Permanent);
        }
    }

    // Shuffle first so that servers of equal preference share the load.
    mx_records.shuffle(&mut rand::thread_rng());
    mx_records.sort_by_key(|&(preference, _)| preference);
    Ok(mx_records.into_iter().map(|(_, name)| name).collect())
}

async fn try_domain(
    transcript: &mut Transcript,
    ctx: &Context,
    mx_domain: &Rc<dns::Name>,
    envelope: &Envelope<'_>,
    mock_connect: Option<MockConnect<'_>>,
) -> Result<(), transact::Error> {
    transcript.line(format_args!("Trying domain {mx_domain}..."));
    let addresses = dns_a(transcript, ctx, mx_domain)
        .await
        .map_err(|_| transact::Error::TryNextServer)?;

    let tlsa = tlsa_records(transcript, ctx, mx_domain).await;

    for addr in addresses {
        let addr_result = if let Some(mock_connect) = mock_connect {
            mock_connect(addr)
        } else {
            match tokio::time::timeout(
                ctx.attempt_timeout,
                try_addr(transcript, ctx, mx_domain, addr, envelope),
            )
            .await
            {
                Ok(r) => r,
                Err(_) => {
                    transcript
                        .line(format_args!("Attempt on {addr} timed out"));
                    Err(transact::Error::TryNextServer)
                },
            }
        };

        match addr_result {
            Ok(results) => {
                if let Some(ref tlsa) = tlsa {
                    let verdict =
                        dane::check(tlsa, results.peer_certificate.as_ref());
                    transcript.line(format_args!("DANE: {verdict}"));
                    if dane::Verdict::Mismatch == verdict {
                        warn!(
                            "{} DANE advisory: certificate of {mx_domain} \
                             matches none of its TLSA records",
                            ctx.log_prefix,
                        );
                    } else {
                        info!(
                            "{} DANE advisory for {mx_domain}: {verdict}",
                            ctx.log_prefix,
                        );
                    }
                }
                return Ok(());
            },
            Err(transact::Error::TotalFailure) => {
                return Err(transact::Error::TotalFailure);
            },
            Err(transact::Error::TryNextServer) => {},
        }
    }

    Err(transact::Error::TryNextServer)
}

/// Fetch the TLSA records for `mx_domain` when DANE is enabled.
///
/// `None` means there is nothing to check against, including when the
/// lookup failed.
async fn tlsa_records(
    transcript: &mut Transcript,
    ctx: &Context,
    mx_domain: &dns::Name,
) -> Option<Vec<dane::Record>> {
    if DaneMode::Off == ctx.dane {
        return None;
    }

    let resolver = ctx.dns_resolver.as_ref()?;
    transcript.line(format_args!(">> DNS TLSA _{}._tcp.{mx_domain}", ctx.port));
    match dane::look_up(resolver, mx_domain, ctx.port).await {
        Ok(records) => {
            transcript
                .line(format_args!("<< {} TLSA record(s)", records.len()));
            Some(records)
        },
        Err(e) => {
            transcript.line(format_args!("TLSA lookup failed: {e}"));
            None
        },
    }
}

async fn dns_a(
    transcript: &mut Transcript,
    ctx: &Context,
    domain: &dns::Name,
) -> Result<Vec<IpAddr>, ()> {
    transcript.line(format_args!(">> DNS AAAA + A {domain}"));

    match dns::addresses(&ctx.dns_cache, ctx.dns_resolver.as_ref(), domain)
        .await
    {
        Ok(results) => {
            for &addr in &results {
                transcript.line(format_args!("<< {addr}"));
            }
            Ok(results)
        },
        Err(dns::CacheError::NotFound) => {
            transcript
                .line(format_args!("No IP addresses found for {domain}"));
            Err(())
        },
        Err(_) => {
            transcript.line(format_args!("DNS error on address lookup"));
            Err(())
        },
    }
}

async fn try_addr(
    transcript: &mut Transcript,
    ctx: &Context,
    mx_domain: &dns::Name,
    addr: IpAddr,
    envelope: &Envelope<'_>,
) -> TransactResult {
    let addr = SocketAddr::from((addr, ctx.port));
    transcript.line(format_args!("Connecting to {addr}..."));
    let sock = match tokio::net::TcpStream::connect(addr).await {
        Ok(sock) => sock,
        Err(e) => {
            transcript.line(format_args!("Failed to connect: {e}"));
            return Err(transact::Error::TryNextServer);
        },
    };
    // SessionIo drives the raw socket itself, so hand it a std socket.
    let session_io = match sock
        .into_std()
        .map_err(|e| e.to_string())
        .and_then(|sock| {
            SessionIo::new_owned_socket(sock).map_err(|e| e.to_string())
        }) {
        Ok(session_io) => session_io,
        Err(e) => {
            transcript.line(format_args!("Failed to configure socket: {e}"));
            return Err(transact::Error::TryNextServer);
        },
    };
    transcript.line(format_args!("Connection established"));

    transact::execute(
        session_io,
        transcript,
        envelope,
        mx_domain,
        &ctx.local_host_name,
    )
    .await
}

#[cfg(test)]
pub(super) mod test {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use super::*;

    fn delivered() -> TransactResult {
        Ok(transact::Results::default())
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_test(
        dns: &[(&str, &[&str])],
        connect_results: &[(&str, TransactResult)],
    ) -> Outcome {
        crate::init_test_log();

        let mut dns_cache = dns::Cache::default();
        for &(host, records) in dns {
            let host = dns::parse_name(host).unwrap();
            let mut a = dns::Entry::<Vec<Ipv4Addr>>::NotFound;
            let mut aaaa = dns::Entry::<Vec<Ipv6Addr>>::NotFound;
            let mut mx = dns::Entry::<Vec<(u16, Rc<dns::Name>)>>::NotFound;

            for &record in records {
                if let Ok(ipv4) = record.parse::<Ipv4Addr>() {
                    match a {
                        dns::Entry::Ok(ref mut v) => v.push(ipv4),
                        ref mut a => *a = dns::Entry::Ok(vec![ipv4]),
                    }
                } else if let Ok(ipv6) = record.parse::<Ipv6Addr>() {
                    match aaaa {
                        dns::Entry::Ok(ref mut v) => v.push(ipv6),
                        ref mut aaaa => *aaaa = dns::Entry::Ok(vec![ipv6]),
                    }
                } else if let Some(mxr) = parse_mx_record(record) {
                    match mx {
                        dns::Entry::Ok(ref mut v) => v.push(mxr),
                        ref mut mx => *mx = dns::Entry::Ok(vec![mxr]),
                    }
                } else if "a-error" == record {
                    a = dns::Entry::Error;
                } else if "aaaa-error" == record {
                    aaaa = dns::Entry::Error;
                } else if "mx-error" == record {
                    mx = dns::Entry::Error;
                } else {
                    panic!("bad DNS entry for {host}: {record}");
                }
            }

            dns::put(&mut dns_cache.a, &host, a);
            dns::put(&mut dns_cache.aaaa, &host, aaaa);
            dns::put(&mut dns_cache.mx, &host, mx);
        }

        let mock_connect = |actual_ipaddr: IpAddr| {
            for (expected_ip, ref result) in connect_results {
                let expected_ipaddr = expected_ip.parse::<IpAddr>().unwrap();
                if expected_ipaddr == actual_ipaddr {
                    return result.clone();
                }
            }

            panic!("unexpected attempt to connect to {actual_ipaddr}")
        };

        let ctx = Context {
            log_prefix: LogPrefix::new("delivery".to_owned()),
            dns_cache: Rc::new(RefCell::new(dns_cache)),
            dns_resolver: None,
            local_host_name: "localhost".to_owned(),
            port: 25,
            attempt_timeout: Duration::from_secs(10),
            dane: DaneMode::Advisory,
        };
        let results = execute(
            &ctx,
            &Rc::new(dns::parse_name("example.com").unwrap()),
            &Envelope {
                mail_from: "zim@irk.com",
                recipient: "one@example.com",
                data: b"message",
            },
            Some(&mock_connect),
        )
        .await;

        println!("Transcript:\n{}", results.transcript.as_str());
        results.outcome
    }

    fn parse_mx_record(r: &str) -> Option<(u16, Rc<dns::Name>)> {
        let (pref, name) = r.split_once('@')?;
        let pref = pref.parse::<u16>().ok()?;
        let name = if "." == name {
            dns::Name::root()
        } else {
            dns::parse_name(name)?
        };
        Some((pref, Rc::new(name)))
    }

    #[test]
    fn simple_happy_path() {
        assert_eq!(
            Outcome::Delivered,
            run_test(
                &[
                    (
                        "example.com",
                        &["20@mx2.example.com", "10@mx1.example.com"],
                    ),
                    ("mx1.example.com", &["1.2.3.4"]),
                ],
                &[("1.2.3.4", delivered())],
            )
        );
    }

    #[test]
    fn simple_happy_path_ipv6() {
        assert_eq!(
            Outcome::Delivered,
            run_test(
                &[
                    (
                        "example.com",
                        &["20@mx2.example.com", "10@mx1.example.com"],
                    ),
                    ("mx1.example.com", &["dead::beef"]),
                ],
                &[("dead::beef", delivered())],
            )
        );
    }

    #[test]
    fn no_mx_fallback() {
        assert_eq!(
            Outcome::Delivered,
            run_test(
                &[("example.com", &["1.2.3.4"])],
                &[("1.2.3.4", delivered())],
            )
        );
    }

    #[test]
    fn null_mx_is_permanent() {
        assert_eq!(
            Outcome::Permanent,
            run_test(&[("example.com", &["0@."])], &[])
        );
    }

    #[test]
    fn lower_preference_tried_first() {
        // Only the address of the preferred exchanger may be contacted.
        assert_eq!(
            Outcome::Transient,
            run_test(
                &[
                    (
                        "example.com",
                        &["20@mx2.example.com", "10@mx1.example.com"],
                    ),
                    ("mx1.example.com", &["1.2.3.4"]),
                    ("mx2.example.com", &["a-error", "aaaa-error"]),
                ],
                &[("1.2.3.4", Err(transact::Error::TryNextServer))],
            )
        );
    }

    #[test]
    fn connect_try_next_server_ip_address() {
        assert_eq!(
            Outcome::Delivered,
            run_test(
                &[
                    ("example.com", &["10@mx1.example.com"]),
                    ("mx1.example.com", &["1.2.3.4", "4.5.6.7"]),
                ],
                &[
                    ("1.2.3.4", Err(transact::Error::TryNextServer)),
                    ("4.5.6.7", delivered()),
                ],
            )
        );
    }

    #[test]
    fn connect_try_next_server_mx_record() {
        assert_eq!(
            Outcome::Delivered,
            run_test(
                &[
                    (
                        "example.com",
                        &["20@mx2.example.com", "10@mx1.example.com"],
                    ),
                    ("mx1.example.com", &["1.2.3.4"]),
                    ("mx2.example.com", &["4.5.6.7"]),
                ],
                &[
                    ("1.2.3.4", Err(transact::Error::TryNextServer)),
                    ("4.5.6.7", delivered()),
                ],
            )
        );
    }

    #[test]
    fn connect_total_failure() {
        assert_eq!(
            Outcome::Permanent,
            run_test(
                &[
                    (
                        "example.com",
                        &["20@mx2.example.com", "10@mx1.example.com"],
                    ),
                    ("mx1.example.com", &["1.2.3.4"]),
                    ("mx2.example.com", &["4.5.6.7"]),
                ],
                &[("1.2.3.4", Err(transact::Error::TotalFailure))],
            )
        );
    }

    /// Attempts delivery where the preferred exchanger gives `first` and the
    /// backup would accept the message.
    pub(in crate::smtp::outbound) fn with_backup_exchanger(
        first: TransactResult,
    ) -> Outcome {
        run_test(
            &[
                ("example.com", &["20@mx2.example.com", "10@mx1.example.com"]),
                ("mx1.example.com", &["1.2.3.4"]),
                ("mx2.example.com", &["4.5.6.7"]),
            ],
            &[("1.2.3.4", first), ("4.5.6.7", delivered())],
        )
    }

    #[test]
    fn refused_session_skips_backup_exchanger() {
        use crate::smtp::codes::pc;

        for at_ehlo in [false, true] {
            assert_eq!(
                Outcome::Permanent,
                with_backup_exchanger(transact::test::refused_session(
                    pc::TransactionFailed,
                    at_ehlo,
                )),
            );
        }

        assert_eq!(
            Outcome::Delivered,
            with_backup_exchanger(transact::test::refused_session(
                pc::ServiceNotAvailableClosing,
                false,
            )),
        );
    }

    #[test]
    fn a_record_not_found() {
        assert_eq!(
            Outcome::Delivered,
            run_test(
                &[
                    (
                        "example.com",
                        &["20@mx2.example.com", "10@mx1.example.com"],
                    ),
                    ("mx2.example.com", &["4.5.6.7"]),
                ],
                &[("4.5.6.7", delivered())],
            )
        );
    }

    #[test]
    fn mx_record_error() {
        assert_eq!(
            Outcome::Transient,
            run_test(&[("example.com", &["mx-error"])], &[])
        );
    }
}
