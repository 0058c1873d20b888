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
use std::io;
use std::net::Ipv4Addr;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::sync::Arc;

use super::integration_test_common::*;
use super::*;
use crate::{
    antiabuse::{greylist::Greylist, ratelimit::RateLimiter},
    notify,
    store::{
        test_support::*, AuthOutcome, DmarcPolicy, Message, MessageFilter,
        Store,
    },
    support::{
        async_io::SessionIo, dns, log_prefix::LogPrefix,
        system_config::SystemConfig,
    },
};

const USER: &str = "dib@local.test";
const OTHER_USER: &str = "zim@local.test";

struct Setup {
    ts: TestStore,
}

fn set_up() -> Setup {
    let ts = test_store();
    add_user(&ts, USER);
    add_user(&ts, OTHER_USER);
    Setup { ts }
}

fn base_config() -> SystemConfig {
    let mut config = SystemConfig::default();
    config.identity.domain = "local.test".to_owned();
    config.greylist.enabled = false;
    config
}

impl Setup {
    fn connect(&self, cxn_name: &'static str) -> SmtpClient {
        self.connect_with(cxn_name, |_| ())
    }

    fn connect_with(
        &self,
        cxn_name: &'static str,
        configure: impl FnOnce(&mut SystemConfig),
    ) -> SmtpClient {
        let mut config = base_config();
        configure(&mut config);

        let (server_io, client_io) = UnixStream::pair().unwrap();
        let store = Arc::clone(&self.ts.store);
        std::thread::spawn(move || {
            run_server(store, config, cxn_name, server_io)
        });

        SmtpClient::new(cxn_name, client_io)
    }

    fn inbox(&self, user: &str) -> Vec<Message> {
        self.ts
            .list_messages(
                user,
                &MessageFilter {
                    mailbox: Some("INBOX".to_owned()),
                    ..MessageFilter::default()
                },
            )
            .unwrap()
    }

    fn body(&self, message: &Message) -> String {
        let raw = self.ts.blobs().read_blob(&message.body_path).unwrap();
        String::from_utf8(raw).unwrap()
    }
}

#[tokio::main(flavor = "current_thread")]
async fn run_server(
    store: Arc<Store>,
    config: SystemConfig,
    cxn_name: &'static str,
    server_io: UnixStream,
) {
    // DNS setup: earth.test has no configuration. mars.test publishes an SPF
    // record which accepts the client IP and a DMARC reject policy. venus.test
    // rejects the client IP via SPF and asks for DMARC rejection. pluto.test
    // is like venus.test but only asks for quarantine. The client IP is listed
    // by bl.test.
    let mut dns_cache = dns::Cache::default();
    let mut txt = |name: &str, value: &str| {
        dns::put(
            &mut dns_cache.txt,
            &dns::parse_name(name).unwrap(),
            dns::Entry::Ok(vec![Rc::from(value)]),
        );
    };
    txt("mars.test", "v=spf1 ip4:192.0.2.3 -all");
    txt("_dmarc.mars.test", "v=DMARC1; p=reject");
    txt("venus.test", "v=spf1 -all");
    txt("_dmarc.venus.test", "v=DMARC1; p=reject");
    txt("pluto.test", "v=spf1 -all");
    txt("_dmarc.pluto.test", "v=DMARC1; p=quarantine");
    dns::put(
        &mut dns_cache.a,
        &dns::parse_name("3.2.0.192.bl.test").unwrap(),
        dns::Entry::Ok(vec![Ipv4Addr::new(127, 0, 0, 2)]),
    );

    let greylist = if config.greylist.enabled {
        Some(Greylist::new(Arc::clone(&store), config.greylist.retry_delay()))
    } else {
        None
    };
    let context = SmtpInContext {
        rate_limiter: Arc::new(RateLimiter::new(
            config.rate_limit.count,
            config.rate_limit.window(),
        )),
        config: Arc::new(config),
        ingester: Ingester {
            store,
            submitter: None,
            hub: notify::Hub::new(),
        },
        greylist,
        dns_resolver: None,
        local_host_name: "mx.local.test".to_owned(),
    };

    let server_io = SessionIo::new_owned_socket(server_io).unwrap();
    let local = tokio::task::LocalSet::new();
    let result = local
        .run_until(serve_smtpin(
            server_io,
            Rc::new(context),
            Rc::new(RefCell::new(dns_cache)),
            LogPrefix::new(cxn_name.to_owned()),
            Some(ssl_acceptor()),
            "192.0.2.3".parse().unwrap(),
        ))
        .await;

    match result {
        Ok(()) => (),
        Err(crate::support::error::Error::Io(e))
            if io::ErrorKind::UnexpectedEof == e.kind()
                || Some(nix::libc::EPIPE) == e.raw_os_error() => {},
        Err(e) => panic!("Unexpected server error: {e} {e:?}"),
    }
}

#[test]
fn helo() {
    let setup = set_up();
    let mut cxn = setup.connect("helo");

    let mut responses = cxn.read_responses();
    assert_eq!(1, responses.len());
    assert!(
        responses[0].starts_with("220 mx.local.test ESMTP rookery "),
        "Unexpected greeting: {}",
        responses[0],
    );
    assert!(responses[0].ends_with(" ready\r\n"));

    cxn.write_line("HELO mail.earth.test\r\n");
    responses = cxn.read_responses();
    // Non-extended HELO yields no extensions, just the basic status code.
    assert_eq!(1, responses.len());
    assert!(responses[0].starts_with("250 mx.local.test"));

    cxn.simple_command("QUIT", "221 2.0.0");
}

#[test]
fn ehlo() {
    let setup = set_up();
    let mut cxn = setup.connect_with("ehlo", |c| c.smtp.max_size = 1234);
    cxn.read_responses();

    cxn.write_line("EHLO mail.earth.test\r\n");
    let responses = cxn.read_responses();
    assert!(responses[0].starts_with("250-mx.local.test"));
    assert!(responses.iter().any(|r| r.contains("SIZE 1234")));
    assert!(responses.iter().any(|r| r.contains("STARTTLS")));
    assert!(responses.iter().any(|r| r.contains("PIPELINING")));
    assert!(responses.iter().any(|r| r.contains("8BITMIME")));
    assert!(responses.iter().any(|r| r.contains("ENHANCEDSTATUSCODES")));
    assert!(!responses.iter().any(|r| r.contains("AUTH")));
    assert!(responses.last().unwrap().starts_with("250 "));
}

#[test]
fn misc_commands() {
    let setup = set_up();
    let mut cxn = setup.connect("misc_commands");
    cxn.skip_pleasantries("EHLO mail.earth.test");

    cxn.simple_command("NOOP", "250 2.0.0");
    cxn.simple_command("VRFY dib", "252 2.7.0");
    cxn.simple_command("EXPN staff", "550 5.3.3");
    cxn.simple_command("RSET", "250 2.0.0");
    cxn.simple_command("FROB", "500 5.5.1");
    cxn.simple_command("DATA", "503 ");
    cxn.simple_command("RCPT TO:<dib@local.test>", "503 ");

    cxn.write_line("HELP\r\n");
    let responses = cxn.read_responses();
    assert!(responses.len() > 1);
    assert!(responses.iter().all(|r| r.starts_with("214")));
}

#[test]
fn mail_before_helo() {
    let setup = set_up();
    let mut cxn = setup.connect("mail_before_helo");
    cxn.read_responses();
    cxn.simple_command("MAIL FROM:<a@earth.test>", "503 ");
}

#[test]
fn relay_explicitly_rejected() {
    let setup = set_up();
    let mut cxn = setup.connect("relay_explicitly_rejected");
    cxn.skip_pleasantries("EHLO mail.earth.test");
    cxn.simple_command("MAIL FROM:<a@earth.test>", "250 ");
    cxn.simple_command("RCPT TO:<gir@earth.test>", "550 5.1.2");
}

#[test]
fn bad_recipient() {
    let setup = set_up();
    let mut cxn = setup.connect("bad_recipient");
    cxn.skip_pleasantries("EHLO mail.earth.test");
    cxn.simple_command("MAIL FROM:<a@earth.test>", "250 ");
    cxn.simple_command("RCPT TO:<gir@local.test>", "550 5.1.1");
    // The transaction survives
    cxn.simple_command("RCPT TO:<dib@local.test>", "250 ");
}

#[test]
fn too_many_recipients() {
    let setup = set_up();
    let mut cxn =
        setup.connect_with(
            "too_many_recipients",
            |c| c.smtp.max_recipients = 2,
        );
    cxn.skip_pleasantries("EHLO mail.earth.test");
    cxn.simple_command("MAIL FROM:<a@earth.test>", "250 ");
    cxn.simple_command("RCPT TO:<dib@local.test>", "250 ");
    cxn.simple_command("RCPT TO:<zim@local.test>", "250 ");
    cxn.simple_command("RCPT TO:<dib@local.test>", "452 4.5.3");
}

#[test]
fn too_many_ineffectual_commands() {
    let setup = set_up();
    let mut cxn = setup.connect("too_many_ineffectual_commands");
    cxn.skip_pleasantries("EHLO mail.earth.test");
    for _ in 0..29 {
        cxn.simple_command("NOOP", "250 ");
    }
    cxn.simple_command("NOOP", "421 4.5.0");
}

#[test]
fn minimal_mail_delivery() {
    let setup = set_up();
    let mut cxn = setup.connect("minimal_mail_delivery");
    cxn.skip_pleasantries("EHLO mail.earth.test");

    let response = cxn.send_mail(
        "a@earth.test",
        &["dib@local.test"],
        "Subject: Hi\r\n\r\nHello.\r\n",
    );
    assert!(response.starts_with("250 2.0.0"), "{response}");

    let inbox = setup.inbox(USER);
    assert_eq!(1, inbox.len());
    let message = &inbox[0];
    assert_eq!("Hi", message.subject);
    assert_eq!("a@earth.test", message.sender);

    let body = setup.body(message);
    assert!(body.starts_with("Received: from mail.earth.test (192.0.2.3)\r\n"));
    assert!(body.contains("\tby mx.local.test (rookery "));
    assert!(body.contains("\tfor <dib@local.test>;\r\n"));
    assert!(body.contains("Authentication-Results: mx.local.test;\r\n"));
    assert!(body.contains("X-Spam-Status: No\r\n"));
    assert!(body.ends_with("Subject: Hi\r\n\r\nHello.\r\n"));

    let found = setup.ts.search(USER, "hello", 10).unwrap();
    assert_eq!(1, found.len());
    assert_eq!(message.id, found[0].id);

    // The connection is ready for another transaction
    let response = cxn.send_mail(
        "",
        &["dib@local.test"],
        "Subject: Bounce\r\n\r\nSecond.\r\n",
    );
    assert!(response.starts_with("250 "), "{response}");
    assert_eq!(2, setup.inbox(USER).len());
}

#[test]
fn multi_mail_delivery() {
    let setup = set_up();
    let mut cxn = setup.connect("multi_mail_delivery");
    cxn.skip_pleasantries("EHLO mail.earth.test");

    let response = cxn.send_mail(
        "a@earth.test",
        &["dib@local.test", "ZIM@Local.Test"],
        "Subject: Both\r\n\r\nTo both of you.\r\n",
    );
    assert!(response.starts_with("250 "), "{response}");

    let dib = setup.inbox(USER);
    let zim = setup.inbox(OTHER_USER);
    assert_eq!(1, dib.len());
    assert_eq!(1, zim.len());
    assert_ne!(dib[0].body_path, zim[0].body_path);
    assert!(setup.body(&zim[0]).contains("\tfor <zim@local.test>;\r\n"));
}

#[test]
fn dot_stuffed_delivery() {
    let setup = set_up();
    let mut cxn = setup.connect("dot_stuffed_delivery");
    cxn.skip_pleasantries("EHLO mail.earth.test");

    let response = cxn.send_mail(
        "a@earth.test",
        &["dib@local.test"],
        "Subject: Dots\r\n\r\n..leading dot\r\n",
    );
    assert!(response.starts_with("250 "), "{response}");
    let body = setup.body(&setup.inbox(USER)[0]);
    assert!(body.ends_with("\r\n\r\n.leading dot\r\n"), "{body:?}");
}

#[test]
fn message_size_boundary() {
    let setup = set_up();
    let mut cxn = setup.connect_with("message_size_boundary", |c| {
        c.smtp.max_size = 100
    });
    cxn.skip_pleasantries("EHLO mail.earth.test");

    let exact = format!("Subject: x\r\n\r\n{}\r\n", "a".repeat(100 - 16));
    assert_eq!(100, exact.len());
    let response = cxn.send_mail("a@earth.test", &["dib@local.test"], &exact);
    assert!(response.starts_with("250 "), "{response}");

    let over = format!("Subject: x\r\n\r\n{}\r\n", "a".repeat(100 - 15));
    let response = cxn.send_mail("a@earth.test", &["dib@local.test"], &over);
    assert!(response.starts_with("552 5.3.4"), "{response}");

    assert_eq!(1, setup.inbox(USER).len());
}

#[test]
fn declared_size_too_big() {
    let setup = set_up();
    let mut cxn = setup.connect_with("declared_size_too_big", |c| {
        c.smtp.max_size = 100
    });
    cxn.skip_pleasantries("EHLO mail.earth.test");
    cxn.simple_command("MAIL FROM:<a@earth.test> SIZE=101", "552 5.3.4");
    cxn.simple_command("MAIL FROM:<a@earth.test> SIZE=100", "250 ");
}

#[test]
fn malformed_message_rejected() {
    let setup = set_up();
    let mut cxn = setup.connect("malformed_message_rejected");
    cxn.skip_pleasantries("EHLO mail.earth.test");

    let response = cxn.send_mail(
        "a@earth.test",
        &["dib@local.test"],
        "this is not a header\r\n\r\nbody\r\n",
    );
    assert!(response.starts_with("550 5.6.0"), "{response}");
    assert!(setup.inbox(USER).is_empty());
}

#[test]
fn dmarc_reject() {
    let setup = set_up();
    let mut cxn = setup.connect("dmarc_reject");
    cxn.skip_pleasantries("EHLO mail.venus.test");

    let response = cxn.send_mail(
        "a@venus.test",
        &["dib@local.test"],
        "From: a@venus.test\r\nSubject: Forged\r\n\r\nHello.\r\n",
    );
    assert!(response.starts_with("550 5.7.1"), "{response}");
    assert!(setup.inbox(USER).is_empty());
    assert_eq!(0, count_files(&setup.ts.root.path().join("blobs")));
}

#[test]
fn dmarc_quarantine_is_recorded() {
    let setup = set_up();
    let mut cxn = setup.connect("dmarc_quarantine_is_recorded");
    cxn.skip_pleasantries("EHLO mail.pluto.test");

    let response = cxn.send_mail(
        "a@pluto.test",
        &["dib@local.test"],
        "From: a@pluto.test\r\nSubject: Hmm\r\n\r\nHello.\r\n",
    );
    assert!(response.starts_with("250 "), "{response}");

    let inbox = setup.inbox(USER);
    assert_eq!(1, inbox.len());
    assert_eq!(AuthOutcome::Fail, inbox[0].auth.spf);
    assert_eq!(AuthOutcome::Fail, inbox[0].auth.dmarc);
    assert_eq!(DmarcPolicy::Quarantine, inbox[0].auth.dmarc_policy);
}

#[test]
fn dmarc_pass() {
    let setup = set_up();
    let mut cxn = setup.connect("dmarc_pass");
    cxn.skip_pleasantries("EHLO mail.mars.test");

    let response = cxn.send_mail(
        "a@mars.test",
        &["dib@local.test"],
        "From: a@mars.test\r\nSubject: Legit\r\n\r\nHello.\r\n",
    );
    assert!(response.starts_with("250 "), "{response}");

    let message = &setup.inbox(USER)[0];
    assert_eq!(AuthOutcome::Pass, message.auth.spf);
    assert_eq!(AuthOutcome::Pass, message.auth.dmarc);
    assert!(setup
        .body(message)
        .contains("\tspf=pass smtp.mailfrom=mars.test;\r\n"));
}

#[test]
fn greylisted_recipient() {
    let setup = set_up();
    let mut cxn = setup.connect_with("greylisted_recipient", |c| {
        c.greylist.enabled = true
    });
    cxn.skip_pleasantries("EHLO mail.earth.test");
    cxn.simple_command("MAIL FROM:<a@earth.test>", "250 ");
    cxn.simple_command("RCPT TO:<dib@local.test>", "451 4.7.1");
    // Still deferred on an immediate retry
    cxn.simple_command("RCPT TO:<dib@local.test>", "451 4.7.1");
    // Unknown users are rejected before the greylist is consulted
    cxn.simple_command("RCPT TO:<gir@local.test>", "550 5.1.1");
}

#[test]
fn connection_rate_limit() {
    let setup = set_up();
    let mut cxn =
        setup.connect_with("connection_rate_limit", |c| c.rate_limit.count = 0);
    let responses = cxn.read_responses();
    assert_eq!(1, responses.len());
    assert!(responses[0].starts_with("421 4.7.0"), "{}", responses[0]);
}

#[test]
fn recipient_rate_limit() {
    let setup = set_up();
    // The connection itself uses up the allowance
    let mut cxn =
        setup.connect_with("recipient_rate_limit", |c| c.rate_limit.count = 1);
    cxn.skip_pleasantries("EHLO mail.earth.test");
    cxn.simple_command("MAIL FROM:<a@earth.test>", "250 ");
    cxn.simple_command("RCPT TO:<dib@local.test>", "450 4.7.0");
}

#[test]
fn dnsbl_listed() {
    let setup = set_up();
    let mut cxn = setup.connect_with("dnsbl_listed", |c| {
        c.dnsbl.zones = vec!["clean.test".to_owned(), "bl.test".to_owned()]
    });
    let responses = cxn.read_responses();
    assert_eq!(1, responses.len());
    assert!(responses[0].starts_with("421 4.7.1"), "{}", responses[0]);
    assert!(responses[0].contains("bl.test"));
}

#[test]
fn delivery_over_tls() {
    let setup = set_up();
    let mut cxn = setup.connect("delivery_over_tls");
    cxn.skip_pleasantries_with_tls("EHLO mail.earth.test");

    // STARTTLS is not offered twice
    cxn.write_line("EHLO mail.earth.test\r\n");
    let responses = cxn.read_responses();
    assert!(!responses.iter().any(|r| r.contains("STARTTLS")));

    let response = cxn.send_mail(
        "a@earth.test",
        &["dib@local.test"],
        "Subject: Secret\r\n\r\nHello.\r\n",
    );
    assert!(response.starts_with("250 "), "{response}");
    assert!(setup
        .body(&setup.inbox(USER)[0])
        .contains("\tvia TCP with ESMTPS ("));
}

#[test]
fn rset_abandons_transaction() {
    let setup = set_up();
    let mut cxn = setup.connect("rset_abandons_transaction");
    cxn.skip_pleasantries("EHLO mail.earth.test");
    cxn.simple_command("MAIL FROM:<a@earth.test>", "250 ");
    cxn.simple_command("RCPT TO:<dib@local.test>", "250 ");
    cxn.simple_command("RSET", "250 ");
    cxn.simple_command("DATA", "503 ");

    // A new HELO also resets
    cxn.simple_command("MAIL FROM:<a@earth.test>", "250 ");
    cxn.write_line("HELO mail.earth.test\r\n");
    cxn.read_responses();
    cxn.simple_command("MAIL FROM:<a@earth.test>", "250 ");
}

fn count_files(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|e| {
            let path = e.unwrap().path();
            if path.is_dir() {
                count_files(&path)
            } else {
                1
            }
        })
        .sum()
}
