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

use std::io::{self, BufRead, BufReader, Read, Write};
use std::mem;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::sync::Arc;

use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};

use super::*;
use crate::{
    mime::parse::parse_message,
    notify,
    smtp::inbound::{Incoming, Ingester, Recipient},
    store::{test_support::*, AuthResults, Message, MessageFilter, Role, Store},
    support::{
        async_io::{test_support::self_signed_acceptor, SessionIo},
        log_prefix::LogPrefix,
        password,
        system_config::SystemConfig,
    },
};

const USER: &str = "dib@local.test";
const PASSWORD: &str = "hunter2";

trait ReadWrite: Read + Write {}
impl<T: Read + Write + ?Sized> ReadWrite for T {}

struct Setup {
    ts: TestStore,
    hub: Arc<notify::Hub>,
}

fn set_up() -> Setup {
    let ts = test_store();
    ts.create_user(
        USER,
        &password::hash(PASSWORD).unwrap(),
        Role::User,
        1 << 30,
    )
    .unwrap();
    add_user(&ts, "zim@local.test");
    Setup {
        ts,
        hub: notify::Hub::new(),
    }
}

impl Setup {
    fn connect(&self, cxn_name: &'static str) -> ImapClient {
        self.connect_with(cxn_name, |_| ())
    }

    fn connect_with(
        &self,
        cxn_name: &'static str,
        configure: impl FnOnce(&mut SystemConfig),
    ) -> ImapClient {
        let mut config = SystemConfig::default();
        config.identity.domain = "local.test".to_owned();
        configure(&mut config);

        let (server_io, client_io) = UnixStream::pair().unwrap();
        let store = Arc::clone(&self.ts.store);
        let hub = Arc::clone(&self.hub);
        std::thread::spawn(move || {
            run_server(store, hub, config, cxn_name, server_io)
        });

        ImapClient::new(cxn_name, client_io)
    }

    /// Deliver a message to `USER` the way the SMTP receiver would.
    fn deliver(&self, subject: &str, body: &str) {
        let raw = format!(
            "From: gir@earth.test\r\nSubject: {subject}\r\n\r\n{body}\r\n"
        );
        let parsed = parse_message(raw.as_bytes()).unwrap();
        let recipient =
            Recipient::normalise_and_validate(&self.ts, "local.test", USER)
                .unwrap();
        let ingester = Ingester {
            store: Arc::clone(&self.ts.store),
            submitter: None,
            hub: Arc::clone(&self.hub),
        };
        let stored = ingester
            .ingest(
                &LogPrefix::new("deliver".to_owned()),
                &Incoming {
                    recipient: &recipient,
                    envelope_sender: "gir@earth.test",
                    prefix: "",
                    raw: raw.as_bytes(),
                    parsed: &parsed,
                    is_spam: false,
                    auth: AuthResults::default(),
                },
            )
            .unwrap();
        assert_eq!(1, stored.len());
    }

    fn mailbox(&self, name: &str) -> Vec<Message> {
        self.ts
            .list_messages(
                USER,
                &MessageFilter {
                    mailbox: Some(name.to_owned()),
                    ..MessageFilter::default()
                },
            )
            .unwrap()
    }
}

#[tokio::main(flavor = "current_thread")]
async fn run_server(
    store: Arc<Store>,
    hub: Arc<notify::Hub>,
    config: SystemConfig,
    cxn_name: &'static str,
    server_io: UnixStream,
) {
    let context = ImapContext {
        config: Arc::new(config),
        store,
        hub,
        local_host_name: "imap.local.test".to_owned(),
    };

    let server_io = SessionIo::new_owned_socket(server_io).unwrap();
    let local = tokio::task::LocalSet::new();
    let result = local
        .run_until(serve_imap(
            server_io,
            Rc::new(context),
            LogPrefix::new(cxn_name.to_owned()),
            Some(self_signed_acceptor()),
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

struct ImapClient {
    name: &'static str,
    io: BufReader<Box<dyn ReadWrite>>,
    next_tag: u32,
}

impl ImapClient {
    fn new(name: &'static str, io: impl ReadWrite + 'static) -> Self {
        Self {
            name,
            io: BufReader::new(Box::new(io)),
            next_tag: 1,
        }
    }

    /// Read one logical response line, inlining any literals it carries.
    fn read_line(&mut self) -> String {
        let mut ret = Vec::<u8>::new();
        loop {
            let start = ret.len();
            self.io.read_until(b'\n', &mut ret).unwrap();
            if ret.len() == start {
                panic!("Unexpected EOF");
            }

            let Some(length) = literal_length(&ret[start..]) else {
                break;
            };
            let literal_start = ret.len();
            ret.resize(literal_start + length, 0);
            self.io.read_exact(&mut ret[literal_start..]).unwrap();
        }

        let line = String::from_utf8_lossy(&ret).into_owned();
        println!("[{}] >> {:?}", self.name, line);
        line
    }

    fn write_raw(&mut self, data: &[u8]) {
        println!("[{}] << {:?}", self.name, String::from_utf8_lossy(data));
        self.io.get_mut().write_all(data).unwrap();
    }

    /// Send `command` under a fresh tag and read responses up to and
    /// including the tagged completion or an untagged `BYE`.
    fn command(&mut self, command: &str) -> Vec<String> {
        let tag = format!("a{}", self.next_tag);
        self.next_tag += 1;
        self.write_raw(format!("{tag} {command}\r\n").as_bytes());
        self.read_until_tagged(&tag)
    }

    fn read_until_tagged(&mut self, tag: &str) -> Vec<String> {
        let prefix = format!("{tag} ");
        let mut ret = Vec::new();
        loop {
            let line = self.read_line();
            let done = line.starts_with(&prefix)
                || (line.starts_with("* BYE ") && !ret.is_empty())
                || line.starts_with("* BYE Too many");
            ret.push(line);
            if done {
                return ret;
            }
        }
    }

    /// Like `command`, but assert the completion is `OK`.
    fn ok(&mut self, command: &str) -> Vec<String> {
        let responses = self.command(command);
        let last = responses.last().unwrap();
        assert!(
            last.split(' ').nth(1) == Some("OK"),
            "{command} failed: {last}",
        );
        responses
    }

    /// Consume the greeting and log in.
    fn log_in(&mut self) {
        self.read_line();
        self.ok(&format!("LOGIN {USER} {PASSWORD}"));
    }

    fn start_tls(&mut self) {
        let mut connector = SslConnector::builder(SslMethod::tls()).unwrap();
        connector.set_verify(SslVerifyMode::NONE);

        assert!(self.io.buffer().is_empty());
        let io = mem::replace(
            &mut self.io,
            BufReader::new(Box::new(io::Cursor::new(Vec::new()))),
        );
        let cxn = connector
            .build()
            .connect("localhost", io.into_inner())
            .map_err(|_| "SSL handshake failed")
            .unwrap();
        self.io = BufReader::new(Box::new(cxn));
    }
}

fn literal_length(line: &[u8]) -> Option<usize> {
    let line = std::str::from_utf8(line).ok()?.strip_suffix("}\r\n")?;
    let open = line.rfind('{')?;
    line[open + 1..].parse().ok()
}

fn find<'a>(responses: &'a [String], prefix: &str) -> &'a str {
    responses
        .iter()
        .find(|r| r.starts_with(prefix))
        .unwrap_or_else(|| panic!("No {prefix:?} in {responses:#?}"))
}

#[test]
fn greeting_and_capability() {
    let setup = set_up();
    let mut cxn = setup.connect("greeting_and_capability");

    let greeting = cxn.read_line();
    assert!(
        greeting.starts_with(
            "* OK [CAPABILITY IMAP4rev1 STARTTLS AUTH=PLAIN IDLE ACL"
        ),
        "Unexpected greeting: {greeting}",
    );
    assert!(greeting.contains("imap.local.test rookery"));

    let responses = cxn.ok("CAPABILITY");
    assert!(responses[0].contains(" QUOTA UNSELECT"));

    cxn.ok("NOOP");
    let responses = cxn.ok("LOGOUT");
    assert_eq!("* BYE Logging out\r\n", responses[0]);
}

#[test]
fn login_failures() {
    let setup = set_up();
    let mut cxn = setup.connect("login_failures");
    cxn.read_line();

    let responses = cxn.command("SELECT INBOX");
    assert!(responses[0].starts_with("a1 BAD"));

    for _ in 0..2 {
        let responses = cxn.command(&format!("LOGIN {USER} wrong"));
        assert!(
            responses[0].contains("NO [AUTHENTICATIONFAILED]"),
            "Unexpected response: {}",
            responses[0],
        );
    }

    let responses = cxn.command(&format!("LOGIN {USER} wrong"));
    assert_eq!("* BYE Too many failed logins\r\n", responses[0]);
}

#[test]
fn unknown_command() {
    let setup = set_up();
    let mut cxn = setup.connect("unknown_command");
    cxn.log_in();

    let responses = cxn.command("FROBNICATE");
    assert!(responses[0].starts_with("a2 BAD"));
    let responses = cxn.command("FETCH 1 FLAGS");
    assert!(responses[0].starts_with("a3 BAD"));
    cxn.ok("NOOP");
}

#[test]
fn login_requires_tls() {
    let setup = set_up();
    let mut cxn = setup.connect_with("login_requires_tls", |c| {
        c.imap.allow_insecure_auth = false;
    });

    let greeting = cxn.read_line();
    assert!(greeting.contains("LOGINDISABLED"));
    let responses = cxn.command(&format!("LOGIN {USER} {PASSWORD}"));
    assert!(responses[0].contains("NO [PRIVACYREQUIRED]"));

    cxn.ok("STARTTLS");
    cxn.start_tls();

    let responses = cxn.ok("CAPABILITY");
    assert!(responses[0].contains("AUTH=PLAIN"));
    assert!(!responses[0].contains("STARTTLS"));
    cxn.ok(&format!("LOGIN {USER} {PASSWORD}"));

    let responses = cxn.command("STARTTLS");
    assert!(responses[0].contains("BAD"));
}

#[test]
fn authenticate_plain() {
    let setup = set_up();

    let mut cxn = setup.connect("authenticate_plain_initial");
    cxn.read_line();
    let creds = base64::encode(format!("\0{USER}\0{PASSWORD}"));
    cxn.ok(&format!("AUTHENTICATE PLAIN {creds}"));

    let mut cxn = setup.connect("authenticate_plain_continued");
    cxn.read_line();
    cxn.write_raw(b"a1 AUTHENTICATE PLAIN\r\n");
    assert_eq!("+ \r\n", cxn.read_line());
    cxn.write_raw(format!("{creds}\r\n").as_bytes());
    let responses = cxn.read_until_tagged("a1");
    assert!(responses[0].starts_with("a1 OK"));

    let mut cxn = setup.connect("authenticate_plain_bad");
    cxn.read_line();
    let creds = base64::encode(format!("\0{USER}\0nope"));
    let responses = cxn.command(&format!("AUTHENTICATE PLAIN {creds}"));
    assert!(responses[0].contains("NO [AUTHENTICATIONFAILED]"));
    let responses = cxn.command("AUTHENTICATE CRAM-MD5");
    assert!(responses[0].starts_with("a2 NO"));
}

#[test]
fn literal_login() {
    let setup = set_up();
    let mut cxn = setup.connect("literal_login");
    cxn.read_line();

    cxn.write_raw(format!("a1 LOGIN {{{}}}\r\n", USER.len()).as_bytes());
    assert!(cxn.read_line().starts_with("+ "));
    cxn.write_raw(
        format!("{USER} {{{}+}}\r\n{PASSWORD}\r\n", PASSWORD.len())
            .as_bytes(),
    );
    let responses = cxn.read_until_tagged("a1");
    assert!(responses[0].starts_with("a1 OK"));
}

#[test]
fn list_mailboxes() {
    let setup = set_up();
    let mut cxn = setup.connect("list_mailboxes");
    cxn.log_in();

    let responses = cxn.ok("LIST \"\" *");
    assert!(responses.len() >= 6, "Too few mailboxes: {responses:#?}");
    find(&responses, "* LIST (\\HasNoChildren) \"/\" \"INBOX\"");
    find(&responses, "* LIST (\\HasNoChildren \\Junk) \"/\" \"Junk\"");

    let responses = cxn.ok("LIST \"\" \"\"");
    assert_eq!("* LIST (\\Noselect) \"/\" \"\"\r\n", responses[0]);

    cxn.ok("CREATE Projects");
    let responses = cxn.ok("LIST \"\" Proj%");
    assert_eq!(2, responses.len());
    assert!(responses[0].ends_with("\"Projects\"\r\n"));

    let responses = cxn.command("CREATE Projects");
    assert!(responses[0].contains("NO [ALREADYEXISTS]"));
}

#[test]
fn select_and_fetch() {
    let setup = set_up();
    setup.deliver("First", "Hello there");
    setup.deliver("Second", "General Kenobi");

    let mut cxn = setup.connect("select_and_fetch");
    cxn.log_in();

    let responses = cxn.ok("SELECT INBOX");
    find(&responses, "* 2 EXISTS");
    find(&responses, "* OK [UIDVALIDITY ");
    find(&responses, "* OK [UIDNEXT 3]");
    assert!(responses.last().unwrap().contains("[READ-WRITE]"));

    let responses = cxn.ok("FETCH 1:* (FLAGS RFC822.SIZE)");
    assert_eq!(3, responses.len());
    assert!(responses[0].starts_with("* 1 FETCH (FLAGS () RFC822.SIZE "));
    assert!(responses[1].starts_with("* 2 FETCH (FLAGS () RFC822.SIZE "));

    let responses = cxn.ok("UID FETCH 2 BODY.PEEK[]");
    assert!(responses[0].starts_with("* 2 FETCH (UID 2 BODY[] {"));
    assert!(responses[0].contains("Subject: Second"));
    assert!(responses[0].contains("General Kenobi"));
    assert!(!setup.mailbox("INBOX")[0].read_state);

    let responses = cxn.ok("UID FETCH 1 BODY[TEXT]");
    assert!(responses[0].contains("Hello there"));
    assert!(!responses[0].contains("Subject: First"));
    assert!(responses[0].contains("FLAGS (\\Seen)"));

    let inbox = setup.mailbox("INBOX");
    let first = inbox.iter().find(|m| 1 == m.uid.0).unwrap();
    assert!(first.read_state);

    let responses = cxn.ok("UID FETCH 1:* (UID)");
    assert_eq!(3, responses.len());

    let responses = cxn.command("FETCH 5 FLAGS");
    assert!(responses[0].contains("BAD"));

    cxn.ok("CLOSE");
    let responses = cxn.command("FETCH 1 FLAGS");
    assert!(responses[0].contains("BAD"));
}

#[test]
fn examine_is_read_only() {
    let setup = set_up();
    setup.deliver("Look", "Don't touch");

    let mut cxn = setup.connect("examine_is_read_only");
    cxn.log_in();

    let responses = cxn.ok("EXAMINE INBOX");
    assert!(responses.last().unwrap().contains("[READ-ONLY]"));
    find(&responses, "* OK [PERMANENTFLAGS ()]");

    let responses = cxn.ok("FETCH 1 BODY[]");
    assert!(!responses[0].contains("\\Seen"));
    assert!(!setup.mailbox("INBOX")[0].read_state);

    let responses = cxn.command("STORE 1 +FLAGS (\\Seen)");
    assert!(responses[0].contains("NO"));
}

#[test]
fn store_flags() {
    let setup = set_up();
    setup.deliver("Flag me", "Please");

    let mut cxn = setup.connect("store_flags");
    cxn.log_in();
    cxn.ok("SELECT INBOX");

    let responses = cxn.ok("UID STORE 1 +FLAGS (\\Flagged $Important)");
    assert_eq!(
        "* 1 FETCH (UID 1 FLAGS (\\Flagged $Important))\r\n",
        responses[0],
    );

    let responses = cxn.ok("STORE 1 -FLAGS.SILENT ($Important)");
    assert_eq!(1, responses.len());
    assert_eq!(vec!["\\Flagged".to_owned()], setup.mailbox("INBOX")[0].flags);

    let responses = cxn.ok("STORE 1 FLAGS (\\seen)");
    assert_eq!("* 1 FETCH (FLAGS (\\Seen))\r\n", responses[0]);
    assert!(setup.mailbox("INBOX")[0].read_state);
}

#[test]
fn copy_to_junk_trains_filter() {
    let setup = set_up();
    setup.deliver("Cheap pills", "Buy cheap pills now");

    let mut cxn = setup.connect("copy_to_junk_trains_filter");
    cxn.log_in();
    cxn.ok("SELECT INBOX");

    let responses = cxn.command("UID COPY 1 Nowhere");
    assert!(responses[0].contains("NO [TRYCREATE]"));

    cxn.ok("UID COPY 1 Junk");
    let junk = setup.mailbox("Junk");
    assert_eq!(1, junk.len());
    assert_eq!(setup.mailbox("INBOX")[0].body_path, junk[0].body_path);

    let totals = setup.ts.bayes_totals().unwrap();
    assert_eq!(1, totals.spam);
    assert_eq!(0, totals.ham);

    cxn.ok("SELECT Junk");
    cxn.ok("COPY 1 Trash");
    assert_eq!(1, setup.ts.bayes_totals().unwrap().ham);
}

#[test]
fn copy_over_quota() {
    let setup = set_up();
    setup.deliver("Big", "Heavy message");
    setup.ts.set_quota(USER, 1).unwrap();

    let mut cxn = setup.connect("copy_over_quota");
    cxn.log_in();
    cxn.ok("SELECT INBOX");

    let responses = cxn.command("COPY 1 Trash");
    assert!(responses[0].contains("NO [OVERQUOTA]"));
    assert!(setup.mailbox("Trash").is_empty());
}

#[test]
fn quota_commands() {
    let setup = set_up();
    setup.deliver("Small", "x");

    let mut cxn = setup.connect("quota_commands");
    cxn.log_in();

    let responses = cxn.ok("GETQUOTAROOT INBOX");
    assert_eq!("* QUOTAROOT \"INBOX\" \"\"\r\n", responses[0]);
    assert_eq!("* QUOTA \"\" (STORAGE 1 1048576)\r\n", responses[1]);

    let responses = cxn.ok("GETQUOTA \"\"");
    assert_eq!("* QUOTA \"\" (STORAGE 1 1048576)\r\n", responses[0]);

    let responses = cxn.command("GETQUOTA elsewhere");
    assert!(responses[0].contains("NO [NONEXISTENT]"));

    setup.ts.set_quota(USER, 0).unwrap();
    let responses = cxn.ok("GETQUOTA \"\"");
    assert_eq!("* QUOTA \"\" ()\r\n", responses[0]);

    let responses = cxn.command("GETQUOTAROOT Nowhere");
    assert!(responses[0].contains("NO [NONEXISTENT]"));
}

#[test]
fn acl_commands() {
    let setup = set_up();
    let mut cxn = setup.connect("acl_commands");
    cxn.log_in();

    let responses = cxn.ok("MYRIGHTS INBOX");
    assert_eq!("* MYRIGHTS \"INBOX\" lrswipkxtea\r\n", responses[0]);

    cxn.ok("SETACL INBOX zim@local.test lr");
    cxn.ok("SETACL INBOX zim@local.test +w");
    cxn.ok("SETACL INBOX anyone l");
    let responses = cxn.ok("GETACL INBOX");
    assert!(responses[0]
        .starts_with(&format!("* ACL \"INBOX\" {USER} lrswipkxtea")));
    assert!(responses[0].contains(" zim@local.test lrw"));
    assert!(responses[0].contains(" anyone l"));

    cxn.ok("SETACL INBOX zim@local.test -r");
    let responses = cxn.ok("GETACL INBOX");
    assert!(responses[0].contains(" zim@local.test lw"));

    cxn.ok("DELETEACL INBOX zim@local.test");
    let responses = cxn.ok("GETACL INBOX");
    assert!(!responses[0].contains("zim@local.test"));

    let responses = cxn.ok("LISTRIGHTS INBOX anyone");
    assert_eq!(
        "* LISTRIGHTS \"INBOX\" anyone \"\" l r s w i p k x t e a\r\n",
        responses[0],
    );

    let responses = cxn.command(&format!("SETACL INBOX {USER} l"));
    assert!(responses[0].contains("NO"));
    let responses = cxn.command("SETACL INBOX nobody l");
    assert!(responses[0].contains("BAD") || responses[0].contains("NO"));
    let responses = cxn.command("SETACL INBOX anyone z");
    assert!(responses[0].contains("BAD"));
    let responses = cxn.command("GETACL Nowhere");
    assert!(responses[0].contains("NO [NONEXISTENT]"));
}

#[test]
fn idle_sees_new_mail() {
    let setup = set_up();
    let mut cxn = setup.connect("idle_sees_new_mail");
    cxn.log_in();

    let responses = cxn.ok("SELECT INBOX");
    find(&responses, "* 0 EXISTS");

    cxn.write_raw(b"a9 IDLE\r\n");
    assert_eq!("+ idling\r\n", cxn.read_line());

    setup.deliver("Ping", "Anyone home?");
    assert_eq!("* 1 EXISTS\r\n", cxn.read_line());
    assert_eq!("* 1 RECENT\r\n", cxn.read_line());

    cxn.write_raw(b"DONE\r\n");
    let responses = cxn.read_until_tagged("a9");
    assert!(responses[0].starts_with("a9 OK"));

    let responses = cxn.ok("FETCH 1 (FLAGS)");
    assert_eq!("* 1 FETCH (FLAGS ())\r\n", responses[0]);
}

#[test]
fn noop_reports_changes() {
    let setup = set_up();
    setup.deliver("One", "1");

    let mut cxn = setup.connect("noop_reports_changes");
    cxn.log_in();
    cxn.ok("SELECT INBOX");

    setup.deliver("Two", "2");
    let responses = cxn.ok("NOOP");
    assert_eq!("* 2 EXISTS\r\n", responses[0]);

    let first = setup
        .mailbox("INBOX")
        .into_iter()
        .find(|m| 1 == m.uid.0)
        .unwrap();
    setup.ts.move_message(USER, &first.id, "Trash").unwrap();
    let responses = cxn.ok("NOOP");
    assert_eq!("* 1 EXPUNGE\r\n", responses[0]);

    let responses = cxn.ok("FETCH 1 (UID)");
    assert_eq!("* 1 FETCH (UID 2)\r\n", responses[0]);
}

#[test]
fn idle_requires_selection() {
    let setup = set_up();
    let mut cxn = setup.connect("idle_requires_selection");
    cxn.log_in();

    let responses = cxn.command("IDLE");
    assert!(responses[0].contains("BAD"));
}
