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

//! The protocol-independent half of an IMAP session.
//!
//! `CommandProcessor` owns the session state and turns parsed commands into
//! responses. It never touches the network; the commands which need to
//! (`STARTTLS`, `AUTHENTICATE`, `IDLE`) are driven by `server`, which calls
//! back in here for their non-I/O parts.

use std::borrow::Cow;
use std::rc::Rc;
use std::sync::Arc;

use log::{info, warn};

use super::lex;
use super::syntax::*;
use crate::{
    antiabuse::bayes,
    notify,
    store::{canonical_mailbox_name, Message, Store, Uid},
    support::{
        error::Error, log_prefix::LogPrefix, system_config::SystemConfig,
    },
};

/// Everything IMAP sessions share.
pub struct ImapContext {
    pub config: Arc<SystemConfig>,
    pub store: Arc<Store>,
    pub hub: Arc<notify::Hub>,
    pub local_host_name: String,
}

/// The RFC 4314 rights alphabet. Owners always hold all of it.
pub const ALL_RIGHTS: &str = "lrswipkxtea";

const JUNK: &str = "Junk";
const SYSTEM_FLAGS: &[&str] =
    &["\\Answered", "\\Flagged", "\\Deleted", "\\Seen", "\\Draft"];
const MAX_AUTH_FAILURES: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cond {
    Ok,
    No,
    Bad,
    Bye,
}

/// A complete response to one command: untagged lines (each without its
/// line ending) followed by the tagged completion.
#[derive(Debug)]
pub struct Response {
    pub untagged: Vec<Vec<u8>>,
    pub cond: Cond,
    pub code: Option<Cow<'static, str>>,
    pub text: Cow<'static, str>,
}

impl Response {
    fn new(cond: Cond, text: impl Into<Cow<'static, str>>) -> Self {
        Self {
            untagged: Vec::new(),
            cond,
            code: None,
            text: text.into(),
        }
    }

    pub fn ok(text: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Cond::Ok, text)
    }

    pub fn no(text: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Cond::No, text)
    }

    pub fn bad(text: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Cond::Bad, text)
    }

    pub fn bye(text: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Cond::Bye, text)
    }

    pub fn code(mut self, code: impl Into<Cow<'static, str>>) -> Self {
        self.code = Some(code.into());
        self
    }

    fn untagged(mut self, lines: Vec<Vec<u8>>) -> Self {
        self.untagged = lines;
        self
    }

    /// Render the response, including line endings.
    ///
    /// A `BYE` is always untagged; otherwise the completion carries `tag`, or
    /// is untagged if there is none (the greeting).
    pub fn render(&self, tag: Option<&str>) -> Vec<u8> {
        let mut out = Vec::new();
        for line in &self.untagged {
            out.extend_from_slice(line);
            out.extend_from_slice(b"\r\n");
        }

        let tag = match (self.cond, tag) {
            (Cond::Bye, _) | (_, None) => "*",
            (_, Some(tag)) => tag,
        };
        let cond = match self.cond {
            Cond::Ok => "OK",
            Cond::No => "NO",
            Cond::Bad => "BAD",
            Cond::Bye => "BYE",
        };
        out.extend_from_slice(tag.as_bytes());
        out.push(b' ');
        out.extend_from_slice(cond.as_bytes());
        if let Some(ref code) = self.code {
            out.extend_from_slice(format!(" [{code}]").as_bytes());
        }
        out.push(b' ');
        out.extend_from_slice(self.text.as_bytes());
        out.extend_from_slice(b"\r\n");
        out
    }
}

fn line(s: impl Into<String>) -> Vec<u8> {
    s.into().into_bytes()
}

struct Selected {
    name: String,
    read_only: bool,
    /// The UIDs the client knows about, in order; index + 1 is the sequence
    /// number.
    uids: Vec<Uid>,
}

pub struct CommandProcessor {
    log_prefix: LogPrefix,
    context: Rc<ImapContext>,
    tls_available: bool,
    tls_active: bool,
    user: Option<String>,
    selected: Option<Selected>,
    auth_failures: u32,
    logged_out: bool,
}

impl CommandProcessor {
    pub fn new(
        log_prefix: LogPrefix,
        context: Rc<ImapContext>,
        tls_available: bool,
    ) -> Self {
        Self {
            log_prefix,
            context,
            tls_available,
            tls_active: false,
            user: None,
            selected: None,
            auth_failures: 0,
            logged_out: false,
        }
    }

    pub fn logged_out(&self) -> bool {
        self.logged_out
    }

    pub fn force_logout(&mut self) {
        self.logged_out = true;
    }

    pub fn greeting(&self) -> Response {
        Response::ok(format!(
            "{} {} {} ready",
            self.context.local_host_name,
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
        ))
        .code(format!("CAPABILITY {}", self.capabilities()))
    }

    fn capabilities(&self) -> String {
        let mut caps = vec!["IMAP4rev1"];
        if self.tls_available && !self.tls_active {
            caps.push("STARTTLS");
        }
        if self.user.is_none() {
            if self.auth_permitted() {
                caps.push("AUTH=PLAIN");
            } else {
                caps.push("LOGINDISABLED");
            }
        }
        caps.extend_from_slice(&[
            "IDLE",
            "ACL",
            "RIGHTS=kxte",
            "QUOTA",
            "UNSELECT",
        ]);
        caps.join(" ")
    }

    fn auth_permitted(&self) -> bool {
        self.tls_active || self.context.config.imap.allow_insecure_auth
    }

    /// Dispatch a command which needs no network interaction.
    pub fn handle(&mut self, command: Command) -> Response {
        match command {
            Command::Capability => Response::ok("CAPABILITY completed")
                .untagged(vec![line(format!(
                    "* CAPABILITY {}",
                    self.capabilities()
                ))]),
            Command::Noop => self.cmd_noop(),
            Command::Logout => {
                self.logged_out = true;
                Response::ok("LOGOUT completed")
                    .untagged(vec![line("* BYE Logging out")])
            },
            Command::Login { user, password } => {
                self.cmd_login(&user, &password)
            },
            Command::Select(name) => self.cmd_select(&name, false),
            Command::Examine(name) => self.cmd_select(&name, true),
            Command::Create(name) => self.cmd_create(&name),
            Command::List { reference, pattern } => {
                self.cmd_list(&reference, &pattern)
            },
            Command::Close | Command::Unselect => self.cmd_close(),
            Command::Fetch { uid, set, items } => {
                self.cmd_fetch(uid, &set, &items)
            },
            Command::Store {
                uid,
                set,
                action,
                silent,
                flags,
            } => self.cmd_store(uid, &set, action, silent, &flags),
            Command::Copy { uid, set, dest } => self.cmd_copy(uid, &set, &dest),
            Command::GetQuotaRoot(mailbox) => self.cmd_get_quota_root(&mailbox),
            Command::GetQuota(root) => self.cmd_get_quota(&root),
            Command::SetAcl {
                mailbox,
                identifier,
                rights,
            } => self.cmd_set_acl(&mailbox, &identifier, &rights),
            Command::DeleteAcl {
                mailbox,
                identifier,
            } => self.cmd_delete_acl(&mailbox, &identifier),
            Command::GetAcl(mailbox) => self.cmd_get_acl(&mailbox),
            Command::ListRights {
                mailbox,
                identifier,
            } => self.cmd_list_rights(&mailbox, &identifier),
            Command::MyRights(mailbox) => self.cmd_my_rights(&mailbox),
            Command::StartTls
            | Command::Authenticate { .. }
            | Command::Idle => Response::bad("Command not available here"),
        }
    }

    fn error_response(&self, e: Error) -> Response {
        match e {
            Error::NotFound => Response::no("No such mailbox or message")
                .code("NONEXISTENT"),
            Error::AlreadyExists => {
                Response::no("Already exists").code("ALREADYEXISTS")
            },
            Error::OverQuota => {
                Response::no("Quota exceeded").code("OVERQUOTA")
            },
            Error::ValidationFailed(msg) => Response::no(msg).code("CANNOT"),
            Error::InvalidCredentials => Response::no("Bad credentials")
                .code("AUTHENTICATIONFAILED"),
            e => {
                warn!("{} Request failed: {e}", self.log_prefix);
                Response::no("Storage failure").code("UNAVAILABLE")
            },
        }
    }

    fn require_auth(&self) -> Result<String, Response> {
        self.user
            .clone()
            .ok_or_else(|| Response::bad("Not logged in"))
    }

    fn require_selected(&self) -> Result<(String, String, bool), Response> {
        let user = self.require_auth()?;
        let selected = self
            .selected
            .as_ref()
            .ok_or_else(|| Response::bad("No mailbox selected"))?;
        Ok((user, selected.name.clone(), selected.read_only))
    }

    /// Check that `AUTHENTICATE` may start.
    pub fn check_authenticate(&self) -> Result<(), Response> {
        if self.user.is_some() {
            return Err(Response::bad("Already logged in"));
        }
        if !self.auth_permitted() {
            return Err(
                Response::no("Use STARTTLS first").code("PRIVACYREQUIRED")
            );
        }
        Ok(())
    }

    /// Complete `AUTHENTICATE PLAIN` with the client's base64 response.
    pub fn authenticate_plain(&mut self, response: &str) -> Response {
        let Ok(decoded) = base64::decode(response) else {
            return Response::bad("Invalid base64");
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return Response::bad("Invalid UTF-8");
        };

        let mut parts = decoded.split('\0');
        let (Some(authzid), Some(authcid), Some(password), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Response::bad("Malformed PLAIN response");
        };

        if !authzid.is_empty() && authzid != authcid {
            return Response::no("Cannot authorise as another user")
                .code("AUTHORIZATIONFAILED");
        }

        self.log_in(authcid, password)
    }

    fn cmd_login(&mut self, user: &str, password: &str) -> Response {
        if let Err(r) = self.check_authenticate() {
            return r;
        }
        self.log_in(user, password)
    }

    fn log_in(&mut self, user: &str, password: &str) -> Response {
        match self.context.store.authenticate(user, password) {
            Ok(user) => {
                info!("{} Logged in", self.log_prefix);
                self.log_prefix.set_user(user.email.clone());
                self.user = Some(user.email);
                self.auth_failures = 0;
                Response::ok("Logged in")
                    .code(format!("CAPABILITY {}", self.capabilities()))
            },
            Err(Error::InvalidCredentials) => {
                self.auth_failures += 1;
                warn!(
                    "{} Failed login for {user:?} ({} so far)",
                    self.log_prefix, self.auth_failures,
                );
                if self.auth_failures >= MAX_AUTH_FAILURES {
                    self.logged_out = true;
                    Response::bye("Too many failed logins")
                } else {
                    Response::no("Bad credentials").code("AUTHENTICATIONFAILED")
                }
            },
            Err(e) => self.error_response(e),
        }
    }

    /// Check that `STARTTLS` may proceed.
    pub fn check_start_tls(&self) -> Result<(), Response> {
        if self.tls_active {
            Err(Response::bad("Already using TLS"))
        } else if !self.tls_available {
            Err(Response::no("TLS not configured"))
        } else if self.user.is_some() {
            Err(Response::bad("Already logged in"))
        } else {
            Ok(())
        }
    }

    pub fn set_tls_active(&mut self) {
        self.tls_active = true;
    }

    /// Check that `IDLE` may start and subscribe to notifications for the
    /// logged-in user.
    pub fn start_idle(&self) -> Result<notify::Subscription, Response> {
        let (user, _, _) = self.require_selected()?;
        Ok(self.context.hub.subscribe(&user))
    }

    pub fn is_selected(&self, mailbox: &str) -> bool {
        self.selected
            .as_ref()
            .map_or(false, |s| s.name == canonical_mailbox_name(mailbox))
    }

    /// Bring the selected mailbox up to date for an idling client.
    ///
    /// Errors are logged and yield no updates; the next poll retries.
    pub fn idle_update(&mut self) -> Vec<Vec<u8>> {
        match self.poll(true) {
            Ok((mut lines, added)) => {
                if added > 0 {
                    lines.push(line(format!("* {added} RECENT")));
                }
                lines
            },
            Err(e) => {
                warn!("{} Poll failed: {e}", self.log_prefix);
                Vec::new()
            },
        }
    }

    /// Find changes to the selected mailbox since the last poll.
    ///
    /// Returns the untagged responses announcing them and the number of new
    /// messages. Removals are only reported if `allow_expunge`; otherwise the
    /// client keeps seeing the old sequence numbers.
    fn poll(
        &mut self,
        allow_expunge: bool,
    ) -> Result<(Vec<Vec<u8>>, usize), Error> {
        let (Some(user), Some(selected)) =
            (self.user.as_deref(), self.selected.as_mut())
        else {
            return Ok((Vec::new(), 0));
        };

        let current = load_uids(&self.context.store, user, &selected.name)?;
        let mut lines = Vec::new();
        if allow_expunge {
            for ix in (0..selected.uids.len()).rev() {
                if current.binary_search(&selected.uids[ix]).is_err() {
                    lines.push(line(format!("* {} EXPUNGE", ix + 1)));
                    selected.uids.remove(ix);
                }
            }
        }

        let last = selected.uids.last().copied();
        let added = current
            .into_iter()
            .filter(|&uid| last.map_or(true, |last| uid > last))
            .collect::<Vec<_>>();
        let count = added.len();
        if count > 0 {
            selected.uids.extend(added);
            lines.push(line(format!("* {} EXISTS", selected.uids.len())));
        }

        Ok((lines, count))
    }

    fn cmd_noop(&mut self) -> Response {
        match self.poll(true) {
            Ok((lines, _)) => Response::ok("NOOP completed").untagged(lines),
            Err(e) => self.error_response(e),
        }
    }

    fn cmd_select(&mut self, name: &str, read_only: bool) -> Response {
        let user = match self.require_auth() {
            Ok(u) => u,
            Err(r) => return r,
        };
        self.selected = None;

        let name = canonical_mailbox_name(name).to_owned();
        let store = &self.context.store;
        let status = match store.mailbox_status(&user, &name) {
            Ok(s) => s,
            Err(e) => return self.error_response(e),
        };
        let uids = match load_uids(store, &user, &name) {
            Ok(u) => u,
            Err(e) => return self.error_response(e),
        };

        let flags = SYSTEM_FLAGS.join(" ");
        let permanent = if read_only {
            String::new()
        } else {
            format!("{flags} \\*")
        };
        let lines = vec![
            line(format!("* FLAGS ({flags})")),
            line(format!("* {} EXISTS", uids.len())),
            line("* 0 RECENT"),
            line(format!(
                "* OK [PERMANENTFLAGS ({permanent})] Flags permitted"
            )),
            line(format!(
                "* OK [UIDVALIDITY {}] UIDs valid",
                status.uid_validity
            )),
            line(format!(
                "* OK [UIDNEXT {}] Predicted next UID",
                status.uid_next
            )),
        ];

        info!("{} Selected {name:?}", self.log_prefix);
        self.selected = Some(Selected {
            name,
            read_only,
            uids,
        });

        if read_only {
            Response::ok("EXAMINE completed").code("READ-ONLY")
        } else {
            Response::ok("SELECT completed").code("READ-WRITE")
        }
        .untagged(lines)
    }

    fn cmd_close(&mut self) -> Response {
        if let Err(r) = self.require_selected() {
            return r;
        }
        self.selected = None;
        Response::ok("Mailbox closed")
    }

    fn cmd_create(&mut self, name: &str) -> Response {
        let user = match self.require_auth() {
            Ok(u) => u,
            Err(r) => return r,
        };
        match self.context.store.create_mailbox(&user, name) {
            Ok(()) => Response::ok("CREATE completed"),
            Err(e) => self.error_response(e),
        }
    }

    fn cmd_list(&mut self, reference: &str, pattern: &str) -> Response {
        let user = match self.require_auth() {
            Ok(u) => u,
            Err(r) => return r,
        };

        if pattern.is_empty() {
            return Response::ok("LIST completed")
                .untagged(vec![line("* LIST (\\Noselect) \"/\" \"\"")]);
        }

        let mailboxes = match self.context.store.list_mailboxes(&user) {
            Ok(m) => m,
            Err(e) => return self.error_response(e),
        };

        let pattern = format!("{reference}{pattern}");
        let lines = mailboxes
            .iter()
            .filter(|name| mailbox_matches(&pattern, name))
            .map(|name| {
                let mut out = format!(
                    "* LIST ({}) \"/\" ",
                    mailbox_attributes(name).join(" ")
                )
                .into_bytes();
                lex::write_string(&mut out, name);
                out
            })
            .collect();

        Response::ok("LIST completed").untagged(lines)
    }

    /// Resolve `set` against the selected mailbox into `(seqnum, uid)` pairs,
    /// in ascending order.
    fn resolve(
        &self,
        uid: bool,
        set: &SeqSet,
    ) -> Result<Vec<(u32, Uid)>, Response> {
        let Some(ref selected) = self.selected else {
            return Err(Response::bad("No mailbox selected"));
        };
        let uids = &selected.uids;

        let mut indices = Vec::<usize>::new();
        if uid {
            let max = uids.last().map_or(0, |u| u.0);
            for &(a, b) in set {
                let (a, b) = (bound(a, max), bound(b, max));
                let (lo, hi) = (a.min(b), a.max(b));
                let start = uids.partition_point(|u| u.0 < lo);
                let end = uids.partition_point(|u| u.0 <= hi);
                indices.extend(start..end);
            }
        } else {
            let max = uids.len() as u32;
            for &(a, b) in set {
                let (a, b) = (bound(a, max), bound(b, max));
                let (lo, hi) = (a.min(b), a.max(b));
                if 0 == lo || hi > max {
                    return Err(Response::bad(
                        "Invalid message sequence number",
                    ));
                }
                indices.extend((lo as usize - 1)..(hi as usize));
            }
        }

        indices.sort_unstable();
        indices.dedup();
        Ok(indices
            .into_iter()
            .map(|ix| (ix as u32 + 1, uids[ix]))
            .collect())
    }

    /// Load the messages for `targets` from the selected mailbox, paired with
    /// their sequence numbers. Messages which have since vanished are skipped.
    fn load_targets(
        &self,
        user: &str,
        mailbox: &str,
        targets: &[(u32, Uid)],
    ) -> Result<Vec<(u32, Message)>, Error> {
        let (Some(&(_, lo)), Some(&(_, hi))) = (targets.first(), targets.last())
        else {
            return Ok(Vec::new());
        };

        let messages =
            self.context
                .store
                .messages_in_uid_range(user, mailbox, lo, Some(hi))?;
        Ok(messages
            .into_iter()
            .filter_map(|m| {
                targets
                    .binary_search_by_key(&m.uid, |&(_, uid)| uid)
                    .ok()
                    .map(|ix| (targets[ix].0, m))
            })
            .collect())
    }

    fn cmd_fetch(
        &mut self,
        uid: bool,
        set: &SeqSet,
        items: &[FetchAtt],
    ) -> Response {
        let (user, mailbox, read_only) = match self.require_selected() {
            Ok(s) => s,
            Err(r) => return r,
        };

        let mut lines = match self.poll(false) {
            Ok((lines, _)) => lines,
            Err(e) => return self.error_response(e),
        };
        let targets = match self.resolve(uid, set) {
            Ok(t) => t,
            Err(r) => return r,
        };
        let messages = match self.load_targets(&user, &mailbox, &targets) {
            Ok(m) => m,
            Err(e) => return self.error_response(e),
        };

        let mut items = items.to_vec();
        if uid && !items.contains(&FetchAtt::Uid) {
            items.insert(0, FetchAtt::Uid);
        }

        for (seqnum, message) in messages {
            match self.fetch_one(&user, read_only, seqnum, message, &items) {
                Ok(line) => lines.push(line),
                Err(e) => return self.error_response(e),
            }
        }

        Response::ok("FETCH completed").untagged(lines)
    }

    fn fetch_one(
        &self,
        user: &str,
        read_only: bool,
        seqnum: u32,
        mut message: Message,
        items: &[FetchAtt],
    ) -> Result<Vec<u8>, Error> {
        let store = &self.context.store;
        let needs_body = items.iter().any(|i| {
            matches!(
                *i,
                FetchAtt::Rfc822
                    | FetchAtt::Rfc822Header
                    | FetchAtt::Rfc822Text
                    | FetchAtt::Body { .. }
            )
        });
        let body = if needs_body {
            store.blobs().read_blob(&message.body_path)?
        } else {
            Vec::new()
        };

        let marks_seen = !read_only
            && !has_flag(&message.flags, "\\Seen")
            && items.iter().any(|i| {
                matches!(
                    *i,
                    FetchAtt::Rfc822
                        | FetchAtt::Rfc822Text
                        | FetchAtt::Body { peek: false, .. }
                )
            });
        if marks_seen {
            let mut flags = message.flags.clone();
            flags.push("\\Seen".to_owned());
            message =
                store.set_flags(user, &message.mailbox, message.uid, &flags)?;
        }

        let (header, text) = split_header(&body);
        let mut out = format!("* {seqnum} FETCH (").into_bytes();
        for (ix, item) in items.iter().enumerate() {
            if ix > 0 {
                out.push(b' ');
            }

            match *item {
                FetchAtt::Uid => out.extend_from_slice(
                    format!("UID {}", message.uid).as_bytes(),
                ),
                FetchAtt::Flags => {
                    out.extend_from_slice(b"FLAGS ");
                    lex::write_flags(&mut out, &message.flags);
                },
                FetchAtt::Rfc822Size => out.extend_from_slice(
                    format!("RFC822.SIZE {}", message.size).as_bytes(),
                ),
                FetchAtt::InternalDate => out.extend_from_slice(
                    message
                        .received_at
                        .0
                        .format("INTERNALDATE \"%e-%b-%Y %H:%M:%S +0000\"")
                        .to_string()
                        .as_bytes(),
                ),
                FetchAtt::Rfc822 => {
                    out.extend_from_slice(b"RFC822 ");
                    lex::write_literal(&mut out, &body);
                },
                FetchAtt::Rfc822Header => {
                    out.extend_from_slice(b"RFC822.HEADER ");
                    lex::write_literal(&mut out, header);
                },
                FetchAtt::Rfc822Text => {
                    out.extend_from_slice(b"RFC822.TEXT ");
                    lex::write_literal(&mut out, text);
                },
                FetchAtt::Body { section, .. } => {
                    let (name, data): (&[u8], &[u8]) = match section {
                        Section::Full => (&b"BODY[] "[..], &body[..]),
                        Section::Header => (&b"BODY[HEADER] "[..], header),
                        Section::Text => (&b"BODY[TEXT] "[..], text),
                    };
                    out.extend_from_slice(name);
                    lex::write_literal(&mut out, data);
                },
            }
        }

        if marks_seen && !items.contains(&FetchAtt::Flags) {
            out.extend_from_slice(b" FLAGS ");
            lex::write_flags(&mut out, &message.flags);
        }
        out.push(b')');
        Ok(out)
    }

    fn cmd_store(
        &mut self,
        uid: bool,
        set: &SeqSet,
        action: StoreAction,
        silent: bool,
        flags: &[String],
    ) -> Response {
        let (user, mailbox, read_only) = match self.require_selected() {
            Ok(s) => s,
            Err(r) => return r,
        };
        if read_only {
            return Response::no("Mailbox is read-only");
        }

        let flags = flags
            .iter()
            .map(|f| canonical_flag(f))
            .filter(|f| "\\Recent" != f)
            .collect::<Vec<_>>();

        let mut lines = match self.poll(false) {
            Ok((lines, _)) => lines,
            Err(e) => return self.error_response(e),
        };
        let targets = match self.resolve(uid, set) {
            Ok(t) => t,
            Err(r) => return r,
        };
        let messages = match self.load_targets(&user, &mailbox, &targets) {
            Ok(m) => m,
            Err(e) => return self.error_response(e),
        };

        for (seqnum, mut message) in messages {
            let new_flags = apply_store(&message.flags, action, &flags);
            if !same_flags(&new_flags, &message.flags) {
                match self.context.store.set_flags(
                    &user,
                    &mailbox,
                    message.uid,
                    &new_flags,
                ) {
                    Ok(m) => message = m,
                    Err(e) => return self.error_response(e),
                }
            }

            if !silent {
                let mut out = format!("* {seqnum} FETCH (").into_bytes();
                if uid {
                    out.extend_from_slice(
                        format!("UID {} ", message.uid).as_bytes(),
                    );
                }
                out.extend_from_slice(b"FLAGS ");
                lex::write_flags(&mut out, &message.flags);
                out.push(b')');
                lines.push(out);
            }
        }

        Response::ok("STORE completed").untagged(lines)
    }

    fn cmd_copy(&mut self, uid: bool, set: &SeqSet, dest: &str) -> Response {
        let (user, mailbox, _) = match self.require_selected() {
            Ok(s) => s,
            Err(r) => return r,
        };
        let dest = canonical_mailbox_name(dest).to_owned();
        let store = Arc::clone(&self.context.store);

        match store.mailbox_exists(&user, &dest) {
            Ok(true) => (),
            Ok(false) => {
                return Response::no("No such mailbox").code("TRYCREATE")
            },
            Err(e) => return self.error_response(e),
        }

        let targets = match self.resolve(uid, set) {
            Ok(t) => t,
            Err(r) => return r,
        };
        let messages = match self.load_targets(&user, &mailbox, &targets) {
            Ok(m) => m,
            Err(e) => return self.error_response(e),
        };

        // Refuse up front rather than leaving a partial copy behind.
        let account = match store.find_user(&user) {
            Ok(a) => a,
            Err(e) => return self.error_response(e),
        };
        let total = messages.iter().map(|(_, m)| m.size).sum::<u64>();
        if account.quota_bytes > 0
            && account.used_bytes.saturating_add(total) > account.quota_bytes
        {
            return Response::no("Quota exceeded").code("OVERQUOTA");
        }

        let training = if JUNK == dest && JUNK != mailbox {
            Some(true)
        } else if JUNK == mailbox && JUNK != dest {
            Some(false)
        } else {
            None
        };

        for (_, message) in &messages {
            if let Err(e) = store.copy_message(&user, &message.id, &dest) {
                return self.error_response(e);
            }

            if let Some(is_spam) = training {
                if let Err(e) = store
                    .message_plaintext(&user, &message.id)
                    .and_then(|text| bayes::train(&store, &text, is_spam))
                {
                    warn!(
                        "{} Failed to train on {}: {e}",
                        self.log_prefix, message.id,
                    );
                }
            }
        }

        if let Some(is_spam) = training {
            info!(
                "{} Trained {} message(s) as {}",
                self.log_prefix,
                messages.len(),
                if is_spam { "spam" } else { "ham" },
            );
        }

        Response::ok("COPY completed")
    }

    fn quota_line(&self, user: &str) -> Result<Vec<u8>, Error> {
        let account = self.context.store.find_user(user)?;
        Ok(line(if 0 == account.quota_bytes {
            "* QUOTA \"\" ()".to_owned()
        } else {
            format!(
                "* QUOTA \"\" (STORAGE {} {})",
                (account.used_bytes + 1023) / 1024,
                account.quota_bytes / 1024,
            )
        }))
    }

    fn cmd_get_quota_root(&mut self, mailbox: &str) -> Response {
        let user = match self.require_auth() {
            Ok(u) => u,
            Err(r) => return r,
        };
        let mailbox = canonical_mailbox_name(mailbox);
        match self.context.store.mailbox_exists(&user, mailbox) {
            Ok(true) => (),
            Ok(false) => return self.error_response(Error::NotFound),
            Err(e) => return self.error_response(e),
        }

        let mut root = b"* QUOTAROOT ".to_vec();
        lex::write_string(&mut root, mailbox);
        root.extend_from_slice(b" \"\"");

        match self.quota_line(&user) {
            Ok(quota) => Response::ok("GETQUOTAROOT completed")
                .untagged(vec![root, quota]),
            Err(e) => self.error_response(e),
        }
    }

    fn cmd_get_quota(&mut self, root: &str) -> Response {
        let user = match self.require_auth() {
            Ok(u) => u,
            Err(r) => return r,
        };
        if !root.is_empty() {
            return Response::no("No such quota root").code("NONEXISTENT");
        }

        match self.quota_line(&user) {
            Ok(quota) => {
                Response::ok("GETQUOTA completed").untagged(vec![quota])
            },
            Err(e) => self.error_response(e),
        }
    }

    /// Authenticate and confirm `mailbox` exists, returning the user and the
    /// canonical mailbox name.
    fn acl_target(&self, mailbox: &str) -> Result<(String, String), Response> {
        let user = self.require_auth()?;
        let mailbox = canonical_mailbox_name(mailbox).to_owned();
        match self.context.store.mailbox_exists(&user, &mailbox) {
            Ok(true) => Ok((user, mailbox)),
            Ok(false) => Err(self.error_response(Error::NotFound)),
            Err(e) => Err(self.error_response(e)),
        }
    }

    fn cmd_set_acl(
        &mut self,
        mailbox: &str,
        identifier: &str,
        rights: &str,
    ) -> Response {
        let (user, mailbox) = match self.acl_target(mailbox) {
            Ok(t) => t,
            Err(r) => return r,
        };
        if let Err(r) = check_identifier(&user, identifier) {
            return r;
        }

        let (action, given) = match rights.as_bytes().first() {
            Some(b'+') => (StoreAction::Add, &rights[1..]),
            Some(b'-') => (StoreAction::Remove, &rights[1..]),
            _ => (StoreAction::Replace, rights),
        };
        if let Some(bad) = given.chars().find(|&c| !ALL_RIGHTS.contains(c)) {
            return Response::bad(format!("Unknown right {bad:?}"));
        }

        let store = &self.context.store;
        let current = match store.list_acl(&user, &mailbox) {
            Ok(acl) => acl
                .into_iter()
                .find(|(id, _)| id == identifier)
                .map(|(_, r)| r)
                .unwrap_or_default(),
            Err(e) => return self.error_response(e),
        };
        let new_rights = ALL_RIGHTS
            .chars()
            .filter(|&c| match action {
                StoreAction::Replace => given.contains(c),
                StoreAction::Add => given.contains(c) || current.contains(c),
                StoreAction::Remove => {
                    !given.contains(c) && current.contains(c)
                },
            })
            .collect::<String>();

        match store.set_acl(&user, &mailbox, identifier, &new_rights) {
            Ok(()) => {
                info!(
                    "{} ACL on {mailbox:?} for {identifier:?} is now \
                     {new_rights:?}",
                    self.log_prefix,
                );
                Response::ok("SETACL completed")
            },
            Err(e) => self.error_response(e),
        }
    }

    fn cmd_delete_acl(&mut self, mailbox: &str, identifier: &str) -> Response {
        let (user, mailbox) = match self.acl_target(mailbox) {
            Ok(t) => t,
            Err(r) => return r,
        };
        if let Err(r) = check_identifier(&user, identifier) {
            return r;
        }

        match self.context.store.delete_acl(&user, &mailbox, identifier) {
            Ok(()) => Response::ok("DELETEACL completed"),
            Err(e) => self.error_response(e),
        }
    }

    fn cmd_get_acl(&mut self, mailbox: &str) -> Response {
        let (user, mailbox) = match self.acl_target(mailbox) {
            Ok(t) => t,
            Err(r) => return r,
        };
        let acl = match self.context.store.list_acl(&user, &mailbox) {
            Ok(acl) => acl,
            Err(e) => return self.error_response(e),
        };

        let mut out = b"* ACL ".to_vec();
        lex::write_string(&mut out, &mailbox);
        out.push(b' ');
        lex::write_astring(&mut out, &user);
        out.extend_from_slice(format!(" {ALL_RIGHTS}").as_bytes());
        for (identifier, rights) in acl {
            out.push(b' ');
            lex::write_astring(&mut out, &identifier);
            out.push(b' ');
            lex::write_astring(&mut out, &rights);
        }

        Response::ok("GETACL completed").untagged(vec![out])
    }

    fn cmd_list_rights(&mut self, mailbox: &str, identifier: &str) -> Response {
        let (user, mailbox) = match self.acl_target(mailbox) {
            Ok(t) => t,
            Err(r) => return r,
        };

        let mut out = b"* LISTRIGHTS ".to_vec();
        lex::write_string(&mut out, &mailbox);
        out.push(b' ');
        lex::write_astring(&mut out, identifier);
        if identifier == user {
            out.extend_from_slice(format!(" {ALL_RIGHTS}").as_bytes());
        } else {
            out.extend_from_slice(b" \"\"");
            for right in ALL_RIGHTS.chars() {
                out.extend_from_slice(format!(" {right}").as_bytes());
            }
        }

        Response::ok("LISTRIGHTS completed").untagged(vec![out])
    }

    fn cmd_my_rights(&mut self, mailbox: &str) -> Response {
        let mailbox = match self.acl_target(mailbox) {
            Ok((_, m)) => m,
            Err(r) => return r,
        };

        let mut out = b"* MYRIGHTS ".to_vec();
        lex::write_string(&mut out, &mailbox);
        out.extend_from_slice(format!(" {ALL_RIGHTS}").as_bytes());
        Response::ok("MYRIGHTS completed").untagged(vec![out])
    }
}

fn load_uids(
    store: &Store,
    user: &str,
    mailbox: &str,
) -> Result<Vec<Uid>, Error> {
    Ok(store
        .messages_in_uid_range(user, mailbox, Uid::MIN, None)?
        .into_iter()
        .map(|m| m.uid)
        .collect())
}

fn bound(b: SeqBound, max: u32) -> u32 {
    match b {
        SeqBound::Num(n) => n,
        SeqBound::Star => max,
    }
}

fn check_identifier(owner: &str, identifier: &str) -> Result<(), Response> {
    if identifier == owner {
        Err(Response::no("The owner's rights cannot be changed"))
    } else if "anyone" == identifier
        || "authenticated" == identifier
        || identifier.contains('@')
    {
        Ok(())
    } else {
        Err(Response::no(format!("Unknown identifier {identifier:?}")))
    }
}

fn has_flag(flags: &[String], flag: &str) -> bool {
    flags.iter().any(|f| f.eq_ignore_ascii_case(flag))
}

fn same_flags(a: &[String], b: &[String]) -> bool {
    a.len() == b.len() && a.iter().all(|f| has_flag(b, f))
}

/// Normalise the capitalisation of system flags.
fn canonical_flag(flag: &str) -> String {
    SYSTEM_FLAGS
        .iter()
        .chain(std::iter::once(&"\\Recent"))
        .find(|f| f.eq_ignore_ascii_case(flag))
        .map_or_else(|| flag.to_owned(), |&f| f.to_owned())
}

fn apply_store(
    current: &[String],
    action: StoreAction,
    flags: &[String],
) -> Vec<String> {
    match action {
        StoreAction::Replace => {
            let mut out = Vec::<String>::new();
            for flag in flags {
                if !has_flag(&out, flag) {
                    out.push(flag.clone());
                }
            }
            out
        },
        StoreAction::Add => {
            let mut out = current.to_vec();
            for flag in flags {
                if !has_flag(&out, flag) {
                    out.push(flag.clone());
                }
            }
            out
        },
        StoreAction::Remove => current
            .iter()
            .filter(|f| !has_flag(flags, f))
            .cloned()
            .collect(),
    }
}

/// Split a message into its header block (including the blank line) and the
/// text after it.
fn split_header(message: &[u8]) -> (&[u8], &[u8]) {
    let end = message
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| p + 4)
        .or_else(|| {
            message.windows(2).position(|w| w == b"\n\n").map(|p| p + 2)
        })
        .unwrap_or(message.len());
    message.split_at(end)
}

fn mailbox_attributes(name: &str) -> Vec<&'static str> {
    let mut attrs = vec!["\\HasNoChildren"];
    match name {
        "Sent" => attrs.push("\\Sent"),
        "Drafts" => attrs.push("\\Drafts"),
        "Junk" => attrs.push("\\Junk"),
        "Trash" => attrs.push("\\Trash"),
        _ => (),
    }
    attrs
}

/// Match a `LIST` pattern, where `*` matches anything and `%` anything but
/// the hierarchy delimiter.
fn mailbox_matches(pattern: &str, name: &str) -> bool {
    fn matches(pattern: &[u8], name: &[u8]) -> bool {
        match pattern.split_first() {
            None => name.is_empty(),
            Some((&b'*', rest)) => {
                (0..=name.len()).any(|skip| matches(rest, &name[skip..]))
            },
            Some((&b'%', rest)) => (0..=name.len())
                .take_while(|&skip| skip == 0 || b'/' != name[skip - 1])
                .any(|skip| matches(rest, &name[skip..])),
            Some((&c, rest)) => {
                name.first() == Some(&c) && matches(rest, &name[1..])
            },
        }
    }

    matches(pattern.as_bytes(), name.as_bytes())
        || ("INBOX" == name
            && matches(
                pattern.to_ascii_uppercase().as_bytes(),
                name.as_bytes(),
            ))
}
