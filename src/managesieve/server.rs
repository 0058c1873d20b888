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

//! One ManageSieve (RFC 5804) session.

use std::borrow::Cow;
use std::io;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use openssl::ssl::SslAcceptor;
use tokio::io::{
    AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter,
};

use super::syntax::{self, Command};
use crate::{
    imap::literal_at_end,
    sieve,
    store::Store,
    support::{
        async_io::SessionIo, error::Error, log_prefix::LogPrefix,
        system_config::SystemConfig,
    },
};

const MAX_LINE: usize = 8192;
const MAX_AUTH_FAILURES: u32 = 3;
const IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const MAX_SCRIPT_NAME: usize = 128;

/// Everything ManageSieve sessions share.
pub struct ManageSieveContext {
    pub config: Arc<SystemConfig>,
    pub store: Arc<Store>,
}

/// A response condition with an optional response code and text.
struct Reply {
    cond: &'static str,
    code: Option<&'static str>,
    text: Option<Cow<'static, str>>,
}

impl Reply {
    fn ok() -> Self {
        Self {
            cond: "OK",
            code: None,
            text: None,
        }
    }

    fn no(text: impl Into<Cow<'static, str>>) -> Self {
        Self {
            cond: "NO",
            code: None,
            text: Some(text.into()),
        }
    }

    fn bye(text: impl Into<Cow<'static, str>>) -> Self {
        Self {
            cond: "BYE",
            code: None,
            text: Some(text.into()),
        }
    }

    fn text(mut self, text: impl Into<Cow<'static, str>>) -> Self {
        self.text = Some(text.into());
        self
    }

    fn code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    fn render(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.cond.as_bytes());
        if let Some(code) = self.code {
            out.extend_from_slice(format!(" ({code})").as_bytes());
        }
        if let Some(ref text) = self.text {
            out.push(b' ');
            syntax::write_string(out, text);
        }
        out.extend_from_slice(b"\r\n");
    }
}

struct Server {
    reader: BufReader<SessionIo>,
    writer: BufWriter<SessionIo>,
    log_prefix: LogPrefix,
    context: Rc<ManageSieveContext>,
    ssl_acceptor: Option<SslAcceptor>,
    tls_active: bool,
    user: Option<String>,
    auth_failures: u32,
    done: bool,
}

/// Serve one ManageSieve session over `io` until the client logs out or the
/// connection fails.
pub async fn serve_managesieve(
    io: SessionIo,
    context: Rc<ManageSieveContext>,
    log_prefix: LogPrefix,
    ssl_acceptor: Option<SslAcceptor>,
) -> Result<(), Error> {
    let mut server = Server {
        reader: BufReader::new(io.clone()),
        writer: BufWriter::new(io),
        log_prefix,
        context,
        ssl_acceptor,
        tls_active: false,
        user: None,
        auth_failures: 0,
        done: false,
    };

    server.run().await
}

impl Server {
    async fn run(&mut self) -> Result<(), Error> {
        info!("{} ManageSieve session started", self.log_prefix);
        let mut out = Vec::new();
        self.capabilities(&mut out);
        self.write_raw(&out).await?;

        let mut cmdline = Vec::<u8>::new();
        while !self.done {
            match tokio::time::timeout(
                IDLE_TIMEOUT,
                self.read_command(&mut cmdline),
            )
            .await
            {
                Err(_) => {
                    info!("{} Idle timeout", self.log_prefix);
                    return self.reply(Reply::bye("Idle timeout")).await;
                },
                Ok(Err(e)) => return Err(e),
                Ok(Ok(false)) => continue,
                Ok(Ok(true)) => (),
            }

            match syntax::parse_command(&cmdline) {
                Ok(command) => self.handle(command).await?,
                Err(msg) => {
                    warn!("{} Bad command: {msg}", self.log_prefix);
                    self.reply(Reply::no(msg)).await?;
                },
            }
        }

        info!("{} ManageSieve session ended", self.log_prefix);
        Ok(())
    }

    fn max_cmdline(&self) -> usize {
        MAX_LINE + self.context.config.managesieve.max_script_size as usize
    }

    /// Read one complete command, with its literals, into `cmdline`, without
    /// the final line ending.
    ///
    /// Returns `false` if the command was unacceptable and has already been
    /// answered.
    async fn read_command(
        &mut self,
        cmdline: &mut Vec<u8>,
    ) -> Result<bool, Error> {
        cmdline.clear();
        let max = self.max_cmdline();

        loop {
            let start = cmdline.len();
            let nread = (&mut self.reader)
                .take(MAX_LINE as u64)
                .read_until(b'\n', cmdline)
                .await?;
            if 0 == nread {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "EOF reached within command",
                )));
            }
            if !cmdline.ends_with(b"\n") {
                self.done = true;
                self.reply(Reply::bye("Line too long")).await?;
                return Ok(false);
            }

            cmdline.pop();
            if cmdline.ends_with(b"\r") {
                cmdline.pop();
            }

            let Some((length, _)) = literal_at_end(&cmdline[start..]) else {
                return Ok(true);
            };

            if cmdline.len() + length > max {
                self.done = true;
                self.reply(
                    Reply::bye("Command too large").code("QUOTA/MAXSIZE"),
                )
                .await?;
                return Ok(false);
            }

            // Clients are not expected to wait for a continuation, so none is
            // sent even for a synchronising literal.
            cmdline.extend_from_slice(b"\r\n");
            let literal_start = cmdline.len();
            cmdline.resize(literal_start + length, 0);
            self.reader.read_exact(&mut cmdline[literal_start..]).await?;
        }
    }

    fn capabilities(&self, out: &mut Vec<u8>) {
        let mut cap = |name: &str, value: Option<&str>| {
            syntax::write_string(out, name);
            if let Some(value) = value {
                out.push(b' ');
                syntax::write_string(out, value);
            }
            out.extend_from_slice(b"\r\n");
        };

        cap(
            "IMPLEMENTATION",
            Some(concat!(
                env!("CARGO_PKG_NAME"),
                " ",
                env!("CARGO_PKG_VERSION")
            )),
        );
        if self.user.is_none() {
            cap("SASL", Some("PLAIN"));
        }
        cap("SIEVE", Some(sieve::EXTENSIONS));
        if self.ssl_acceptor.is_some() && !self.tls_active {
            cap("STARTTLS", None);
        }
        cap("VERSION", Some("1.0"));
        Reply::ok().render(out);
    }

    async fn handle(&mut self, command: Command) -> Result<(), Error> {
        match command {
            Command::Capability => {
                let mut out = Vec::new();
                self.capabilities(&mut out);
                self.write_raw(&out).await
            },
            Command::Noop => {
                self.reply(Reply::ok().text("NOOP completed")).await
            },
            Command::Logout => {
                self.done = true;
                self.reply(Reply::ok().text("Logout completed")).await
            },
            Command::StartTls => self.cmd_start_tls().await,
            Command::Authenticate { mechanism, initial } => {
                self.cmd_authenticate(&mechanism, initial).await
            },
            command => {
                let Some(user) = self.user.clone() else {
                    return self.reply(Reply::no("Not authenticated")).await;
                };
                self.handle_authenticated(&user, command).await
            },
        }
    }

    async fn handle_authenticated(
        &mut self,
        user: &str,
        command: Command,
    ) -> Result<(), Error> {
        let store = Arc::clone(&self.context.store);
        let reply = match command {
            Command::ListScripts => {
                let scripts = match store.list_scripts(user) {
                    Ok(s) => s,
                    Err(e) => return self.reply(self.error_reply(e)).await,
                };
                let mut out = Vec::new();
                for script in scripts {
                    syntax::write_string(&mut out, &script.name);
                    if script.is_active {
                        out.extend_from_slice(b" ACTIVE");
                    }
                    out.extend_from_slice(b"\r\n");
                }
                Reply::ok().render(&mut out);
                return self.write_raw(&out).await;
            },

            Command::GetScript(name) => {
                let content = match store.get_script(user, &name) {
                    Ok(c) => c,
                    Err(e) => return self.reply(self.error_reply(e)).await,
                };
                let mut out = format!("{{{}}}\r\n", content.len()).into_bytes();
                out.extend_from_slice(content.as_bytes());
                out.extend_from_slice(b"\r\n");
                Reply::ok().render(&mut out);
                return self.write_raw(&out).await;
            },

            Command::PutScript { name, content } => {
                if let Err(reply) = self.check_script(&name, &content) {
                    reply
                } else {
                    match store.put_script(user, &name, &content) {
                        Ok(()) => {
                            info!("{} Stored script {name:?}", self.log_prefix);
                            Reply::ok()
                        },
                        Err(e) => self.error_reply(e),
                    }
                }
            },

            Command::CheckScript(content) => {
                match sieve::parse(&content) {
                    Ok(_) => Reply::ok(),
                    Err(e) => Reply::no(e.to_string()),
                }
            },

            Command::HaveSpace { name, size } => {
                if let Err(reply) = check_script_name(&name) {
                    reply
                } else if size
                    > self.context.config.managesieve.max_script_size
                {
                    Reply::no("Script too large").code("QUOTA/MAXSIZE")
                } else {
                    Reply::ok()
                }
            },

            Command::DeleteScript(name) => {
                match store.delete_script(user, &name) {
                    Ok(()) => Reply::ok(),
                    Err(e) => self.error_reply(e),
                }
            },

            Command::SetActive(name) => {
                let name = Some(name.as_str()).filter(|n| !n.is_empty());
                match store.set_active_script(user, name) {
                    Ok(()) => {
                        info!(
                            "{} Active script is now {name:?}",
                            self.log_prefix
                        );
                        Reply::ok()
                    },
                    Err(e) => self.error_reply(e),
                }
            },

            Command::RenameScript { old_name, new_name } => {
                if let Err(reply) = check_script_name(&new_name) {
                    reply
                } else {
                    match store.rename_script(user, &old_name, &new_name) {
                        Ok(()) => Reply::ok(),
                        Err(e) => self.error_reply(e),
                    }
                }
            },

            Command::Capability
            | Command::Noop
            | Command::Logout
            | Command::StartTls
            | Command::Authenticate { .. } => Reply::no("Unexpected command"),
        };

        self.reply(reply).await
    }

    fn check_script(&self, name: &str, content: &str) -> Result<(), Reply> {
        check_script_name(name)?;
        if content.len() as u64
            > self.context.config.managesieve.max_script_size
        {
            return Err(Reply::no("Script too large").code("QUOTA/MAXSIZE"));
        }
        sieve::parse(content).map_err(|e| Reply::no(e.to_string()))?;
        Ok(())
    }

    fn error_reply(&self, e: Error) -> Reply {
        match e {
            Error::NotFound => Reply::no("No such script").code("NONEXISTENT"),
            Error::AlreadyExists => {
                Reply::no("Script already exists").code("ALREADYEXISTS")
            },
            Error::ActiveScript => {
                Reply::no("Script is active").code("ACTIVE")
            },
            e => {
                warn!("{} Request failed: {e}", self.log_prefix);
                Reply::no("Storage failure").code("TRYLATER")
            },
        }
    }

    async fn cmd_start_tls(&mut self) -> Result<(), Error> {
        if self.tls_active {
            return self.reply(Reply::no("Already using TLS")).await;
        }
        let Some(ssl_acceptor) = self.ssl_acceptor.take() else {
            return self.reply(Reply::no("TLS not configured")).await;
        };
        if !self.reader.buffer().is_empty() {
            warn!("{} Client pipelined data after STARTTLS", self.log_prefix);
            self.done = true;
            return self
                .reply(Reply::bye("Pipelined data after STARTTLS"))
                .await;
        }

        self.reply(Reply::ok().text("Begin TLS negotiation now")).await?;
        info!("{} Start TLS handshake", self.log_prefix);
        self.reader.get_ref().ssl_accept(&ssl_acceptor).await?;
        self.tls_active = true;
        info!(
            "{} TLS handshake completed: {}",
            self.log_prefix,
            self.reader.get_ref().ssl_string().unwrap_or_default(),
        );

        // RFC 5804 2.2: capabilities are re-issued after negotiation
        self.ssl_acceptor = Some(ssl_acceptor);
        let mut out = Vec::new();
        self.capabilities(&mut out);
        self.write_raw(&out).await
    }

    async fn cmd_authenticate(
        &mut self,
        mechanism: &str,
        initial: Option<String>,
    ) -> Result<(), Error> {
        if self.user.is_some() {
            return self.reply(Reply::no("Already authenticated")).await;
        }
        if !mechanism.eq_ignore_ascii_case("PLAIN") {
            return self.reply(Reply::no("Unsupported mechanism")).await;
        }
        if !self.tls_active && !self.context.config.imap.allow_insecure_auth {
            return self
                .reply(Reply::no("Use STARTTLS first").code("ENCRYPT-NEEDED"))
                .await;
        }

        let data = match initial {
            Some(data) => data,
            None => {
                self.write_raw(b"\"\"\r\n").await?;
                let mut line = Vec::new();
                if !self.read_command(&mut line).await? {
                    return Ok(());
                }
                match syntax::parse_sasl_reply(&line) {
                    Some(data) => data,
                    None => {
                        return self.reply(Reply::no("Bad SASL reply")).await
                    },
                }
            },
        };

        if "*" == data {
            return self.reply(Reply::no("Authentication cancelled")).await;
        }

        let Some((authzid, authcid, password)) = decode_plain(&data) else {
            return self.reply(Reply::no("Malformed PLAIN response")).await;
        };
        if !authzid.is_empty() && authzid != authcid {
            return self
                .reply(Reply::no("Cannot authorise as another user"))
                .await;
        }

        match self.context.store.authenticate(&authcid, &password) {
            Ok(user) => {
                info!("{} Logged in", self.log_prefix);
                self.log_prefix.set_user(user.email.clone());
                self.user = Some(user.email);
                self.reply(Reply::ok().text("Logged in")).await
            },
            Err(Error::InvalidCredentials) => {
                self.auth_failures += 1;
                warn!(
                    "{} Failed login for {authcid:?} ({} so far)",
                    self.log_prefix, self.auth_failures,
                );
                if self.auth_failures >= MAX_AUTH_FAILURES {
                    self.done = true;
                    self.reply(Reply::bye("Too many failed logins")).await
                } else {
                    self.reply(Reply::no("Authentication failed")).await
                }
            },
            Err(e) => {
                let reply = self.error_reply(e);
                self.reply(reply).await
            },
        }
    }

    async fn reply(&mut self, reply: Reply) -> Result<(), Error> {
        let mut out = Vec::new();
        reply.render(&mut out);
        self.write_raw(&out).await
    }

    async fn write_raw(&mut self, data: &[u8]) -> Result<(), Error> {
        self.writer.write_all(data).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

fn check_script_name(name: &str) -> Result<(), Reply> {
    if name.is_empty()
        || name.len() > MAX_SCRIPT_NAME
        || name.chars().any(char::is_control)
    {
        Err(Reply::no("Invalid script name"))
    } else {
        Ok(())
    }
}

/// Split a base64 SASL PLAIN response into authzid, authcid and password.
fn decode_plain(data: &str) -> Option<(String, String, String)> {
    let decoded = String::from_utf8(base64::decode(data).ok()?).ok()?;
    let mut parts = decoded.split('\0');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(authzid), Some(authcid), Some(password), None) => Some((
            authzid.to_owned(),
            authcid.to_owned(),
            password.to_owned(),
        )),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn plain_decoding() {
        assert_eq!(
            Some((String::new(), "a@b.test".to_owned(), "pw".to_owned())),
            decode_plain(&base64::encode("\0a@b.test\0pw")),
        );
        assert_eq!(None, decode_plain(&base64::encode("a@b.test\0pw")));
        assert_eq!(None, decode_plain("!!!"));
    }

    #[test]
    fn reply_rendering() {
        let mut out = Vec::new();
        Reply::no("Script is active").code("ACTIVE").render(&mut out);
        Reply::ok().render(&mut out);
        assert_eq!(
            "NO (ACTIVE) \"Script is active\"\r\nOK\r\n",
            String::from_utf8(out).unwrap(),
        );
    }

    #[test]
    fn script_names() {
        assert!(check_script_name("vacation").is_ok());
        assert!(check_script_name("").is_err());
        assert!(check_script_name("a\nb").is_err());
        assert!(check_script_name(&"x".repeat(200)).is_err());
    }
}
