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

//! The network half of an IMAP session: framing commands and their literals,
//! and the commands which converse with the client mid-flight.

use std::io;
use std::rc::Rc;
use std::str;
use std::time::Duration;

use lazy_static::lazy_static;
use log::{info, warn};
use openssl::ssl::SslAcceptor;
use regex::bytes::Regex;
use tokio::io::{
    AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter,
};
use tokio::time::Instant;

use super::command_processor::{CommandProcessor, ImapContext, Response};
use super::syntax::{self as s, Command, CommandLine};
use crate::support::{async_io::SessionIo, error::Error, log_prefix::LogPrefix};

const MAX_CMDLINE: usize = 65536;
const MAX_AUTH_LINE: u64 = 8192;
/// RFC 3501 asks for at least 30 minutes before an idle client is logged out.
const AUTOLOGOUT: Duration = Duration::from_secs(30 * 60);
const IDLE_TIMEOUT: Duration = Duration::from_secs(29 * 60);

lazy_static! {
    static ref LITERAL_AT_END: Regex =
        Regex::new(r#"\{([0-9]+)(\+?)\}$"#).unwrap();
}

struct Server {
    reader: BufReader<SessionIo>,
    writer: BufWriter<SessionIo>,
    log_prefix: LogPrefix,
    ssl_acceptor: Option<SslAcceptor>,
    processor: CommandProcessor,
}

/// Serve one IMAP session over `io` until the client logs out or the
/// connection fails.
pub async fn serve_imap(
    io: SessionIo,
    context: Rc<ImapContext>,
    log_prefix: LogPrefix,
    ssl_acceptor: Option<SslAcceptor>,
) -> Result<(), Error> {
    let processor =
        CommandProcessor::new(
            log_prefix.clone(),
            context,
            ssl_acceptor.is_some(),
        );
    let mut server = Server {
        reader: BufReader::new(io.clone()),
        writer: BufWriter::new(io),
        log_prefix,
        ssl_acceptor,
        processor,
    };

    server.run().await
}

/// The outcome of waiting during `IDLE`.
enum IdleWake {
    Input(io::Result<usize>),
    Notified(Option<String>),
    TimedOut,
}

impl Server {
    async fn run(&mut self) -> Result<(), Error> {
        info!("{} IMAP session started", self.log_prefix);
        let greeting = self.processor.greeting();
        self.send(None, &greeting).await?;

        let mut cmdline = Vec::<u8>::new();
        while !self.processor.logged_out() {
            match tokio::time::timeout(
                AUTOLOGOUT,
                self.read_command(&mut cmdline),
            )
            .await
            {
                Err(_) => {
                    info!("{} Autologout", self.log_prefix);
                    let bye = Response::bye("Autologout; idle for too long");
                    self.send(None, &bye).await?;
                    return Ok(());
                },
                Ok(Err(e)) => return Err(e),
                Ok(Ok(false)) => continue,
                Ok(Ok(true)) => (),
            }

            self.handle_command_line(&cmdline).await?;
        }

        info!("{} IMAP session ended", self.log_prefix);
        Ok(())
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

        loop {
            let start = cmdline.len();
            let room = (MAX_CMDLINE + 2).saturating_sub(start) as u64;
            let nread = (&mut self.reader)
                .take(room.max(2))
                .read_until(b'\n', cmdline)
                .await?;
            if 0 == nread {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "EOF reached within command",
                )));
            }

            if !cmdline.ends_with(b"\n") {
                if cmdline.len() < MAX_CMDLINE {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "EOF reached within command",
                    )));
                }

                self.skip_line().await?;
                self.reject_too_long(cmdline).await?;
                return Ok(false);
            }

            cmdline.pop();
            if cmdline.ends_with(b"\r") {
                cmdline.pop();
            }

            let Some((length, synchronising)) =
                literal_at_end(&cmdline[start..])
            else {
                return Ok(true);
            };

            if cmdline.len() + length > MAX_CMDLINE {
                if !synchronising {
                    // The client sends the literal regardless
                    tokio::io::copy(
                        &mut (&mut self.reader).take(length as u64),
                        &mut tokio::io::sink(),
                    )
                    .await?;
                    self.skip_line().await?;
                }
                self.reject_too_long(cmdline).await?;
                return Ok(false);
            }

            cmdline.extend_from_slice(b"\r\n");
            if synchronising {
                self.write_raw(b"+ Ready for literal data\r\n").await?;
            }

            let literal_start = cmdline.len();
            cmdline.resize(literal_start + length, 0);
            self.reader.read_exact(&mut cmdline[literal_start..]).await?;
        }
    }

    async fn skip_line(&mut self) -> Result<(), Error> {
        let mut discard = Vec::new();
        loop {
            discard.clear();
            let nread = (&mut self.reader)
                .take(MAX_CMDLINE as u64)
                .read_until(b'\n', &mut discard)
                .await?;
            if 0 == nread || discard.ends_with(b"\n") {
                return Ok(());
            }
        }
    }

    async fn reject_too_long(&mut self, cmdline: &[u8]) -> Result<(), Error> {
        warn!("{} Command line too long", self.log_prefix);
        let tag = cmdline
            .split(|&b| b' ' == b)
            .next()
            .and_then(|t| str::from_utf8(t).ok())
            .filter(|t| !t.is_empty())
            .map(str::to_owned);
        let response = Response::bad("Command line too long").code("TOOBIG");
        self.send(tag.as_deref(), &response).await
    }

    async fn handle_command_line(
        &mut self,
        cmdline: &[u8],
    ) -> Result<(), Error> {
        match s::parse_command_line(cmdline) {
            Err(tag) => {
                warn!(
                    "{} Unparsable command: {:?}",
                    self.log_prefix,
                    String::from_utf8_lossy(&cmdline[..cmdline.len().min(64)]),
                );
                let response = Response::bad("Unrecognised command syntax");
                self.send(tag.as_deref(), &response).await
            },

            Ok(CommandLine {
                tag,
                command: Command::StartTls,
            }) => self.cmd_start_tls(&tag).await,

            Ok(CommandLine {
                tag,
                command: Command::Authenticate { mechanism, initial },
            }) => self.cmd_authenticate(&tag, &mechanism, initial).await,

            Ok(CommandLine {
                tag,
                command: Command::Idle,
            }) => self.cmd_idle(&tag).await,

            Ok(CommandLine { tag, command }) => {
                let response = self.processor.handle(command);
                self.send(Some(&tag), &response).await
            },
        }
    }

    async fn cmd_start_tls(&mut self, tag: &str) -> Result<(), Error> {
        if let Err(response) = self.processor.check_start_tls() {
            return self.send(Some(tag), &response).await;
        }
        let Some(ssl_acceptor) = self.ssl_acceptor.take() else {
            return self
                .send(Some(tag), &Response::no("TLS not configured"))
                .await;
        };

        if !self.reader.buffer().is_empty() {
            warn!("{} Client pipelined data after STARTTLS", self.log_prefix);
            self.processor.force_logout();
            return self
                .send(None, &Response::bye("Pipelined data after STARTTLS"))
                .await;
        }

        self.send(Some(tag), &Response::ok("Begin TLS negotiation now"))
            .await?;

        info!("{} Start TLS handshake", self.log_prefix);
        self.reader.get_ref().ssl_accept(&ssl_acceptor).await?;
        self.processor.set_tls_active();
        info!(
            "{} TLS handshake completed: {}",
            self.log_prefix,
            self.reader.get_ref().ssl_string().unwrap_or_default(),
        );

        Ok(())
    }

    async fn cmd_authenticate(
        &mut self,
        tag: &str,
        mechanism: &str,
        initial: Option<String>,
    ) -> Result<(), Error> {
        if !mechanism.eq_ignore_ascii_case("PLAIN") {
            let response = Response::no("Unsupported authentication mechanism");
            return self.send(Some(tag), &response).await;
        }
        if let Err(response) = self.processor.check_authenticate() {
            return self.send(Some(tag), &response).await;
        }

        let data = match initial {
            // RFC 4959: "=" is an empty initial response
            Some(s) if "=" == s => String::new(),
            Some(s) => s,
            None => {
                self.write_raw(b"+ \r\n").await?;
                let mut line = Vec::new();
                (&mut self.reader)
                    .take(MAX_AUTH_LINE)
                    .read_until(b'\n', &mut line)
                    .await?;
                if !line.ends_with(b"\n") {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "EOF or overflow in AUTHENTICATE",
                    )));
                }
                String::from_utf8_lossy(&line).trim_end().to_owned()
            },
        };

        if "*" == data {
            let response = Response::bad("Authentication cancelled");
            return self.send(Some(tag), &response).await;
        }

        let response = self.processor.authenticate_plain(&data);
        self.send(Some(tag), &response).await
    }

    async fn cmd_idle(&mut self, tag: &str) -> Result<(), Error> {
        let mut subscription = match self.processor.start_idle() {
            Ok(s) => s,
            Err(response) => return self.send(Some(tag), &response).await,
        };

        self.write_raw(b"+ idling\r\n").await?;
        // Pick up anything delivered between the last poll and subscribing
        self.send_idle_update().await?;

        let deadline = Instant::now() + IDLE_TIMEOUT;
        let mut line = Vec::<u8>::new();
        loop {
            let wake = {
                let mut input = (&mut self.reader).take(MAX_AUTH_LINE);
                tokio::select! {
                    r = input.read_until(b'\n', &mut line) => {
                        IdleWake::Input(r)
                    },
                    e = subscription.events.recv() => {
                        IdleWake::Notified(e.map(|e| e.mailbox))
                    },
                    _ = tokio::time::sleep_until(deadline) => {
                        IdleWake::TimedOut
                    },
                }
            };

            match wake {
                IdleWake::Input(r) => {
                    if 0 == r? {
                        return Err(Error::Io(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "EOF during IDLE",
                        )));
                    }
                    if !line.ends_with(b"\n") {
                        if line.len() as u64 >= MAX_AUTH_LINE {
                            self.processor.force_logout();
                            return self
                                .send(None, &Response::bye("Line too long"))
                                .await;
                        }
                        continue;
                    }

                    let response = if str::from_utf8(&line).map_or(false, |l| {
                        l.trim_end().eq_ignore_ascii_case("DONE")
                    }) {
                        Response::ok("IDLE terminated")
                    } else {
                        Response::bad("Expected DONE")
                    };
                    return self.send(Some(tag), &response).await;
                },

                IdleWake::Notified(Some(mailbox)) => {
                    if self.processor.is_selected(&mailbox) {
                        self.send_idle_update().await?;
                    }
                },

                IdleWake::Notified(None) | IdleWake::TimedOut => {
                    info!("{} IDLE timed out", self.log_prefix);
                    self.processor.force_logout();
                    return self
                        .send(None, &Response::bye("IDLE timed out"))
                        .await;
                },
            }
        }
    }

    async fn send_idle_update(&mut self) -> Result<(), Error> {
        let lines = self.processor.idle_update();
        if lines.is_empty() {
            return Ok(());
        }

        for line in lines {
            self.writer.write_all(&line).await?;
            self.writer.write_all(b"\r\n").await?;
        }
        self.writer.flush().await?;
        Ok(())
    }

    async fn send(
        &mut self,
        tag: Option<&str>,
        response: &Response,
    ) -> Result<(), Error> {
        self.write_raw(&response.render(tag)).await
    }

    async fn write_raw(&mut self, data: &[u8]) -> Result<(), Error> {
        self.writer.write_all(data).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// If `line` ends with a literal introducer, its length and whether the
/// client waits for a continuation before sending it.
pub(crate) fn literal_at_end(line: &[u8]) -> Option<(usize, bool)> {
    let captures = LITERAL_AT_END.captures(line)?;
    let length = str::from_utf8(captures.get(1)?.as_bytes())
        .ok()?
        .parse::<usize>()
        .ok()?;
    let synchronising =
        captures.get(2).map_or(true, |m| m.as_bytes().is_empty());
    Some((length, synchronising))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn literal_introducers() {
        assert_eq!(Some((12, true)), literal_at_end(b"a SELECT {12}"));
        assert_eq!(Some((3, false)), literal_at_end(b"a LOGIN {3+}"));
        assert_eq!(None, literal_at_end(b"a LOGIN {3} x"));
        assert_eq!(None, literal_at_end(b"a NOOP"));
        assert_eq!(None, literal_at_end(b"a X {99999999999999999999999}"));
    }
}
