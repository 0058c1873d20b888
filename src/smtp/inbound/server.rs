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

//! The protocol half of an inbound SMTP session.
//!
//! This reads commands, enforces the RFC 5321 command sequence and undoes
//! dot-stuffing. Every decision about whether to accept something is made by
//! the service on the other end of the bridge.

use std::borrow::Cow;
use std::future::Future;
use std::io;
use std::time::Duration;

use log::{error, info, warn};
use openssl::ssl::SslAcceptor;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt,
    BufStream,
};
use tokio::sync::{mpsc, oneshot};

use super::super::{codes::*, syntax::*};
use super::bridge::*;
use crate::support::{async_io::SessionIo, error::Error, log_prefix::LogPrefix};

pub(super) struct Service {
    /// The message size limit advertised with `SIZE`.
    pub(super) max_size: u64,
    /// If set, the connection is refused with this response instead of the
    /// greeting.
    pub(super) refuse: Option<SmtpResponse<'static>>,
    pub(super) send_request: mpsc::Sender<Request>,
}

/// How long the client may stay silent between commands.
const COMMAND_IDLE: Duration = Duration::from_secs(300);
/// How long the client may take to send a whole message body.
const DATA_IDLE: Duration = Duration::from_secs(1800);
const MAX_LINE: usize = 1024;
/// The most bytes of message data handled as one unit.
const MAX_DATA_CHUNK: u64 = 65536;
/// Commands tolerated without any progress towards delivering mail.
const MAX_IDLE_COMMANDS: u32 = 30;

/// Where the client is in the command sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    /// No HELO yet, either at the start or after STARTTLS.
    Connected,
    /// Greeted, with no mail transaction open.
    Greeted,
    /// `MAIL FROM` accepted, along with this many recipients.
    Transaction(u32),
}

/// One command line as received, before parsing.
enum Line {
    Text(String),
    TooLong,
    Binary,
    NotUtf8,
}

struct Session {
    io: BufStream<SessionIo>,
    log_prefix: LogPrefix,
    ssl_acceptor: Option<SslAcceptor>,
    service: Service,
    local_host_name: String,

    phase: Phase,
    idle_commands: u32,
    closing: bool,
    /// Whether the client has ended any command with a bare LF.
    saw_bare_lf: bool,
}

pub(super) async fn run(
    io: SessionIo,
    log_prefix: LogPrefix,
    ssl_acceptor: Option<SslAcceptor>,
    service: Service,
    local_host_name: String,
) -> Result<(), Error> {
    let mut session = Session {
        io: BufStream::new(io),
        log_prefix,
        ssl_acceptor,
        service,
        local_host_name,

        phase: Phase::Connected,
        idle_commands: 0,
        closing: false,
        saw_bare_lf: false,
    };

    if let Some(refusal) = session.service.refuse.take() {
        warn!("{} Refusing connection: {}", session.log_prefix, refusal.2);
        return session.reply(refusal).await;
    }

    session
        .reply(smtp_reply(
            pc::ServiceReady,
            None,
            format!(
                "{} ESMTP {} {} ready",
                session.local_host_name,
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION"),
            ),
        ))
        .await?;

    while !session.closing {
        let line = with_deadline(COMMAND_IDLE, session.read_line()).await?;
        session.dispatch(line).await?;
    }

    Ok(())
}

async fn with_deadline<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, Error>>,
) -> Result<T, Error> {
    tokio::time::timeout(limit, fut).await.unwrap_or_else(|_| {
        Err(Error::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            "Connection idle timer expired",
        )))
    })
}

fn smtp_reply(
    code: PrimaryCode,
    enhanced: Option<(ClassCode, SubjectCode)>,
    text: impl Into<Cow<'static, str>>,
) -> SmtpResponse<'static> {
    SmtpResponse(code, enhanced, text.into())
}

fn ok() -> SmtpResponse<'static> {
    smtp_reply(pc::Ok, Some((cc::Success, sc::Undefined)), "OK")
}

fn out_of_sequence(text: &'static str) -> SmtpResponse<'static> {
    smtp_reply(
        pc::BadSequenceOfCommands,
        Some((cc::PermFail, sc::InvalidCommand)),
        text,
    )
}

fn internal_error() -> SmtpResponse<'static> {
    smtp_reply(
        pc::ServiceNotAvailableClosing,
        Some((cc::TempFail, sc::OtherMailSystem)),
        "Internal server error",
    )
}

impl Session {
    async fn read_line(&mut self) -> Result<Line, Error> {
        let mut raw = Vec::new();
        (&mut self.io)
            .take(MAX_LINE as u64)
            .read_until(b'\n', &mut raw)
            .await?;

        if !raw.ends_with(b"\n") {
            if raw.len() < MAX_LINE {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    if raw.is_empty() {
                        "EOF reached at start of command"
                    } else {
                        "EOF reached within command"
                    },
                )));
            }

            // Discard the remainder of the overlong line
            while !raw.is_empty() && !raw.ends_with(b"\n") {
                raw.clear();
                (&mut self.io)
                    .take(MAX_LINE as u64)
                    .read_until(b'\n', &mut raw)
                    .await?;
            }
            return Ok(Line::TooLong);
        }

        raw.pop();
        if Some(&b'\r') == raw.last() {
            raw.pop();
        } else {
            self.saw_bare_lf = true;
        }

        if raw.contains(&0) {
            return Ok(Line::Binary);
        }

        Ok(String::from_utf8(raw).map_or(Line::NotUtf8, Line::Text))
    }

    async fn dispatch(&mut self, line: Line) -> Result<(), Error> {
        let text = match line {
            Line::Text(text) => text,
            Line::Binary => {
                warn!(
                    "{} Remote is speaking binary, closing connection",
                    self.log_prefix,
                );
                self.closing = true;
                return Ok(());
            },
            Line::TooLong => {
                return self
                    .reply(smtp_reply(
                        pc::CommandSyntaxError,
                        Some((cc::PermFail, sc::OtherProtocolStatus)),
                        "Command line too long",
                    ))
                    .await;
            },
            Line::NotUtf8 => {
                warn!("{} Non-UTF-8 command received", self.log_prefix);
                return self
                    .reply(smtp_reply(
                        pc::CommandSyntaxError,
                        Some((cc::PermFail, sc::OtherProtocolStatus)),
                        "Malformed UTF-8",
                    ))
                    .await;
            },
        };

        self.idle_commands += 1;
        if self.idle_commands > MAX_IDLE_COMMANDS {
            warn!(
                "{} Terminating connection after too many non-mail commands",
                self.log_prefix,
            );
            return self
                .reply(smtp_reply(
                    pc::ServiceNotAvailableClosing,
                    Some((cc::TempFail, sc::OtherProtocolStatus)),
                    "Too many commands issued without sending mail",
                ))
                .await;
        }

        let command = match text.parse::<Command>() {
            Ok(command) => command,
            Err(_) => return self.reject_unparsable(&text).await,
        };

        match command {
            Command::Helo(verb, origin) => self.helo(verb, origin).await,
            Command::MailFrom(mail) => {
                for warning in &mail.warnings {
                    warn!("{} {}", self.log_prefix, warning);
                }
                self.mail_from(mail.return_path, mail.size).await
            },
            Command::Recipient(to, warnings) => {
                for warning in warnings {
                    warn!("{} {}", self.log_prefix, warning);
                }
                self.recipient(to).await
            },
            Command::Data => self.data().await,
            Command::Reset => {
                self.abandon_transaction();
                if self.ask(RequestPayload::Reset).await? {
                    self.reply(ok()).await?;
                }
                Ok(())
            },
            Command::Verify => {
                info!("{} Declined to VRFY", self.log_prefix);
                self.reply(smtp_reply(
                    pc::CannotVerify,
                    Some((cc::Success, sc::OtherSecurity)),
                    "Cannot VRFY user, but will accept message",
                ))
                .await
            },
            Command::Expand => {
                self.reply(smtp_reply(
                    pc::ActionNotTakenPermanent,
                    Some((
                        cc::PermFail,
                        sc::SystemNotCapableOfSelectedFeatures,
                    )),
                    "There are no mailing lists here",
                ))
                .await
            },
            Command::Help => {
                self.reply_lines(
                    pc::HelpMessage,
                    Some((cc::Success, sc::Undefined)),
                    &[
                        "Supported commands:",
                        "  EHLO HELO MAIL RCPT DATA",
                        "  RSET NOOP QUIT VRFY STARTTLS",
                        "End of HELP",
                    ],
                )
                .await
            },
            Command::Noop => self.reply(ok()).await,
            Command::Quit => {
                // The client may already be gone.
                let _ = self
                    .reply(smtp_reply(
                        pc::ServiceClosing,
                        Some((cc::Success, sc::Undefined)),
                        "Bye",
                    ))
                    .await;
                self.closing = true;
                Ok(())
            },
            Command::StartTls => self.start_tls().await,
            Command::Http => {
                warn!("{} Remote is speaking HTTP, closing", self.log_prefix);
                self.closing = true;
                Ok(())
            },
        }
    }

    async fn reject_unparsable(&mut self, text: &str) -> Result<(), Error> {
        let shown = text
            .char_indices()
            .nth(64)
            .map_or(text, |(end, _)| &text[..end]);
        warn!("{} Received bad command {shown:?}", self.log_prefix);

        self.reply(if looks_like_known_command(text) {
            smtp_reply(
                pc::ParameterSyntaxError,
                Some((cc::PermFail, sc::InvalidCommandArguments)),
                "Unknown command syntax",
            )
        } else {
            smtp_reply(
                pc::CommandSyntaxError,
                Some((cc::PermFail, sc::InvalidCommand)),
                "Unrecognised command",
            )
        })
        .await
    }

    async fn helo(
        &mut self,
        verb: String,
        origin: String,
    ) -> Result<(), Error> {
        let extended = !verb.eq_ignore_ascii_case("HELO");
        self.log_prefix.set_helo(origin.clone());
        info!("{} SMTP {verb}", self.log_prefix);

        // HELO in the middle of a transaction implies RSET.
        if matches!(self.phase, Phase::Transaction(_)) {
            self.abandon_transaction();
            if !self.ask(RequestPayload::Reset).await? {
                return Ok(());
            }
        }

        let tls = self.io.get_ref().ssl_string();
        if !self
            .ask(RequestPayload::Helo(HeloRequest {
                extended,
                host: origin.clone(),
                tls,
            }))
            .await?
        {
            return Ok(());
        }

        self.phase = Phase::Greeted;
        let salutation =
            format!("{} salutations, {origin}", self.local_host_name);
        if !extended {
            return self.reply(smtp_reply(pc::Ok, None, salutation)).await;
        }

        let size = format!("SIZE {}", self.service.max_size);
        let mut lines = vec![
            salutation.as_str(),
            "8BITMIME",
            "ENHANCEDSTATUSCODES",
            "PIPELINING",
            size.as_str(),
        ];
        // STARTTLS must not be offered once TLS is up.
        if self.ssl_acceptor.is_some() && !self.io.get_ref().is_ssl() {
            lines.push("STARTTLS");
        }
        lines.push("HELP");

        self.reply_lines(pc::Ok, None, &lines).await
    }

    async fn mail_from(
        &mut self,
        return_path: String,
        declared_size: Option<u64>,
    ) -> Result<(), Error> {
        match self.phase {
            Phase::Connected => {
                return self
                    .reply(out_of_sequence("Still waiting for HELO"))
                    .await
            },
            Phase::Transaction(_) => {
                return self
                    .reply(out_of_sequence("Already got MAIL FROM"))
                    .await
            },
            Phase::Greeted => (),
        }

        if declared_size.is_some_and(|size| size > self.service.max_size) {
            return self
                .reply(smtp_reply(
                    pc::ExceededStorageAllocation,
                    Some((cc::PermFail, sc::MessageLengthExceedsLimit)),
                    format!(
                        "Maximum message size is {} bytes",
                        self.service.max_size,
                    ),
                ))
                .await;
        }

        if !self
            .ask(RequestPayload::Mail(MailRequest {
                from: return_path,
                size: declared_size,
            }))
            .await?
        {
            return Ok(());
        }

        info!("{} Start mail transaction", self.log_prefix);
        self.idle_commands = 0;
        self.phase = Phase::Transaction(0);
        self.reply(ok()).await
    }

    async fn recipient(&mut self, forward_path: String) -> Result<(), Error> {
        let accepted = match self.phase {
            Phase::Connected => {
                return self
                    .reply(out_of_sequence("Still waiting for HELO"))
                    .await
            },
            Phase::Greeted => {
                return self
                    .reply(out_of_sequence("Still waiting for MAIL FROM"))
                    .await
            },
            Phase::Transaction(n) => n,
        };

        if !self
            .ask(RequestPayload::Recipient(RecipientRequest {
                to: forward_path,
            }))
            .await?
        {
            return Ok(());
        }

        self.idle_commands = 0;
        self.phase = Phase::Transaction(accepted + 1);
        self.reply(smtp_reply(
            pc::Ok,
            Some((cc::Success, sc::DestinationAddressValid)),
            "OK",
        ))
        .await
    }

    async fn data(&mut self) -> Result<(), Error> {
        match self.phase {
            Phase::Connected => {
                return self
                    .reply(out_of_sequence("Still waiting for HELO"))
                    .await
            },
            Phase::Greeted => {
                return self
                    .reply(out_of_sequence("Still waiting for MAIL FROM"))
                    .await
            },
            Phase::Transaction(0) => {
                return self.reply(out_of_sequence("No recipients")).await
            },
            Phase::Transaction(_) => (),
        }

        let (service_end, mut our_end) = tokio::io::duplex(4096);
        let (completion_tx, completion_rx) = oneshot::channel();
        if !self
            .ask(RequestPayload::Data(DataRequest {
                data: service_end,
                completion: completion_rx,
            }))
            .await?
        {
            return Ok(());
        }

        self.idle_commands = 0;
        self.reply(smtp_reply(
            pc::StartMailInput,
            None,
            "Go ahead; end with <CRLF>.<CRLF>",
        ))
        .await?;

        // A client that ends commands with bare LFs probably ends the data
        // the same way.
        let unix_lines = self.saw_bare_lf;
        with_deadline(DATA_IDLE, async {
            unstuff_data(&mut self.io, &mut our_end, unix_lines, true)
                .await
                .map_err(Error::Io)
        })
        .await?;

        // Closing our end tells the service the body is complete.
        drop(our_end);
        let (verdict_tx, verdict_rx) = oneshot::channel();
        // If the service is gone, `verdict_rx` reports it below.
        let _ = completion_tx.send(verdict_tx);

        let response = match verdict_rx.await {
            Ok(Ok(())) => ok(),
            Ok(Err(response)) => response,
            Err(_) => {
                error!(
                    "{} [BUG] Service worker disappeared during data transfer",
                    self.log_prefix,
                );
                smtp_reply(
                    pc::ActionAborted,
                    Some((cc::TempFail, sc::OtherMailSystem)),
                    "Internal server error",
                )
            },
        };

        info!(
            "{} Completed data transfer {}",
            self.log_prefix,
            if response.0.is_positive() {
                "successfully"
            } else {
                "unsuccessfully"
            },
        );
        self.phase = Phase::Greeted;
        self.reply(response).await
    }

    async fn start_tls(&mut self) -> Result<(), Error> {
        let problem = match self.phase {
            Phase::Connected => Some("Still waiting for HELO"),
            Phase::Transaction(_) => Some("Already got MAIL FROM"),
            Phase::Greeted if self.io.get_ref().is_ssl() => {
                Some("Already using TLS")
            },
            Phase::Greeted => None,
        };
        if let Some(problem) = problem {
            return self.reply(out_of_sequence(problem)).await;
        }

        let Some(ssl_acceptor) = self.ssl_acceptor.take() else {
            return self
                .reply(smtp_reply(
                    pc::CommandNotImplemented,
                    Some((cc::PermFail, sc::SecurityFeaturesNotSupported)),
                    "TLS not configured",
                ))
                .await;
        };

        self.reply(smtp_reply(
            pc::ServiceReady,
            Some((cc::Success, sc::Undefined)),
            "Switching to TLS",
        ))
        .await?;

        info!("{} Start TLS handshake", self.log_prefix);
        self.phase = Phase::Connected;
        self.io.get_mut().ssl_accept(&ssl_acceptor).await?;
        info!(
            "{} TLS handshake completed: {}",
            self.log_prefix,
            self.io.get_ref().ssl_string().unwrap_or_default(),
        );

        Ok(())
    }

    fn abandon_transaction(&mut self) {
        if Phase::Connected != self.phase {
            self.phase = Phase::Greeted;
        }
    }

    /// Pass `payload` to the service and wait for its verdict.
    ///
    /// On rejection the service's response is sent to the client and this
    /// returns `false`. On acceptance nothing is sent.
    async fn ask(&mut self, payload: RequestPayload) -> Result<bool, Error> {
        let (respond, verdict) = oneshot::channel();
        let verdict = match self
            .service
            .send_request
            .send(Request { payload, respond })
            .await
        {
            Ok(()) => verdict.await.ok(),
            Err(_) => None,
        };

        match verdict {
            Some(Ok(())) => Ok(true),
            Some(Err(response)) => {
                self.reply(response).await?;
                Ok(false)
            },
            None => {
                error!("{} [BUG] Service worker disappeared", self.log_prefix);
                self.reply(internal_error()).await?;
                Ok(false)
            },
        }
    }

    async fn reply(&mut self, response: SmtpResponse<'_>) -> Result<(), Error> {
        let SmtpResponse(code, enhanced, text) = response;
        self.reply_lines(code, enhanced, &[&*text]).await
    }

    /// Send a (possibly multi-line) reply and flush it.
    async fn reply_lines(
        &mut self,
        code: PrimaryCode,
        enhanced: Option<(ClassCode, SubjectCode)>,
        lines: &[&str],
    ) -> Result<(), Error> {
        if pc::ServiceClosing == code || pc::ServiceNotAvailableClosing == code
        {
            self.closing = true;
        }

        let mut out = String::new();
        for (ix, line) in lines.iter().enumerate() {
            format_reply(&mut out, code, enhanced, ix + 1 == lines.len(), line);
        }

        self.io.write_all(out.as_bytes()).await?;
        self.io.flush().await?;
        Ok(())
    }
}

/// Copy message data from `src` to `dst` up to and including the line
/// consisting of a single `.`, removing the dot-stuffing.
///
/// With `unix_lines`, bare LFs end lines and are rewritten as CRLF. If
/// `detect_line_endings` is set, the first line ending seen decides whether
/// `unix_lines` is turned on. Otherwise only CRLF ends a line, so any binary
/// content survives unchanged.
///
/// Write errors on `dst` are swallowed so that the rest of the data is still
/// consumed from the client.
async fn unstuff_data(
    src: &mut (impl AsyncBufRead + Unpin),
    dst: &mut (impl AsyncWrite + Unpin),
    mut unix_lines: bool,
    mut detect_line_endings: bool,
) -> io::Result<()> {
    let mut chunk = Vec::new();
    let mut at_line_start = true;
    // Set when the previous chunk was cut off right after a CR.
    let mut after_cr = false;
    let mut dst_ok = true;

    loop {
        chunk.clear();
        (&mut *src)
            .take(MAX_DATA_CHUNK)
            .read_until(b'\n', &mut chunk)
            .await?;

        let has_lf = chunk.ends_with(b"\n");
        if !has_lf && (chunk.len() as u64) < MAX_DATA_CHUNK {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF encountered in DATA payload",
            ));
        }

        let crlf =
            chunk.ends_with(b"\r\n") || (after_cr && b"\n" == &chunk[..]);
        if detect_line_endings && has_lf {
            detect_line_endings = false;
            unix_lines = !crlf;
        }

        let mut content = &chunk[..];
        if at_line_start {
            // ".\n" is never valid content at the start of a line, so it
            // terminates the data even in strict mode.
            if b".\r\n" == content || b".\n" == content {
                return Ok(());
            }
            if content.starts_with(b".") {
                content = &content[1..];
            }
        }

        if dst_ok {
            let written = if unix_lines && has_lf && !crlf {
                match dst.write_all(&content[..content.len() - 1]).await {
                    Ok(()) => dst.write_all(b"\r\n").await,
                    Err(e) => Err(e),
                }
            } else {
                dst.write_all(content).await
            };
            dst_ok = written.is_ok();
        }

        at_line_start = crlf || (unix_lines && has_lf);
        after_cr = chunk.ends_with(b"\r");
    }
}
