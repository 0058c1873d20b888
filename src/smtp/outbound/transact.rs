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

use std::fmt::{self, Write as _};
use std::io;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use log::error;
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode, SslVersion};
use openssl::x509::X509;
use tokio::io::{
    AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
    BufWriter,
};
use tokio::time::timeout_at;

use super::transcript::Transcript;
use crate::support::{async_io::SessionIo, dns};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The transaction on this connection failed, but another server (or a
    /// later retry) may succeed.
    TryNextServer,
    /// The message was refused outright; retrying is futile.
    TotalFailure,
}

/// What is known about a connection that accepted the message.
#[derive(Clone, Debug, Default)]
pub struct Results {
    /// The TLS version, if STARTTLS was negotiated.
    pub tls_version: Option<SslVersion>,
    /// Whether the peer's certificate chain verified against the system trust
    /// store.
    pub valid_certificate: bool,
    /// The peer's leaf certificate, if TLS was negotiated.
    pub peer_certificate: Option<X509>,
}

/// The message to send on one connection.
pub struct Envelope<'a> {
    /// The reverse path; empty for the null sender.
    pub mail_from: &'a str,
    pub recipient: &'a str,
    pub data: &'a [u8],
}

const MAX_LINE: u64 = 1024;
const MAX_REPLY_LINES: usize = 1000;
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Executes an SMTP transaction against an established connection.
///
/// STARTTLS is used whenever offered. The certificate is checked and the
/// outcome reported in the `Results`, but an untrusted certificate does not
/// stop delivery.
pub async fn execute(
    cxn: SessionIo,
    transcript: &mut Transcript,
    envelope: &Envelope<'_>,
    mx_domain: &dns::Name,
    local_host_name: &str,
) -> Result<Results, Error> {
    let mut client = Client {
        io: BufReader::with_capacity(MAX_LINE as usize, cxn),
        transcript,
        deadline: Instant::now() + COMMAND_TIMEOUT,
    };

    // Greeting
    client.expect(Blame::Server).await?;

    let mut capabilities = client.hello(local_host_name).await?;
    let mut results = Results::default();
    if capabilities.starttls {
        results = client.start_tls(mx_domain).await?;
        capabilities = client.hello(local_host_name).await?;
    } else {
        client.transcript.line(format_args!(
            "WARNING: Conducting this transaction in cleartext!",
        ));
    }

    let size = envelope.data.len() as u64;
    if let Some(max_size) = capabilities.max_size.filter(|&max| size > max) {
        client.transcript.line(format_args!(
            "Server accepts at most {max_size} bytes; message is {size}",
        ));
        return Err(Error::TotalFailure);
    }

    client.command(&mail_command(envelope, &capabilities)).await?;
    client.expect(Blame::Message).await?;
    client
        .command(&format!("RCPT TO:<{}>", envelope.recipient))
        .await?;
    client.expect(Blame::Message).await?;
    client.transfer(envelope.data).await?;

    // Whatever happens to QUIT, the message is already accepted.
    if client.command("QUIT").await.is_ok() {
        let _ = client.read_reply().await;
    }

    Ok(results)
}

/// What a failure status refers to. Only the transcript wording depends on
/// it; any 5xx is final either way.
#[derive(Clone, Copy)]
enum Blame {
    /// The server as a whole (greeting, HELO, STARTTLS).
    Server,
    /// This particular message.
    Message,
}

#[derive(Default)]
struct Reply {
    code: u32,
    lines: Vec<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Capabilities {
    starttls: bool,
    eight_bit: bool,
    size: bool,
    max_size: Option<u64>,
}

impl Capabilities {
    /// Reads the extension keywords from an EHLO reply. The first line is
    /// the server's greeting and carries no keyword.
    fn from_ehlo(lines: &[String]) -> Self {
        let mut capabilities = Self::default();
        for line in lines.iter().skip(1) {
            let mut words = line.split_ascii_whitespace();
            let Some(keyword) = words.next() else {
                continue;
            };

            if keyword.eq_ignore_ascii_case("STARTTLS") {
                capabilities.starttls = true;
            } else if keyword.eq_ignore_ascii_case("8BITMIME") {
                capabilities.eight_bit = true;
            } else if keyword.eq_ignore_ascii_case("SIZE") {
                capabilities.size = true;
                // SIZE 0 and a bare SIZE both mean no fixed limit.
                capabilities.max_size = words
                    .next()
                    .and_then(|n| n.parse::<u64>().ok())
                    .filter(|&n| n > 0);
            }
        }
        capabilities
    }
}

fn mail_command(
    envelope: &Envelope<'_>,
    capabilities: &Capabilities,
) -> String {
    let mut command = format!("MAIL FROM:<{}>", envelope.mail_from);
    if capabilities.size {
        let _ = write!(command, " SIZE={}", envelope.data.len());
    }
    if capabilities.eight_bit && !envelope.data.is_ascii() {
        command.push_str(" BODY=8BITMIME");
    }
    command
}

struct Client<'a> {
    io: BufReader<SessionIo>,
    transcript: &'a mut Transcript,
    deadline: Instant,
}

impl Client<'_> {
    /// Records `what` and gives up on this server.
    fn fail(&mut self, what: fmt::Arguments<'_>) -> Error {
        self.transcript.line(what);
        Error::TryNextServer
    }

    /// Maps a non-2xx status to the error it implies.
    ///
    /// A 4xx may go away on another server or a later retry; a 5xx will not.
    fn refusal(&mut self, code: u32, blame: Blame) -> Error {
        let (note, error) = match (code / 100, blame) {
            (4, Blame::Server) => (
                "Server appears temporarily unavailable",
                Error::TryNextServer,
            ),
            (5, Blame::Server) => (
                "Server refuses service permanently",
                Error::TotalFailure,
            ),
            (4, Blame::Message) => {
                ("Mail failed temporarily", Error::TryNextServer)
            },
            (5, Blame::Message) => ("Mail rejected", Error::TotalFailure),
            _ => ("Unexpected response code; giving up", Error::TryNextServer),
        };
        self.transcript.line(format_args!("{code}: {note}"));
        error
    }

    async fn expect(&mut self, blame: Blame) -> Result<Reply, Error> {
        let reply = self.read_reply().await?;
        if (200..300).contains(&reply.code) {
            Ok(reply)
        } else {
            Err(self.refusal(reply.code, blame))
        }
    }

    async fn hello(
        &mut self,
        local_host_name: &str,
    ) -> Result<Capabilities, Error> {
        self.command(&format!("EHLO {local_host_name}")).await?;
        let reply = self.read_reply().await?;
        match reply.code {
            200..=299 => return Ok(Capabilities::from_ehlo(&reply.lines)),
            // EHLO not understood; fall back to HELO.
            500..=504 | 550 => {},
            code => return Err(self.refusal(code, Blame::Server)),
        }

        self.command(&format!("HELO {local_host_name}")).await?;
        self.expect(Blame::Server).await?;
        Ok(Capabilities::default())
    }

    async fn start_tls(
        &mut self,
        mx_domain: &dns::Name,
    ) -> Result<Results, Error> {
        self.command("STARTTLS").await?;
        self.expect(Blame::Server).await?;
        if !self.io.buffer().is_empty() {
            return Err(self.fail(format_args!(
                "Server sent data ahead of the TLS handshake",
            )));
        }

        self.transcript
            .line(format_args!("<> Performing TLS handshake"));
        let valid_certificate = Arc::new(AtomicBool::new(true));
        let connector = tls_connector(Arc::clone(&valid_certificate))?;
        let host = mx_domain.to_ascii();
        let host = host.strip_suffix('.').unwrap_or(&host);
        let handshake = timeout_at(
            self.deadline.into(),
            self.io.get_ref().ssl_connect(host, &connector),
        )
        .await;
        match handshake {
            Ok(Ok(())) => {},
            Ok(Err(e)) => {
                return Err(
                    self.fail(format_args!("<> TLS handshake failed: {e}"))
                )
            },
            Err(_) => {
                return Err(
                    self.fail(format_args!("<> TLS handshake timed out"))
                )
            },
        }

        let cxn = self.io.get_ref();
        let results = Results {
            tls_version: cxn.ssl_version(),
            valid_certificate: valid_certificate.load(Ordering::Relaxed),
            peer_certificate: cxn.peer_certificate(),
        };
        let cipher = cxn.ssl_string().unwrap_or_default();
        self.transcript.line(format_args!(
            "<> TLS established ({cipher}), certificate {}",
            if results.valid_certificate {
                "verified"
            } else {
                "NOT verified"
            },
        ));
        Ok(results)
    }

    async fn transfer(&mut self, data: &[u8]) -> Result<(), Error> {
        self.command("DATA").await?;
        let reply = self.read_reply().await?;
        match reply.code {
            // Some servers answer DATA with 250 rather than 354.
            200..=299 | 354 => {},
            code => return Err(self.refusal(code, Blame::Message)),
        }

        let size = data.len() as u64;
        // Allow for a 32kbps transfer rate.
        self.deadline += Duration::from_millis(size / 4);
        let sent = timeout_at(
            self.deadline.into(),
            write_dot_stuffed(self.io.get_mut(), data),
        )
        .await;
        match sent {
            Ok(Ok(())) => {},
            Ok(Err(e)) => {
                return Err(self.fail(format_args!("I/O error: {e}")))
            },
            Err(_) => {
                return Err(
                    self.fail(format_args!("<< DATA transfer timed out"))
                )
            },
        }

        self.transcript
            .line(format_args!("<< [{size} bytes, dot-stuffed]"));
        self.expect(Blame::Message).await?;
        Ok(())
    }

    /// Sends `command` plus CRLF and restarts the command deadline.
    async fn command(&mut self, command: &str) -> Result<(), Error> {
        self.deadline = Instant::now() + COMMAND_TIMEOUT;
        self.transcript.line(format_args!("<< {command}"));

        let cxn = self.io.get_mut();
        let write = async {
            cxn.write_all(command.as_bytes()).await?;
            cxn.write_all(b"\r\n").await?;
            cxn.flush().await
        };
        let written = timeout_at(self.deadline.into(), write).await;
        match written {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(self.fail(format_args!(
                "I/O error sending command to server: {e}",
            ))),
            Err(_) => Err(
                self.fail(format_args!("Timeout sending command to server"))
            ),
        }
    }

    /// Reads one complete (possibly multi-line) reply.
    async fn read_reply(&mut self) -> Result<Reply, Error> {
        let mut reply = Reply::default();
        for _ in 0..MAX_REPLY_LINES {
            let line = self.read_line().await?;
            let Some((code, more, text)) = split_reply_line(&line) else {
                return Err(self.fail(format_args!("Bad SMTP response")));
            };

            reply.code = code;
            reply.lines.push(text.to_owned());
            if !more {
                return Ok(reply);
            }
        }

        Err(self.fail(format_args!("Too many responses; giving up")))
    }

    async fn read_line(&mut self) -> Result<String, Error> {
        let mut raw = Vec::<u8>::new();
        let read = timeout_at(
            self.deadline.into(),
            (&mut self.io).take(MAX_LINE).read_until(b'\n', &mut raw),
        )
        .await;

        match read {
            Err(_) => Err(self.fail(format_args!(
                "Timed out reading line from server",
            ))),
            Ok(Err(e)) => Err(self.fail(format_args!(
                "I/O error reading line from server: {e}",
            ))),
            Ok(Ok(_)) if raw.ends_with(b"\n") => {
                let line = String::from_utf8_lossy(&raw)
                    .trim_end_matches(['\r', '\n'])
                    .to_owned();
                self.transcript.line(format_args!(">> {line:?}"));
                Ok(line)
            },
            Ok(Ok(n)) if n as u64 >= MAX_LINE => {
                Err(self.fail(format_args!("Server response line too long")))
            },
            Ok(Ok(_)) => {
                Err(self.fail(format_args!("EOF reading line from server")))
            },
        }
    }
}

/// Splits `250-text` into its status, continuation flag, and text.
fn split_reply_line(line: &str) -> Option<(u32, bool, &str)> {
    let code = line
        .get(..3)
        .filter(|c| c.bytes().all(|b| b.is_ascii_digit()))?
        .parse::<u32>()
        .ok()?;
    let more = match line.as_bytes().get(3) {
        None | Some(b' ') => false,
        Some(b'-') => true,
        Some(_) => return None,
    };
    Some((code, more, line.get(4..).unwrap_or("")))
}

fn tls_connector(
    valid_certificate: Arc<AtomicBool>,
) -> Result<SslConnector, Error> {
    let mut builder = SslConnector::builder(SslMethod::tls_client())
        .map_err(unexpected_ssl_error)?;
    builder
        .set_min_proto_version(Some(SslVersion::TLS1_2))
        .map_err(unexpected_ssl_error)?;
    builder.set_verify_callback(SslVerifyMode::PEER, move |ok, _| {
        if !ok {
            valid_certificate.store(false, Ordering::Relaxed);
        }
        true
    });
    Ok(builder.build())
}

fn unexpected_ssl_error(err: openssl::error::ErrorStack) -> Error {
    error!("unexpected SSL error: {err}");
    Error::TryNextServer
}

/// Writes `data` as the body of a DATA command, followed by the terminating
/// ".\r\n". Only CRLF counts as a line ending for dot stuffing.
async fn write_dot_stuffed(
    dst: &mut (impl AsyncWrite + Unpin),
    data: &[u8],
) -> io::Result<()> {
    let mut dst = BufWriter::new(dst);
    let mut at_line_start = true;
    for line in data.split_inclusive(|&b| b'\n' == b) {
        if at_line_start && line.starts_with(b".") {
            dst.write_all(b".").await?;
        }
        dst.write_all(line).await?;
        at_line_start = line.ends_with(b"\r\n");
    }

    if !at_line_start {
        dst.write_all(b"\r\n").await?;
    }
    dst.write_all(b".\r\n").await?;
    dst.flush().await
}

#[cfg(test)]
pub(super) mod test {
    use std::os::unix::net::UnixStream;

    use itertools::Itertools;
    use proptest::prelude::*;

    use super::super::super::codes::*;
    use super::*;
    use crate::support::async_io::test_support::self_signed_acceptor;

    fn dot_stuffed(content: &[u8]) -> Vec<u8> {
        let mut encoded = Vec::<u8>::new();
        futures::executor::block_on(write_dot_stuffed(&mut encoded, content))
            .unwrap();
        encoded
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 1024,
            ..ProptestConfig::default()
        })]

        #[test]
        fn binary_dot_stuffing_encodes_properly(
            content in "[x.\r\n]{0,100}",
        ) {
            let mut stuffed = content.replace("\r\n.", "\r\n..");
            if stuffed.starts_with('.') {
                stuffed = format!(".{stuffed}");
            }
            if !stuffed.is_empty() && !stuffed.ends_with("\r\n") {
                stuffed.push_str("\r\n");
            }
            stuffed.push_str(".\r\n");

            let actual =
                String::from_utf8(dot_stuffed(content.as_bytes())).unwrap();
            prop_assert_eq!(stuffed, actual);
        }
    }

    #[test]
    fn ehlo_keywords() {
        let lines = ["mx.irk.com greets you", "8bitmime", "SIZE 1000",
                     "PIPELINING", "StartTLS"]
            .map(str::to_owned);
        assert_eq!(
            Capabilities {
                starttls: true,
                eight_bit: true,
                size: true,
                max_size: Some(1000),
            },
            Capabilities::from_ehlo(&lines),
        );

        let lines = ["STARTTLS", "SIZE 0"].map(str::to_owned);
        assert_eq!(
            Capabilities {
                size: true,
                ..Capabilities::default()
            },
            Capabilities::from_ehlo(&lines),
        );
    }

    #[test]
    fn reply_line_splitting() {
        assert_eq!(
            Some((250, true, "SIZE 10")),
            split_reply_line("250-SIZE 10")
        );
        assert_eq!(Some((354, false, "Go")), split_reply_line("354 Go"));
        assert_eq!(Some((221, false, "")), split_reply_line("221"));
        assert_eq!(None, split_reply_line("HTTP/1.1 400 Bad Request"));
        assert_eq!(None, split_reply_line("250_nope"));
    }

    #[derive(Clone, Copy, Debug)]
    enum SessionStep {
        Command(&'static str),
        Response(PrimaryCode, &'static str),
        RawResponseData(&'static str),
        InfiniteResponse,
        StartTls,
        DotStuffedData,
    }

    use self::SessionStep::{
        Command as C, DotStuffedData, RawResponseData, Response as R, StartTls,
    };

    struct SessionParms {
        mail_from: &'static str,
        recipient: &'static str,
        message_data: Vec<u8>,
    }

    impl Default for SessionParms {
        fn default() -> Self {
            Self {
                mail_from: "zim@earth.com",
                recipient: "tallest@irk.com",
                message_data: b"this is the message data\r\n".to_vec(),
            }
        }
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_session(
        parms: &SessionParms,
        steps: &[SessionStep],
    ) -> Result<Results, Error> {
        crate::init_test_log();

        let (server_io, client_io) = UnixStream::pair().unwrap();
        let server_io = SessionIo::new_owned_socket(server_io).unwrap();
        let client_io = SessionIo::new_owned_socket(client_io).unwrap();
        let server_future = run_server(server_io, parms, steps);
        let mut transcript = Transcript::new();
        let envelope = Envelope {
            mail_from: parms.mail_from,
            recipient: parms.recipient,
            data: &parms.message_data,
        };
        let mx_domain = dns::Name::from_ascii("mail.irk.com").unwrap();
        let client_future = execute(
            client_io,
            &mut transcript,
            &envelope,
            &mx_domain,
            "mx.earth.com",
        );
        let (ret, server_result) = tokio::join![client_future, server_future];

        println!("Transcript:\n{}", transcript.as_str());

        if let Some(err) = server_result.expect("server I/O error") {
            panic!("server returned test failure: {err}");
        }

        ret
    }

    async fn run_server(
        mut cxn: SessionIo,
        parms: &SessionParms,
        steps: &[SessionStep],
    ) -> io::Result<Option<String>> {
        async fn read_line(
            cxn: &mut SessionIo,
            buf: &mut [u8],
            buf_len: &mut usize,
        ) -> io::Result<Result<String, String>> {
            let len = loop {
                if let Some(eol) = memchr::memchr(b'\n', &buf[..*buf_len]) {
                    break eol + 1;
                }

                if *buf_len >= buf.len() {
                    return Ok(Err("Over-long command line".to_owned()));
                }

                *buf_len += cxn.read(&mut buf[*buf_len..]).await?;
            };

            let Ok(mut s) =
                std::str::from_utf8(&buf[..len]).map(|s| s.to_owned())
            else {
                return Ok(Err("Non-UTF8 command line".to_owned()));
            };

            if !s.ends_with("\r\n") {
                return Ok(Err(format!("Improperly terminated line: {s:?}")));
            }

            buf.copy_within(s.len()..*buf_len, 0);
            *buf_len -= s.len();

            s.truncate(s.len() - 2);
            Ok(Ok(s))
        }

        let mut buf = [0u8; 256];
        let mut buf_len = 0usize;

        for (step, next_step) in steps
            .iter()
            .copied()
            .chain(std::iter::once(SessionStep::Command("unreachable")))
            .tuple_windows()
        {
            match step {
                SessionStep::Command(expected_line) => {
                    let actual_line =
                        match read_line(&mut cxn, &mut buf, &mut buf_len)
                            .await?
                        {
                            Ok(line) => line,
                            Err(err) => return Ok(Some(err)),
                        };

                    if actual_line != expected_line {
                        return Ok(Some(format!(
                            "expected command {expected_line:?}, \
                             got {actual_line:?}",
                        )));
                    }
                },

                SessionStep::Response(code, message) => {
                    let line = format!(
                        "{}{}{message}\r\n",
                        code as u32,
                        if matches!(next_step, SessionStep::Response(..)) {
                            "-"
                        } else {
                            " "
                        },
                    );
                    cxn.write_all(line.as_bytes()).await?;
                    cxn.flush().await?;
                },

                SessionStep::RawResponseData(s) => {
                    cxn.write_all(s.as_bytes()).await?;
                    cxn.flush().await?;
                },

                SessionStep::InfiniteResponse => {
                    while cxn.write_all(b"250 ").await.is_ok() {}
                },

                SessionStep::StartTls => {
                    if let Err(e) =
                        cxn.ssl_accept(&self_signed_acceptor()).await
                    {
                        return Ok(Some(format!(
                            "TLS handshake failed unexpectedly: {e}",
                        )));
                    }
                },

                SessionStep::DotStuffedData => {
                    let mut received = Vec::<u8>::new();
                    loop {
                        let line =
                            match read_line(&mut cxn, &mut buf, &mut buf_len)
                                .await?
                            {
                                Ok(line) => line,
                                Err(err) => return Ok(Some(err)),
                            };

                        if "." == line {
                            break;
                        }

                        received.extend_from_slice(
                            line.strip_prefix('.').unwrap_or(&line).as_bytes(),
                        );
                        received.extend_from_slice(b"\r\n");
                    }

                    if received != parms.message_data {
                        return Ok(Some(format!(
                            "expected message {:?}, but got {:?}",
                            String::from_utf8_lossy(&parms.message_data),
                            String::from_utf8_lossy(&received),
                        )));
                    }
                },
            }
        }

        // Ensure the client actually hangs up and isn't trying to talk to us
        // more or waiting for us to say something.
        let mut more = [0u8];
        match tokio::time::timeout(Duration::from_secs(5), cxn.read(&mut more))
            .await
        {
            Err(_timeout) => {
                return Ok(Some("client never hung up".to_owned()))
            },
            Ok(Err(e)) => match e.kind() {
                io::ErrorKind::UnexpectedEof
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::ConnectionReset => {},
                _ => return Err(e),
            },
            Ok(Ok(0)) => {},
            Ok(Ok(_)) => return Ok(Some("client wrote more data".to_owned())),
        }

        Ok(None)
    }

    /// Runs a session against a server that refuses with `code`, either in
    /// its greeting or in reply to EHLO.
    pub(in crate::smtp::outbound) fn refused_session(
        code: PrimaryCode,
        at_ehlo: bool,
    ) -> Result<Results, Error> {
        if at_ehlo {
            run_session(
                &SessionParms::default(),
                &[
                    R(pc::Ok, "Greeting"),
                    C("EHLO mx.earth.com"),
                    R(code, "Refused"),
                ],
            )
        } else {
            run_session(&SessionParms::default(), &[R(code, "Refused")])
        }
    }

    fn try_next_server(parms: &SessionParms, steps: &[SessionStep]) {
        assert_eq!(
            Error::TryNextServer,
            run_session(parms, steps).unwrap_err()
        );
    }

    fn total_failure(parms: &SessionParms, steps: &[SessionStep]) {
        assert_eq!(Error::TotalFailure, run_session(parms, steps).unwrap_err());
    }

    #[test]
    fn minimal_success() {
        let results = run_session(
            &SessionParms::default(),
            &[
                R(pc::Ok, "Greeting"),
                C("EHLO mx.earth.com"),
                R(pc::Ok, "No extensions supported"),
                C("MAIL FROM:<zim@earth.com>"),
                R(pc::Ok, "OK"),
                C("RCPT TO:<tallest@irk.com>"),
                R(pc::Ok, "OK"),
                C("DATA"),
                R(pc::StartMailInput, "OK"),
                DotStuffedData,
                R(pc::Ok, "OK"),
                C("QUIT"),
                R(pc::ServiceClosing, "Bye"),
            ],
        )
        .unwrap();
        assert!(results.tls_version.is_none());
        assert!(results.peer_certificate.is_none());
    }

    #[test]
    fn null_sender_and_dot_stuffing() {
        run_session(
            &SessionParms {
                mail_from: "",
                message_data: b"Subject: x\r\n\r\n.hidden\r\n..\r\n".to_vec(),
                ..SessionParms::default()
            },
            &[
                R(pc::Ok, "Greeting"),
                C("EHLO mx.earth.com"),
                R(pc::Ok, "Ok"),
                C("MAIL FROM:<>"),
                R(pc::Ok, "OK"),
                C("RCPT TO:<tallest@irk.com>"),
                R(pc::Ok, "OK"),
                C("DATA"),
                R(pc::StartMailInput, "OK"),
                DotStuffedData,
                R(pc::Ok, "OK"),
                C("QUIT"),
                R(pc::ServiceClosing, "Bye"),
            ],
        )
        .unwrap();
    }

    #[test]
    fn helo_fallback() {
        run_session(
            &SessionParms::default(),
            &[
                R(pc::Ok, "How do you do?"),
                C("EHLO mx.earth.com"),
                R(
                    pc::CommandSyntaxError,
                    "Gee willikers, I don't know what EHLO means",
                ),
                C("HELO mx.earth.com"),
                R(pc::Ok, "OK"),
                C("MAIL FROM:<zim@earth.com>"),
                R(pc::Ok, "OK"),
                C("RCPT TO:<tallest@irk.com>"),
                R(pc::Ok, "OK"),
                C("DATA"),
                R(pc::StartMailInput, "OK"),
                DotStuffedData,
                R(pc::Ok, "OK"),
                C("QUIT"),
                R(pc::ServiceClosing, "Bye"),
            ],
        )
        .unwrap();
    }

    #[test]
    fn opportunistic_starttls() {
        let results = run_session(
            &SessionParms::default(),
            &[
                R(pc::Ok, "Greeting"),
                C("EHLO mx.earth.com"),
                R(pc::Ok, "Ok"),
                R(pc::Ok, "StartTLS"),
                C("STARTTLS"),
                R(pc::ServiceReady, "Go ahead"),
                StartTls,
                C("EHLO mx.earth.com"),
                R(pc::Ok, "Ok"),
                C("MAIL FROM:<zim@earth.com>"),
                R(pc::Ok, "OK"),
                C("RCPT TO:<tallest@irk.com>"),
                R(pc::Ok, "OK"),
                C("DATA"),
                R(pc::StartMailInput, "OK"),
                DotStuffedData,
                R(pc::Ok, "OK"),
                C("QUIT"),
                R(pc::ServiceClosing, "Bye"),
            ],
        )
        .unwrap();

        assert!(results.tls_version.is_some());
        // Self-signed, so not trusted, but delivery went ahead anyway
        assert!(!results.valid_certificate);
        assert!(results.peer_certificate.is_some());
    }

    #[test]
    fn starttls_rejected() {
        let steps = |code| {
            [
                R(pc::Ok, "Greeting"),
                C("EHLO mx.earth.com"),
                R(pc::Ok, "Ok"),
                R(pc::Ok, "STARTTLS"),
                C("STARTTLS"),
                R(code, "No TLS for you!"),
            ]
        };
        try_next_server(
            &SessionParms::default(),
            &steps(pc::ActionNotTakenTemporary),
        );
        total_failure(&SessionParms::default(), &steps(pc::TransactionFailed));
    }

    #[test]
    fn greeting_reject() {
        total_failure(
            &SessionParms::default(),
            &[R(pc::TransactionFailed, "go away forever")],
        );
        total_failure(
            &SessionParms::default(),
            &[R(pc::ActionNotTakenPermanent, "No SMTP here")],
        );
        try_next_server(
            &SessionParms::default(),
            &[R(pc::ServiceNotAvailableClosing, "Busy")],
        );
    }

    #[test]
    fn hello_reject() {
        total_failure(
            &SessionParms::default(),
            &[
                R(pc::Ok, "Greeting"),
                C("EHLO mx.earth.com"),
                R(pc::TransactionFailed, "Not talking to you"),
            ],
        );
        total_failure(
            &SessionParms::default(),
            &[
                R(pc::Ok, "Greeting"),
                C("EHLO mx.earth.com"),
                R(pc::CommandSyntaxError, "What?"),
                C("HELO mx.earth.com"),
                R(pc::ActionNotTakenPermanent, "Still no"),
            ],
        );
        try_next_server(
            &SessionParms::default(),
            &[
                R(pc::Ok, "Greeting"),
                C("EHLO mx.earth.com"),
                R(pc::ServiceNotAvailableClosing, "Later"),
            ],
        );
    }

    #[test]
    fn mail_reject_permanent() {
        total_failure(
            &SessionParms::default(),
            &[
                R(pc::Ok, "Greeting"),
                C("EHLO mx.earth.com"),
                R(pc::Ok, "Ok"),
                C("MAIL FROM:<zim@earth.com>"),
                R(pc::ActionNotTakenPermanent, "Not welcome here"),
            ],
        );
    }

    #[test]
    fn mail_reject_temporary() {
        try_next_server(
            &SessionParms::default(),
            &[
                R(pc::Ok, "Greeting"),
                C("EHLO mx.earth.com"),
                R(pc::Ok, "Ok"),
                C("MAIL FROM:<zim@earth.com>"),
                R(pc::ActionNotTakenTemporary, "Server error"),
            ],
        );
    }

    #[test]
    fn recipient_rejected() {
        let steps = |code| {
            [
                R(pc::Ok, "Greeting"),
                C("EHLO mx.earth.com"),
                R(pc::Ok, "Ok"),
                C("MAIL FROM:<zim@earth.com>"),
                R(pc::Ok, "Ok"),
                C("RCPT TO:<tallest@irk.com>"),
                R(code, "Nope"),
            ]
        };
        try_next_server(&SessionParms::default(), &steps(pc::ActionAborted));
        total_failure(&SessionParms::default(), &steps(pc::UserNotLocal));
    }

    #[test]
    fn post_data_failures() {
        let steps = |code| {
            [
                R(pc::Ok, "Greeting"),
                C("EHLO mx.earth.com"),
                R(pc::Ok, "Ok"),
                C("MAIL FROM:<zim@earth.com>"),
                R(pc::Ok, "Ok"),
                C("RCPT TO:<tallest@irk.com>"),
                R(pc::Ok, "Ok"),
                C("DATA"),
                R(pc::StartMailInput, "Ok"),
                DotStuffedData,
                R(code, "Hmm"),
            ]
        };
        try_next_server(
            &SessionParms::default(),
            &steps(pc::ActionNotTakenTemporary),
        );
        total_failure(
            &SessionParms::default(),
            &steps(pc::ActionNotTakenPermanent),
        );
    }

    #[test]
    fn size_extension() {
        run_session(
            &SessionParms::default(),
            &[
                R(pc::Ok, "Greeting"),
                C("EHLO mx.earth.com"),
                R(pc::Ok, "Ok"),
                R(pc::Ok, "SiZe 26"),
                C("MAIL FROM:<zim@earth.com> SIZE=26"),
                R(pc::Ok, "Ok"),
                C("RCPT TO:<tallest@irk.com>"),
                R(pc::Ok, "Ok"),
                C("DATA"),
                R(pc::StartMailInput, "Ok"),
                DotStuffedData,
                R(pc::Ok, "Ok"),
                C("QUIT"),
                R(pc::Ok, "Bye"),
            ],
        )
        .unwrap();

        total_failure(
            &SessionParms::default(),
            &[
                R(pc::Ok, "Greeting"),
                C("EHLO mx.earth.com"),
                R(pc::Ok, "Ok"),
                R(pc::Ok, "SiZe 13"),
            ],
        );
    }

    #[test]
    fn eight_bit_body_declared() {
        run_session(
            &SessionParms {
                message_data: "Subject: café\r\n\r\nhé\r\n"
                    .as_bytes()
                    .to_vec(),
                ..SessionParms::default()
            },
            &[
                R(pc::Ok, "Greeting"),
                C("EHLO mx.earth.com"),
                R(pc::Ok, "Ok"),
                R(pc::Ok, "8BITMIME"),
                C("MAIL FROM:<zim@earth.com> BODY=8BITMIME"),
                R(pc::Ok, "Ok"),
                C("RCPT TO:<tallest@irk.com>"),
                R(pc::Ok, "Ok"),
                C("DATA"),
                R(pc::StartMailInput, "Ok"),
                DotStuffedData,
                R(pc::Ok, "Ok"),
                C("QUIT"),
                R(pc::Ok, "Bye"),
            ],
        )
        .unwrap();
    }

    #[test]
    fn bad_status_line() {
        try_next_server(
            &SessionParms::default(),
            &[RawResponseData("HTTP/1.1 400 Bad Request\r\n")],
        );
    }

    #[test]
    fn overlong_response_line() {
        try_next_server(
            &SessionParms::default(),
            &[SessionStep::InfiniteResponse],
        );
    }
}
