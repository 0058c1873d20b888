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

//! The service behind the inbound SMTP port: decides which recipients and
//! messages are accepted and hands accepted messages to local delivery.

use std::borrow::Cow;
use std::cell::RefCell;
use std::fmt::Write as _;
use std::net::IpAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::prelude::*;
use log::{error, info, warn};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use super::super::{auth, codes::*};
use super::{bridge::*, delivery::*};
use crate::{
    antiabuse::{dnsbl, greylist::Greylist, ratelimit::RateLimiter, spam},
    mime::parse::parse_message,
    store::UnixTimestamp,
    support::{
        async_io::SessionIo,
        dns,
        error::Error,
        log_prefix::LogPrefix,
        metrics::{self, Counter},
        system_config::SystemConfig,
    },
};

/// How long validation (SPF, DKIM, DMARC, DNSBL) may wait on DNS.
const DNS_DEADLINE: Duration = Duration::from_secs(20);

/// Everything shared by all inbound SMTP sessions.
pub struct SmtpInContext {
    pub config: Arc<SystemConfig>,
    pub ingester: Ingester,
    pub rate_limiter: Arc<RateLimiter>,
    /// Absent when greylisting is disabled.
    pub greylist: Option<Greylist>,
    /// `None` makes every uncached lookup fail, which tests rely on.
    pub dns_resolver: Option<Rc<dns::Resolver>>,
    pub local_host_name: String,
}

pub async fn serve_smtpin(
    io: SessionIo,
    context: Rc<SmtpInContext>,
    dns_cache: Rc<RefCell<dns::Cache>>,
    log_prefix: LogPrefix,
    ssl_acceptor: Option<openssl::ssl::SslAcceptor>,
    peer_ip: IpAddr,
) -> Result<(), Error> {
    metrics::incr(Counter::SmtpConnections);
    let refuse =
        check_connection(&log_prefix, &context, &dns_cache, peer_ip).await;
    let tls = io.ssl_string();
    let (request_tx, request_rx) = mpsc::channel(1);
    let server_service = super::server::Service {
        max_size: context.config.smtp.max_size,
        refuse,
        send_request: request_tx,
    };

    let mut service = SmtpinService {
        log_prefix: log_prefix.clone(),
        context: Rc::clone(&context),
        request_in: request_rx,
        dns_cache,
        peer_ip,
        tls,
        helo_host: String::new(),
        extended: false,
        return_path: String::new(),
    };

    let result = tokio::join![
        super::server::run(
            io,
            log_prefix,
            ssl_acceptor,
            server_service,
            context.local_host_name.clone(),
        ),
        service.run(),
    ]
    .0;
    if result.is_err() {
        metrics::incr(Counter::SmtpErrors);
    }
    result
}

/// Decide whether the connection is refused outright.
async fn check_connection(
    log_prefix: &LogPrefix,
    context: &SmtpInContext,
    dns_cache: &Rc<RefCell<dns::Cache>>,
    peer_ip: IpAddr,
) -> Option<SmtpResponse<'static>> {
    if !context.rate_limiter.allow(peer_ip, Instant::now()) {
        warn!("{log_prefix} Connection rate limit exceeded");
        return Some(SmtpResponse(
            pc::ServiceNotAvailableClosing,
            Some((cc::TempFail, sc::OtherSecurity)),
            Cow::Borrowed("Too many connections; try again later"),
        ));
    }

    let listed = dnsbl::check(
        dns_cache,
        context.dns_resolver.as_ref(),
        peer_ip,
        &context.config.dnsbl.zones,
        tokio::time::Instant::now() + DNS_DEADLINE,
    )
    .await;
    if let Some(zone) = listed {
        warn!("{log_prefix} {peer_ip} is listed by {zone}");
        return Some(SmtpResponse(
            pc::ServiceNotAvailableClosing,
            Some((cc::TempFail, sc::DeliveryNotAuthorised)),
            Cow::Owned(format!("{peer_ip} is listed by {zone}")),
        ));
    }

    None
}

struct SmtpinService {
    log_prefix: LogPrefix,
    context: Rc<SmtpInContext>,
    request_in: mpsc::Receiver<Request>,
    dns_cache: Rc<RefCell<dns::Cache>>,

    peer_ip: IpAddr,
    tls: Option<String>,
    helo_host: String,
    /// Whether the client greeted with EHLO.
    extended: bool,
    return_path: String,
}

impl SmtpinService {
    async fn run(&mut self) {
        loop {
            let Some(request) = self.request_in.recv().await else {
                return;
            };

            match request.payload {
                RequestPayload::Helo(helo) => {
                    self.helo_host = helo.host;
                    self.extended = helo.extended;
                    self.tls = helo.tls;
                    let _ = request.respond.send(Ok(()));
                },

                RequestPayload::Reset => {
                    self.return_path.clear();
                    let _ = request.respond.send(Ok(()));
                },

                RequestPayload::Recipient(_) | RequestPayload::Data(_) => {
                    let _ = request
                        .respond
                        .send(Err(SmtpResponse::out_of_sequence()));
                },

                RequestPayload::Mail(mail_request) => {
                    let result = self.req_mail(mail_request);
                    let ok = result.is_ok();
                    let _ = request.respond.send(result);
                    if ok {
                        self.handle_mail_transaction().await;
                    } else {
                        warn!(
                            "{} Rejected MAIL FROM due to bad return path",
                            self.log_prefix,
                        );
                    }

                    self.return_path.clear();
                },
            }
        }
    }

    fn req_mail(
        &mut self,
        req: MailRequest,
    ) -> Verdict {
        if !req.from.is_empty() && !req.from.contains('@') {
            return Err(SmtpResponse(
                pc::ActionNotTakenPermanent,
                Some((cc::PermFail, sc::BadSenderMailboxAddressSyntax)),
                Cow::Borrowed("Return path must be an email address"),
            ));
        }

        self.return_path = req.from;
        Ok(())
    }

    async fn handle_mail_transaction(&mut self) {
        let mut recipients = Vec::<Recipient>::new();

        let data = loop {
            let Some(request) = self.request_in.recv().await else {
                return;
            };

            match request.payload {
                RequestPayload::Reset => {
                    let _ = request.respond.send(Ok(()));
                    return;
                },

                RequestPayload::Recipient(recipient) => {
                    if recipients.len()
                        >= self.context.config.smtp.max_recipients
                    {
                        let _ = request.respond.send(Err(SmtpResponse(
                            pc::InsufficientStorage,
                            Some((cc::TempFail, sc::TooManyRecipients)),
                            Cow::Borrowed("Too many recipients"),
                        )));
                        continue;
                    }

                    let result = self.accept_recipient(recipient).map(|r| {
                        recipients.push(r);
                    });
                    let _ = request.respond.send(result);
                },

                RequestPayload::Data(data) => {
                    let _ = request.respond.send(Ok(()));
                    break data;
                },

                RequestPayload::Helo(_) | RequestPayload::Mail(_) => {
                    let _ = request
                        .respond
                        .send(Err(SmtpResponse::out_of_sequence()));
                },
            }
        };

        let data_result = self.consume_data(data.data).await;
        // If the completion channel is closed, the server aborted the
        // transfer and nothing may be delivered.
        let Ok(response_tx) = data.completion.await else {
            return;
        };

        let response = match data_result {
            Ok(message) => self.deliver_message(&recipients, message).await,
            Err(response) => Err(response),
        };
        metrics::incr(if response.is_ok() {
            Counter::MessagesReceived
        } else {
            Counter::MessagesRejected
        });
        let _ = response_tx.send(response);
    }

    /// Run the per-recipient gates: address validation, then the rate limit,
    /// then the greylist.
    fn accept_recipient(
        &self,
        req: RecipientRequest,
    ) -> Result<Recipient, SmtpResponse<'static>> {
        let recipient = Recipient::normalise_and_validate(
            &self.context.ingester.store,
            &self.context.config.identity.domain,
            &req.to,
        )?;

        if !self.context.rate_limiter.allow(self.peer_ip, Instant::now()) {
            warn!("{} Recipient rate limit exceeded", self.log_prefix);
            return Err(SmtpResponse(
                pc::ActionNotTakenTemporary,
                Some((cc::TempFail, sc::OtherSecurity)),
                Cow::Borrowed("Rate limit exceeded; try again later"),
            ));
        }

        if let Some(ref greylist) = self.context.greylist {
            greylist
                .check(
                    &self.log_prefix,
                    self.peer_ip,
                    &self.return_path,
                    &recipient.normalised,
                    UnixTimestamp::now(),
                )
                .map_err(|_| {
                    metrics::incr(Counter::GreylistBlocked);
                    SmtpResponse(
                        pc::ActionAborted,
                        Some((cc::TempFail, sc::DeliveryNotAuthorised)),
                        Cow::Borrowed("Greylisted; try again later"),
                    )
                })?;
        }

        Ok(recipient)
    }

    /// Buffer the message, reading at most one byte past the size limit so
    /// that an oversized message can be told apart.
    async fn consume_data(
        &mut self,
        data: tokio::io::DuplexStream,
    ) -> Result<Vec<u8>, SmtpResponse<'static>> {
        let max_size = self.context.config.smtp.max_size;
        let mut buffer = Vec::new();
        if let Err(e) = data.take(max_size + 1).read_to_end(&mut buffer).await
        {
            error!("{} Buffering message failed: {e}", self.log_prefix);
            return Err(SmtpResponse(
                pc::TransactionFailed,
                Some((cc::TempFail, sc::OtherMailSystem)),
                Cow::Borrowed("Internal I/O error"),
            ));
        }

        if buffer.len() as u64 > max_size {
            return Err(SmtpResponse(
                pc::ExceededStorageAllocation,
                Some((cc::PermFail, sc::MessageLengthExceedsLimit)),
                Cow::Owned(format!("Maximum message size is {max_size} bytes")),
            ));
        }

        Ok(buffer)
    }

    async fn deliver_message(
        &mut self,
        recipients: &[Recipient],
        message: Vec<u8>,
    ) -> Verdict {
        let parsed = parse_message(&message).map_err(|e| {
            info!("{} Rejecting malformed message: {e}", self.log_prefix);
            SmtpResponse(
                pc::ActionNotTakenPermanent,
                Some((cc::PermFail, sc::OtherMediaError)),
                Cow::Owned(format!("Malformed message: {e}")),
            )
        })?;

        let verdict = auth::authenticate(
            &self.log_prefix,
            &self.dns_cache,
            self.context.dns_resolver.as_ref(),
            &auth::Envelope {
                ip: self.peer_ip,
                helo: &self.helo_host,
                mail_from: &self.return_path,
            },
            &message,
            tokio::time::Instant::now() + DNS_DEADLINE,
        )
        .await;
        if verdict.rejects() {
            warn!("{} Message rejected by DMARC policy", self.log_prefix);
            return Err(SmtpResponse(
                pc::ActionNotTakenPermanent,
                Some((cc::PermFail, sc::DeliveryNotAuthorised)),
                Cow::Borrowed("Message rejected by DMARC policy"),
            ));
        }

        let spam = spam::check(
            &self.log_prefix,
            &self.context.config.spam,
            &self.context.ingester.store,
            &parsed.plaintext,
        );
        info!(
            "{} Spam score {:.2} ({:?})",
            self.log_prefix, spam.score, spam.action,
        );
        if spam.is_spam() {
            metrics::incr(Counter::SpamDetected);
        }
        if spam::Action::Reject == spam.action {
            return Err(SmtpResponse(
                pc::ActionNotTakenPermanent,
                Some((cc::PermFail, sc::DeliveryNotAuthorised)),
                Cow::Borrowed("Message rejected as spam"),
            ));
        }

        let smtp_date = Utc::now().to_rfc2822();
        let mut message_prefix = String::new();
        let mut first_error = None::<SmtpResponse<'static>>;
        let mut has_success = false;

        // Partial failures cannot be reported to the client. Success is
        // returned if any recipient succeeds; otherwise the first failure.
        for recipient in recipients {
            message_prefix.clear();
            format_received_header(
                &mut message_prefix,
                &self.context.local_host_name,
                self.extended,
                self.tls.as_deref(),
                &self.helo_host,
                self.peer_ip,
                recipient,
                &smtp_date,
            );
            message_prefix
                .push_str(&verdict.header(&self.context.local_host_name));
            message_prefix.push_str(&spam.headers());

            let result = self.context.ingester.ingest(
                &self.log_prefix,
                &Incoming {
                    recipient,
                    envelope_sender: &self.return_path,
                    prefix: &message_prefix,
                    raw: &message,
                    parsed: &parsed,
                    is_spam: spam.is_spam(),
                    auth: verdict.results,
                },
            );

            match result {
                Ok(_) => has_success = true,
                Err(e) => {
                    error!(
                        "{} Delivery to <{}> failed: {e}",
                        self.log_prefix, recipient.normalised,
                    );
                    if first_error.is_none() {
                        first_error = Some(storage_response(e));
                    }
                },
            }
        }

        match first_error {
            Some(response) if !has_success => Err(response),
            _ => Ok(()),
        }
    }
}

fn format_received_header(
    s: &mut String,
    local_host_name: &str,
    extended: bool,
    tls: Option<&str>,
    helo_host: &str,
    peer_ip: IpAddr,
    recipient: &Recipient,
    smtp_date: &str,
) {
    // RFC 5321 § 4.4
    let _ = write!(s, "Received: from ");
    if helo_host.is_empty() {
        let _ = write!(s, "{peer_ip}");
    } else {
        let _ = write!(
            s,
            "{} ({})",
            make_header_comment_safe(helo_host),
            peer_ip
        );
    }
    let _ = write!(
        s,
        "\r\n\tby {local_host_name} ({svc} {version})\r\n\
         \tvia TCP with {protocol}\r\n\
         \tfor <{recipient}>;\r\n\
         \t{smtp_date}\r\n",
        svc = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        protocol = match (extended, tls) {
            (true, Some(tls)) => format!("ESMTPS ({tls})"),
            (false, Some(tls)) => format!("SMTPS ({tls})"),
            (true, None) => "ESMTP".to_owned(),
            (false, None) => "SMTP".to_owned(),
        },
        recipient = recipient.normalised,
    );
}

fn make_header_comment_safe(s: &str) -> Cow<'_, str> {
    const MAX_LEN: usize = 200;

    fn acceptable_char(c: char) -> bool {
        matches!(
            c, 'A'..='Z' | 'a'..='z' | '0'..='9' | '-' | '.' | '_' | '[' | ']'
            | ':')
    }

    if s.len() <= MAX_LEN && s.chars().all(acceptable_char) {
        Cow::Borrowed(s)
    } else {
        let mut s = s.to_owned();
        s.retain(acceptable_char);
        // Only ASCII remains, so this is a char boundary
        s.truncate(MAX_LEN);
        Cow::Owned(s)
    }
}
