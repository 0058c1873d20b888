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

//! Local delivery of accepted messages.

use std::borrow::Cow;
use std::sync::Arc;

use log::{error, info, warn};

use super::super::codes::*;
use super::bridge::SmtpResponse;
use crate::{
    mime::parse::ParsedMessage,
    notify,
    sieve,
    smtp::outbound::Submitter,
    store::{new_id, normalise_email, AuthResults, Message, NewMessage, Store},
    support::{error::Error, log_prefix::LogPrefix},
};

#[derive(Debug, Clone)]
pub struct Recipient {
    /// The address of the local user.
    pub normalised: String,
    /// The address as the client wrote it.
    pub smtp: String,
}

impl Recipient {
    /// Normalise `smtp` and validate that it names an existing user in a
    /// domain this server is responsible for.
    ///
    /// On failure, returns the appropriate SMTP response.
    pub fn normalise_and_validate(
        store: &Store,
        primary_domain: &str,
        smtp: &str,
    ) -> Result<Self, SmtpResponse<'static>> {
        let normalised = normalise_email(smtp);
        let Some((local, domain)) = normalised.rsplit_once('@') else {
            return Err(SmtpResponse(
                pc::ActionNotTakenPermanent,
                Some((cc::PermFail, sc::BadDestinationMailboxAddressSyntax)),
                // The "no such user - " prefix has significance with some
                // agents according to RFC 5321
                Cow::Borrowed(
                    "no such user - specifying the domain is mandatory",
                ),
            ));
        };

        if local.is_empty() || domain.is_empty() {
            return Err(SmtpResponse(
                pc::ActionNotTakenPermanent,
                Some((cc::PermFail, sc::BadDestinationMailboxAddressSyntax)),
                Cow::Owned(format!("no such user - {smtp}")),
            ));
        }

        let local_domain = domain.eq_ignore_ascii_case(primary_domain)
            || store.is_local_domain(domain).map_err(storage_response)?;
        if !local_domain {
            return Err(SmtpResponse(
                pc::ActionNotTakenPermanent,
                Some((cc::PermFail, sc::BadDestinationSystemAddress)),
                Cow::Borrowed("Relay not permitted"),
            ));
        }

        if !store.user_exists(&normalised).map_err(storage_response)? {
            return Err(SmtpResponse(
                pc::ActionNotTakenPermanent,
                Some((cc::PermFail, sc::BadDestinationMailboxAddress)),
                Cow::Owned(format!("no such user - {smtp}")),
            ));
        }

        Ok(Recipient {
            normalised,
            smtp: smtp.to_owned(),
        })
    }
}

/// What ingestion needs besides the message itself.
#[derive(Clone)]
pub struct Ingester {
    pub store: Arc<Store>,
    /// Used to send vacation replies. Without it, vacation actions are
    /// ignored.
    pub submitter: Option<Submitter>,
    pub hub: Arc<notify::Hub>,
}

/// One message, as it is to be delivered to one recipient.
pub struct Incoming<'a> {
    pub recipient: &'a Recipient,
    /// The envelope sender; empty for the null reverse path.
    pub envelope_sender: &'a str,
    /// Header lines to prepend to `raw` in the stored copy.
    pub prefix: &'a str,
    pub raw: &'a [u8],
    pub parsed: &'a ParsedMessage,
    pub is_spam: bool,
    pub auth: AuthResults,
}

impl Ingester {
    /// Run the recipient's filter over `incoming` and store it in every
    /// mailbox the filter chose.
    ///
    /// The body is written once and shared by all rows. Either every row is
    /// committed or none is; in the latter case the body is removed again.
    /// A discarded message writes nothing and returns an empty list.
    ///
    /// A vacation reply is only queued after the rows are committed, or
    /// right away for a discarded message.
    pub fn ingest(
        &self,
        log_prefix: &LogPrefix,
        incoming: &Incoming<'_>,
    ) -> Result<Vec<Message>, Error> {
        let owner = &incoming.recipient.normalised;
        let delivery = sieve::Delivery {
            owner,
            headers: &incoming.parsed.headers,
            envelope_sender: incoming.envelope_sender,
            is_spam: incoming.is_spam,
        };
        let mut disposition = sieve::run(log_prefix, &self.store, &delivery);

        if disposition.targets.is_empty() {
            info!("{log_prefix} Message for {owner} discarded by filter");
            self.reply(log_prefix, &delivery, &disposition);
            return Ok(Vec::new());
        }

        let targets = self.prepare_mailboxes(
            log_prefix,
            owner,
            std::mem::take(&mut disposition.targets),
        )?;

        let mut data =
            Vec::with_capacity(incoming.prefix.len() + incoming.raw.len());
        data.extend_from_slice(incoming.prefix.as_bytes());
        data.extend_from_slice(incoming.raw);

        let blob_id = new_id();
        let body_path = self.store.blobs().write_blob(&blob_id, &data)?;

        let rows = targets
            .iter()
            .enumerate()
            .map(|(ix, mailbox)| NewMessage {
                id: if 0 == ix { blob_id.clone() } else { new_id() },
                message_id: incoming.parsed.message_id().to_owned(),
                sender: incoming.envelope_sender.to_owned(),
                recipient: owner.clone(),
                subject: incoming.parsed.subject().to_owned(),
                snippet: incoming.parsed.snippet.clone(),
                body_path: body_path.clone(),
                size: data.len() as u64,
                mailbox: mailbox.clone(),
                flags: Vec::new(),
                auth: incoming.auth,
            })
            .collect::<Vec<_>>();

        let saved = match self
            .store
            .save_messages(&rows, &incoming.parsed.plaintext)
        {
            Ok(saved) => saved,
            Err(e) => {
                if let Err(e2) = self.store.blobs().delete_blob(&body_path) {
                    error!(
                        "{log_prefix} Failed to remove orphaned blob \
                         {body_path}: {e2}",
                    );
                }
                return Err(e);
            },
        };

        for message in &saved {
            info!(
                "{log_prefix} Delivered {} to {owner} in {} as UID {}",
                message.id, message.mailbox, message.uid,
            );
            self.hub.publish(
                owner,
                notify::Event {
                    mailbox: message.mailbox.clone(),
                    uid: message.uid,
                },
            );
        }

        self.reply(log_prefix, &delivery, &disposition);
        Ok(saved)
    }

    fn reply(
        &self,
        log_prefix: &LogPrefix,
        delivery: &sieve::Delivery<'_>,
        disposition: &sieve::Disposition,
    ) {
        if let Some(ref submitter) = self.submitter {
            sieve::reply(
                log_prefix,
                &self.store,
                submitter,
                delivery,
                disposition,
            );
        }
    }

    /// Create any missing target mailboxes. A target whose name is not
    /// acceptable is replaced by `INBOX`.
    fn prepare_mailboxes(
        &self,
        log_prefix: &LogPrefix,
        owner: &str,
        targets: Vec<String>,
    ) -> Result<Vec<String>, Error> {
        let mut prepared = Vec::<String>::with_capacity(targets.len());
        for target in targets {
            let target = match self.store.ensure_mailbox(owner, &target) {
                Ok(()) => target,
                Err(Error::ValidationFailed(e)) => {
                    warn!(
                        "{log_prefix} Filter chose unusable mailbox \
                         {target:?} ({e}); using INBOX",
                    );
                    "INBOX".to_owned()
                },
                Err(e) => return Err(e),
            };

            if !prepared.contains(&target) {
                prepared.push(target);
            }
        }

        Ok(prepared)
    }
}

/// The response for a store failure at any point of the transaction.
pub fn storage_response(e: Error) -> SmtpResponse<'static> {
    error!("Storage failure during SMTP transaction: {e}");
    SmtpResponse(
        pc::ActionAborted,
        Some((cc::TempFail, sc::OtherMailSystem)),
        Cow::Borrowed("Local storage error; try again later"),
    )
}
