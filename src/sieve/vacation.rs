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

//! Automatic replies for the Sieve `vacation` action (RFC 5230).

use chrono::prelude::*;
use log::{info, warn};

use super::parse::Vacation;
use crate::mime::header::{extract_address, Headers};
use crate::smtp::outbound::Submitter;
use crate::store::{new_id, Store, UnixTimestamp};
use crate::support::{error::Error, log_prefix::LogPrefix};

const DEFAULT_DAYS: u64 = 7;

/// Whether a message may be answered at all.
///
/// Mailing lists, bulk mail, other automatic messages and bounces never get
/// a reply.
pub fn should_reply(headers: &Headers, envelope_sender: &str) -> bool {
    if let Some(precedence) = headers.get("Precedence") {
        let precedence = precedence.trim();
        if ["list", "bulk", "junk"]
            .iter()
            .any(|p| p.eq_ignore_ascii_case(precedence))
        {
            return false;
        }
    }

    if headers
        .get("Auto-Submitted")
        .is_some_and(|v| !v.trim().eq_ignore_ascii_case("no"))
    {
        return false;
    }

    if headers.contains("List-Id") {
        return false;
    }

    let local_part = envelope_sender
        .rsplit_once('@')
        .map_or(envelope_sender, |(local, _)| local);
    !(envelope_sender.is_empty()
        || local_part.eq_ignore_ascii_case("mailer-daemon")
        || local_part.eq_ignore_ascii_case("postmaster"))
}

/// The minimum time between two replies to the same sender.
fn interval(vacation: &Vacation) -> chrono::Duration {
    let days = vacation.days.unwrap_or(DEFAULT_DAYS).clamp(1, 365);
    chrono::Duration::days(days as i64)
}

/// Build the reply to a message from `recipient` with `original` headers.
pub fn compose(
    owner: &str,
    vacation: &Vacation,
    original: &Headers,
    recipient: &str,
    now: DateTime<Utc>,
) -> Vec<u8> {
    let from = vacation
        .from
        .as_deref()
        .and_then(extract_address)
        .unwrap_or_else(|| owner.to_owned());
    let domain = from.rsplit_once('@').map_or("localhost", |(_, d)| d);
    let subject = vacation.subject.clone().unwrap_or_else(|| {
        format!("Auto: {}", original.get("Subject").unwrap_or("").trim())
    });

    let mut reply = format!(
        "From: <{from}>\r\n\
         To: <{recipient}>\r\n\
         Subject: {subject}\r\n\
         Date: {date}\r\n\
         Message-ID: <{id}@{domain}>\r\n",
        subject = subject.replace(['\r', '\n'], " "),
        date = now.to_rfc2822(),
        id = new_id(),
    );
    if let Some(message_id) = original.get("Message-ID") {
        let message_id = message_id.trim();
        reply.push_str(&format!(
            "In-Reply-To: {message_id}\r\nReferences: {message_id}\r\n"
        ));
    }
    reply.push_str("Auto-Submitted: auto-replied\r\nMIME-Version: 1.0\r\n");

    if vacation.mime {
        // The reason is a complete MIME entity, headers included.
        reply.push_str(&crlf(&vacation.reason));
    } else {
        reply.push_str(
            "Content-Type: text/plain; charset=utf-8\r\n\
             Content-Transfer-Encoding: 8bit\r\n\r\n",
        );
        reply.push_str(&crlf(&vacation.reason));
        if !reply.ends_with("\r\n") {
            reply.push_str("\r\n");
        }
    }

    reply.into_bytes()
}

fn crlf(s: &str) -> String {
    s.replace("\r\n", "\n").replace('\n', "\r\n")
}

/// Send a vacation reply to `envelope_sender` if nothing suppresses it.
///
/// Returns whether a reply was queued.
pub fn process(
    log_prefix: &LogPrefix,
    store: &Store,
    submitter: &Submitter,
    owner: &str,
    vacation: &Vacation,
    headers: &Headers,
    envelope_sender: &str,
) -> Result<bool, Error> {
    if !should_reply(headers, envelope_sender) {
        info!("{log_prefix} Vacation reply to <{envelope_sender}> suppressed");
        return Ok(false);
    }

    let now = UnixTimestamp::now();
    if let Some(last) = store.vacation_last_sent(owner, envelope_sender)? {
        if now < last + interval(vacation) {
            info!(
                "{log_prefix} Already answered <{envelope_sender}> at {}",
                last.0.to_rfc3339(),
            );
            return Ok(false);
        }
    }

    let reply = compose(owner, vacation, headers, envelope_sender, now.0);
    // Replies use the null reverse path so that they cannot bounce back here.
    let row = submitter.submit("", envelope_sender, &reply)?;
    if let Err(e) = store.record_vacation(owner, envelope_sender, now) {
        warn!("{log_prefix} Failed to record vacation reply: {e}");
    }
    info!(
        "{log_prefix} Vacation reply to <{envelope_sender}> queued as {}",
        row.id,
    );
    Ok(true)
}
