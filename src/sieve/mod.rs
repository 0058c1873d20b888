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

//! Per-user message filtering with a subset of Sieve (RFC 5228).
//!
//! `run` and `reply` are what ingestion calls; `parse` is shared with
//! ManageSieve, which validates scripts on upload.

use log::{info, warn};

use crate::mime::header::Headers;
use crate::smtp::outbound::Submitter;
use crate::store::Store;
use crate::support::log_prefix::LogPrefix;

mod interp;
pub mod parse;
pub mod vacation;

pub use parse::parse;

/// The extensions advertised to ManageSieve clients.
pub const EXTENSIONS: &str = "fileinto vacation";

/// One message as seen by one recipient's filter.
pub struct Delivery<'a> {
    /// The recipient whose script runs.
    pub owner: &'a str,
    pub headers: &'a Headers,
    /// The envelope sender; empty for the null reverse path.
    pub envelope_sender: &'a str,
    /// Whether the content filter judged the message to be spam, which moves
    /// the implicit keep to `Junk`.
    pub is_spam: bool,
}

/// What one recipient's filter decided.
#[derive(Debug, Default)]
pub struct Disposition {
    /// Mailbox names without duplicates; empty means the message is
    /// discarded.
    pub targets: Vec<String>,
    /// The vacation reply the script asked for. It is only sent once the
    /// message has been stored.
    pub vacation: Option<parse::Vacation>,
}

impl Disposition {
    fn keep(mailbox: &str) -> Self {
        Disposition {
            targets: vec![mailbox.to_owned()],
            vacation: None,
        }
    }
}

/// Decide where `delivery` is stored.
///
/// Nothing here can fail: a broken script leaves the message in the inbox.
/// Nothing is sent either; see `reply`.
pub fn run(
    log_prefix: &LogPrefix,
    store: &Store,
    delivery: &Delivery<'_>,
) -> Disposition {
    let implicit_keep = if delivery.is_spam { "Junk" } else { "INBOX" };

    let source = match store.active_script(delivery.owner) {
        Ok(Some(source)) => source,
        Ok(None) => return Disposition::keep(implicit_keep),
        Err(e) => {
            warn!(
                "{log_prefix} Failed to load Sieve script of {}: {e}",
                delivery.owner,
            );
            return Disposition::keep("INBOX");
        },
    };

    let script = match parse(&source) {
        Ok(script) => script,
        Err(e) => {
            warn!(
                "{log_prefix} Sieve script of {} is broken: {e}",
                delivery.owner,
            );
            return Disposition::keep("INBOX");
        },
    };

    let outcome = interp::evaluate(&script, delivery.headers, implicit_keep);
    info!(
        "{log_prefix} Sieve for {}: {}",
        delivery.owner,
        if outcome.targets.is_empty() {
            "discard".to_owned()
        } else {
            outcome.targets.join(", ")
        },
    );

    Disposition {
        targets: outcome.targets,
        vacation: outcome.vacation,
    }
}

/// Queue the vacation reply `disposition` asked for, if any.
///
/// Called after the message is stored (or discarded). Failures are logged
/// and otherwise ignored.
pub fn reply(
    log_prefix: &LogPrefix,
    store: &Store,
    submitter: &Submitter,
    delivery: &Delivery<'_>,
    disposition: &Disposition,
) {
    let Some(ref vacation) = disposition.vacation else {
        return;
    };

    if let Err(e) = vacation::process(
        log_prefix,
        store,
        submitter,
        delivery.owner,
        vacation,
        delivery.headers,
        delivery.envelope_sender,
    ) {
        warn!("{log_prefix} Vacation reply failed: {e}");
    }
}
