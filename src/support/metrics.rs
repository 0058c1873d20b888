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

//! Process-wide event counters.
//!
//! Counters only ever go up and are lost on restart. They are read through
//! the admin endpoints of the HTTP API, as JSON or in the Prometheus text
//! exposition format.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Counter {
    MessagesReceived,
    MessagesRejected,
    SmtpConnections,
    SmtpErrors,
    ApiRequests,
    ApiErrors,
    StorageWrites,
    StorageReads,
    StorageErrors,
    OutboundEnqueued,
    OutboundSent,
    OutboundTransientFailures,
    OutboundPermanentFailures,
    SpamDetected,
    GreylistBlocked,
}

const COUNTERS: usize = 15;

impl Counter {
    pub const ALL: [Counter; COUNTERS] = [
        Counter::MessagesReceived,
        Counter::MessagesRejected,
        Counter::SmtpConnections,
        Counter::SmtpErrors,
        Counter::ApiRequests,
        Counter::ApiErrors,
        Counter::StorageWrites,
        Counter::StorageReads,
        Counter::StorageErrors,
        Counter::OutboundEnqueued,
        Counter::OutboundSent,
        Counter::OutboundTransientFailures,
        Counter::OutboundPermanentFailures,
        Counter::SpamDetected,
        Counter::GreylistBlocked,
    ];

    /// The name in snapshots. Prometheus names add a prefix and `_total`.
    pub fn name(self) -> &'static str {
        match self {
            Counter::MessagesReceived => "messages_received",
            Counter::MessagesRejected => "messages_rejected",
            Counter::SmtpConnections => "smtp_connections",
            Counter::SmtpErrors => "smtp_errors",
            Counter::ApiRequests => "api_requests",
            Counter::ApiErrors => "api_errors",
            Counter::StorageWrites => "storage_writes",
            Counter::StorageReads => "storage_reads",
            Counter::StorageErrors => "storage_errors",
            Counter::OutboundEnqueued => "outbound_enqueued",
            Counter::OutboundSent => "outbound_sent",
            Counter::OutboundTransientFailures => {
                "outbound_transient_failures"
            },
            Counter::OutboundPermanentFailures => {
                "outbound_permanent_failures"
            },
            Counter::SpamDetected => "spam_detected",
            Counter::GreylistBlocked => "greylist_blocked",
        }
    }

    fn help(self) -> &'static str {
        match self {
            Counter::MessagesReceived => "Incoming messages accepted",
            Counter::MessagesRejected => "Incoming messages refused at DATA",
            Counter::SmtpConnections => "Inbound SMTP connections",
            Counter::SmtpErrors => "Inbound SMTP sessions ending in error",
            Counter::ApiRequests => "HTTP API requests",
            Counter::ApiErrors => "HTTP API requests failing with 5xx",
            Counter::StorageWrites => "Blobs written",
            Counter::StorageReads => "Blobs read",
            Counter::StorageErrors => "Blob operations failing",
            Counter::OutboundEnqueued => "Messages queued for delivery",
            Counter::OutboundSent => "Messages delivered to a remote server",
            Counter::OutboundTransientFailures => {
                "Delivery attempts deferred for retry"
            },
            Counter::OutboundPermanentFailures => "Deliveries given up on",
            Counter::SpamDetected => "Incoming messages classified as spam",
            Counter::GreylistBlocked => "Recipients deferred by the greylist",
        }
    }
}

pub struct Metrics {
    counts: [AtomicU64; COUNTERS],
}

impl Metrics {
    pub const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            counts: [ZERO; COUNTERS],
        }
    }

    pub fn incr(&self, counter: Counter) {
        self.counts[counter as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counts[counter as usize].load(Ordering::Relaxed)
    }

    /// Every counter by name.
    pub fn snapshot(&self) -> BTreeMap<&'static str, u64> {
        Counter::ALL
            .iter()
            .map(|&c| (c.name(), self.get(c)))
            .collect()
    }

    /// Render every counter in the Prometheus text exposition format.
    pub fn prometheus(&self) -> String {
        let mut out = String::new();
        for &counter in &Counter::ALL {
            let name = format!("rookery_{}_total", counter.name());
            let _ = write!(
                out,
                "# HELP {name} {}\n# TYPE {name} counter\n{name} {}\n",
                counter.help(),
                self.get(counter),
            );
        }
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// The counters of this process.
pub static METRICS: Metrics = Metrics::new();

pub fn incr(counter: Counter) {
    METRICS.incr(counter);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn counters_are_independent() {
        let metrics = Metrics::new();
        metrics.incr(Counter::OutboundSent);
        metrics.incr(Counter::OutboundSent);
        metrics.incr(Counter::GreylistBlocked);

        assert_eq!(2, metrics.get(Counter::OutboundSent));
        assert_eq!(1, metrics.get(Counter::GreylistBlocked));
        assert_eq!(0, metrics.get(Counter::MessagesReceived));

        let snapshot = metrics.snapshot();
        assert_eq!(COUNTERS, snapshot.len());
        assert_eq!(Some(&2), snapshot.get("outbound_sent"));
        assert_eq!(Some(&0), snapshot.get("api_errors"));
    }

    #[test]
    fn prometheus_exposition() {
        let metrics = Metrics::new();
        metrics.incr(Counter::SmtpConnections);
        let text = metrics.prometheus();

        assert!(text.contains(
            "# TYPE rookery_smtp_connections_total counter\n\
             rookery_smtp_connections_total 1\n"
        ));
        assert!(text.contains("rookery_spam_detected_total 0\n"));
        assert_eq!(COUNTERS * 3, text.lines().count());
        for (ix, &counter) in Counter::ALL.iter().enumerate() {
            assert_eq!(ix, counter as usize);
        }
    }
}
