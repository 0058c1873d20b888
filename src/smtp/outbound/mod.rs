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

//! Outbound mail: queue submission, the delivery worker, and the SMTP client.

use std::sync::Arc;

use chrono::prelude::*;
use log::info;

use crate::mime::dkim;
use crate::store::{new_id, OutboundMessage, Store};
use crate::support::error::Error;
use crate::support::metrics::{self, Counter};

pub mod dane;
mod serverseq;
pub mod send;
pub mod transact;
mod transcript;

/// A row whose retry count reaches this value is marked `FAILED`.
pub const MAX_RETRIES: u32 = 10;

/// The delay before the attempt following failed attempt `retry_count`.
pub fn backoff(retry_count: u32) -> chrono::Duration {
    match retry_count {
        0 | 1 => chrono::Duration::minutes(1),
        2 => chrono::Duration::minutes(5),
        3 => chrono::Duration::minutes(15),
        4 => chrono::Duration::hours(1),
        5 => chrono::Duration::hours(6),
        n => {
            let hours = 6i64.saturating_mul(1i64 << (n - 5).min(8));
            chrono::Duration::hours(hours.min(24))
        },
    }
}

/// The single entry point for mail leaving the system.
///
/// Both the API and vacation replies go through here, so every outbound
/// message is signed and spooled the same way.
#[derive(Clone)]
pub struct Submitter {
    pub store: Arc<Store>,
    pub signer: Option<Arc<dkim::Signer>>,
}

impl Submitter {
    /// DKIM-sign `message`, write it under `outbound/` and queue it for
    /// `recipient`.
    ///
    /// If queueing fails, the blob is removed again.
    pub fn submit(
        &self,
        sender: &str,
        recipient: &str,
        message: &[u8],
    ) -> Result<OutboundMessage, Error> {
        let signed;
        let data = match self.signer {
            None => message,
            Some(ref signer) => {
                signed = signer.sign(message, Utc::now()).map_err(|e| {
                    Error::ValidationFailed(format!("DKIM signing: {e}"))
                })?;
                &signed[..]
            },
        };

        let blob_key =
            self.store.blobs().write_outbound_blob(&new_id(), data)?;
        match self.store.enqueue(sender, recipient, &blob_key) {
            Ok(row) => {
                metrics::incr(Counter::OutboundEnqueued);
                info!(
                    "Queued {} from <{sender}> to <{recipient}>",
                    row.id,
                );
                Ok(row)
            },
            Err(e) => {
                let _ = self.store.blobs().delete_blob(&blob_key);
                Err(e)
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::{test_support::*, QueueStatus};

    #[test]
    fn backoff_schedule() {
        let minutes = |n| backoff(n).num_minutes();
        assert_eq!(1, minutes(1));
        assert_eq!(5, minutes(2));
        assert_eq!(15, minutes(3));
        assert_eq!(60, minutes(4));
        assert_eq!(360, minutes(5));
        assert_eq!(720, minutes(6));
        assert_eq!(1440, minutes(7));
        assert_eq!(1440, minutes(9));
        assert_eq!(1440, minutes(u32::MAX));
    }

    #[test]
    fn submit_signs_and_queues() {
        let ts = test_store();
        let submitter = Submitter {
            store: Arc::clone(&ts.store),
            signer: Some(Arc::new(dkim::Signer::new(
                "example.org".to_owned(),
                "default".to_owned(),
                dkim::generate_key().unwrap(),
            ))),
        };

        let row = submitter
            .submit(
                "alice@example.org",
                "bob@remote.example",
                b"From: alice@example.org\r\nSubject: Hi\r\n\r\nHello\r\n",
            )
            .unwrap();
        assert_eq!(QueueStatus::Pending, row.status);
        assert!(row.blob_key.starts_with("outbound/"));

        let stored = ts.blobs().read_blob(&row.blob_key).unwrap();
        assert!(stored.starts_with(b"DKIM-Signature: v=1; a=rsa-sha256;"));
        assert!(stored.ends_with(b"Subject: Hi\r\n\r\nHello\r\n"));
        assert_eq!(1, ts.list_queue().unwrap().len());
    }

    #[test]
    fn submit_without_signer() {
        let ts = test_store();
        let submitter = Submitter {
            store: Arc::clone(&ts.store),
            signer: None,
        };
        let row = submitter
            .submit("", "bob@remote.example", b"Subject: x\r\n\r\ny\r\n")
            .unwrap();
        assert_eq!(
            b"Subject: x\r\n\r\ny\r\n".to_vec(),
            ts.blobs().read_blob(&row.blob_key).unwrap()
        );
    }
}
