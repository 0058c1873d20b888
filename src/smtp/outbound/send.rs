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

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};

use super::{backoff, serverseq, transact::Envelope, MAX_RETRIES};
use crate::{
    store::{OutboundMessage, QueueStatus, Store, UnixTimestamp},
    support::{
        dns,
        error::Error,
        log_prefix::LogPrefix,
        metrics::{self, Counter},
        system_config::DeliveryConfig,
    },
};

pub type MockServerSeq<'a> = &'a dyn Fn(&dns::Name) -> serverseq::Outcome;

/// One member of the delivery worker pool.
///
/// Workers share nothing but the store; `Store::lock_next_ready` is what
/// keeps two of them from delivering the same row.
pub struct Worker {
    pub log_prefix: LogPrefix,
    pub store: Arc<Store>,
    pub dns_resolver: Option<Rc<dns::Resolver>>,
    pub local_host_name: String,
    pub config: DeliveryConfig,
}

/// Where a row goes after an attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Transition {
    status: QueueStatus,
    retry_count: u32,
    next_retry_at: UnixTimestamp,
}

fn transition(
    outcome: serverseq::Outcome,
    retry_count: u32,
    now: UnixTimestamp,
) -> Transition {
    match outcome {
        serverseq::Outcome::Delivered => Transition {
            status: QueueStatus::Sent,
            retry_count,
            next_retry_at: now,
        },
        serverseq::Outcome::Permanent => Transition {
            status: QueueStatus::Failed,
            retry_count,
            next_retry_at: now,
        },
        serverseq::Outcome::Transient => {
            let retry_count = retry_count + 1;
            if retry_count >= MAX_RETRIES {
                Transition {
                    status: QueueStatus::Failed,
                    retry_count,
                    next_retry_at: now,
                }
            } else {
                Transition {
                    status: QueueStatus::Retrying,
                    retry_count,
                    next_retry_at: now + backoff(retry_count),
                }
            }
        },
    }
}

impl Worker {
    /// Poll the queue every `poll_interval_secs` until `shutdown` fires.
    ///
    /// A row being delivered when shutdown arrives goes back to `RETRYING`
    /// with its retry count unchanged.
    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(
            self.config.poll_interval_secs.max(1),
        ));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {},
            }

            // Drain everything that is ready before sleeping again.
            loop {
                let row = match self.store.lock_next_ready(UnixTimestamp::now())
                {
                    Ok(Some(row)) => row,
                    Ok(None) => break,
                    Err(e) => {
                        error!("{} Failed to poll queue: {e}", self.log_prefix);
                        break;
                    },
                };

                tokio::select! {
                    biased;
                    _ = shutdown.changed() => {
                        self.release(&row);
                        return;
                    },
                    r = self.deliver(&row, None) => if let Err(e) = r {
                        error!(
                            "{} Failed to record outcome of {}: {e}",
                            self.log_prefix, row.id,
                        );
                    },
                }
            }
        }
    }

    /// Claim and attempt the next ready row, if there is one.
    ///
    /// Returns whether a row was processed.
    pub async fn process_next(
        &self,
        mock_serverseq: Option<MockServerSeq<'_>>,
    ) -> Result<bool, Error> {
        let Some(row) = self.store.lock_next_ready(UnixTimestamp::now())? else {
            return Ok(false);
        };
        self.deliver(&row, mock_serverseq).await?;
        Ok(true)
    }

    fn release(&self, row: &OutboundMessage) {
        info!(
            "{} Shutting down; {} goes back to the queue",
            self.log_prefix, row.id,
        );
        if let Err(e) = self.store.update_status(
            &row.id,
            QueueStatus::Retrying,
            row.retry_count,
            UnixTimestamp::now(),
            None,
        ) {
            error!("{} Failed to release {}: {e}", self.log_prefix, row.id);
        }
    }

    async fn deliver(
        &self,
        row: &OutboundMessage,
        mock_serverseq: Option<MockServerSeq<'_>>,
    ) -> Result<(), Error> {
        let log_prefix = self.log_prefix.deep_clone();
        log_prefix.set_user(row.id.clone());

        let data = match self.store.blobs().read_blob(&row.blob_key) {
            Ok(data) => data,
            Err(Error::NotFound) => {
                warn!("{log_prefix} Blob {} is gone", row.blob_key);
                return self.fail(row, "blob missing");
            },
            Err(e) => {
                // Treat a broken store like a broken network.
                error!("{log_prefix} Failed to read {}: {e}", row.blob_key);
                return self.finish(
                    &log_prefix,
                    row,
                    serverseq::Outcome::Transient,
                    &e.to_string(),
                );
            },
        };

        let Some(domain) = row
            .recipient
            .rsplit_once('@')
            .and_then(|(_, domain)| dns::parse_name(domain))
        else {
            return self.fail(row, "invalid recipient address");
        };
        let domain = Rc::new(domain);

        let (outcome, transcript) = if let Some(mock) = mock_serverseq {
            (mock(&domain), String::new())
        } else {
            let ctx = serverseq::Context {
                log_prefix: log_prefix.clone(),
                dns_cache: Rc::new(RefCell::new(dns::Cache::default())),
                dns_resolver: self.dns_resolver.clone(),
                local_host_name: self.local_host_name.clone(),
                port: self.config.port,
                attempt_timeout: Duration::from_secs(
                    self.config.attempt_timeout_secs,
                ),
                dane: self.config.dane,
            };
            let results = serverseq::execute(
                &ctx,
                &domain,
                &Envelope {
                    mail_from: &row.sender,
                    recipient: &row.recipient,
                    data: &data,
                },
                None,
            )
            .await;
            (results.outcome, results.transcript.summary().to_owned())
        };

        self.finish(&log_prefix, row, outcome, &transcript)
    }

    fn fail(&self, row: &OutboundMessage, why: &str) -> Result<(), Error> {
        metrics::incr(Counter::OutboundPermanentFailures);
        error!("{} {} failed permanently: {why}", self.log_prefix, row.id);
        self.store.update_status(
            &row.id,
            QueueStatus::Failed,
            row.retry_count,
            UnixTimestamp::now(),
            Some(why),
        )?;
        Ok(())
    }

    fn finish(
        &self,
        log_prefix: &LogPrefix,
        row: &OutboundMessage,
        outcome: serverseq::Outcome,
        transcript: &str,
    ) -> Result<(), Error> {
        let t = transition(outcome, row.retry_count, UnixTimestamp::now());
        match t.status {
            QueueStatus::Sent => {
                metrics::incr(Counter::OutboundSent);
                info!("{log_prefix} Delivered to <{}>", row.recipient)
            },
            QueueStatus::Retrying => {
                metrics::incr(Counter::OutboundTransientFailures);
                info!(
                    "{log_prefix} Delivery to <{}> deferred; attempt {} at {}",
                    row.recipient,
                    t.retry_count + 1,
                    t.next_retry_at.0.to_rfc3339(),
                )
            },
            _ => {
                metrics::incr(Counter::OutboundPermanentFailures);
                warn!(
                    "{log_prefix} Delivery to <{}> failed after {} retries",
                    row.recipient, t.retry_count,
                )
            },
        }

        let last_error = (QueueStatus::Sent != t.status
            && !transcript.is_empty())
        .then_some(transcript);
        self.store.update_status(
            &row.id,
            t.status,
            t.retry_count,
            t.next_retry_at,
            last_error,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::store::test_support::*;

    fn worker(ts: &TestStore) -> Worker {
        Worker {
            log_prefix: LogPrefix::new("delivery".to_owned()),
            store: Arc::clone(&ts.store),
            dns_resolver: None,
            local_host_name: "mx.example.org".to_owned(),
            config: DeliveryConfig {
                workers: 1,
                poll_interval_secs: 1,
                attempt_timeout_secs: 5,
                port: 25,
                dane: crate::support::system_config::DaneMode::Off,
            },
        }
    }

    fn enqueue(ts: &TestStore, recipient: &str) -> OutboundMessage {
        let key = ts
            .blobs()
            .write_outbound_blob(
                &crate::store::new_id(),
                b"From: a@example.org\r\n\r\nhi\r\n",
            )
            .unwrap();
        ts.enqueue("a@example.org", recipient, &key).unwrap()
    }

    #[tokio::main(flavor = "current_thread")]
    async fn process(
        worker: &Worker,
        outcome: serverseq::Outcome,
    ) -> Option<String> {
        let seen = RefCell::new(None);
        let mock = |domain: &dns::Name| {
            *seen.borrow_mut() = Some(domain.to_ascii());
            outcome
        };
        assert!(worker.process_next(Some(&mock)).await.unwrap());
        seen.into_inner()
    }

    #[test]
    fn transition_schedule() {
        let now = UnixTimestamp::now();
        let t = transition(serverseq::Outcome::Transient, 0, now);
        assert_eq!(QueueStatus::Retrying, t.status);
        assert_eq!(1, t.retry_count);
        assert_eq!(now + ChronoDuration::minutes(1), t.next_retry_at);

        let t = transition(serverseq::Outcome::Transient, 8, now);
        assert_eq!(QueueStatus::Retrying, t.status);
        assert_eq!(9, t.retry_count);

        let t = transition(serverseq::Outcome::Transient, 9, now);
        assert_eq!(QueueStatus::Failed, t.status);
        assert_eq!(10, t.retry_count);

        let t = transition(serverseq::Outcome::Permanent, 3, now);
        assert_eq!(QueueStatus::Failed, t.status);
        assert_eq!(3, t.retry_count);

        assert_eq!(
            QueueStatus::Sent,
            transition(serverseq::Outcome::Delivered, 4, now).status
        );
    }

    #[test]
    fn delivered_row_is_sent() {
        let ts = test_store();
        let w = worker(&ts);
        let row = enqueue(&ts, "bob@Remote.Example");

        assert_eq!(
            Some("remote.example.".to_owned()),
            process(&w, serverseq::Outcome::Delivered)
        );
        let row = ts.find_outbound(&row.id).unwrap();
        assert_eq!(QueueStatus::Sent, row.status);
        assert_eq!(None, row.last_error);
    }

    #[test]
    fn transient_failure_is_rescheduled() {
        let ts = test_store();
        let w = worker(&ts);
        let row = enqueue(&ts, "bob@remote.example");

        process(&w, serverseq::Outcome::Transient);
        let row = ts.find_outbound(&row.id).unwrap();
        assert_eq!(QueueStatus::Retrying, row.status);
        assert_eq!(1, row.retry_count);
        assert!(row.next_retry_at > UnixTimestamp::now());

        // Not ready again until the backoff expires
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        assert!(!rt.block_on(w.process_next(None)).unwrap());
    }

    #[test]
    fn permanent_failure_is_final() {
        let ts = test_store();
        let w = worker(&ts);
        let row = enqueue(&ts, "bob@remote.example");

        process(&w, serverseq::Outcome::Permanent);
        let row = ts.find_outbound(&row.id).unwrap();
        assert_eq!(QueueStatus::Failed, row.status);
        assert_eq!(0, row.retry_count);
    }

    #[test]
    fn refused_greeting_or_ehlo_fails_without_retry() {
        use super::super::{serverseq::test::with_backup_exchanger, transact};
        use crate::smtp::codes::pc;

        for at_ehlo in [false, true] {
            let outcome = with_backup_exchanger(
                transact::test::refused_session(pc::TransactionFailed, at_ehlo),
            );
            let t = transition(outcome, 0, UnixTimestamp::now());
            assert_eq!(QueueStatus::Failed, t.status);
            assert_eq!(0, t.retry_count);

            let ts = test_store();
            let w = worker(&ts);
            let row = enqueue(&ts, "bob@remote.example");
            process(&w, outcome);
            let row = ts.find_outbound(&row.id).unwrap();
            assert_eq!(QueueStatus::Failed, row.status);
            assert_eq!(0, row.retry_count);
        }
    }

    #[test]
    fn tenth_transient_failure_is_final() {
        let ts = test_store();
        let w = worker(&ts);
        let row = enqueue(&ts, "bob@remote.example");
        ts.update_status(
            &row.id,
            QueueStatus::Retrying,
            9,
            UnixTimestamp::now() - ChronoDuration::seconds(1),
            None,
        )
        .unwrap();

        process(&w, serverseq::Outcome::Transient);
        let row = ts.find_outbound(&row.id).unwrap();
        assert_eq!(QueueStatus::Failed, row.status);
        assert_eq!(10, row.retry_count);
    }

    #[tokio::main(flavor = "current_thread")]
    async fn process_unmocked(worker: &Worker) -> bool {
        let never = |_: &dns::Name| -> serverseq::Outcome {
            panic!("delivery should not be attempted")
        };
        worker.process_next(Some(&never)).await.unwrap()
    }

    #[test]
    fn missing_blob_fails() {
        let ts = test_store();
        let w = worker(&ts);
        let row = enqueue(&ts, "bob@remote.example");
        ts.blobs().delete_blob(&row.blob_key).unwrap();

        assert!(process_unmocked(&w));
        let row = ts.find_outbound(&row.id).unwrap();
        assert_eq!(QueueStatus::Failed, row.status);
        assert_eq!(Some("blob missing"), row.last_error.as_deref());
    }

    #[test]
    fn invalid_recipient_fails() {
        let ts = test_store();
        let w = worker(&ts);
        let row = enqueue(&ts, "nobody");

        assert!(process_unmocked(&w));
        let row = ts.find_outbound(&row.id).unwrap();
        assert_eq!(QueueStatus::Failed, row.status);
    }

    #[test]
    fn empty_queue() {
        let ts = test_store();
        assert!(!process_unmocked(&worker(&ts)));
    }
}
