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

//! The hub through which ingestion tells IDLE-ing IMAP sessions about new
//! mail.
//!
//! One hub is created at startup and handed to every publisher and
//! subscriber. Delivery is best-effort: a subscriber whose channel is full
//! simply misses the event and picks the change up on its next poll.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;

use crate::store::Uid;

/// How many events may queue up for a subscriber before further ones are
/// dropped.
const CHANNEL_CAPACITY: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub mailbox: String,
    pub uid: Uid,
}

type Senders = HashMap<String, Vec<(u64, mpsc::Sender<Event>)>>;

#[derive(Default)]
pub struct Hub {
    subscribers: RwLock<Senders>,
    next_id: AtomicU64,
}

/// A registration on the hub. Dropping it unsubscribes.
pub struct Subscription {
    hub: Arc<Hub>,
    user: String,
    id: u64,
    pub events: mpsc::Receiver<Event>,
}

impl Hub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start receiving events for `user`.
    pub fn subscribe(self: &Arc<Self>, user: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.write()
            .entry(user.to_owned())
            .or_default()
            .push((id, tx));

        Subscription {
            hub: Arc::clone(self),
            user: user.to_owned(),
            id,
            events: rx,
        }
    }

    /// Send `event` to every subscriber of `user` without blocking.
    pub fn publish(&self, user: &str, event: Event) {
        let subscribers = self
            .subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(senders) = subscribers.get(user) {
            for (_, sender) in senders {
                let _ = sender.try_send(event.clone());
            }
        }
    }

    /// The number of live subscriptions of `user`.
    pub fn subscriber_count(&self, user: &str) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(user)
            .map_or(0, Vec::len)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Senders> {
        self.subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut subscribers = self.hub.write();
        if let Some(senders) = subscribers.get_mut(&self.user) {
            senders.retain(|&(id, _)| id != self.id);
            if senders.is_empty() {
                subscribers.remove(&self.user);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn event(uid: u32) -> Event {
        Event {
            mailbox: "INBOX".to_owned(),
            uid: Uid(uid),
        }
    }

    #[test]
    fn events_reach_only_their_user() {
        let hub = Hub::new();
        let mut alice = hub.subscribe("alice@example.com");
        let mut bob = hub.subscribe("bob@example.com");

        hub.publish("alice@example.com", event(1));
        assert_eq!(Ok(event(1)), alice.events.try_recv());
        assert!(bob.events.try_recv().is_err());
    }

    #[test]
    fn dropping_unsubscribes() {
        let hub = Hub::new();
        let first = hub.subscribe("u@example.com");
        let second = hub.subscribe("u@example.com");
        assert_eq!(2, hub.subscriber_count("u@example.com"));
        drop(first);
        assert_eq!(1, hub.subscriber_count("u@example.com"));
        drop(second);
        assert_eq!(0, hub.subscriber_count("u@example.com"));
        assert!(hub.subscribers.read().unwrap().is_empty());
    }

    #[test]
    fn full_channel_drops_events() {
        let hub = Hub::new();
        let mut sub = hub.subscribe("u@example.com");
        for uid in 0..CHANNEL_CAPACITY as u32 + 10 {
            hub.publish("u@example.com", event(uid));
        }

        let mut received = 0;
        while sub.events.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(CHANNEL_CAPACITY, received);
    }
}
