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

//! Per-IP token-bucket rate limiting.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::debug;

/// One token bucket per IP address.
///
/// Each bucket holds at most `count` tokens and refills at `count` tokens per
/// `window`. An address seen for the first time starts with a full bucket.
pub struct RateLimiter {
    count: u32,
    window: Duration,
    table: Mutex<HashMap<IpAddr, Bucket>>,
}

#[derive(Clone, Copy, Debug)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

impl RateLimiter {
    pub fn new(count: u32, window: Duration) -> Self {
        Self {
            count,
            window,
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Tokens regained per second.
    fn rate(&self) -> f64 {
        let secs = self.window.as_secs_f64();
        if secs > 0.0 {
            f64::from(self.count) / secs
        } else {
            f64::INFINITY
        }
    }

    fn refilled(&self, bucket: Bucket, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        let gained = if elapsed > 0.0 {
            elapsed * self.rate()
        } else {
            0.0
        };
        (bucket.tokens + gained).min(f64::from(self.count))
    }

    /// Take a token for an event from `ip` at `now`, returning whether one
    /// was available.
    pub fn allow(&self, ip: IpAddr, now: Instant) -> bool {
        let capacity = f64::from(self.count);
        let mut table = self.lock();
        let bucket = table.entry(ip).or_insert(Bucket {
            tokens: capacity,
            last: now,
        });

        bucket.tokens = self.refilled(*bucket, now);
        bucket.last = bucket.last.max(now);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drop every bucket that has refilled completely by `now`, since it is
    /// indistinguishable from a fresh one. Returns the number removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let capacity = f64::from(self.count);
        let mut table = self.lock();
        let before = table.len();
        table.retain(|_, &mut b| self.refilled(b, now) < capacity);
        let removed = before - table.len();
        if removed > 0 {
            debug!("Rate limiter swept {removed} idle buckets");
        }
        removed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<IpAddr, Bucket>> {
        // The table holds no invariants a panic could break.
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Periodically sweep `limiter` until `shutdown` fires.
pub async fn run_sweeper(
    limiter: std::sync::Arc<RateLimiter>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut interval =
        tokio::time::interval(limiter.window.max(Duration::from_secs(60)));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                limiter.sweep(Instant::now());
            },
            _ = shutdown.changed() => return,
        }
    }
}
