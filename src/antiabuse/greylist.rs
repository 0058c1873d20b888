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

//! Triplet greylisting.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};

use crate::store::{Store, Triplet, UnixTimestamp};
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;

/// The network a sender's address is greylisted under: its /24 for IPv4 or
/// its /64 for IPv6.
pub fn mask_ip(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(ip) => {
            let [a, b, c, _] = ip.octets();
            format!("{}/24", Ipv4Addr::new(a, b, c, 0))
        },
        IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
            Some(v4) => mask_ip(IpAddr::V4(v4)),
            None => {
                let masked = u128::from(ip) & !((1u128 << 64) - 1);
                format!("{}/64", Ipv6Addr::from(masked))
            },
        },
    }
}

pub fn triplet(ip: IpAddr, sender: &str, recipient: &str) -> Triplet {
    Triplet {
        ip_net: mask_ip(ip),
        sender: sender.to_lowercase(),
        recipient: recipient.to_lowercase(),
    }
}

/// Decides whether a delivery attempt must be deferred.
pub struct Greylist {
    store: Arc<Store>,
    retry_delay: chrono::Duration,
}

impl Greylist {
    pub fn new(store: Arc<Store>, retry_delay: Duration) -> Self {
        Self {
            store,
            retry_delay: chrono::Duration::from_std(retry_delay)
                .unwrap_or_else(|_| chrono::Duration::seconds(300)),
        }
    }

    /// Observe an attempt for `(ip, sender, recipient)` at `now`.
    ///
    /// Returns `Err(Error::Greylisted)` if the attempt must be deferred,
    /// including when the greylist table cannot be consulted.
    pub fn check(
        &self,
        log_prefix: &LogPrefix,
        ip: IpAddr,
        sender: &str,
        recipient: &str,
        now: UnixTimestamp,
    ) -> Result<(), Error> {
        let triplet = triplet(ip, sender, recipient);
        match self.store.greylist_observe(&triplet, now, self.retry_delay) {
            Ok(true) => Ok(()),
            Ok(false) => {
                info!(
                    "{log_prefix} Greylisted ({}, {}, {})",
                    triplet.ip_net, triplet.sender, triplet.recipient,
                );
                Err(Error::Greylisted)
            },
            Err(e) => {
                error!("{log_prefix} Greylist lookup failed, deferring: {e}");
                Err(Error::Greylisted)
            },
        }
    }
}

/// Delete greylist entries not seen within `expiration`.
pub fn prune(
    store: &Store,
    now: UnixTimestamp,
    expiration: Duration,
) -> Result<usize, Error> {
    let expiration = chrono::Duration::from_std(expiration)
        .map_err(|e| Error::ValidationFailed(e.to_string()))?;
    store.greylist_prune(UnixTimestamp(now.0 - expiration))
}

/// Prune the greylist every `interval` until `shutdown` fires.
pub async fn run_pruner(
    store: Arc<Store>,
    interval: Duration,
    expiration: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker =
        tokio::time::interval(interval.max(Duration::from_secs(1)));
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match prune(&store, UnixTimestamp::now(), expiration) {
                    Ok(0) => {},
                    Ok(n) => info!("Pruned {n} expired greylist entries"),
                    Err(e) => error!("Greylist prune failed: {e}"),
                }
            },
            _ = shutdown.changed() => return,
        }
    }
}
