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

//! DNS block list checks (RFC 5782).

use std::cell::RefCell;
use std::net::{IpAddr, Ipv4Addr};
use std::rc::Rc;

use log::warn;

use crate::support::dns::{self, CacheError};

/// The name queried in `zone` to test `ip`: its octets reversed, then the
/// zone.
pub fn query_name(ip: Ipv4Addr, zone: &str) -> String {
    let [a, b, c, d] = ip.octets();
    format!("{d}.{c}.{b}.{a}.{}", zone.trim_end_matches('.'))
}

/// Run one lookup pass for `ip` over `zones`.
///
/// Returns the first zone listing `ip`. Only IPv4 is checked, and private
/// or loopback addresses are never looked up. A zone which cannot be
/// queried is treated as not listing the address.
pub fn eval(
    cache: &mut dns::Cache,
    ip: IpAddr,
    zones: &[String],
) -> Result<Option<String>, CacheError> {
    let IpAddr::V4(ip) = ip else {
        return Ok(None);
    };
    if ip.is_private() || ip.is_loopback() {
        return Ok(None);
    }

    for zone in zones {
        let Some(name) = dns::parse_name(&query_name(ip, zone)) else {
            continue;
        };

        match dns::look_up(&mut cache.a, &name) {
            Ok(addrs) if !addrs.is_empty() => return Ok(Some(zone.clone())),
            Ok(_) | Err(CacheError::NotFound) => {},
            Err(CacheError::Error) => {
                warn!("DNSBL {zone} lookup for {ip} failed, treating as clean");
            },
            Err(CacheError::NotReady) => return Err(CacheError::NotReady),
        }
    }

    Ok(None)
}

/// Check `ip` against every zone, waiting for DNS as needed.
///
/// Timing out counts as not listed.
pub async fn check(
    cache: &Rc<RefCell<dns::Cache>>,
    resolver: Option<&Rc<dns::Resolver>>,
    ip: IpAddr,
    zones: &[String],
    deadline: tokio::time::Instant,
) -> Option<String> {
    if zones.is_empty() {
        return None;
    }

    match tokio::time::timeout_at(
        deadline,
        dns::wait_for(cache, resolver, |c| eval(c, ip, zones)),
    )
    .await
    {
        Ok(Ok(listed)) => listed,
        Ok(Err(_)) => None,
        Err(_) => {
            warn!("DNSBL check for {ip} timed out, treating as clean");
            None
        },
    }
}
