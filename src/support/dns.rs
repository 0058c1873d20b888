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

//! A small DNS cache shared by the validators, the anti-abuse gates, and the
//! delivery worker.
//!
//! Consumers never talk to the resolver directly. They look names up in a
//! `Cache`; a miss records the name as `New` and reports `NotReady`, after
//! which `wait_for` starts the actual queries and retries the lookup when
//! something changes. This keeps all evaluation logic synchronous and lets
//! tests run against a pre-populated cache with no resolver at all.

use std::cell::RefCell;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::rc::{Rc, Weak};

use log::warn;

pub use hickory_resolver::Name;

pub type Resolver = hickory_resolver::AsyncResolver<
    hickory_resolver::name_server::GenericConnector<
        hickory_resolver::name_server::TokioRuntimeProvider,
    >,
>;

/// Build a resolver from the system configuration, falling back to the
/// library defaults if `/etc/resolv.conf` is unusable.
pub fn system_resolver() -> Rc<Resolver> {
    match Resolver::tokio_from_system_conf() {
        Ok(r) => Rc::new(r),
        Err(e) => {
            warn!(
                "Unable to read system DNS configuration, using defaults: {e}"
            );
            Rc::new(Resolver::tokio(
                hickory_resolver::config::ResolverConfig::default(),
                hickory_resolver::config::ResolverOpts::default(),
            ))
        },
    }
}

/// A cache of DNS records.
///
/// When the `Cache` is dropped, all in-flight queries are cancelled. The
/// query tasks themselves do not keep the cache alive.
#[derive(Debug)]
pub struct Cache {
    pub a: CacheMap<Vec<Ipv4Addr>>,
    pub aaaa: CacheMap<Vec<Ipv6Addr>>,
    pub txt: CacheMap<Vec<Rc<str>>>,
    /// MX records as `(preference, exchange)` pairs, in the order the server
    /// returned them.
    pub mx: CacheMap<Vec<(u16, Rc<Name>)>>,

    notify: Rc<tokio::sync::Notify>,
    in_flight_tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            a: Default::default(),
            aaaa: Default::default(),
            txt: Default::default(),
            mx: Default::default(),

            notify: Rc::new(tokio::sync::Notify::new()),
            in_flight_tasks: Default::default(),
        }
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        for task in &self.in_flight_tasks {
            task.abort();
        }
    }
}

// Association lists rather than hash maps: these stay tiny, and hashing a
// `Name` allocates.
pub type CacheMap<T> = Vec<(Rc<Name>, Entry<T>)>;

#[derive(Debug)]
pub enum Entry<T> {
    /// The query succeeded, and these are its results.
    Ok(T),
    /// The query succeeded and returned no results.
    NotFound,
    /// The query failed.
    Error,
    /// The query is in-flight.
    Pending,
    /// A consumer newly discovered the need for this query.
    New,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheError {
    NotFound,
    Error,
    NotReady,
}

/// Parse `s` as an absolute DNS name, tolerating a missing trailing dot.
///
/// Internationalised names are converted to their ASCII form.
pub fn parse_name(s: &str) -> Option<Name> {
    let mut name = Name::from_utf8(s.trim_end_matches('.')).ok()?;
    name.set_fqdn(true);
    Some(name)
}

/// Look `name` up in `cache`.
///
/// If `name` is not in the cache, put it into the `New` status and return
/// `NotReady`.
pub fn look_up<'a, T>(
    cache: &'a mut CacheMap<T>,
    name: &Name,
) -> Result<&'a T, CacheError> {
    let position = cache.iter().position(|e| names_equal(&e.0, name));
    if let Some(position) = position {
        match cache[position].1 {
            Entry::Ok(ref v) => Ok(v),
            Entry::NotFound => Err(CacheError::NotFound),
            Entry::Error => Err(CacheError::Error),
            Entry::Pending | Entry::New => Err(CacheError::NotReady),
        }
    } else {
        cache.push((Rc::new(name.clone()), Entry::New));
        Err(CacheError::NotReady)
    }
}

/// Insert a completed entry directly. Used to seed the cache in tests and to
/// record synthesised answers.
pub fn put<T>(cache: &mut CacheMap<T>, name: &Name, entry: Entry<T>) {
    if let Some(existing) = cache.iter_mut().find(|e| names_equal(&e.0, name))
    {
        existing.1 = entry;
    } else {
        cache.push((Rc::new(name.clone()), entry));
    }
}

fn names_equal(a: &Name, b: &Name) -> bool {
    // Case-insensitive label comparison
    a == b
}

/// Repeatedly run `look_up` against the cache until it produces something
/// other than `NotReady`, starting DNS queries as needed.
///
/// If `resolver` is `None`, anything not already in the cache resolves to
/// `CacheError::Error`.
pub async fn wait_for<T, F: FnMut(&mut Cache) -> Result<T, CacheError>>(
    cache: &Rc<RefCell<Cache>>,
    resolver: Option<&Rc<Resolver>>,
    mut look_up: F,
) -> Result<T, CacheError> {
    loop {
        let result = look_up(&mut cache.borrow_mut());
        if !matches!(result, Err(CacheError::NotReady)) {
            return result;
        }

        if resolver.is_none() {
            // Resolve everything outstanding to Error so that the next pass
            // reaches a conclusion.
            spawn_lookups(cache, None);
            let result = look_up(&mut cache.borrow_mut());
            return match result {
                Err(CacheError::NotReady) => Err(CacheError::Error),
                r => r,
            };
        }

        // Register for notification before starting the lookups so that a
        // fast answer is not missed.
        let notify = Rc::clone(&cache.borrow().notify);
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        spawn_lookups(cache, resolver);
        notified.await;
    }
}

/// Look up all addresses for `name`, IPv6 first.
pub async fn addresses(
    cache: &Rc<RefCell<Cache>>,
    resolver: Option<&Rc<Resolver>>,
    name: &Name,
) -> Result<Vec<IpAddr>, CacheError> {
    let v6 = wait_for(cache, resolver, |c| {
        look_up(&mut c.aaaa, name).map(|v| v.clone())
    })
    .await;
    let v4 = wait_for(cache, resolver, |c| {
        look_up(&mut c.a, name).map(|v| v.clone())
    })
    .await;

    match (v6, v4) {
        (Err(CacheError::Error), Err(CacheError::Error)) => {
            Err(CacheError::Error)
        },
        (v6, v4) => {
            let addresses = v6
                .unwrap_or_default()
                .into_iter()
                .map(IpAddr::V6)
                .chain(v4.unwrap_or_default().into_iter().map(IpAddr::V4))
                .collect::<Vec<_>>();
            if addresses.is_empty() {
                Err(CacheError::NotFound)
            } else {
                Ok(addresses)
            }
        },
    }
}

/// Start DNS queries for all `New` entries.
///
/// Queries are spawned in the contextual `LocalSet`. If `resolver` is
/// `None`, all new entries are immediately resolved to `Error`.
fn spawn_lookups(cache: &Rc<RefCell<Cache>>, resolver: Option<&Rc<Resolver>>) {
    let mut cache_mut = cache.borrow_mut();
    let cache_mut = &mut *cache_mut;

    cache_mut.in_flight_tasks.retain(|t| !t.is_finished());

    spawn_name_lookups(
        &mut cache_mut.a,
        &mut cache_mut.in_flight_tasks,
        cache,
        resolver,
        |resolver, name| async move {
            resolver
                .ipv4_lookup(name)
                .await
                .map(|r| r.iter().map(|a| a.0).collect::<Vec<_>>())
        },
        |d| &mut d.a,
    );
    spawn_name_lookups(
        &mut cache_mut.aaaa,
        &mut cache_mut.in_flight_tasks,
        cache,
        resolver,
        |resolver, name| async move {
            resolver
                .ipv6_lookup(name)
                .await
                .map(|r| r.iter().map(|a| a.0).collect::<Vec<_>>())
        },
        |d| &mut d.aaaa,
    );
    spawn_name_lookups(
        &mut cache_mut.mx,
        &mut cache_mut.in_flight_tasks,
        cache,
        resolver,
        |resolver, name| async move {
            resolver.mx_lookup(name).await.map(|r| {
                r.iter()
                    .map(|mx| (mx.preference(), Rc::new(mx.exchange().clone())))
                    .collect::<Vec<_>>()
            })
        },
        |d| &mut d.mx,
    );
    spawn_name_lookups(
        &mut cache_mut.txt,
        &mut cache_mut.in_flight_tasks,
        cache,
        resolver,
        |resolver, name| async move {
            resolver.txt_lookup(name).await.map(|r| {
                r.iter()
                    .map(|parts| {
                        // A TXT record is a sequence of strings which are
                        // concatenated without separators.
                        let combined = parts
                            .iter()
                            .flat_map(|p| p.iter().copied())
                            .collect::<Vec<u8>>();
                        Rc::<str>::from(String::from_utf8_lossy(&combined))
                    })
                    .collect::<Vec<_>>()
            })
        },
        |d| &mut d.txt,
    );
}

fn spawn_name_lookups<T, R, F, A>(
    map: &mut CacheMap<T>,
    tasks: &mut Vec<tokio::task::JoinHandle<()>>,
    cache: &Rc<RefCell<Cache>>,
    resolver: Option<&Rc<Resolver>>,
    run: F,
    access: A,
) where
    R: Future<Output = Result<T, hickory_resolver::error::ResolveError>>
        + 'static,
    F: FnOnce(Rc<Resolver>, Name) -> R + Clone + 'static,
    A: FnOnce(&mut Cache) -> &mut CacheMap<T> + Clone + 'static,
    T: 'static,
{
    for entry in map {
        if !matches!(entry.1, Entry::New) {
            continue;
        }

        let Some(resolver) = resolver else {
            entry.1 = Entry::Error;
            continue;
        };

        entry.1 = Entry::Pending;

        let run = run.clone();
        let access = access.clone();
        let cache = Rc::downgrade(cache);
        let resolver = Rc::clone(resolver);
        let name = Rc::clone(&entry.0);
        tasks.push(tokio::task::spawn_local(async move {
            let mut query = (*name).clone();
            query.set_fqdn(true);
            let new_entry = to_entry(run(resolver, query).await);

            let Some(cache) = Weak::upgrade(&cache) else {
                return;
            };
            let mut cache = cache.borrow_mut();
            for entry in access(&mut cache) {
                if Rc::ptr_eq(&name, &entry.0) {
                    entry.1 = new_entry;
                    break;
                }
            }
            cache.notify.notify_waiters();
        }));
    }
}

fn to_entry<T>(
    r: Result<T, hickory_resolver::error::ResolveError>,
) -> Entry<T> {
    use hickory_resolver::error::ResolveErrorKind as Rek;

    match r {
        Ok(v) => Entry::Ok(v),
        Err(e) => match *e.kind() {
            Rek::NoRecordsFound { .. } => Entry::NotFound,
            _ => Entry::Error,
        },
    }
}
