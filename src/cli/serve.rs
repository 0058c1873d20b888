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
use std::future::Future;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};

use crate::antiabuse::{greylist, ratelimit};
use crate::http::{serve_http, ApiContext};
use crate::imap::{serve_imap, ImapContext};
use crate::managesieve::{serve_managesieve, ManageSieveContext};
use crate::mime::dkim;
use crate::notify;
use crate::smtp::inbound::{serve_smtpin, Ingester, SmtpInContext};
use crate::smtp::outbound::{send::Worker, Submitter};
use crate::store::Store;
use crate::support::{
    async_io::SessionIo,
    dns,
    error::Error,
    log_prefix::LogPrefix,
    system_config::{SystemConfig, TlsConfig},
};

// Like `die!`, but through the logger, which may be syslog by now.
macro_rules! fatal {
    ($ex:ident, $($stuff:tt)*) => {{
        error!($($stuff)*);
        crate::support::sysexits::$ex.exit()
    }}
}

/// How long sessions still open at shutdown are given to finish.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

pub(super) fn serve(config: SystemConfig) {
    let config = Arc::new(config);
    let local_host_name = local_host_name(&config);
    let ssl_acceptor = config.tls.as_ref().map(create_ssl_acceptor);
    if ssl_acceptor.is_none() {
        warn!("No [tls] configuration; STARTTLS will not be offered");
    }

    let store = match Store::open(
        &LogPrefix::new("store".to_owned()),
        &config.storage.db_path,
        &config.storage.blob_path,
    ) {
        Ok(store) => Arc::new(store),
        Err(e) => fatal!(
            EX_UNAVAILABLE,
            "Unable to open store at '{}': {}",
            config.storage.db_path.display(),
            e
        ),
    };

    match store.release_processing() {
        Ok(0) => (),
        Ok(n) => info!("Returned {n} interrupted deliveries to the queue"),
        Err(e) => fatal!(EX_UNAVAILABLE, "Unable to recover queue: {}", e),
    }

    let signer = match dkim::Signer::load(
        config.identity.domain.clone(),
        config.dkim.selector.clone(),
        &config.dkim.private_key,
    ) {
        Ok(signer) => Arc::new(signer),
        Err(e) => fatal!(
            EX_CONFIG,
            "Unable to load DKIM key from '{}' \
             (`rookery dkim-keygen` creates one): {}",
            config.dkim.private_key.display(),
            e
        ),
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => fatal!(EX_OSERR, "Failed to start tokio runtime: {}", e),
    };

    let local = tokio::task::LocalSet::new();
    local.block_on(
        &runtime,
        run(config, store, signer, ssl_acceptor, local_host_name),
    );
    info!("Shut down");
}

async fn run(
    config: Arc<SystemConfig>,
    store: Arc<Store>,
    signer: Arc<dkim::Signer>,
    ssl_acceptor: Option<SslAcceptor>,
    local_host_name: String,
) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    // Every session holds a clone of `drain_tx`; once they are all gone
    // `drain_rx` yields `None`.
    let (drain_tx, mut drain_rx) = mpsc::channel::<()>(1);

    let hub = notify::Hub::new();
    let dns_resolver = dns::system_resolver();
    let submitter = Submitter {
        store: Arc::clone(&store),
        signer: Some(signer),
    };
    let rate_limiter = Arc::new(ratelimit::RateLimiter::new(
        config.rate_limit.count,
        config.rate_limit.window(),
    ));

    let smtp_context = Rc::new(SmtpInContext {
        config: Arc::clone(&config),
        ingester: Ingester {
            store: Arc::clone(&store),
            submitter: Some(submitter.clone()),
            hub: Arc::clone(&hub),
        },
        rate_limiter: Arc::clone(&rate_limiter),
        greylist: config.greylist.enabled.then(|| {
            greylist::Greylist::new(
                Arc::clone(&store),
                config.greylist.retry_delay(),
            )
        }),
        dns_resolver: Some(Rc::clone(&dns_resolver)),
        local_host_name: local_host_name.clone(),
    });
    let imap_context = Rc::new(ImapContext {
        config: Arc::clone(&config),
        store: Arc::clone(&store),
        hub: Arc::clone(&hub),
        local_host_name: local_host_name.clone(),
    });
    let managesieve_context = Rc::new(ManageSieveContext {
        config: Arc::clone(&config),
        store: Arc::clone(&store),
    });
    let api_context = Rc::new(ApiContext {
        config: Arc::clone(&config),
        store: Arc::clone(&store),
        submitter,
    });

    let smtp_listener = bind("smtp", config.smtp.port).await;
    let imap_listener = bind("imap", config.imap.port).await;
    let managesieve_listener =
        bind("managesieve", config.managesieve.port).await;
    let http_listener = bind("http", config.http.port).await;

    {
        let ssl_acceptor = ssl_acceptor.clone();
        tokio::task::spawn_local(accept_loop(
            "smtp",
            smtp_listener,
            shutdown_rx.clone(),
            drain_tx.clone(),
            move |io, log_prefix, peer_ip| {
                serve_smtpin(
                    io,
                    Rc::clone(&smtp_context),
                    Rc::new(RefCell::new(dns::Cache::default())),
                    log_prefix,
                    ssl_acceptor.clone(),
                    peer_ip,
                )
            },
        ));
    }
    {
        let ssl_acceptor = ssl_acceptor.clone();
        tokio::task::spawn_local(accept_loop(
            "imap",
            imap_listener,
            shutdown_rx.clone(),
            drain_tx.clone(),
            move |io, log_prefix, _| {
                serve_imap(
                    io,
                    Rc::clone(&imap_context),
                    log_prefix,
                    ssl_acceptor.clone(),
                )
            },
        ));
    }
    {
        let ssl_acceptor = ssl_acceptor.clone();
        tokio::task::spawn_local(accept_loop(
            "managesieve",
            managesieve_listener,
            shutdown_rx.clone(),
            drain_tx.clone(),
            move |io, log_prefix, _| {
                serve_managesieve(
                    io,
                    Rc::clone(&managesieve_context),
                    log_prefix,
                    ssl_acceptor.clone(),
                )
            },
        ));
    }
    tokio::task::spawn_local(accept_loop(
        "http",
        http_listener,
        shutdown_rx.clone(),
        drain_tx.clone(),
        move |io, log_prefix, _| {
            serve_http(
                io,
                Rc::clone(&api_context),
                log_prefix,
                ssl_acceptor.clone(),
            )
        },
    ));

    let workers = config.delivery.workers.max(1);
    for n in 0..workers {
        let worker = Worker {
            log_prefix: LogPrefix::new(format!("delivery{n}")),
            store: Arc::clone(&store),
            dns_resolver: Some(Rc::clone(&dns_resolver)),
            local_host_name: local_host_name.clone(),
            config: config.delivery.clone(),
        };
        let drain = drain_tx.clone();
        let shutdown = shutdown_rx.clone();
        tokio::task::spawn_local(async move {
            let _drain = drain;
            worker.run(shutdown).await;
        });
    }

    if config.greylist.enabled {
        tokio::task::spawn_local(greylist::run_pruner(
            Arc::clone(&store),
            Duration::from_secs(config.greylist.prune_interval_secs),
            config.greylist.expiration(),
            shutdown_rx.clone(),
        ));
    }
    tokio::task::spawn_local(ratelimit::run_sweeper(
        rate_limiter,
        shutdown_rx.clone(),
    ));

    info!(
        "Serving {} on SMTP {}, IMAP {}, ManageSieve {}, HTTP {} \
         with {workers} delivery workers",
        config.identity.domain,
        config.smtp.port,
        config.imap.port,
        config.managesieve.port,
        config.http.port,
    );

    wait_for_signal().await;
    info!("Shutting down; draining sessions for up to {DRAIN_TIMEOUT:?}");
    let _ = shutdown_tx.send(true);
    drop(drain_tx);

    if tokio::time::timeout(DRAIN_TIMEOUT, drain_rx.recv())
        .await
        .is_err()
    {
        warn!("Sessions still open after {DRAIN_TIMEOUT:?}; exiting anyway");
    }
}

async fn bind(protocol: &str, port: u16) -> TcpListener {
    let addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port);
    match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => fatal!(
            EX_OSERR,
            "Unable to listen for {} on port {}: {}",
            protocol,
            port,
            e
        ),
    }
}

/// Accept connections on `listener` until `shutdown` fires, running each
/// through `serve` as its own local task.
async fn accept_loop<F, Fut>(
    protocol: &'static str,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
    drain: mpsc::Sender<()>,
    serve: F,
) where
    F: Fn(SessionIo, LogPrefix, IpAddr) -> Fut,
    Fut: Future<Output = Result<(), Error>> + 'static,
{
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.changed() => return,
            r = listener.accept() => match r {
                Ok(accepted) => accepted,
                Err(e) => {
                    // Usually EMFILE; back off instead of spinning.
                    warn!("{protocol}: accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                },
            },
        };

        let log_prefix = LogPrefix::new(protocol.to_owned());
        log_prefix.set_peer(peer.to_string());

        let _ = stream.set_nodelay(true);
        let io = match stream
            .into_std()
            .map_err(|e| e.to_string())
            .and_then(|s| {
                SessionIo::new_owned_socket(s).map_err(|e| e.to_string())
            }) {
            Ok(io) => io,
            Err(e) => {
                error!("{log_prefix} Unable to set up socket: {e}");
                continue;
            },
        };

        info!("{log_prefix} Connection established");
        let session = serve(io, log_prefix.clone(), canonical_ip(peer.ip()));
        let drain = drain.clone();
        tokio::task::spawn_local(async move {
            let _drain = drain;
            match session.await {
                Ok(()) => info!("{log_prefix} Normal client disconnect"),
                Err(e) => warn!("{log_prefix} Abnormal client disconnect: {e}"),
            }
        });
    }
}

/// IPv4 clients of a dual-stack socket show up as IPv4-mapped IPv6
/// addresses, which DNSBL, greylisting and SPF all need in IPv4 form.
fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map_or(IpAddr::V6(v6), IpAddr::V4),
        v4 => v4,
    }
}

async fn wait_for_signal() {
    let (mut sigint, mut sigterm) = match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) {
        (Ok(a), Ok(b)) => (a, b),
        (Err(e), _) | (_, Err(e)) => {
            fatal!(EX_OSERR, "Unable to install signal handlers: {}", e)
        },
    };

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
}

fn local_host_name(config: &SystemConfig) -> String {
    if !config.identity.host_name.is_empty() {
        return config.identity.host_name.clone();
    }

    match nix::unistd::gethostname() {
        Ok(name) => match name.into_string() {
            Ok(name) => name,
            Err(_) => fatal!(EX_OSERR, "System host name is not UTF-8"),
        },
        Err(e) => fatal!(
            EX_OSERR,
            "Failed to determine host name; you may \
             need to explicitly configure it: {}",
            e
        ),
    }
}

fn create_ssl_acceptor(tls: &TlsConfig) -> SslAcceptor {
    let mut acceptor =
        match SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server()) {
            Ok(a) => a,
            Err(e) => fatal!(
                EX_SOFTWARE,
                "Failed to initialise OpenSSL acceptor: {}",
                e
            ),
        };

    if let Err(e) =
        acceptor.set_private_key_file(&tls.private_key, SslFiletype::PEM)
    {
        fatal!(
            EX_CONFIG,
            "Unable to load TLS private key from '{}': {}",
            tls.private_key.display(),
            e
        );
    }

    if let Err(e) = acceptor.set_certificate_chain_file(&tls.certificate_chain)
    {
        fatal!(
            EX_CONFIG,
            "Unable to load TLS certificate chain from '{}': {}",
            tls.certificate_chain.display(),
            e
        );
    }

    if let Err(e) = acceptor.check_private_key() {
        fatal!(EX_CONFIG, "TLS key seems to be invalid: {}", e);
    }

    acceptor.build()
}
