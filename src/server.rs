//! Server accept loop, background tasks, and graceful shutdown.
//!
//! Sits between the TCP listener and the per-request pipeline in
//! [`crate::proxy`]. Kept apart from `main()` so the accept loop can be driven
//! from tests with an ephemeral listener and a oneshot shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use hyper::Response;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::client::legacy::connect::Connect;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::proxy::{BoxBody, Proxy, handle_request};
use crate::rate_limit::RateLimiterRegistry;

/// Accepts connections on `listener` and dispatches every request through
/// `proxy`. Generic over the client connector so tests can run against a
/// plain-HTTP client while production uses the TLS-capable one.
///
/// Runs until `shutdown` resolves, then stops accepting new connections
/// and returns. Requests on already-spawned connection tasks continue to
/// completion independently.
pub async fn serve<C>(
    listener: TcpListener,
    proxy: Arc<Proxy<C>>,
    shutdown: impl Future<Output = ()>,
) where
    C: Connect + Clone + Send + Sync + 'static,
{
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, client_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(%e, "failed to accept connection");
                        continue;
                    }
                };
                debug!(client = %client_addr, "accepted connection");

                let proxy = Arc::clone(&proxy);

                tokio::spawn(async move {
                    let svc = service_fn(move |req: hyper::Request<Incoming>| {
                        let proxy = Arc::clone(&proxy);
                        async move {
                            let resp = handle_request(req, &proxy, client_addr)
                                .await
                                .unwrap_or_else(|e| e.into_response());
                            Ok::<Response<BoxBody>, std::convert::Infallible>(resp)
                        }
                    });

                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), svc)
                        .await
                    {
                        warn!(%e, "connection error");
                    }
                });
            }
            () = &mut shutdown => {
                info!("shutting down, no longer accepting connections");
                break;
            }
        }
    }
}

/// Spawns a background task that periodically drops fully drained buckets
/// from the registry, bounding memory without changing any admission
/// decision.
pub fn spawn_bucket_sweeper(
    registry: Arc<RateLimiterRegistry>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let before = registry.tracked_key_count();
            let pruned = registry.retain_active();
            if pruned > 0 {
                info!(
                    before,
                    after = before.saturating_sub(pruned),
                    pruned,
                    "bucket sweep completed"
                );
            }
        }
    })
}

/// Awaits a shutdown signal (SIGINT or SIGTERM on Unix, Ctrl+C on all
/// platforms). Returns once the first signal is received.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(%e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("received SIGINT, initiating graceful shutdown"),
                    _ = sigterm.recv() => info!("received SIGTERM, initiating graceful shutdown"),
                }
            }
            Err(e) => {
                warn!(%e, "failed to register SIGTERM handler");
                ctrl_c.await;
                info!("received SIGINT, initiating graceful shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
        info!("received Ctrl+C, initiating graceful shutdown");
    }
}
