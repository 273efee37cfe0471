//! Core request pipeline: admission, tarpit, and forwarding.
//!
//! Every inbound request is assigned a monotonically increasing request ID
//! and wrapped in a [`tracing::Span`]. The span starts with the request line
//! and client address; the rate-limit key, the inbound and outbound
//! `X-Forwarded-For` values, and the tarpit wait are recorded on it as the
//! pipeline reaches them. Observation never alters the decision.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use hyper::{Request, Response};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::{Connect, HttpConnector};
use hyper_util::rt::TokioExecutor;
use tracing::{Instrument, field, warn};

use crate::admission::{Admission, AdmissionController};
use crate::config::RuntimeConfig;
use crate::connector::{self, DownstreamConnector};
use crate::forward::Dispatcher;
use crate::headers::X_FORWARDED_FOR;
use crate::rate_limit::RateLimiterRegistry;
use crate::tarpit::Tarpit;
use crate::{ProxyError, Result};

/// An alias to simplify the calls to `Box<dyn std::error::Error + Send + Sync>`.
pub type StdError = Box<dyn std::error::Error + Send + Sync>;

/// Type-erased body used for both request forwarding and response streaming.
///
/// Lets locally built bodies (error responses, buffered request bodies) and
/// streamed downstream bodies share a single response type.
pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, StdError>;

/// Plain-HTTP client, used where TLS is never needed (tests, local targets).
pub type HttpClient = Client<HttpConnector, BoxBody>;

/// The production client: HTTP and HTTPS, with connect and TLS handshake
/// timeouts.
pub type HttpsClient = Client<DownstreamConnector, BoxBody>;

/// Global monotonic counter for assigning unique request IDs.
static REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Constructs the shared downstream client. Built once at startup; its
/// connection pool is reused by every request.
pub fn build_client(config: &RuntimeConfig) -> HttpsClient {
    let connector =
        connector::build_connector(config.timeouts.connect, config.timeouts.tls_handshake);
    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(config.pool.idle_timeout)
        .pool_max_idle_per_host(config.pool.max_idle_per_host)
        .build(connector)
}

/// Everything a request handler needs, shared across connections via `Arc`.
#[derive(Debug)]
pub struct Proxy<C> {
    admission: AdmissionController,
    tarpit: Tarpit,
    dispatcher: Dispatcher<C>,
}

impl<C> Proxy<C>
where
    C: Connect + Clone + Send + Sync + 'static,
{
    pub fn new(admission: AdmissionController, tarpit: Tarpit, dispatcher: Dispatcher<C>) -> Self {
        Self {
            admission,
            tarpit,
            dispatcher,
        }
    }

    /// Wires up the production components from validated configuration.
    pub fn from_config(config: &RuntimeConfig, client: Client<C, BoxBody>) -> Self {
        let registry = Arc::new(RateLimiterRegistry::new(config.limits));
        Self::new(
            AdmissionController::new(registry),
            Tarpit::from_config(&config.tarpit),
            Dispatcher::from_config(config, client),
        )
    }

    /// Replaces the tarpit, keeping everything else.
    pub fn with_tarpit(mut self, tarpit: Tarpit) -> Self {
        self.tarpit = tarpit;
        self
    }

    pub fn registry(&self) -> &Arc<RateLimiterRegistry> {
        self.admission.registry()
    }
}

/// Processes a single inbound request through the proxy pipeline.
///
/// 1. **Key derivation**: the client identity is the inbound
///    `X-Forwarded-For` value, or the peer IP when absent; the key is the
///    method plus that identity.
/// 2. **Limit check**: one unit is charged to the key's bucket.
/// 3. **Rejected**: the tarpit delay is awaited (no registry lock is held),
///    then [`ProxyError::RateLimited`] is returned for rendering as 429.
/// 4. **Allowed**: the request is forwarded downstream and the response
///    relayed; construction and transport failures come back as errors that
///    render as 503.
///
/// Dropping the returned future (e.g. because the client hung up) cancels
/// the tarpit wait or the in-flight downstream call.
pub async fn handle_request<B, C>(
    req: Request<B>,
    proxy: &Proxy<C>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody>>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<StdError>,
    C: Connect + Clone + Send + Sync + 'static,
{
    let request_id = REQUEST_ID.fetch_add(1, Ordering::Relaxed);

    let span = tracing::info_span!(
        "request",
        id = request_id,
        method = %req.method(),
        uri = %req.uri(),
        client = %client_addr,
        forwarded_for_incoming = field::Empty,
        rate_limit_key = field::Empty,
        forwarded_for_outgoing = field::Empty,
        wait_ms = field::Empty,
    );

    if let Some(xff) = req.headers().get(&X_FORWARDED_FOR) {
        span.record(
            "forwarded_for_incoming",
            &*String::from_utf8_lossy(xff.as_bytes()),
        );
    }

    async move {
        let admission = proxy.admission.admit(&req, client_addr);
        let span = tracing::Span::current();
        span.record("rate_limit_key", field::display(admission.key()));

        match admission {
            Admission::Allowed(_) => proxy.dispatcher.forward(req, client_addr).await,
            Admission::Rejected(key) => {
                let waited = proxy.tarpit.apply().await;
                span.record("wait_ms", waited.as_millis() as u64);
                warn!(
                    key = %key,
                    wait_ms = waited.as_millis() as u64,
                    "rate limit exceeded"
                );
                Err(ProxyError::RateLimited {
                    key: key.to_string(),
                })
            }
        }
    }
    .instrument(span)
    .await
}
