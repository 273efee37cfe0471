//! Shared test infrastructure for integration tests.
//!
//! Provides throwaway HTTP backend servers, configuration and proxy
//! builders, client constructors, and utility functions used across all
//! integration test modules.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use ratelimit_proxy::{
    AdmissionController, BoxBody, Config, Dispatcher, FixedJitter, HttpClient, ManualClock, Proxy,
    RateLimiterRegistry, RuntimeConfig, Tarpit, TimeoutsConfig, TrackingSleeper,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// A synthetic client address used in all test invocations.
const TEST_CLIENT_ADDR: &str = "192.168.1.100:54321";

/// Initializes a tracing subscriber for test output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("debug")
        .try_init();
}

pub fn test_addr() -> SocketAddr {
    TEST_CLIENT_ADDR.parse().unwrap()
}

pub fn test_client() -> HttpClient {
    Client::builder(TokioExecutor::new()).build(HttpConnector::new())
}

/// Collects a [`BoxBody`] into [`Bytes`], mapping any body error to a
/// descriptive panic so test assertions remain concise.
pub async fn collect_body(body: BoxBody) -> Bytes {
    body.collect()
        .await
        .expect("failed to collect response body")
        .to_bytes()
}

/// Builds a `RuntimeConfig` targeting the given local backend address.
pub fn test_config(addr: SocketAddr) -> RuntimeConfig {
    Config {
        downstream: Some(format!("http://{addr}")),
        ..Default::default()
    }
    .into_runtime()
    .expect("test config must be valid")
}

/// Builds a `RuntimeConfig` with a specific body size limit.
pub fn test_config_with_body_limit(addr: SocketAddr, limit: u64) -> RuntimeConfig {
    Config {
        downstream: Some(format!("http://{addr}")),
        max_body_size: Some(limit),
        ..Default::default()
    }
    .into_runtime()
    .expect("test config must be valid")
}

/// Builds a `RuntimeConfig` with a short downstream request timeout.
pub fn test_config_with_timeout(addr: SocketAddr, request_ms: u64) -> RuntimeConfig {
    Config {
        downstream: Some(format!("http://{addr}")),
        timeouts: TimeoutsConfig {
            request_ms,
            ..Default::default()
        },
        ..Default::default()
    }
    .into_runtime()
    .expect("test config must be valid")
}

/// Everything a test needs to drive and observe a proxy.
pub struct TestProxy {
    pub proxy: Arc<Proxy<HttpConnector>>,
    pub clock: Arc<ManualClock>,
    pub sleeper: TrackingSleeper,
}

/// Builds a proxy over a plain-HTTP client, a manual clock, and a tarpit
/// that records a fixed 600ms delay (100ms base + 500ms jitter) instead of
/// sleeping.
pub fn test_proxy(config: &RuntimeConfig) -> TestProxy {
    let clock = Arc::new(ManualClock::new());
    let sleeper = TrackingSleeper::new();

    let registry = Arc::new(RateLimiterRegistry::with_clock(
        config.limits,
        clock.clone(),
    ));
    let tarpit = Tarpit::new(100.0, Arc::new(FixedJitter(500.0)), Arc::new(sleeper.clone()));
    let dispatcher = Dispatcher::from_config(config, test_client());

    TestProxy {
        proxy: Arc::new(Proxy::new(
            AdmissionController::new(registry),
            tarpit,
            dispatcher,
        )),
        clock,
        sleeper,
    }
}

/// Serves every connection accepted on `listener` through `handler` until
/// the returned sender is dropped or fired.
fn spawn_backend_on<F, Fut, RB>(listener: TcpListener, handler: F) -> oneshot::Sender<()>
where
    F: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<RB>> + Send + 'static,
    RB: Body<Data = Bytes> + Send + 'static,
    RB::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (tx, rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let mut shutdown = std::pin::pin!(async {
            let _ = rx.await;
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, _) = result.expect("accept failed");
                    let handler = handler.clone();
                    let service = service_fn(move |req: Request<Incoming>| {
                        let handler = handler.clone();
                        async move { Ok::<_, std::convert::Infallible>(handler(req).await) }
                    });
                    tokio::spawn(async move {
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
                () = &mut shutdown => break,
            }
        }
    });

    tx
}

/// Starts an HTTP server on an ephemeral loopback port, answering every
/// request through `handler`. Returns the server address and a handle to
/// shut it down.
async fn spawn_backend<F, Fut, RB>(handler: F) -> (SocketAddr, oneshot::Sender<()>)
where
    F: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<RB>> + Send + 'static,
    RB: Body<Data = Bytes> + Send + 'static,
    RB::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind test backend");
    let addr = listener.local_addr().unwrap();

    (addr, spawn_backend_on(listener, handler))
}

fn fixed_response(
    status: StatusCode,
    content_type: &'static str,
    body: &'static str,
) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", content_type)
        .header("x-backend", "test")
        .body(Full::new(Bytes::from(body)))
        .expect("test response must build")
}

/// Starts a local backend that responds to every request with the given
/// status, content-type, and body.
pub async fn start_backend(
    status: StatusCode,
    content_type: &'static str,
    body: &'static str,
) -> (SocketAddr, oneshot::Sender<()>) {
    spawn_backend(move |_req| async move { fixed_response(status, content_type, body) }).await
}

/// Like [`start_backend`], but bound to a specific address.
pub async fn start_backend_at(
    addr: SocketAddr,
    status: StatusCode,
    content_type: &'static str,
    body: &'static str,
) -> oneshot::Sender<()> {
    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind test backend at requested address");

    spawn_backend_on(listener, move |_req| async move {
        fixed_response(status, content_type, body)
    })
}

/// Starts a local backend that describes the request it received as a
/// JSON object: method, path, query, body, and the headers the proxy is
/// expected to rewrite.
pub async fn start_echo_backend() -> (SocketAddr, oneshot::Sender<()>) {
    spawn_backend(|req: Request<Incoming>| async move {
        let (parts, body) = req.into_parts();
        let body = body
            .collect()
            .await
            .map(|c| c.to_bytes())
            .unwrap_or_default();
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        };

        let echo = serde_json::json!({
            "method": parts.method.as_str(),
            "path": parts.uri.path(),
            "query": parts.uri.query(),
            "body": String::from_utf8_lossy(&body),
            "host": header("host"),
            "x_forwarded_for": header("x-forwarded-for"),
            "x_forwarded_for_bytes": parts
                .headers
                .get("x-forwarded-for")
                .map(|v| v.as_bytes().to_vec()),
            "proxy_authorization": header("proxy-authorization"),
            "x_custom": header("x-custom"),
        });

        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(echo.to_string())))
            .expect("test response must build")
    })
    .await
}

/// Starts a backend that sleeps for the given duration before responding.
pub async fn start_slow_backend(delay: Duration) -> (SocketAddr, oneshot::Sender<()>) {
    spawn_backend(move |_req| async move {
        tokio::time::sleep(delay).await;
        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain")
            .body(Full::new(Bytes::from("slow")))
            .expect("test response must build")
    })
    .await
}

/// Response body that yields one chunk and then never makes progress.
pub struct StallingBody {
    sent: bool,
}

impl Body for StallingBody {
    type Data = Bytes;
    type Error = std::convert::Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Self::Error>>> {
        if self.sent {
            return Poll::Pending;
        }
        self.sent = true;
        Poll::Ready(Some(Ok(Frame::data(Bytes::from_static(b"partial")))))
    }
}

/// Starts a backend that sends headers and a first chunk right away, then
/// stalls the rest of the body forever.
pub async fn start_stalling_backend() -> (SocketAddr, oneshot::Sender<()>) {
    spawn_backend(|_req| async {
        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain")
            .body(StallingBody { sent: false })
            .expect("test response must build")
    })
    .await
}

/// Returns a loopback address nothing is listening on.
pub async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind throwaway listener");
    listener.local_addr().unwrap()
}

/// Builds a request with an empty body.
pub fn empty_request(method: hyper::Method, uri: &str) -> Request<http_body_util::Empty<Bytes>> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(http_body_util::Empty::<Bytes>::new())
        .unwrap()
}

/// Parses a response body produced by [`start_echo_backend`].
pub async fn echo_json(body: BoxBody) -> serde_json::Value {
    let bytes = collect_body(body).await;
    serde_json::from_slice(&bytes).expect("echo backend returns JSON")
}
