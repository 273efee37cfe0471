//! Forwarding dispatcher: rebuilds an admitted request against the fixed
//! downstream target, executes it on the shared client, and relays the
//! response.
//!
//! The inbound body is read fully (once) before the outbound request is
//! built. The downstream response body is streamed back without buffering.
//! A single deadline, fixed before the downstream call, bounds both the wait
//! for response headers and the relay of the response body.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Frame, SizeHint};
use hyper::http::uri::Authority;
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::Connect;
use tokio::time::{Instant, Sleep, sleep_until, timeout_at};
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::proxy::{BoxBody, StdError};
use crate::{ProxyError, Result, headers};

/// Sends admitted requests to the downstream target.
#[derive(Debug, Clone)]
pub struct Dispatcher<C> {
    client: Client<C, BoxBody>,
    downstream: Uri,
    request_timeout: Duration,
    max_body_size: u64,
}

impl<C> Dispatcher<C>
where
    C: Connect + Clone + Send + Sync + 'static,
{
    pub fn new(
        client: Client<C, BoxBody>,
        downstream: Uri,
        request_timeout: Duration,
        max_body_size: u64,
    ) -> Self {
        Self {
            client,
            downstream,
            request_timeout,
            max_body_size,
        }
    }

    pub fn from_config(config: &RuntimeConfig, client: Client<C, BoxBody>) -> Self {
        Self::new(
            client,
            config.downstream.clone(),
            config.timeouts.request,
            config.max_body_size,
        )
    }

    /// Forwards `req` downstream and returns the downstream response.
    ///
    /// Failures are never retried: a request that cannot be built or
    /// delivered resolves to a [`ProxyError`] for the caller to render.
    pub async fn forward<B>(
        &self,
        req: Request<B>,
        client_addr: SocketAddr,
    ) -> Result<Response<BoxBody>>
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<StdError>,
    {
        let (mut parts, body) = req.into_parts();

        let body = read_body(body, self.max_body_size).await?;

        let target = downstream_uri(&self.downstream, &parts.uri)?;
        let authority = target
            .authority()
            .cloned()
            .ok_or_else(|| ProxyError::DownstreamRequest("target has no authority".into()))?;

        headers::strip_hop_by_hop(&mut parts.headers);
        let forwarded_for = headers::append_forwarded_for(&mut parts.headers, client_addr)?;
        headers::rewrite_host(&mut parts.headers, &authority);
        parts.uri = target;

        tracing::Span::current().record(
            "forwarded_for_outgoing",
            &*String::from_utf8_lossy(forwarded_for.as_bytes()),
        );
        debug!(
            headers = ?parts.headers,
            downstream_uri = %parts.uri,
            body_len = body.len(),
            "forwarding request"
        );

        let outbound = Request::from_parts(
            parts,
            Full::new(body)
                .map_err(|never| -> StdError { match never {} })
                .boxed(),
        );

        let start = Instant::now();
        let deadline = start + self.request_timeout;
        let mut resp = match timeout_at(deadline, self.client.request(outbound)).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                warn!(
                    error = %e,
                    latency_ms = start.elapsed().as_millis() as u64,
                    downstream = %self.downstream,
                    "downstream request failed"
                );
                return Err(e.into());
            }
            Err(_elapsed) => {
                warn!(
                    timeout = ?self.request_timeout,
                    latency_ms = start.elapsed().as_millis() as u64,
                    downstream = %self.downstream,
                    "downstream request timed out"
                );
                return Err(ProxyError::DownstreamTimeout(self.request_timeout));
            }
        };

        info!(
            status = resp.status().as_u16(),
            latency_ms = start.elapsed().as_millis() as u64,
            downstream = %self.downstream,
            "downstream responded"
        );

        headers::strip_hop_by_hop(resp.headers_mut());

        let request_timeout = self.request_timeout;
        Ok(resp.map(|body| {
            let body = body.map_err(|e| -> StdError { Box::new(e) }).boxed();
            DeadlineBody::new(body, deadline, request_timeout).boxed()
        }))
    }
}

/// Relays a downstream body until the request deadline, then fails it.
///
/// A frame that is ready is always passed through; the deadline only fires
/// while the downstream is stalled.
struct DeadlineBody {
    inner: BoxBody,
    deadline: Pin<Box<Sleep>>,
    timeout: Duration,
    expired: bool,
}

impl DeadlineBody {
    fn new(inner: BoxBody, deadline: Instant, timeout: Duration) -> Self {
        Self {
            inner,
            deadline: Box::pin(sleep_until(deadline)),
            timeout,
            expired: false,
        }
    }
}

impl Body for DeadlineBody {
    type Data = Bytes;
    type Error = StdError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, StdError>>> {
        let this = self.get_mut();

        if this.expired {
            return Poll::Ready(None);
        }

        if let Poll::Ready(frame) = Pin::new(&mut this.inner).poll_frame(cx) {
            return Poll::Ready(frame);
        }

        match this.deadline.as_mut().poll(cx) {
            Poll::Ready(()) => {
                this.expired = true;
                warn!(timeout = ?this.timeout, "downstream body timed out");
                Poll::Ready(Some(Err(Box::new(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("downstream body not completed within {:?}", this.timeout),
                )))))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.expired || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Reads the whole inbound body, refusing to buffer more than `limit` bytes.
async fn read_body<B>(body: B, limit: u64) -> Result<Bytes>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<StdError>,
{
    let limit_usize = usize::try_from(limit).unwrap_or(usize::MAX);

    match Limited::new(body, limit_usize).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.is::<LengthLimitError>() => {
            warn!(limit, "request body exceeds size limit");
            Err(ProxyError::BodyTooLarge { limit })
        }
        Err(e) => {
            warn!(error = %e, "failed to read request body");
            Err(ProxyError::BodyRead(e.to_string()))
        }
    }
}

/// Appends the inbound path and query to the downstream base URI.
///
/// A base path on the downstream target is kept as a prefix, so
/// `http://backend/api` + `/users?id=1` becomes `http://backend/api/users?id=1`.
fn downstream_uri(downstream: &Uri, original: &Uri) -> Result<Uri> {
    let authority: &Authority = downstream
        .authority()
        .ok_or_else(|| ProxyError::DownstreamRequest("downstream has no authority".into()))?;
    let scheme = downstream.scheme_str().unwrap_or("http");

    let base_path = downstream.path().trim_end_matches('/');
    let path_and_query = original
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    format!("{scheme}://{authority}{base_path}{path_and_query}")
        .parse::<Uri>()
        .map_err(|e| ProxyError::DownstreamRequest(format!("failed to build downstream URI: {e}")))
}
