//! Outbound connector for the downstream client.
//!
//! Stacks three layers:
//!
//! - [`HttpConnector`] with an explicit TCP connect timeout.
//! - [`hyper_rustls::HttpsConnector`] for `https://` targets, verifying the
//!   server against the Mozilla root store from [`webpki_roots`]. Plain
//!   `http://` targets pass through unmodified.
//! - [`TimeoutConnector`], bounding the whole connection establishment by
//!   the connect timeout plus the TLS handshake timeout. Since the TCP stage
//!   alone is capped at the connect timeout, the TLS stage always gets at
//!   least the full handshake budget and never more than the combined one.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use hyper::Uri;
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::connect::HttpConnector;
use tower_service::Service;

use crate::proxy::StdError;

/// The connector stack used by the production downstream client.
pub type DownstreamConnector = TimeoutConnector<hyper_rustls::HttpsConnector<HttpConnector>>;

/// Bounds connection establishment of the wrapped connector.
#[derive(Debug, Clone)]
pub struct TimeoutConnector<C> {
    inner: C,
    timeout: Duration,
}

impl<C> TimeoutConnector<C> {
    pub fn new(inner: C, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl<C> Service<Uri> for TimeoutConnector<C>
where
    C: Service<Uri>,
    C::Future: Send + 'static,
    C::Error: Into<StdError>,
    C::Response: Send + 'static,
{
    type Response = C::Response;
    type Error = StdError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let timeout = self.timeout;
        let connecting = self.inner.call(dst);

        Box::pin(async move {
            match tokio::time::timeout(timeout, connecting).await {
                Ok(result) => result.map_err(Into::into),
                Err(_elapsed) => Err(Box::new(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connection not established within {timeout:?}"),
                )) as StdError),
            }
        })
    }
}

/// Builds the downstream connector stack.
pub fn build_connector(
    connect_timeout: Duration,
    tls_handshake_timeout: Duration,
) -> DownstreamConnector {
    let mut http = HttpConnector::new();
    http.set_connect_timeout(Some(connect_timeout));
    http.enforce_http(false);

    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    let https = HttpsConnectorBuilder::new()
        .with_tls_config(tls_config)
        .https_or_http()
        .enable_http1()
        .wrap_connector(http);

    TimeoutConnector::new(https, connect_timeout + tls_handshake_timeout)
}
