//! Error types and HTTP status code mapping.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Response, StatusCode};

use crate::proxy::{BoxBody, StdError};

/// Every failure the proxy can produce, each mapping to a specific HTTP status.
#[derive(Debug)]
pub enum ProxyError {
    /// The configuration file could not be loaded, parsed, or validated.
    Config(String),
    /// The downstream target URI is malformed or unparseable.
    InvalidDownstream(String),
    /// The client exhausted the bucket for its rate-limit key.
    RateLimited {
        /// The key whose bucket overflowed.
        key: String,
    },
    /// The outbound request could not be constructed.
    DownstreamRequest(String),
    /// The inbound request body could not be read.
    BodyRead(String),
    /// The inbound request body exceeded the configured size limit.
    BodyTooLarge { limit: u64 },
    /// The downstream target was unreachable or the transfer failed.
    DownstreamUnavailable(String),
    /// The downstream round-trip exceeded the overall request timeout.
    DownstreamTimeout(Duration),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::InvalidDownstream(msg) => write!(f, "invalid downstream: {msg}"),
            Self::RateLimited { key } => write!(f, "rate limit exceeded for {key}"),
            Self::DownstreamRequest(msg) => {
                write!(f, "failed to create downstream request: {msg}")
            }
            Self::BodyRead(msg) => write!(f, "failed to read request body: {msg}"),
            Self::BodyTooLarge { limit } => {
                write!(f, "request body exceeds limit of {limit} bytes")
            }
            Self::DownstreamUnavailable(msg) => write!(f, "downstream unavailable: {msg}"),
            Self::DownstreamTimeout(after) => {
                write!(f, "downstream timed out after {after:?}")
            }
        }
    }
}

impl std::error::Error for ProxyError {}

impl ProxyError {
    /// Returns the HTTP status code corresponding to this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Config(_) | Self::InvalidDownstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::DownstreamRequest(_)
            | Self::BodyRead(_)
            | Self::DownstreamUnavailable(_)
            | Self::DownstreamTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// The fixed message placed in the `error` field of the JSON body.
    ///
    /// Clients only ever see these strings; the detailed cause goes to the log.
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::Config(_) | Self::InvalidDownstream(_) => "internal proxy error",
            Self::RateLimited { .. } => "rate limit exceeded; please wait 1sec and try again",
            Self::DownstreamRequest(_) | Self::BodyRead(_) => {
                "failed to create downstream request"
            }
            Self::BodyTooLarge { .. } => "request body too large",
            Self::DownstreamUnavailable(_) | Self::DownstreamTimeout(_) => {
                "downstream target unavailable"
            }
        }
    }

    /// Converts this error into an HTTP response with a JSON body.
    pub fn into_response(self) -> Response<BoxBody> {
        let body = serde_json::json!({ "error": self.public_message() }).to_string();

        let mut response = Response::new(
            Full::new(Bytes::from(body))
                .map_err(|never| -> StdError { match never {} })
                .boxed(),
        );
        *response.status_mut() = self.status_code();
        response.headers_mut().insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static("application/json"),
        );
        response
    }
}

impl From<hyper::header::InvalidHeaderValue> for ProxyError {
    fn from(err: hyper::header::InvalidHeaderValue) -> Self {
        Self::DownstreamRequest(err.to_string())
    }
}

impl From<hyper_util::client::legacy::Error> for ProxyError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        Self::DownstreamUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_of(resp: Response<BoxBody>) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn rate_limited_maps_to_429_with_fixed_body() {
        let resp = ProxyError::RateLimited {
            key: "GET:10.0.0.1".into(),
        }
        .into_response();

        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "application/json"
        );
        assert_eq!(
            body_of(resp).await,
            r#"{"error":"rate limit exceeded; please wait 1sec and try again"}"#
        );
    }

    #[tokio::test]
    async fn construction_failure_maps_to_503() {
        let resp = ProxyError::DownstreamRequest("bad uri".into()).into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            body_of(resp).await,
            r#"{"error":"failed to create downstream request"}"#
        );
    }

    #[tokio::test]
    async fn transport_failure_and_timeout_share_body() {
        for err in [
            ProxyError::DownstreamUnavailable("connection refused".into()),
            ProxyError::DownstreamTimeout(Duration::from_secs(10)),
        ] {
            let resp = err.into_response();
            assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
            assert_eq!(
                body_of(resp).await,
                r#"{"error":"downstream target unavailable"}"#
            );
        }
    }

    #[test]
    fn body_read_failure_is_service_unavailable() {
        let err = ProxyError::BodyRead("connection reset".into());
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.public_message(), "failed to create downstream request");
    }

    #[test]
    fn display_keeps_detail_for_logs() {
        let err = ProxyError::DownstreamUnavailable("connection refused".into());
        assert_eq!(err.to_string(), "downstream unavailable: connection refused");
    }
}
