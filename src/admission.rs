//! Admission control: derives the rate-limit key for a request and asks the
//! registry whether the request may proceed.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use hyper::Request;
use hyper::header::HeaderMap;

use crate::headers::X_FORWARDED_FOR;
use crate::rate_limit::{RateLimitKey, RateLimiterRegistry};

/// Outcome of an admission check. Both variants carry the key that was charged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allowed(RateLimitKey),
    Rejected(RateLimitKey),
}

impl Admission {
    pub fn key(&self) -> &RateLimitKey {
        match self {
            Self::Allowed(key) | Self::Rejected(key) => key,
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed(_))
    }
}

/// Decides allow/reject for each inbound request.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    registry: Arc<RateLimiterRegistry>,
}

impl AdmissionController {
    pub fn new(registry: Arc<RateLimiterRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<RateLimiterRegistry> {
        &self.registry
    }

    /// Charges the request against its bucket.
    ///
    /// The decision is made exactly once per request; there is no retry.
    pub fn admit<B>(&self, req: &Request<B>, client_addr: SocketAddr) -> Admission {
        let identity = client_identity(req.headers(), client_addr);
        let key = RateLimitKey::new(req.method().clone(), identity);

        match self.registry.acquire_for(&key) {
            Ok(()) => Admission::Allowed(key),
            Err(_) => Admission::Rejected(key),
        }
    }
}

/// The identity a client is rate limited under.
///
/// Uses the raw bytes of the inbound `X-Forwarded-For` value when it is
/// present and non-blank, otherwise the peer IP without its port.
pub fn client_identity(headers: &HeaderMap, client_addr: SocketAddr) -> Bytes {
    headers
        .get(X_FORWARDED_FOR)
        .map(|value| value.as_bytes().trim_ascii())
        .filter(|value| !value.is_empty())
        .map(Bytes::copy_from_slice)
        .unwrap_or_else(|| Bytes::from(client_addr.ip().to_string()))
}
