//! HTTP header processing: forwarded-chain rewriting, hop-by-hop removal,
//! and host rewriting.
//!
//! Implements the header-level requirements of RFC 7230 Section 6.1
//! (hop-by-hop header handling) and the de-facto `X-Forwarded-For`
//! convention for reverse proxies.

use std::net::SocketAddr;

use hyper::header::{HeaderMap, HeaderName, HeaderValue, InvalidHeaderValue};
use hyper::http::uri::Authority;

/// The forwarded-chain header, read for client identity and rewritten on
/// every forwarded request.
pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Removes all hop-by-hop headers from the given header map.
///
/// Strips the standard set defined in RFC 7230 Section 6.1 (`Connection`,
/// `Keep-Alive`, `Proxy-Authenticate`, `Proxy-Authorization`, `TE`,
/// `Trailers`, `Transfer-Encoding`, `Upgrade`), plus any additional
/// header names declared in the `Connection` header value.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let conn: Vec<HeaderName> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|val| val.to_str().ok())
        .flat_map(|val| val.split(','))
        .filter_map(|s| HeaderName::from_bytes(s.trim().as_bytes()).ok())
        .collect();

    conn.iter().for_each(|name| {
        headers.remove(name);
    });

    [
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailers",
        "transfer-encoding",
        "upgrade",
    ]
    .iter()
    .for_each(|name| {
        headers.remove(*name);
    });
}

/// Extends the `X-Forwarded-For` chain with the immediate peer.
///
/// If the inbound request carried a non-blank value, `", " + client_addr` is
/// appended to its raw bytes; otherwise the header is set to `client_addr`.
/// The peer is written as the full socket address. Returns the value that
/// was set.
pub fn append_forwarded_for(
    headers: &mut HeaderMap,
    client_addr: SocketAddr,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let peer = client_addr.to_string();

    let chain = match headers.get(&X_FORWARDED_FOR) {
        Some(existing) if !existing.as_bytes().trim_ascii().is_empty() => {
            let mut chain = Vec::with_capacity(existing.len() + 2 + peer.len());
            chain.extend_from_slice(existing.as_bytes());
            chain.extend_from_slice(b", ");
            chain.extend_from_slice(peer.as_bytes());
            HeaderValue::from_bytes(&chain)?
        }
        _ => HeaderValue::from_str(&peer)?,
    };

    headers.insert(X_FORWARDED_FOR, chain.clone());
    Ok(chain)
}

/// Rewrites the `Host` header to match the downstream authority.
pub fn rewrite_host(headers: &mut HeaderMap, downstream_auth: &Authority) {
    if let Ok(val) = HeaderValue::from_str(downstream_auth.as_str()) {
        headers.insert(hyper::header::HOST, val);
    }
}
