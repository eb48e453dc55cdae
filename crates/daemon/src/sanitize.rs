//! Request sanitization applied once before proxying
//!
//! Mirrors the hop-by-hop handling a well-behaved reverse proxy performs:
//! strip headers that only describe the client-facing hop, preserve protocol
//! upgrades, and record the observed client on the forwarding headers.

use crate::Result;
use http::HeaderMap;
use http::header::{CONNECTION, UPGRADE, USER_AGENT};

/// Hop-by-hop headers, removed before forwarding to the backend. As of RFC
/// 7230 hop-by-hop headers are required to appear in the `Connection` header
/// field; these are the legacy RFC 2616 names kept for backward
/// compatibility. `Proxy-Connection` is non-standard but still sent by
/// libcurl.
const HOP_HEADERS: [&str; 10] = [
    "alt-svc",
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Prepare request headers for proxying. Mutates `headers` in place and
/// should run exactly once per request, before dispatch; the transform is
/// idempotent. `remote_addr` is the observed peer in `host:port` form;
/// `tls_terminated` records whether the inbound connection arrived over TLS.
///
/// An address that cannot be split into host and port skips the
/// `X-Forwarded-For` merge without failing the request; proxying is never
/// aborted over a formatting problem in a non-critical header.
pub fn prepare_request(
    headers: &mut HeaderMap,
    remote_addr: &str,
    tls_terminated: bool,
) -> Result<()> {
    // If the client did not set a User-Agent, pin it to empty so the HTTP
    // client library does not inject its own default.
    if !headers.contains_key(USER_AGENT) {
        headers.insert(USER_AGENT, http::HeaderValue::from_static(""));
    }

    // Upgrade intent must be read before the Connection-named and hop-by-hop
    // stripping below removes the evidence.
    let upgrade = upgrade_type(headers);
    remove_connection_named_headers(headers);

    for name in HOP_HEADERS {
        let Some(value) = headers.get(name) else {
            continue;
        };
        // Te: trailers survives: it signals trailer-handling capability to
        // backends that care, not a per-hop forwarding detail.
        if name == "te"
            && value
                .to_str()
                .is_ok_and(|v| v.eq_ignore_ascii_case("trailers"))
        {
            continue;
        }
        headers.remove(name);
    }

    // Restore the headers needed for protocol upgrades such as websockets.
    if let Some(protocol) = upgrade {
        headers.insert(CONNECTION, http::HeaderValue::from_static("Upgrade"));
        if let Ok(value) = http::HeaderValue::from_str(&protocol) {
            headers.insert(UPGRADE, value);
        }
    }

    if let Some(client_ip) = host_of(remote_addr) {
        // If we aren't the first proxy, retain prior X-Forwarded-For
        // information as a comma+space separated list and fold multiple
        // headers into one.
        let prior: Vec<&str> = headers
            .get_all(X_FORWARDED_FOR)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        let chain = if prior.is_empty() {
            client_ip.to_string()
        } else {
            format!("{}, {}", prior.join(", "), client_ip)
        };
        if let Ok(value) = http::HeaderValue::from_str(&chain) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }

    if !headers.contains_key(X_FORWARDED_PROTO) {
        let proto = if tls_terminated { "https" } else { "http" };
        headers.insert(X_FORWARDED_PROTO, http::HeaderValue::from_static(proto));
    }

    Ok(())
}

/// The lowercased upgrade protocol, when the `Connection` header names the
/// `Upgrade` token.
fn upgrade_type(headers: &HeaderMap) -> Option<String> {
    let mentions_upgrade = headers.get_all(CONNECTION).iter().any(|value| {
        value.to_str().is_ok_and(|v| {
            v.split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        })
    });
    if !mentions_upgrade {
        return None;
    }
    headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_lowercase)
}

/// Remove hop-by-hop headers listed in the `Connection` header itself.
/// See RFC 7230, section 6.1.
fn remove_connection_named_headers(headers: &mut HeaderMap) {
    let named: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_lowercase())
        .filter(|token| !token.is_empty())
        .collect();
    for name in named {
        headers.remove(name.as_str());
    }
}

/// Split `host:port`, returning the host part. Handles bracketed IPv6
/// literals; returns `None` when no port separator is present.
fn host_of(remote_addr: &str) -> Option<&str> {
    if let Some(rest) = remote_addr.strip_prefix('[') {
        let end = rest.find(']')?;
        return Some(&rest[..end]);
    }
    let (host, port) = remote_addr.rsplit_once(':')?;
    if host.is_empty() || port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(host)
}
