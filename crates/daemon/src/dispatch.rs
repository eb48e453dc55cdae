//! Upstream dispatch through a shared SOCKS5-proxied HTTP client

use crate::table::RedirectEntry;
use crate::{DaemonError, Result, sanitize};
use axum::body::Body;
use axum::response::{IntoResponse, Response};
use http::header::{CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderValue, StatusCode};
use tokio::net::TcpStream;
use tracing::{debug, warn};
use url::Url;

/// Response headers describing the proxy-to-upstream hop; never copied back
/// to the client.
const RESPONSE_HOP_HEADERS: [&str; 6] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "trailer",
    "upgrade",
];

/// Shared HTTP client used for every upstream request.
///
/// The client is immutable after construction and shared across all routes
/// and request tasks; its connection pool amortizes SOCKS5 session setup per
/// connection rather than per request.
#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
}

impl UpstreamClient {
    /// Build a client that tunnels every request through the SOCKS5 proxy at
    /// `host:port`, resolving hostnames on the proxy side so onion addresses
    /// never hit local DNS.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::DialSetup`] when nothing accepts TCP
    /// connections at the SOCKS5 address; an unreachable proxy is fatal at
    /// startup rather than discovered on the first request.
    pub async fn socks5(host: &str, port: u16) -> Result<Self> {
        let addr = format!("{host}:{port}");
        TcpStream::connect(&addr)
            .await
            .map_err(|source| DaemonError::DialSetup {
                addr: addr.clone(),
                source,
            })?;

        let proxy = reqwest::Proxy::all(format!("socks5h://{addr}"))
            .map_err(|err| DaemonError::Config(format!("invalid SOCKS5 address {addr}: {err}")))?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .build()
            .map_err(|err| {
                DaemonError::Config(format!("failed to build upstream HTTP client: {err}"))
            })?;

        debug!(%addr, "SOCKS5 endpoint reachable");
        Ok(Self::new(client))
    }

    /// Wrap an already-configured client. The proxy core only needs "some
    /// way to dial upstream hosts"; how that client reaches the Tor network
    /// is the caller's concern.
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Forward a request to `entry`'s upstream with the route label already
    /// matched. Upstream failures become a 502 for this request only.
    pub async fn proxy_request(
        &self,
        entry: &RedirectEntry,
        req: axum::extract::Request,
        remote_addr: &str,
        tls_terminated: bool,
    ) -> Response {
        let (parts, body) = req.into_parts();
        let mut headers = parts.headers;

        // Captured before sanitization strips the evidence.
        let forwarded_host = headers
            .get(HOST)
            .cloned()
            .or_else(|| {
                parts
                    .uri
                    .authority()
                    .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
            });
        let has_body = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .is_some_and(|n| n > 0)
            || headers.contains_key(TRANSFER_ENCODING);

        if let Err(err) = sanitize::prepare_request(&mut headers, remote_addr, tls_terminated) {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("request preparation in reverse proxy: {err}"),
            )
                .into_response();
        }

        if let Some(host) = forwarded_host {
            headers.insert("x-forwarded-host", host);
        }
        if let Ok(origin) = HeaderValue::from_str(entry.host()) {
            headers.insert("x-origin-host", origin);
        }
        // Host is derived from the target URL so the onion service's own
        // virtual hosting sees the name it expects.
        headers.remove(HOST);

        let label = entry.route_label();
        let target = match build_target(entry, &label, parts.uri.path(), parts.uri.query()) {
            Ok(target) => target,
            Err(err) => {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("building upstream target: {err}"),
                )
                    .into_response();
            }
        };

        debug!(method = %parts.method, %target, "proxying request");

        let mut request = self.client.request(parts.method, target).headers(headers);
        if has_body {
            request = request.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        let upstream_response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(host = entry.host(), error = %err, "upstream request failed");
                return (StatusCode::BAD_GATEWAY, format!("upstream request failed: {err}"))
                    .into_response();
            }
        };

        let status = upstream_response.status();
        let mut response_headers = http::HeaderMap::new();
        for (name, value) in upstream_response.headers() {
            if !RESPONSE_HOP_HEADERS.contains(&name.as_str()) {
                response_headers.insert(name.clone(), value.clone());
            }
        }

        let mut response = Response::new(Body::from_stream(upstream_response.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        response
    }
}

/// The rewritten upstream target: plaintext scheme, the entry's onion host,
/// and the request path with the public route label stripped.
fn build_target(
    entry: &RedirectEntry,
    label: &str,
    path: &str,
    query: Option<&str>,
) -> Result<Url> {
    let prefix = format!("/{label}");
    let rest = path.strip_prefix(&prefix).unwrap_or(path);
    let rest = if rest.is_empty() { "/" } else { rest };

    let mut target = format!("http://{}{}", entry.host(), rest);
    if let Some(query) = query {
        target.push('?');
        target.push_str(query);
    }
    Url::parse(&target).map_err(|source| DaemonError::InvalidEndpointUrl {
        endpoint: target.clone(),
        source,
    })
}
