//! Redirect table mapping public route labels to upstream onion URLs

use crate::{DaemonError, Result};
use serde_json::Value;
use url::Url;

/// Substring that qualifies a registry endpoint as onion-addressed.
const ONION_MARKER: &str = "onion";

/// Hostname suffix stripped when deriving the public route label.
const ONION_SUFFIX: &str = ".onion";

/// One route: an onion host and the upstream URL it was first seen with.
#[derive(Debug, Clone)]
pub struct RedirectEntry {
    host: String,
    upstream: Url,
}

impl RedirectEntry {
    pub fn new(host: String, upstream: Url) -> Self {
        Self { host, upstream }
    }

    /// Full upstream host, port included when the endpoint carried one.
    /// This is the entry's identity within a table.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn upstream(&self) -> &Url {
        &self.upstream
    }

    /// The public path prefix label: the host with its port and the `.onion`
    /// suffix stripped. A request to `/<label>/rest` is forwarded to this
    /// entry's upstream with path `/rest`.
    pub fn route_label(&self) -> String {
        let without_port = self.host.split(':').next().unwrap_or(&self.host);
        without_port
            .strip_suffix(ONION_SUFFIX)
            .unwrap_or(without_port)
            .to_string()
    }
}

/// Ordered, deduplicated mapping from onion host to upstream URL.
///
/// The table only grows: rebuilding from a new registry snapshot appends
/// hosts it has not seen before and never removes or re-points an existing
/// route, so routes stay stable across refreshes for the table's lifetime.
#[derive(Debug, Default)]
pub struct RedirectTable {
    entries: Vec<RedirectEntry>,
}

impl RedirectTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest a raw registry payload, appending routes for endpoints whose
    /// host is not already known. Returns the number of routes appended.
    ///
    /// The payload must decode as a JSON array of objects; only `endpoint`
    /// values containing the onion marker qualify. All qualifying endpoints
    /// are parsed before the table is touched, so a malformed URL abandons
    /// the whole batch without partial application.
    ///
    /// # Errors
    ///
    /// [`DaemonError::MalformedRegistry`] when the payload is not an array of
    /// objects, [`DaemonError::NoEndpoints`] when no endpoint qualifies (the
    /// existing table is left untouched), and
    /// [`DaemonError::InvalidEndpointUrl`] when a qualifying endpoint does
    /// not parse as a URL.
    pub fn ingest(&mut self, raw: &[u8]) -> Result<usize> {
        let records: Vec<serde_json::Map<String, Value>> =
            serde_json::from_slice(raw).map_err(DaemonError::MalformedRegistry)?;

        let endpoints: Vec<&str> = records
            .iter()
            .filter_map(|record| record.get("endpoint").and_then(Value::as_str))
            .filter(|endpoint| endpoint.contains(ONION_MARKER))
            .collect();

        if endpoints.is_empty() {
            return Err(DaemonError::NoEndpoints);
        }

        let mut parsed = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let url = Url::parse(endpoint).map_err(|source| DaemonError::InvalidEndpointUrl {
                endpoint: endpoint.to_string(),
                source,
            })?;
            let host = match (url.host_str(), url.port()) {
                (Some(host), Some(port)) => format!("{host}:{port}"),
                (Some(host), None) => host.to_string(),
                (None, _) => {
                    return Err(DaemonError::InvalidEndpointUrl {
                        endpoint: endpoint.to_string(),
                        source: url::ParseError::EmptyHost,
                    });
                }
            };
            parsed.push(RedirectEntry::new(host, url));
        }

        let mut appended = 0;
        for entry in parsed {
            if !self.contains_host(entry.host()) {
                self.entries.push(entry);
                appended += 1;
            }
        }
        Ok(appended)
    }

    /// Look up an entry by its public route label.
    pub fn find(&self, label: &str) -> Option<&RedirectEntry> {
        self.entries
            .iter()
            .find(|entry| entry.route_label() == label)
    }

    pub fn entries(&self) -> &[RedirectEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn contains_host(&self, host: &str) -> bool {
        self.entries.iter().any(|entry| entry.host() == host)
    }
}
