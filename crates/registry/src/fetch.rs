//! Fetch-and-validate helpers shared by the registry sources

use crate::error::{RegistryError, Result};
use std::path::Path;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Remote registry fetches are bounded by this timeout; a slow registry is
/// treated as a failed refresh, never as a hung one.
pub(crate) const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// The registry wire format: a JSON array of objects.
pub(crate) fn is_array_of_objects_json(bytes: &[u8]) -> bool {
    serde_json::from_slice::<Vec<serde_json::Map<String, serde_json::Value>>>(bytes).is_ok()
}

/// Parse `source` as an absolute http(s) URL.
///
/// Anything without an explicit scheme (including plain file paths) is
/// rejected here so it can fall through to the file-path check.
pub(crate) fn parse_remote_url(source: &str) -> Option<Url> {
    Url::parse(source)
        .ok()
        .filter(|url| matches!(url.scheme(), "http" | "https"))
}

/// Read registry bytes from a local file and validate their shape.
pub(crate) fn read_from_file(path: &Path) -> Result<Vec<u8>> {
    let data = std::fs::read(path)?;
    if !is_array_of_objects_json(&data) {
        return Err(RegistryError::InvalidJson { origin: "file" });
    }
    Ok(data)
}

/// Fetch registry bytes from a remote URL and validate their shape.
pub(crate) async fn fetch_from_remote(client: &reqwest::Client, url: &Url) -> Result<Vec<u8>> {
    debug!(%url, "fetching registry");
    let response = client.get(url.clone()).send().await?.error_for_status()?;
    let body = response.bytes().await?;
    if !is_array_of_objects_json(&body) {
        return Err(RegistryError::InvalidJson { origin: "remote" });
    }
    Ok(body.to_vec())
}
