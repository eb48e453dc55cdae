//! Registry source variants and detection

use crate::error::{RegistryError, Result};
use crate::fetch;
use std::path::Path;
use url::Url;

/// Tag describing where registry bytes come from.
///
/// The daemon uses this to decide whether periodic auto-updating is
/// meaningful: a constant registry never changes, so only remote sources are
/// worth polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryType {
    Constant,
    Remote,
}

/// A source of registry bytes.
///
/// `Constant` is immutable once created; `Remote` re-fetches its URL on every
/// [`Registry::get_json`] call, bounded by a 5-second timeout.
#[derive(Debug, Clone)]
pub enum Registry {
    Constant {
        json: Vec<u8>,
    },
    Remote {
        url: Url,
        client: reqwest::Client,
    },
}

impl Registry {
    /// Resolve a registry from an operator-supplied source string.
    ///
    /// The input is inspected in fixed priority order: (1) is it itself a
    /// JSON array of objects, (2) is it an absolute http(s) URL, (3) does it
    /// name an existing file whose contents validate as the wire format.
    /// Anything else is a configuration error.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnrecognizedSource`] when the input matches
    /// none of the three forms, or a file/validation error when a named file
    /// cannot be read or does not hold an array of objects.
    pub fn from_source(source: &str) -> Result<Self> {
        if fetch::is_array_of_objects_json(source.as_bytes()) {
            return Ok(Self::constant(source.as_bytes().to_vec()));
        }

        if let Some(url) = fetch::parse_remote_url(source) {
            return Self::remote(url);
        }

        if Path::new(source).exists() {
            return Self::from_file(Path::new(source));
        }

        Err(RegistryError::UnrecognizedSource)
    }

    /// A registry that always returns the same JSON value.
    pub fn constant(json: Vec<u8>) -> Self {
        Self::Constant { json }
    }

    /// A registry fetched from a remote URL on every `get_json` call.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn remote(url: Url) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(fetch::FETCH_TIMEOUT)
            .build()
            .map_err(RegistryError::Client)?;
        Ok(Self::Remote { url, client })
    }

    /// A constant registry loaded from a local file, validated on load.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = fetch::read_from_file(path)?;
        Ok(Self::Constant { json })
    }

    /// The source tag for this registry.
    pub fn registry_type(&self) -> RegistryType {
        match self {
            Self::Constant { .. } => RegistryType::Constant,
            Self::Remote { .. } => RegistryType::Remote,
        }
    }

    /// Current registry bytes.
    ///
    /// Constant sources return their stored value; remote sources perform a
    /// fresh fetch and validate the response shape.
    ///
    /// # Errors
    ///
    /// Returns a fetch or validation error for remote sources; constant
    /// sources never fail.
    pub async fn get_json(&self) -> Result<Vec<u8>> {
        match self {
            Self::Constant { json } => Ok(json.clone()),
            Self::Remote { url, client } => fetch::fetch_from_remote(client, url).await,
        }
    }
}
