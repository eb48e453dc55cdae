//! Registry error types

use thiserror::Error;

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Errors raised while resolving or fetching a registry source
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(
        "registry source must be a JSON array of objects, a remote URL or a path to a JSON file"
    )]
    UnrecognizedSource,

    #[error("invalid JSON from {origin}: expected an array of objects")]
    InvalidJson { origin: &'static str },

    #[error("failed to load registry file: {0}")]
    File(#[from] std::io::Error),

    #[error("registry fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("failed to build registry HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}
