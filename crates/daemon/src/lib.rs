//! Oniongate daemon: a reverse proxy from cleartext/TLS HTTP to onion services
//!
//! The daemon terminates ordinary HTTP(S) connections on a public address and
//! tunnels every upstream request through a SOCKS5 proxy to the onion service
//! selected by the request's leading path segment. The set of known onion
//! endpoints comes from a registry source and can be refreshed periodically
//! while the server is live.

pub mod config;
pub mod dispatch;
pub mod sanitize;
pub mod server;
pub mod table;
pub mod tls;
pub mod updater;

pub use config::{Cli, TlsSettings};
pub use dispatch::UpstreamClient;
pub use server::ProxyServer;
pub use table::{RedirectEntry, RedirectTable};
pub use updater::AutoUpdater;

use oniongate_registry::RegistryError;

/// Result type for daemon operations
pub type Result<T> = std::result::Result<T, DaemonError>;

/// Daemon error types
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("malformed registry payload: {0}")]
    MalformedRegistry(#[source] serde_json::Error),

    #[error("no onion endpoints found in registry")]
    NoEndpoints,

    #[error("invalid endpoint URL {endpoint:?}: {source}")]
    InvalidEndpointUrl {
        endpoint: String,
        source: url::ParseError,
    },

    #[error("SOCKS5 endpoint unreachable at {addr}: {source}")]
    DialSetup {
        addr: String,
        source: std::io::Error,
    },

    #[error("TLS provisioning failed: {0}")]
    TlsProvision(String),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
