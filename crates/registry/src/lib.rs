//! Registry sources for the oniongate reverse proxy
//!
//! A registry is the external source of truth listing known onion endpoints
//! as a JSON array of objects. This crate answers a single question for the
//! daemon: "where do the current registry bytes come from?" — a fixed value
//! supplied at startup, or a remote URL re-fetched on every call.

mod fetch;
mod source;

pub mod error;

pub use error::{RegistryError, Result};
pub use source::{Registry, RegistryType};
