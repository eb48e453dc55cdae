//! TLS provisioning for the public-facing listener
//!
//! Two acquisition paths: a static certificate/key pair loaded from disk, or
//! ACME-managed issuance and renewal. Either failure is fatal to server
//! startup; the operator fixes configuration and restarts.

use crate::config::TlsSettings;
use crate::{DaemonError, Result};
use futures::StreamExt;
use rustls::ServerConfig;
use rustls::crypto::CryptoProvider;
use rustls_acme::caches::DirCache;
use rustls_acme::{AcmeAcceptor, AcmeConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info};

/// ALPN identifiers advertised by the TLS listener. `h2-14` is a draft-era
/// identifier kept only for compatibility with older HTTP/2 peers.
const ALPN_PROTOCOLS: [&[u8]; 3] = [b"http/1.1", b"h2", b"h2-14"];

/// How accepted connections are secured, produced before the listener starts.
pub enum TlsContext {
    Disabled,
    Static(TlsAcceptor),
    Automatic {
        acceptor: AcmeAcceptor,
        config: Arc<ServerConfig>,
    },
}

/// A provisioned TLS context plus the background task driving ACME
/// issuance/renewal when automatic TLS is active.
pub struct TlsProvision {
    pub context: TlsContext,
    pub acme_driver: Option<JoinHandle<()>>,
}

/// Build the TLS context for the configured settings.
///
/// # Errors
///
/// Returns [`DaemonError::TlsProvision`] when the static pair cannot be
/// loaded or the ACME configuration is unusable.
pub fn provision(settings: &TlsSettings) -> Result<TlsProvision> {
    match settings {
        TlsSettings::Disabled => Ok(TlsProvision {
            context: TlsContext::Disabled,
            acme_driver: None,
        }),
        TlsSettings::Static {
            cert_path,
            key_path,
        } => {
            let config = static_server_config(cert_path, key_path)?;
            Ok(TlsProvision {
                context: TlsContext::Static(TlsAcceptor::from(Arc::new(config))),
                acme_driver: None,
            })
        }
        TlsSettings::Automatic {
            domains,
            contact_email,
            use_staging,
        } => automatic_context(domains, contact_email.as_deref(), *use_staging),
    }
}

/// rustls configuration for a static certificate pair: TLS 1.2+, ECDHE-AES-GCM
/// suites only, HTTP/1.1 and HTTP/2 over ALPN.
fn static_server_config(cert_path: &Path, key_path: &Path) -> Result<ServerConfig> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<std::io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(DaemonError::TlsProvision(format!(
            "no certificates found in {}",
            cert_path.display()
        )));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| {
            DaemonError::TlsProvision(format!("no private key found in {}", key_path.display()))
        })?;

    let mut config = ServerConfig::builder_with_provider(Arc::new(restricted_provider()))
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|err| DaemonError::TlsProvision(err.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| DaemonError::TlsProvision(err.to_string()))?;
    config.alpn_protocols = alpn_protocols();
    Ok(config)
}

/// The ring provider restricted to AES-GCM suites with ECDHE key exchange
/// (plus the TLS 1.3 AES-GCM suites those sessions negotiate).
fn restricted_provider() -> CryptoProvider {
    use rustls::crypto::ring::{self, cipher_suite};

    CryptoProvider {
        cipher_suites: vec![
            cipher_suite::TLS13_AES_128_GCM_SHA256,
            cipher_suite::TLS13_AES_256_GCM_SHA384,
            cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
            cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
            cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        ],
        ..ring::default_provider()
    }
}

/// ACME-backed context: the certificate resolver serves whatever the ACME
/// state has issued, and the spawned driver keeps ordering and renewing for
/// the lifetime of the listener without further caller action.
fn automatic_context(
    domains: &[String],
    contact_email: Option<&str>,
    use_staging: bool,
) -> Result<TlsProvision> {
    if domains.is_empty() {
        return Err(DaemonError::TlsProvision(
            "automatic TLS requires at least one domain".into(),
        ));
    }

    let cache_dir = acme_cache_dir();
    info!(
        domains = ?domains,
        staging = use_staging,
        cache = %cache_dir.display(),
        "provisioning automatic TLS"
    );

    let mut acme_config = AcmeConfig::new(domains.to_vec())
        .cache(DirCache::new(cache_dir))
        .directory_lets_encrypt(!use_staging);
    if let Some(email) = contact_email {
        acme_config = acme_config.contact_push(format!("mailto:{email}"));
    }

    let mut state = acme_config.state();
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(state.resolver());
    config.alpn_protocols = alpn_protocols();
    let acceptor = state.acceptor();

    let acme_driver = tokio::spawn(async move {
        while let Some(event) = state.next().await {
            match event {
                Ok(ok) => info!(event = ?ok, "ACME event"),
                Err(err) => error!(error = %err, "ACME error"),
            }
        }
    });

    Ok(TlsProvision {
        context: TlsContext::Automatic {
            acceptor,
            config: Arc::new(config),
        },
        acme_driver: Some(acme_driver),
    })
}

fn alpn_protocols() -> Vec<Vec<u8>> {
    ALPN_PROTOCOLS.iter().map(|proto| proto.to_vec()).collect()
}

/// Certificate storage for the ACME account and issued certificates; the
/// cache layout itself is the ACME library's concern.
fn acme_cache_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "oniongate")
        .map(|dirs| dirs.data_dir().join("acme"))
        .unwrap_or_else(|| PathBuf::from("oniongate-acme"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn self_signed_pair() -> (tempfile::NamedTempFile, tempfile::NamedTempFile) {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
            .unwrap()
            .self_signed(&key_pair)
            .unwrap();
        let mut cert_file = tempfile::NamedTempFile::new().unwrap();
        cert_file.write_all(cert.pem().as_bytes()).unwrap();
        let mut key_file = tempfile::NamedTempFile::new().unwrap();
        key_file
            .write_all(key_pair.serialize_pem().as_bytes())
            .unwrap();
        (cert_file, key_file)
    }

    #[test]
    fn static_config_advertises_expected_alpn() {
        let (cert_file, key_file) = self_signed_pair();
        let config = static_server_config(cert_file.path(), key_file.path()).unwrap();
        assert_eq!(
            config.alpn_protocols,
            vec![b"http/1.1".to_vec(), b"h2".to_vec(), b"h2-14".to_vec()]
        );
    }

    #[test]
    fn missing_certificate_file_is_fatal() {
        let (_, key_file) = self_signed_pair();
        let err =
            static_server_config(Path::new("/does/not/exist.pem"), key_file.path()).unwrap_err();
        assert!(matches!(err, DaemonError::Io(_)));
    }

    #[test]
    fn garbage_key_material_is_fatal() {
        let (cert_file, _) = self_signed_pair();
        let mut bogus = tempfile::NamedTempFile::new().unwrap();
        bogus.write_all(b"this is not a pem key").unwrap();

        let err = static_server_config(cert_file.path(), bogus.path()).unwrap_err();
        assert!(matches!(err, DaemonError::TlsProvision(_)));
    }

    #[test]
    fn empty_certificate_file_is_fatal() {
        let (_, key_file) = self_signed_pair();
        let empty = tempfile::NamedTempFile::new().unwrap();

        let err = static_server_config(empty.path(), key_file.path()).unwrap_err();
        assert!(matches!(err, DaemonError::TlsProvision(_)));
    }
}
