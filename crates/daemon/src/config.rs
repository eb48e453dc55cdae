//! CLI surface and TLS settings validation

use crate::{DaemonError, Result};
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Port the TLS listener binds to; TLS-ALPN-01 challenges only work on 443.
const HTTPS_PORT: u16 = 443;

/// Reverse proxy exposing onion services to ordinary HTTP(S) clients
#[derive(Parser, Debug, Clone)]
#[command(name = "oniongate", version, about, long_about = None)]
pub struct Cli {
    /// JSON string, file path or URL with the list of onion endpoints
    #[arg(long)]
    pub registry: String,

    /// Domain to obtain and renew an automatic TLS certificate for (repeatable)
    #[arg(long = "domain")]
    pub domains: Vec<String>,

    /// ACME contact email for automatic TLS
    #[arg(long)]
    pub email: Option<String>,

    /// Path to a static TLS certificate chain (requires --tls-key-path)
    #[arg(long = "tls-cert-path")]
    pub tls_cert_path: Option<PathBuf>,

    /// Path to the static TLS private key (requires --tls-cert-path)
    #[arg(long = "tls-key-path")]
    pub tls_key_path: Option<PathBuf>,

    /// Disable TLS and listen in cleartext on localhost
    #[arg(long, default_value_t = false)]
    pub insecure: bool,

    /// Cleartext listening port
    #[arg(long, default_value_t = 7070)]
    pub port: u16,

    /// Hostname of the SOCKS5 endpoint exposed by the Tor client
    #[arg(long = "socks5-hostname", default_value = "127.0.0.1")]
    pub socks5_hostname: String,

    /// Port of the SOCKS5 endpoint exposed by the Tor client
    #[arg(long = "socks5-port", default_value_t = 9050)]
    pub socks5_port: u16,

    /// Hours between registry refreshes for remote registries
    #[arg(long = "auto-update-period", default_value_t = 12)]
    pub auto_update_period: u64,

    /// Use the Let's Encrypt staging CA for automatic TLS
    #[arg(long = "acme-staging", default_value_t = false)]
    pub acme_staging: bool,
}

impl Cli {
    /// The address the proxy listens on: localhost for cleartext, the HTTPS
    /// port on all interfaces when TLS is active.
    pub fn listen_addr(&self, tls: &TlsSettings) -> SocketAddr {
        match tls {
            TlsSettings::Disabled => {
                SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.port)
            }
            _ => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), HTTPS_PORT),
        }
    }
}

/// How the public-facing listener is secured. Exactly one variant is active
/// per running server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsSettings {
    /// Cleartext listener, no TLS.
    Disabled,
    /// Operator-supplied certificate chain and private key.
    Static {
        cert_path: PathBuf,
        key_path: PathBuf,
    },
    /// ACME-managed issuance and renewal for a set of domains.
    Automatic {
        domains: Vec<String>,
        contact_email: Option<String>,
        use_staging: bool,
    },
}

impl TlsSettings {
    /// Derive the TLS mode from the parsed flags, rejecting inconsistent
    /// combinations before anything binds.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::Config`] when only one of the static pair is
    /// given, when TLS is enabled with no certificate source, when
    /// `--insecure` contradicts a certificate source, or when a domain is
    /// not syntactically valid.
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        match (&cli.tls_cert_path, &cli.tls_key_path) {
            (Some(cert_path), Some(key_path)) => {
                if cli.insecure {
                    return Err(DaemonError::Config(
                        "--insecure cannot be combined with a static certificate pair".into(),
                    ));
                }
                Ok(Self::Static {
                    cert_path: cert_path.clone(),
                    key_path: key_path.clone(),
                })
            }
            (Some(_), None) | (None, Some(_)) => Err(DaemonError::Config(
                "--tls-cert-path and --tls-key-path must be given together".into(),
            )),
            (None, None) if !cli.domains.is_empty() => {
                if cli.insecure {
                    return Err(DaemonError::Config(
                        "--insecure cannot be combined with --domain".into(),
                    ));
                }
                for domain in &cli.domains {
                    if !is_valid_domain(domain) {
                        return Err(DaemonError::Config(format!(
                            "invalid domain for automatic TLS: {domain:?}"
                        )));
                    }
                }
                Ok(Self::Automatic {
                    domains: cli.domains.clone(),
                    contact_email: cli.email.clone(),
                    use_staging: cli.acme_staging,
                })
            }
            (None, None) if cli.insecure => Ok(Self::Disabled),
            (None, None) => Err(DaemonError::Config(
                "TLS requires --domain for automatic issuance or a \
                 --tls-cert-path/--tls-key-path pair; pass --insecure to serve cleartext"
                    .into(),
            )),
        }
    }
}

/// Minimal domain-name syntax check: dot-separated labels of letters, digits
/// and interior hyphens.
fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > 253 || !domain.contains('.') {
        return false;
    }
    domain.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["oniongate", "--registry", "[]"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults_match_the_documented_surface() {
        let cli = cli(&["--insecure"]);
        assert_eq!(cli.port, 7070);
        assert_eq!(cli.socks5_hostname, "127.0.0.1");
        assert_eq!(cli.socks5_port, 9050);
        assert_eq!(cli.auto_update_period, 12);
    }

    #[test]
    fn no_tls_source_and_not_insecure_is_rejected() {
        let err = TlsSettings::from_cli(&cli(&[])).unwrap_err();
        assert!(matches!(err, DaemonError::Config(_)));
    }

    #[test]
    fn half_a_certificate_pair_is_rejected() {
        let err = TlsSettings::from_cli(&cli(&["--tls-cert-path", "/tmp/cert.pem"])).unwrap_err();
        assert!(matches!(err, DaemonError::Config(_)));
        let err = TlsSettings::from_cli(&cli(&["--tls-key-path", "/tmp/key.pem"])).unwrap_err();
        assert!(matches!(err, DaemonError::Config(_)));
    }

    #[test]
    fn full_pair_selects_static_tls() {
        let settings = TlsSettings::from_cli(&cli(&[
            "--tls-cert-path",
            "/tmp/cert.pem",
            "--tls-key-path",
            "/tmp/key.pem",
        ]))
        .unwrap();
        assert!(matches!(settings, TlsSettings::Static { .. }));
    }

    #[test]
    fn domains_select_automatic_tls() {
        let parsed = cli(&[
            "--domain",
            "proxy.example.com",
            "--email",
            "ops@example.com",
            "--acme-staging",
        ]);
        let settings = TlsSettings::from_cli(&parsed).unwrap();
        match settings {
            TlsSettings::Automatic {
                domains,
                contact_email,
                use_staging,
            } => {
                assert_eq!(domains, vec!["proxy.example.com"]);
                assert_eq!(contact_email.as_deref(), Some("ops@example.com"));
                assert!(use_staging);
            }
            other => panic!("expected automatic TLS, got {other:?}"),
        }
    }

    #[test]
    fn invalid_domain_is_rejected() {
        let err = TlsSettings::from_cli(&cli(&["--domain", "no spaces allowed"])).unwrap_err();
        assert!(matches!(err, DaemonError::Config(_)));
        let err = TlsSettings::from_cli(&cli(&["--domain", "nodots"])).unwrap_err();
        assert!(matches!(err, DaemonError::Config(_)));
    }

    #[test]
    fn insecure_conflicts_with_certificate_sources() {
        let err =
            TlsSettings::from_cli(&cli(&["--insecure", "--domain", "proxy.example.com"]))
                .unwrap_err();
        assert!(matches!(err, DaemonError::Config(_)));
    }

    #[test]
    fn listen_addr_depends_on_tls_mode() {
        let parsed = cli(&["--insecure", "--port", "8181"]);
        assert_eq!(
            parsed.listen_addr(&TlsSettings::Disabled).to_string(),
            "127.0.0.1:8181"
        );
        let automatic = TlsSettings::Automatic {
            domains: vec!["proxy.example.com".into()],
            contact_email: None,
            use_staging: false,
        };
        assert_eq!(
            parsed.listen_addr(&automatic).to_string(),
            "0.0.0.0:443"
        );
    }

    #[test]
    fn domain_syntax_checks() {
        assert!(is_valid_domain("proxy.example.com"));
        assert!(is_valid_domain("a-b.example.io"));
        assert!(!is_valid_domain(""));
        assert!(!is_valid_domain("-bad.example.com"));
        assert!(!is_valid_domain("bad-.example.com"));
        assert!(!is_valid_domain("exa mple.com"));
    }
}
