use anyhow::{Context, Result};
use clap::Parser;
use oniongate_daemon::updater::ErrorHandler;
use oniongate_daemon::{Cli, ProxyServer, TlsSettings, UpstreamClient};
use oniongate_registry::Registry;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize rustls crypto provider for TLS connections
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("oniongate=info")),
        )
        .init();

    let cli = Cli::parse();

    let tls = TlsSettings::from_cli(&cli)?;
    let registry = Registry::from_source(&cli.registry).context("resolving registry source")?;

    let upstream = UpstreamClient::socks5(&cli.socks5_hostname, cli.socks5_port).await?;

    let mut server = ProxyServer::new(upstream);
    server
        .with_registry(registry)
        .await
        .context("loading registry")?;

    let on_error: ErrorHandler = Arc::new(|err| warn!(error = %err, "registry refresh failed"));
    server.with_auto_update(
        Duration::from_secs(cli.auto_update_period * 60 * 60),
        on_error,
    );

    let addr = cli.listen_addr(&tls);
    server
        .serve(addr, &tls)
        .await
        .context("starting proxy server")?;

    shutdown_signal().await;
    info!("shutdown signal received");

    server.stop().await;
    Ok(())
}

/// Completes on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
