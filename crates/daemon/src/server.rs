//! Proxy server lifecycle: listener, routing and shutdown

use crate::config::TlsSettings;
use crate::dispatch::UpstreamClient;
use crate::table::RedirectTable;
use crate::tls::{self, TlsContext};
use crate::updater::{AutoUpdater, ErrorHandler};
use crate::Result;
use axum::Router;
use axum::extract::{ConnectInfo, Request, State};
use axum::response::{IntoResponse, Response};
use http::{HeaderValue, Method, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use oniongate_registry::{Registry, RegistryType};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tokio_util::compat::{FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tower::Service;
use tracing::{debug, info, warn};

/// Connection-scoped marker: whether this connection was TLS-terminated.
/// Read by the handler to derive `X-Forwarded-Proto`.
#[derive(Debug, Clone, Copy)]
struct TlsTerminated(bool);

/// State shared by every request task: the live redirect table and the
/// SOCKS5-proxied upstream client.
#[derive(Clone)]
struct ProxyState {
    table: Arc<RwLock<RedirectTable>>,
    upstream: UpstreamClient,
}

/// The reverse proxy: one listener, one redirect table, one shared upstream
/// client and at most one auto-updater task.
///
/// Assembled in sequence: configure the upstream client, attach the
/// registry, optionally start auto-updating, then serve. [`ProxyServer::stop`]
/// closes the listener and blocks until the background tasks have exited.
pub struct ProxyServer {
    table: Arc<RwLock<RedirectTable>>,
    upstream: UpstreamClient,
    registry: Option<Registry>,
    updater: Option<AutoUpdater>,
    shutdown_tx: watch::Sender<bool>,
    accept_handle: Option<JoinHandle<()>>,
    acme_driver: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl ProxyServer {
    pub fn new(upstream: UpstreamClient) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            table: Arc::new(RwLock::new(RedirectTable::new())),
            upstream,
            registry: None,
            updater: None,
            shutdown_tx,
            accept_handle: None,
            acme_driver: None,
            local_addr: None,
        }
    }

    /// Attach the registry and perform the initial load. The server refuses
    /// to start without at least one route, so any ingestion error here is
    /// fatal.
    ///
    /// # Errors
    ///
    /// Propagates registry fetch errors and table ingestion errors.
    pub async fn with_registry(&mut self, registry: Registry) -> Result<()> {
        let raw = registry.get_json().await?;
        let appended = self.table.write().await.ingest(&raw)?;
        info!(routes = appended, "loaded initial registry");
        self.registry = Some(registry);
        Ok(())
    }

    /// Start the periodic registry refresh. A no-op for constant registries,
    /// where polling could never observe a change.
    pub fn with_auto_update(&mut self, period: Duration, on_error: ErrorHandler) {
        let Some(registry) = &self.registry else {
            warn!("auto-update requested before a registry was attached; ignoring");
            return;
        };
        if registry.registry_type() != RegistryType::Remote {
            debug!("constant registry source; auto-update skipped");
            return;
        }
        if self.updater.is_some() {
            warn!("auto-updater already running");
            return;
        }
        self.updater = Some(AutoUpdater::start(
            registry.clone(),
            self.table.clone(),
            period,
            on_error,
        ));
    }

    /// Provision TLS, bind the listener and start accepting connections.
    /// Returns once the accept loop is running.
    ///
    /// # Errors
    ///
    /// TLS provisioning failures and bind errors are fatal and surfaced here.
    pub async fn serve(&mut self, addr: SocketAddr, settings: &TlsSettings) -> Result<()> {
        let provision = tls::provision(settings)?;
        self.acme_driver = provision.acme_driver;

        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);

        {
            let table = self.table.read().await;
            for entry in table.entries() {
                info!(
                    route = format!("/{}", entry.route_label()),
                    upstream = %entry.upstream(),
                    "registered route"
                );
            }
        }
        info!(
            %local_addr,
            tls = !matches!(settings, TlsSettings::Disabled),
            "serving oniongate"
        );

        let state = ProxyState {
            table: self.table.clone(),
            upstream: self.upstream.clone(),
        };
        let router = Router::new().fallback(proxy_handler).with_state(state);

        let context = Arc::new(provision.context);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("listener shutting down");
                            break;
                        }
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                let router = router.clone();
                                let context = context.clone();
                                tokio::spawn(async move {
                                    handle_connection(stream, peer, context, router).await;
                                });
                            }
                            Err(err) => warn!(error = %err, "accept failed"),
                        }
                    }
                }
            }
        });
        self.accept_handle = Some(handle);
        Ok(())
    }

    /// The bound address, available once [`ProxyServer::serve`] has returned.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// The live redirect table shared with request tasks and the updater.
    pub fn table(&self) -> Arc<RwLock<RedirectTable>> {
        self.table.clone()
    }

    /// Close the listener and stop the auto-updater, blocking until both
    /// tasks have exited. In-flight requests run on their own tasks and are
    /// left to complete; no new connections are accepted.
    pub async fn stop(&mut self) {
        self.shutdown_tx.send(true).ok();
        if let Some(handle) = self.accept_handle.take() {
            let _ = handle.await;
        }
        if let Some(updater) = self.updater.take() {
            updater.stop().await;
        }
        if let Some(driver) = self.acme_driver.take() {
            driver.abort();
        }
        info!("proxy server stopped");
    }
}

/// Route every request by its leading path segment against the live table.
async fn proxy_handler(State(state): State<ProxyState>, req: Request) -> Response {
    let remote_addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default();
    let tls_terminated = req
        .extensions()
        .get::<TlsTerminated>()
        .is_some_and(|t| t.0);

    let label = req
        .uri()
        .path()
        .trim_start_matches('/')
        .split('/')
        .next()
        .unwrap_or_default()
        .to_string();

    let entry = { state.table.read().await.find(&label).cloned() };
    let Some(entry) = entry else {
        return (StatusCode::NOT_FOUND, "unknown onion route\n").into_response();
    };

    // Pre-flight requests are answered here with permissive CORS headers and
    // never reach the upstream.
    if req.method() == Method::OPTIONS {
        return preflight_response();
    }

    state
        .upstream
        .proxy_request(&entry, req, &remote_addr, tls_terminated)
        .await
}

fn preflight_response() -> Response {
    let mut response = StatusCode::OK.into_response();
    let headers = response.headers_mut();
    headers.insert(
        "access-control-allow-origin",
        HeaderValue::from_static("*"),
    );
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static("POST, GET, OPTIONS, PUT, DELETE"),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static("*"),
    );
    response
}

/// Terminate TLS as configured, then serve HTTP on the resulting stream.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    context: Arc<TlsContext>,
    router: Router,
) {
    match context.as_ref() {
        TlsContext::Disabled => serve_stream(stream, peer, false, router).await,
        TlsContext::Static(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => serve_stream(tls_stream, peer, true, router).await,
            Err(err) => debug!(%peer, error = %err, "TLS handshake failed"),
        },
        TlsContext::Automatic { acceptor, config } => {
            match acceptor.accept(stream.compat()).await {
                // the acceptor answered a TLS-ALPN-01 validation request
                Ok(None) => debug!(%peer, "served TLS-ALPN-01 challenge"),
                Ok(Some(handshake)) => match handshake.into_stream(config.clone()).await {
                    Ok(tls_stream) => serve_stream(tls_stream.compat(), peer, true, router).await,
                    Err(err) => debug!(%peer, error = %err, "TLS handshake failed"),
                },
                Err(err) => debug!(%peer, error = %err, "ACME TLS accept failed"),
            }
        }
    }
}

/// Serve one connection, tagging every request with the peer address and the
/// TLS flag the sanitizer needs.
async fn serve_stream<S>(stream: S, peer: SocketAddr, tls_terminated: bool, router: Router)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let hyper_service = hyper::service::service_fn(
        move |mut request: hyper::Request<hyper::body::Incoming>| {
            request.extensions_mut().insert(ConnectInfo(peer));
            request.extensions_mut().insert(TlsTerminated(tls_terminated));
            router.clone().call(request)
        },
    );

    if let Err(err) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(io, hyper_service)
        .await
    {
        debug!(%peer, error = %err, "connection error");
    }
}
