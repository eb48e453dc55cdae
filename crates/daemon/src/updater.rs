//! Background registry refresh feeding the redirect table

use crate::DaemonError;
use crate::table::RedirectTable;
use oniongate_registry::Registry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Callback invoked with every refresh-cycle error. Errors never stop the
/// update loop.
pub type ErrorHandler = Arc<dyn Fn(&DaemonError) + Send + Sync>;

/// A single background task that re-reads the registry on a fixed period and
/// ingests the result into the shared redirect table.
///
/// Single-use: once stopped it cannot be restarted; the server owns at most
/// one updater for its lifetime.
pub struct AutoUpdater {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl AutoUpdater {
    /// Spawn the update loop. Each tick fetches the registry and applies it
    /// to `table` under a write lock held only for the ingestion itself;
    /// fetch and ingestion errors go to `on_error` and the loop continues.
    pub fn start(
        registry: Registry,
        table: Arc<RwLock<RedirectTable>>,
        period: Duration,
        on_error: ErrorHandler,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the interval fires immediately; the initial load already
            // happened when the registry was attached
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("auto-updater shutting down");
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        match registry.get_json().await {
                            Ok(raw) => {
                                let mut table = table.write().await;
                                match table.ingest(&raw) {
                                    Ok(appended) if appended > 0 => {
                                        info!(appended, total = table.len(), "registry refresh added routes");
                                    }
                                    Ok(_) => debug!("registry refresh found no new routes"),
                                    Err(err) => on_error(&err),
                                }
                            }
                            Err(err) => on_error(&DaemonError::Registry(err)),
                        }
                    }
                }
            }
        });

        Self {
            shutdown_tx,
            handle,
        }
    }

    /// Stop the update loop, blocking until the task has exited. No refresh
    /// can occur after this returns.
    pub async fn stop(self) {
        self.shutdown_tx.send(true).ok();
        let _ = self.handle.await;
    }
}
