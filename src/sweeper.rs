use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::registry::ConnectionRegistry;
use crate::store::{SessionStatus, SyncStore};

/// Background task that evicts connections whose heartbeat has gone stale.
/// Eviction is silent: the peer is presumed already disconnected, so its
/// channel is closed and nobody is notified. Runs independently of all
/// connection tasks; stops when the shutdown channel fires.
pub struct Sweeper {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn SyncStore>,
    threshold: Duration,
    interval: Duration,
}

impl Sweeper {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn SyncStore>,
        threshold: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            threshold,
            interval,
        }
    }

    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            // The immediate first tick is harmless: nothing is stale yet.
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep_once().await;
                    }
                    _ = shutdown.changed() => {
                        info!("liveness sweeper stopping");
                        break;
                    }
                }
            }
        })
    }

    /// One sweep tick: every stale connection is removed from the registry
    /// (which closes its writer task) and its session is finalized as
    /// failed, best-effort.
    pub async fn sweep_once(&self) -> usize {
        let stale = self.registry.stale(self.threshold);
        let mut evicted = 0;
        for connection_id in stale {
            let Some(handle) = self.registry.remove(&connection_id) else {
                continue; // disconnected between the scan and now
            };
            info!(
                "evicting stale connection {} (tenant {})",
                handle.connection_id, handle.tenant_id
            );
            evicted += 1;
            if let Some(session_id) = handle.session_id {
                if let Err(err) = self
                    .store
                    .finalize_session(&session_id, SessionStatus::Failed)
                    .await
                {
                    warn!("failed to finalize session {}: {}", session_id, err);
                }
            }
        }
        evicted
    }
}
