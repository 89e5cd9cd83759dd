//! TelemetryService: transport-agnostic state shared by the HTTP layer.
//!
//! Owns:
//! - the broadcast hub (subscriber membership)
//! - the durable store (register index configuration)
//! - the pipeline manager (producer lifecycle)
//! - shutdown coordination
//!
//! Transports call into this service; they never touch the store or manager directly.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

use crate::health::Health;
use crate::hub::BroadcastHub;
use crate::manager::{IpcManager, ManagerStatus};
use crate::store::{DurableKvStore, TCP_VELOCITY_R_INDEX_KEY};
use crate::version::VersionInfo;

#[derive(Debug, thiserror::Error)]
pub enum RegisterIndexError {
    #[error("register index must be >= 0, got {0}")]
    Negative(i64),
}

/// Snapshot of service health for transports to query.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: Health,
    pub pipeline: ManagerStatus,
    pub subscribers: usize,
    pub version: VersionInfo,
}

pub struct TelemetryService {
    hub: Arc<BroadcastHub>,
    store: Arc<DurableKvStore>,
    manager: Arc<IpcManager>,
    version: VersionInfo,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl TelemetryService {
    pub fn new(
        hub: Arc<BroadcastHub>,
        store: Arc<DurableKvStore>,
        manager: Arc<IpcManager>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            hub,
            store,
            manager,
            version: VersionInfo::new(),
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn with_version(mut self, version: VersionInfo) -> Self {
        self.version = version;
        self
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    pub fn store(&self) -> &Arc<DurableKvStore> {
        &self.store
    }

    pub fn manager(&self) -> &Arc<IpcManager> {
        &self.manager
    }

    /// Queue a new register index. Visible to the producer after the next flush.
    ///
    /// 0 disables register sync.
    pub fn set_register_index(&self, index: i64) -> Result<(), RegisterIndexError> {
        if index < 0 {
            return Err(RegisterIndexError::Negative(index));
        }
        self.store.set(TCP_VELOCITY_R_INDEX_KEY, index);
        tracing::info!(index, "Register index updated");
        Ok(())
    }

    /// Last flushed register index.
    pub async fn register_index(&self) -> Option<i64> {
        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || store.get_as::<i64>(TCP_VELOCITY_R_INDEX_KEY))
            .await
        {
            Ok(index) => index,
            Err(e) => {
                tracing::error!(error = %e, "Register index read panicked");
                None
            }
        }
    }

    pub async fn health(&self) -> HealthSnapshot {
        let pipeline = self.manager.status();
        HealthSnapshot {
            status: Health::from_status(&pipeline),
            pipeline,
            subscribers: self.hub.len().await,
            version: self.version.clone(),
        }
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Stop the pipeline and flush pending state.
    pub async fn shutdown(&self) {
        self.manager.stop().await;
        self.store.shutdown().await;
        tracing::info!("Telemetry service shut down");
    }
}
