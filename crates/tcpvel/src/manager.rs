//! Pipeline lifecycle: supervisor, channel, consumer loop and watcher under one
//! start/stop.
//!
//! ```text
//! Stopped -> Starting -> Running -> Stopping -> Stopped
//! ```
//!
//! The channel and both background tasks live for one `start()`..`stop()` span. Producer
//! restarts happen inside that span and never re-enter `start()`.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::{ChannelError, CrossProcessChannel, DEFAULT_CHANNEL_CAPACITY};
use crate::consumer::{ConsumerStats, DEFAULT_POLL_INTERVAL, MessageHandler, run_consumer_loop};
use crate::supervisor::{
    DEFAULT_TERMINATE_GRACE, DEFAULT_WATCH_INTERVAL, ProcessSupervisor, WorkerSpawner,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl ManagerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for ManagerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub watch_interval: Duration,
    pub poll_interval: Duration,
    pub terminate_grace: Duration,
    pub channel_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            watch_interval: DEFAULT_WATCH_INTERVAL,
            poll_interval: DEFAULT_POLL_INTERVAL,
            terminate_grace: DEFAULT_TERMINATE_GRACE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl ManagerConfig {
    pub fn with_watch_interval(mut self, interval: Duration) -> Self {
        self.watch_interval = interval;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("cannot start while {0}")]
    InvalidState(ManagerState),
    #[error("failed to open producer channel: {0}")]
    Channel(#[from] ChannelError),
}

/// Point-in-time view of the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub state: ManagerState,
    pub producer_pid: Option<u32>,
    pub restarts: u64,
    pub delivered: u64,
    pub handler_failures: u64,
}

/// Everything owned by one started pipeline.
struct Running {
    channel: CrossProcessChannel,
    supervisor: Arc<ProcessSupervisor>,
    cancel: CancellationToken,
    consumer: JoinHandle<()>,
    watcher: JoinHandle<()>,
}

pub struct IpcManager {
    config: ManagerConfig,
    spawner: Arc<dyn WorkerSpawner>,
    handler: Arc<dyn MessageHandler>,
    stats: Arc<ConsumerStats>,

    /// Serializes start/stop.
    running: Mutex<Option<Running>>,
    /// Last supervisor, kept after stop so status still reports restarts.
    supervisor: StdMutex<Option<Arc<ProcessSupervisor>>>,

    state_tx: watch::Sender<ManagerState>,
    state_rx: watch::Receiver<ManagerState>,
}

impl IpcManager {
    pub fn new(
        config: ManagerConfig,
        spawner: Arc<dyn WorkerSpawner>,
        handler: Arc<dyn MessageHandler>,
    ) -> Arc<Self> {
        let (state_tx, state_rx) = watch::channel(ManagerState::Stopped);
        Arc::new(Self {
            config,
            spawner,
            handler,
            stats: ConsumerStats::new(),
            running: Mutex::new(None),
            supervisor: StdMutex::new(None),
            state_tx,
            state_rx,
        })
    }

    fn set_state(&self, state: ManagerState) {
        let _ = self.state_tx.send(state);
        tracing::debug!(%state, "Pipeline state changed");
    }

    pub fn state(&self) -> ManagerState {
        *self.state_rx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ManagerState> {
        self.state_rx.clone()
    }

    fn current_supervisor(&self) -> Option<Arc<ProcessSupervisor>> {
        match self.supervisor.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn status(&self) -> ManagerStatus {
        let supervisor = self.current_supervisor();
        ManagerStatus {
            state: self.state(),
            producer_pid: supervisor.as_ref().and_then(|s| s.current_pid()),
            restarts: supervisor.as_ref().map_or(0, |s| s.restarts()),
            delivered: self.stats.delivered(),
            handler_failures: self.stats.failed(),
        }
    }

    /// Open the channel, spawn the producer and launch the consumer and watcher.
    ///
    /// A failed initial spawn is not fatal: the watcher retries on its next tick.
    pub async fn start(&self) -> Result<(), ManagerError> {
        let mut running = self.running.lock().await;
        let state = self.state();
        if running.is_some() || state != ManagerState::Stopped {
            return Err(ManagerError::InvalidState(state));
        }
        self.set_state(ManagerState::Starting);

        let (channel, rx) = match CrossProcessChannel::open(self.config.channel_capacity).await {
            Ok(opened) => opened,
            Err(e) => {
                self.set_state(ManagerState::Stopped);
                return Err(e.into());
            }
        };

        let supervisor = ProcessSupervisor::new(
            Arc::clone(&self.spawner),
            channel.child_info().clone(),
            self.config.watch_interval,
        );
        if let Err(e) = supervisor.start().await {
            tracing::warn!(error = %e, "Initial producer spawn failed, watcher will retry");
        }
        match self.supervisor.lock() {
            Ok(mut guard) => *guard = Some(Arc::clone(&supervisor)),
            Err(poisoned) => *poisoned.into_inner() = Some(Arc::clone(&supervisor)),
        }

        let cancel = CancellationToken::new();
        let consumer = tokio::spawn(run_consumer_loop(
            rx,
            Arc::clone(&self.handler),
            self.config.poll_interval,
            cancel.child_token(),
            Arc::clone(&self.stats),
        ));
        let watcher = tokio::spawn(Arc::clone(&supervisor).watch(cancel.child_token()));

        *running = Some(Running {
            channel,
            supervisor,
            cancel,
            consumer,
            watcher,
        });
        self.set_state(ManagerState::Running);
        tracing::info!(
            watch_interval = ?self.config.watch_interval,
            poll_interval = ?self.config.poll_interval,
            "Pipeline started"
        );
        Ok(())
    }

    /// Cancel the loops, stop the producer and close the channel.
    ///
    /// A no-op when nothing is running.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(run) = running.take() else {
            self.set_state(ManagerState::Stopped);
            return;
        };
        self.set_state(ManagerState::Stopping);

        run.cancel.cancel();
        for (name, task) in [("consumer", run.consumer), ("watcher", run.watcher)] {
            if let Err(e) = task.await {
                tracing::warn!(task = name, error = %e, "Pipeline task ended abnormally");
            }
        }

        run.supervisor.terminate(self.config.terminate_grace).await;
        run.channel.close().await;

        self.set_state(ManagerState::Stopped);
        tracing::info!(
            restarts = run.supervisor.restarts(),
            delivered = self.stats.delivered(),
            "Pipeline stopped"
        );
    }
}
