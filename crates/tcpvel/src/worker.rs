//! Producer process body.
//!
//! Runs inside the child process spawned by the supervisor. Connects to the robot,
//! turns status messages into telemetry and pushes it into the channel back to the
//! server. The channel address comes from the environment (set by the parent).
//!
//! Motion state is reset whenever the status stream ends, and the worker reconnects. When
//! the channel to the parent closes the worker exits; the parent is gone or stopping.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::bridge::{
    ChannelError, ChannelSender, DEFAULT_CHANNEL_CAPACITY, IncarnationId, channel_info_from_env,
};
use crate::estimator::{REGISTER_SYNC_WINDOW_SECS, VelocityEstimator};
use crate::message::{Sample, TelemetryMessage};
use crate::robot::{
    ConnectError, DEFAULT_SUBSCRIBE_FREQUENCY_HZ, LinkError, RetryPolicy, RobotLink,
    StatusMessage, Topic, connect_with_retry,
};
use crate::store::{DurableKvStore, TCP_VELOCITY_R_INDEX_KEY};

pub const DEFAULT_ROBOT_ADDR: &str = "10.27.1.254";

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub robot_addr: String,
    pub retry: RetryPolicy,
    pub frequency_hz: u32,
    pub channel_capacity: usize,
    pub register_sync_window: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            robot_addr: DEFAULT_ROBOT_ADDR.to_string(),
            retry: RetryPolicy::default(),
            frequency_hz: DEFAULT_SUBSCRIBE_FREQUENCY_HZ,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            register_sync_window: Duration::from_secs_f64(REGISTER_SYNC_WINDOW_SECS),
        }
    }
}

impl WorkerConfig {
    pub fn new(robot_addr: impl Into<String>) -> Self {
        Self {
            robot_addr: robot_addr.into(),
            ..Self::default()
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_frequency_hz(mut self, hz: u32) -> Self {
        self.frequency_hz = hz;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub fn with_register_sync_window(mut self, window: Duration) -> Self {
        self.register_sync_window = window;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("server channel: {0}")]
    Channel(#[from] ChannelError),
}

/// Why the worker returned normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Cancelled,
    ChannelClosed,
}

/// Writes the latest velocity to the configured register, off the sample path.
///
/// Requests are dropped while a write is still in flight.
struct RegisterSync {
    tx: mpsc::Sender<f64>,
    task: JoinHandle<()>,
}

impl RegisterSync {
    fn spawn(
        link: Arc<dyn RobotLink>,
        store: Arc<DurableKvStore>,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<f64>(1);
        let task = tokio::spawn(async move {
            loop {
                let velocity = tokio::select! {
                    _ = cancel.cancelled() => break,
                    v = rx.recv() => match v {
                        Some(v) => v,
                        None => break,
                    },
                };

                let reader = Arc::clone(&store);
                let index = match tokio::task::spawn_blocking(move || {
                    reader.get_as::<i64>(TCP_VELOCITY_R_INDEX_KEY)
                })
                .await
                {
                    Ok(index) => index,
                    Err(e) => {
                        tracing::warn!(error = %e, "Register index lookup failed");
                        continue;
                    }
                };

                let Some(index) = index.filter(|i| *i > 0).and_then(|i| u32::try_from(i).ok())
                else {
                    tracing::trace!("Register sync disabled");
                    continue;
                };

                match link.write_register(index, velocity).await {
                    Ok(()) => tracing::debug!(index, velocity, "Synced velocity to register"),
                    Err(e) => tracing::error!(index, error = %e, "Register write failed"),
                }
            }
        });
        Self { tx, task }
    }

    fn request(&self, velocity: f64) {
        let _ = self.tx.try_send(velocity);
    }

    async fn stop(self) {
        drop(self.tx);
        let _ = self.task.await;
    }
}

fn publish(channel: &ChannelSender, message: &TelemetryMessage) {
    match channel.put(message) {
        Ok(()) => {}
        Err(ChannelError::Full) => {
            tracing::debug!(kind = message.kind(), "Server channel full, dropping message");
        }
        Err(ChannelError::Closed) => {
            tracing::debug!("Server channel closed");
        }
        Err(e) => {
            tracing::warn!(kind = message.kind(), error = %e, "Failed to publish message");
        }
    }
}

/// Run the producer until cancelled or the server channel closes.
pub async fn run_worker(
    link: Arc<dyn RobotLink>,
    store: Arc<DurableKvStore>,
    channel: Arc<ChannelSender>,
    config: WorkerConfig,
    cancel: CancellationToken,
) -> Result<WorkerExit, WorkerError> {
    let stop = cancel.child_token();
    let channel_closed = channel.closed_token();
    let stop_on_close = stop.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = channel_closed.cancelled() => stop_on_close.cancel(),
            _ = stop_on_close.cancelled() => {}
        }
    });

    let sync = RegisterSync::spawn(Arc::clone(&link), store, stop.clone());
    let mut estimator = VelocityEstimator::new()
        .with_sync_window(config.register_sync_window.as_secs_f64());
    let clock = Instant::now();

    let result = 'session: loop {
        match connect_with_retry(link.as_ref(), &config.robot_addr, &config.retry, &stop).await {
            Ok(_) => {}
            Err(ConnectError::Cancelled) => break 'session Ok(()),
            Err(e) => break 'session Err(WorkerError::from(e)),
        }

        let mut stream = match link.subscribe(&Topic::ALL, config.frequency_hz).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = %e, "Subscribe failed, reconnecting");
                link.disconnect().await;
                tokio::select! {
                    _ = stop.cancelled() => break 'session Ok(()),
                    _ = tokio::time::sleep(config.retry.interval) => continue 'session,
                }
            }
        };
        tracing::info!(
            frequency_hz = config.frequency_hz,
            topics = ?Topic::ALL,
            "Subscribed to robot status"
        );
        estimator.reset();

        loop {
            let raw = tokio::select! {
                _ = stop.cancelled() => break 'session Ok(()),
                raw = stream.next() => raw,
            };
            let Some(raw) = raw else {
                tracing::warn!("Robot status stream ended, reconnecting");
                link.disconnect().await;
                estimator.reset();
                continue 'session;
            };

            match StatusMessage::parse(&raw) {
                Ok(StatusMessage::CartesianPosition(position)) => {
                    let now = clock.elapsed().as_secs_f64();
                    if let Some(message) = estimator.on_sample(Sample::at(position, now)) {
                        publish(&channel, &message);
                        if estimator.register_sync_due(now) {
                            sync.request(estimator.last_velocity());
                        }
                    }
                }
                Ok(StatusMessage::ProgramStatus { program_name }) => {
                    publish(&channel, &TelemetryMessage::running_program(program_name));
                }
                Ok(StatusMessage::Unknown { path }) => {
                    tracing::warn!(path, "Unhandled robot topic");
                }
                Err(e @ LinkError::Malformed { .. }) => {
                    tracing::debug!(error = %e, "Dropping malformed status message");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Status message error");
                }
            }
        }
    };

    stop.cancel();
    sync.stop().await;
    link.disconnect().await;

    result?;
    let exit = if cancel.is_cancelled() {
        WorkerExit::Cancelled
    } else {
        WorkerExit::ChannelClosed
    };
    tracing::info!(?exit, "Producer stopped");
    Ok(exit)
}

/// Producer process entry point: connect to the channel named in the environment and
/// run until the server goes away.
pub async fn run_worker_from_env(
    link: Arc<dyn RobotLink>,
    store: Arc<DurableKvStore>,
    config: WorkerConfig,
    cancel: CancellationToken,
) -> Result<WorkerExit, WorkerError> {
    let info = channel_info_from_env().map_err(ChannelError::from)?;
    let incarnation = IncarnationId::new();
    let span = tracing::info_span!("producer", %incarnation);

    async move {
        let (channel, writer) =
            ChannelSender::connect(&info, incarnation, config.channel_capacity).await?;
        tracing::info!(pid = std::process::id(), "Producer connected to server channel");

        let exit = run_worker(link, store, Arc::clone(&channel), config, cancel).await;
        drop(channel);
        let _ = writer.await;
        exit
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{ChannelReceiver, CrossProcessChannel};
    use crate::robot::{SimulatedConfig, SimulatedRobot};
    use crate::store::StoreConfig;

    struct Harness {
        channel: CrossProcessChannel,
        rx: ChannelReceiver,
        sender: Arc<ChannelSender>,
        store: Arc<DurableKvStore>,
        _dir: tempfile::TempDir,
    }

    async fn harness(index: Option<i64>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = DurableKvStore::open(StoreConfig::in_dir(dir.path())).unwrap();
        if let Some(index) = index {
            store.set(TCP_VELOCITY_R_INDEX_KEY, index);
            store.flush().unwrap();
        }
        let (channel, rx) = CrossProcessChannel::open(256).await.unwrap();
        let (sender, _writer) = ChannelSender::connect(channel.child_info(), IncarnationId::new(), 256)
            .await
            .unwrap();
        Harness {
            channel,
            rx,
            sender,
            store,
            _dir: dir,
        }
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig::new("sim")
            .with_frequency_hz(1000)
            .with_retry(RetryPolicy::default().with_interval(Duration::from_millis(5)))
            .with_register_sync_window(Duration::from_millis(10))
    }

    async fn collect(rx: &mut ChannelReceiver, n: usize) -> Vec<TelemetryMessage> {
        let mut out = Vec::with_capacity(n);
        tokio::time::timeout(Duration::from_secs(5), async {
            while out.len() < n {
                let Some(item) = rx.recv().await else { break };
                out.push(TelemetryMessage::from_serializable(item.payload).unwrap());
            }
        })
        .await
        .expect("worker produced too few messages");
        out
    }

    #[tokio::test]
    async fn streams_velocity_and_program_and_syncs_register() {
        let mut h = harness(Some(7)).await;
        let robot = Arc::new(SimulatedRobot::new(
            SimulatedConfig::default().with_program_name("WELD_01"),
        ));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_worker(
            robot.clone(),
            h.store.clone(),
            h.sender.clone(),
            fast_config(),
            cancel.clone(),
        ));

        let messages = collect(&mut h.rx, 40).await;
        assert!(messages.contains(&TelemetryMessage::running_program("WELD_01")));
        let velocities: Vec<f64> = messages
            .iter()
            .filter_map(|m| match m {
                TelemetryMessage::Velocity { velocity, .. } => Some(*velocity),
                _ => None,
            })
            .collect();
        assert!(!velocities.is_empty());
        assert!(velocities.iter().all(|v| v.is_finite() && *v >= 0.0));

        tokio::time::timeout(Duration::from_secs(5), async {
            while robot.register_writes().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("register was never written");
        assert!(robot.register_writes().iter().all(|(i, _)| *i == 7));

        cancel.cancel();
        assert_eq!(task.await.unwrap().unwrap(), WorkerExit::Cancelled);
        assert!(!robot.is_connected());
        h.channel.close().await;
    }

    #[tokio::test]
    async fn zero_index_disables_register_sync() {
        let mut h = harness(Some(0)).await;
        let robot = Arc::new(SimulatedRobot::new(SimulatedConfig::default()));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_worker(
            robot.clone(),
            h.store.clone(),
            h.sender.clone(),
            fast_config(),
            cancel.clone(),
        ));

        collect(&mut h.rx, 60).await;
        cancel.cancel();
        task.await.unwrap().unwrap();
        assert!(robot.register_writes().is_empty());
        h.channel.close().await;
    }

    #[tokio::test]
    async fn reconnects_when_stream_ends() {
        let mut h = harness(None).await;
        let robot = Arc::new(SimulatedRobot::new(
            SimulatedConfig::default().with_stream_limit(Some(5)),
        ));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_worker(
            robot.clone(),
            h.store.clone(),
            h.sender.clone(),
            fast_config(),
            cancel.clone(),
        ));

        collect(&mut h.rx, 12).await;
        assert!(robot.connect_attempts() >= 2);

        cancel.cancel();
        task.await.unwrap().unwrap();
        h.channel.close().await;
    }

    #[tokio::test]
    async fn exits_when_server_channel_closes() {
        let h = harness(None).await;
        let robot = Arc::new(SimulatedRobot::new(SimulatedConfig::default()));
        let task = tokio::spawn(run_worker(
            robot,
            h.store.clone(),
            h.sender.clone(),
            fast_config(),
            CancellationToken::new(),
        ));

        tokio::time::sleep(Duration::from_millis(20)).await;
        h.channel.close().await;
        drop(h.rx);

        let exit = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("worker did not notice the closed channel")
            .unwrap()
            .unwrap();
        assert_eq!(exit, WorkerExit::ChannelClosed);
    }

    #[tokio::test]
    async fn gives_up_when_retry_cap_reached() {
        let h = harness(None).await;
        let robot = Arc::new(SimulatedRobot::new(
            SimulatedConfig::default().with_fail_first_connects(u32::MAX),
        ));
        let config = fast_config().with_retry(
            RetryPolicy::default()
                .with_interval(Duration::from_millis(1))
                .with_max_attempts(Some(2)),
        );
        let err = run_worker(robot, h.store.clone(), h.sender.clone(), config, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Connect(ConnectError::GaveUp { attempts: 2, .. })
        ));
        h.channel.close().await;
    }
}
