//! Producer process supervisor.
//!
//! Owns the one live producer process. A watch loop polls liveness on a fixed interval
//! and, when the process is gone, asks the spawner for a replacement. Liveness check and
//! swap happen under one lock, so concurrent checks never spawn two processes.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::bridge::{CHANNEL_ENV_VAR, ChildChannelInfo};

pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Environment variable carrying the spawn generation (0 for the first process).
pub const GENERATION_ENV_VAR: &str = "TCPVEL_GENERATION";

/// A running producer process.
#[async_trait]
pub trait WorkerProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Non-blocking. Reaps the process if it has exited.
    fn is_alive(&mut self) -> bool;

    /// Ask the process to stop, killing it if it is still alive after `grace`.
    async fn terminate(&mut self, grace: Duration);
}

#[derive(Debug, Clone)]
pub struct WorkerSpawnConfig {
    pub channel: ChildChannelInfo,
    pub generation: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Creates producer processes. Called once at start and again for every restart.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, config: &WorkerSpawnConfig) -> Result<Box<dyn WorkerProcess>, SpawnError>;
}

/// OS child process.
pub struct ChildProcess {
    child: Child,
}

impl ChildProcess {
    pub fn new(child: Child) -> Self {
        Self { child }
    }
}

#[async_trait]
impl WorkerProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                tracing::warn!(%status, "Producer process exited");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to poll producer process");
                false
            }
        }
    }

    async fn terminate(&mut self, grace: Duration) {
        let Some(pid) = self.child.id() else {
            return;
        };

        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::debug!(pid, error = %e, "SIGTERM failed");
            }
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(pid, %status, "Producer process stopped");
            }
            Ok(Err(e)) => {
                tracing::warn!(pid, error = %e, "Failed to wait for producer process");
            }
            Err(_) => {
                tracing::warn!(pid, ?grace, "Producer ignored SIGTERM, killing");
                if let Err(e) = self.child.kill().await {
                    tracing::error!(pid, error = %e, "Failed to kill producer process");
                }
            }
        }
    }
}

/// Spawns a command with the channel address in its environment.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Re-run the current executable.
    pub fn current_exe() -> Result<Self, SpawnError> {
        Ok(Self::new(std::env::current_exe()?))
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, config: &WorkerSpawnConfig) -> Result<Box<dyn WorkerProcess>, SpawnError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env(CHANNEL_ENV_VAR, config.channel.to_env_value())
            .env(GENERATION_ENV_VAR, config.generation.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        Ok(Box::new(ChildProcess::new(child)))
    }
}

/// Outcome of one liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    Alive,
    /// No process was running (the initial spawn failed); one is now.
    Spawned { pid: Option<u32> },
    Restarted { pid: Option<u32> },
    RestartFailed,
}

pub struct ProcessSupervisor {
    spawner: Arc<dyn WorkerSpawner>,
    channel: ChildChannelInfo,
    watch_interval: Duration,
    current: Mutex<Option<Box<dyn WorkerProcess>>>,
    pid: AtomicU32,
    generation: AtomicU64,
    restarts: AtomicU64,
}

impl ProcessSupervisor {
    pub fn new(
        spawner: Arc<dyn WorkerSpawner>,
        channel: ChildChannelInfo,
        watch_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            spawner,
            channel,
            watch_interval,
            current: Mutex::new(None),
            pid: AtomicU32::new(0),
            generation: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
        })
    }

    fn spawn_next(&self) -> Result<Box<dyn WorkerProcess>, SpawnError> {
        let config = WorkerSpawnConfig {
            channel: self.channel.clone(),
            generation: self.generation.fetch_add(1, Ordering::Relaxed),
        };
        let process = self.spawner.spawn(&config)?;
        self.pid.store(process.id().unwrap_or(0), Ordering::Relaxed);
        tracing::info!(
            pid = ?process.id(),
            generation = config.generation,
            "Producer process spawned"
        );
        Ok(process)
    }

    /// Spawn the first process. A no-op if one is already alive.
    pub async fn start(&self) -> Result<Option<u32>, SpawnError> {
        let mut current = self.current.lock().await;
        if let Some(process) = current.as_mut()
            && process.is_alive()
        {
            return Ok(process.id());
        }
        let process = self.spawn_next()?;
        let pid = process.id();
        *current = Some(process);
        Ok(pid)
    }

    /// Check the current process and replace it if it is gone.
    pub async fn check_once(&self) -> CheckOutcome {
        let mut current = self.current.lock().await;
        if let Some(process) = current.as_mut()
            && process.is_alive()
        {
            return CheckOutcome::Alive;
        }

        let previous = current.take();
        if let Some(dead) = &previous {
            tracing::warn!(pid = ?dead.id(), "Producer process died, restarting");
        } else {
            tracing::warn!("No producer process running, spawning");
        }
        self.pid.store(0, Ordering::Relaxed);

        match self.spawn_next() {
            Ok(process) => {
                let pid = process.id();
                *current = Some(process);
                if previous.is_none() {
                    return CheckOutcome::Spawned { pid };
                }
                self.restarts.fetch_add(1, Ordering::Relaxed);
                CheckOutcome::Restarted { pid }
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to restart producer, will retry");
                CheckOutcome::RestartFailed
            }
        }
    }

    /// Poll liveness every `watch_interval` until cancelled.
    pub async fn watch(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.watch_interval,
            self.watch_interval,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.check_once().await;
        }
        tracing::debug!("Supervisor watch loop stopped");
    }

    /// Pid of the current process, if one is running.
    pub fn current_pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::Relaxed) {
            0 => None,
            pid => Some(pid),
        }
    }

    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    pub fn watch_interval(&self) -> Duration {
        self.watch_interval
    }

    /// Stop the current process. Nothing is restarted afterwards unless `start` or
    /// `check_once` is called again.
    pub async fn terminate(&self, grace: Duration) {
        let process = self.current.lock().await.take();
        self.pid.store(0, Ordering::Relaxed);
        if let Some(mut process) = process {
            process.terminate(grace).await;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicBool;

    /// Process whose liveness is controlled by the test.
    pub(crate) struct MockProcess {
        pid: u32,
        alive: Arc<AtomicBool>,
        terminated: Arc<AtomicU64>,
    }

    #[async_trait]
    impl WorkerProcess for MockProcess {
        fn id(&self) -> Option<u32> {
            Some(self.pid)
        }

        fn is_alive(&mut self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn terminate(&mut self, _grace: Duration) {
            self.alive.store(false, Ordering::SeqCst);
            self.terminated.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    pub(crate) struct MockSpawner {
        pub(crate) spawned: StdMutex<Vec<Arc<AtomicBool>>>,
        pub(crate) generations: StdMutex<Vec<u64>>,
        pub(crate) terminated: Arc<AtomicU64>,
        pub(crate) fail: AtomicBool,
    }

    impl MockSpawner {
        pub(crate) fn count(&self) -> usize {
            self.spawned.lock().unwrap().len()
        }

        pub(crate) fn kill_latest(&self) {
            if let Some(alive) = self.spawned.lock().unwrap().last() {
                alive.store(false, Ordering::SeqCst);
            }
        }
    }

    impl WorkerSpawner for MockSpawner {
        fn spawn(
            &self,
            config: &WorkerSpawnConfig,
        ) -> Result<Box<dyn WorkerProcess>, SpawnError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(SpawnError::Other("spawner disabled".into()));
            }
            let alive = Arc::new(AtomicBool::new(true));
            let mut spawned = self.spawned.lock().unwrap();
            spawned.push(alive.clone());
            self.generations.lock().unwrap().push(config.generation);
            Ok(Box::new(MockProcess {
                pid: 1000 + spawned.len() as u32,
                alive,
                terminated: self.terminated.clone(),
            }))
        }
    }

    pub(crate) fn dummy_channel() -> ChildChannelInfo {
        ChildChannelInfo::NamedSocket {
            path: PathBuf::from("/tmp/tcpvel-test.sock"),
        }
    }

    fn supervisor(spawner: &Arc<MockSpawner>, interval: Duration) -> Arc<ProcessSupervisor> {
        ProcessSupervisor::new(spawner.clone(), dummy_channel(), interval)
    }

    #[tokio::test]
    async fn start_spawns_once() {
        let spawner = Arc::new(MockSpawner::default());
        let sup = supervisor(&spawner, DEFAULT_WATCH_INTERVAL);

        assert_eq!(sup.start().await.unwrap(), Some(1001));
        assert_eq!(sup.start().await.unwrap(), Some(1001));
        assert_eq!(spawner.count(), 1);
        assert_eq!(sup.current_pid(), Some(1001));
        assert_eq!(sup.restarts(), 0);
    }

    #[tokio::test]
    async fn dead_process_is_replaced_exactly_once() {
        let spawner = Arc::new(MockSpawner::default());
        let sup = supervisor(&spawner, DEFAULT_WATCH_INTERVAL);
        sup.start().await.unwrap();

        assert_eq!(sup.check_once().await, CheckOutcome::Alive);

        spawner.kill_latest();
        let (a, b) = tokio::join!(sup.check_once(), sup.check_once());
        let restarted = [a, b]
            .iter()
            .filter(|o| matches!(o, CheckOutcome::Restarted { .. }))
            .count();
        assert_eq!(restarted, 1);
        assert_eq!(spawner.count(), 2);
        assert_eq!(sup.restarts(), 1);
        assert_eq!(sup.current_pid(), Some(1002));
        assert_eq!(*spawner.generations.lock().unwrap(), vec![0, 1]);
    }

    #[tokio::test]
    async fn failed_restart_is_retried_on_next_check() {
        let spawner = Arc::new(MockSpawner::default());
        let sup = supervisor(&spawner, DEFAULT_WATCH_INTERVAL);

        spawner.fail.store(true, Ordering::SeqCst);
        assert!(sup.start().await.is_err());
        assert_eq!(sup.check_once().await, CheckOutcome::RestartFailed);
        assert_eq!(sup.current_pid(), None);

        spawner.fail.store(false, Ordering::SeqCst);
        assert_eq!(
            sup.check_once().await,
            CheckOutcome::Spawned { pid: Some(1001) }
        );
        assert_eq!(spawner.count(), 1);
    }

    #[tokio::test]
    async fn late_first_spawn_is_not_a_restart() {
        let spawner = Arc::new(MockSpawner::default());
        let sup = supervisor(&spawner, DEFAULT_WATCH_INTERVAL);

        spawner.fail.store(true, Ordering::SeqCst);
        assert!(sup.start().await.is_err());
        spawner.fail.store(false, Ordering::SeqCst);
        sup.check_once().await;
        assert_eq!(sup.restarts(), 0);

        spawner.kill_latest();
        assert_eq!(
            sup.check_once().await,
            CheckOutcome::Restarted { pid: Some(1002) }
        );
        assert_eq!(sup.restarts(), 1);
    }

    #[tokio::test]
    async fn watch_restarts_within_one_interval() {
        let spawner = Arc::new(MockSpawner::default());
        let sup = supervisor(&spawner, Duration::from_millis(50));
        sup.start().await.unwrap();

        let cancel = CancellationToken::new();
        let watcher = tokio::spawn(sup.clone().watch(cancel.clone()));

        spawner.kill_latest();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(sup.restarts(), 1);
        assert_eq!(spawner.count(), 2);

        cancel.cancel();
        watcher.await.unwrap();
    }

    #[tokio::test]
    async fn terminate_stops_current_process() {
        let spawner = Arc::new(MockSpawner::default());
        let sup = supervisor(&spawner, DEFAULT_WATCH_INTERVAL);
        sup.start().await.unwrap();

        sup.terminate(Duration::from_millis(10)).await;
        assert_eq!(spawner.terminated.load(Ordering::SeqCst), 1);
        assert_eq!(sup.current_pid(), None);

        sup.terminate(Duration::from_millis(10)).await;
        assert_eq!(spawner.terminated.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn child_process_terminates_with_sigterm() {
        let spawner = CommandSpawner::new("sleep").with_args(["30"]);
        let mut process = spawner
            .spawn(&WorkerSpawnConfig {
                channel: dummy_channel(),
                generation: 0,
            })
            .unwrap();
        assert!(process.id().is_some());
        assert!(process.is_alive());

        process.terminate(Duration::from_secs(2)).await;
        assert!(!process.is_alive());
    }
}
