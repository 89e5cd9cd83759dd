//! tcpvel binary.
//!
//! - `tcpvel serve`: HTTP/WebSocket server plus the supervised producer pipeline
//! - `tcpvel worker`: the producer process itself (spawned by `serve`)

mod logging;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use tcpvel::transport::{ServerConfig, serve_listener};
use tcpvel::worker::DEFAULT_ROBOT_ADDR;
use tcpvel::{
    BroadcastHub, CommandSpawner, DurableKvStore, IpcManager, ManagerConfig, MessageHandler,
    RetryPolicy, SimulatedConfig, SimulatedRobot, StoreConfig, TelemetryService, VersionInfo,
    WorkerConfig, WorkerExit, run_worker_from_env,
};

/// Robot link compiled into the producer.
const ROBOT_LINK: &str = "simulated";

/// Robot TCP velocity telemetry server
#[derive(Parser)]
#[command(name = "tcpvel")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WebSocket server and supervise the producer
    Serve(ServeArgs),

    /// Run the producer (started by `serve`, reads TCPVEL_CHANNEL)
    Worker(ProducerArgs),
}

/// Options shared by the server and the producer it spawns.
#[derive(Args, Debug, Clone)]
struct ProducerArgs {
    /// Robot controller address
    #[arg(long, env = "ROBOT_IP", default_value = DEFAULT_ROBOT_ADDR)]
    robot_ip: String,

    /// Directory holding the persisted state file
    #[arg(long, env = "TCPVEL_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Delay between robot connection attempts
    #[arg(long, default_value_t = 5000)]
    retry_interval_ms: u64,

    /// Give up connecting after this many attempts (default: retry forever)
    #[arg(long)]
    max_connect_attempts: Option<u32>,
}

impl ProducerArgs {
    fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::new(self.robot_ip.clone()).with_retry(
            RetryPolicy::default()
                .with_interval(Duration::from_millis(self.retry_interval_ms))
                .with_max_attempts(self.max_connect_attempts),
        )
    }

    /// Arguments that reproduce these options for `tcpvel worker`.
    fn to_worker_args(&self) -> Vec<String> {
        let mut args = vec![
            "worker".to_string(),
            "--robot-ip".to_string(),
            self.robot_ip.clone(),
            "--data-dir".to_string(),
            self.data_dir.display().to_string(),
            "--retry-interval-ms".to_string(),
            self.retry_interval_ms.to_string(),
        ];
        if let Some(max) = self.max_connect_attempts {
            args.push("--max-connect-attempts".to_string());
            args.push(max.to_string());
        }
        args
    }
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind
    #[arg(long, env = "PORT", default_value_t = 8000)]
    port: u16,

    /// Producer liveness check interval
    #[arg(long, default_value_t = 2000)]
    watch_interval_ms: u64,

    /// Consumer poll interval when the channel is empty
    #[arg(long, default_value_t = 10)]
    poll_interval_ms: u64,

    /// How often pending state is written to disk
    #[arg(long, default_value_t = 5000)]
    flush_interval_ms: u64,

    #[command(flatten)]
    producer: ProducerArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Worker(args) => run_producer(args).await,
    }
}

async fn run_serve(args: ServeArgs) -> anyhow::Result<()> {
    // Bind before spawning the producer.
    let listener = ServerConfig::default()
        .with_host(args.host)
        .with_port(args.port)
        .bind()
        .await
        .context("failed to bind HTTP listener")?;

    let store = DurableKvStore::open(
        StoreConfig::in_dir(&args.producer.data_dir)
            .with_flush_interval(Duration::from_millis(args.flush_interval_ms)),
    )
    .context("failed to open state store")?;
    let flusher_cancel = CancellationToken::new();
    let flusher = store.spawn_flusher(flusher_cancel.clone());

    let spawner = CommandSpawner::current_exe()
        .context("failed to locate own executable")?
        .with_args(args.producer.to_worker_args());

    let hub = BroadcastHub::new();
    let handler: Arc<dyn MessageHandler> = hub.clone();
    let manager = IpcManager::new(
        ManagerConfig::default()
            .with_watch_interval(Duration::from_millis(args.watch_interval_ms))
            .with_poll_interval(Duration::from_millis(args.poll_interval_ms)),
        Arc::new(spawner),
        handler,
    );
    manager.start().await.context("failed to start pipeline")?;

    let service = Arc::new(
        TelemetryService::new(hub, Arc::clone(&store), manager)
            .with_version(VersionInfo::new().with_robot_link(ROBOT_LINK)),
    );

    let result = serve_listener(listener, service).await;

    flusher_cancel.cancel();
    if let Err(e) = flusher.await {
        tracing::warn!(error = %e, "State flusher ended abnormally");
    }
    result
}

async fn run_producer(args: ProducerArgs) -> anyhow::Result<()> {
    let store = DurableKvStore::open(StoreConfig::in_dir(&args.data_dir))
        .context("failed to open state store")?;
    let link = Arc::new(SimulatedRobot::new(SimulatedConfig::default()));

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let exit = run_worker_from_env(link, store, args.worker_config(), cancel).await?;
    match exit {
        WorkerExit::Cancelled => tracing::info!("Producer stopped by signal"),
        WorkerExit::ChannelClosed => tracing::info!("Server channel closed, producer exiting"),
    }
    Ok(())
}

async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = term.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    cancel.cancel();
}
