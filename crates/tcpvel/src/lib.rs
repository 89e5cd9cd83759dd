//! tcpvel: supervised robot telemetry pipeline.
//!
//! A producer process talks to the robot controller and derives TCP velocity; a
//! cross-process channel carries its messages to the server, which fans them out to
//! WebSocket subscribers. A small durable store carries configuration the other way.

mod health;
mod version;

pub mod bridge;
pub mod consumer;
pub mod estimator;
pub mod hub;
pub mod manager;
pub mod message;
pub mod robot;
pub mod service;
pub mod store;
pub mod supervisor;
pub mod transport;
pub mod worker;

pub use consumer::{ConsumerStats, HandlerError, MessageHandler, run_consumer_loop};
pub use estimator::{MotionState, VelocityEstimator};
pub use health::Health;
pub use hub::{BroadcastHub, BroadcastReport, SendError, Subscriber, SubscriberId};
pub use manager::{IpcManager, ManagerConfig, ManagerError, ManagerState, ManagerStatus};
pub use message::{Position, Sample, TelemetryMessage};
pub use robot::{
    ConnectError, LinkError, RawStatus, RetryPolicy, RobotLink, SimulatedConfig, SimulatedRobot,
    StatusMessage, Topic,
};
pub use service::{HealthSnapshot, RegisterIndexError, TelemetryService};
pub use store::{DurableKvStore, StoreConfig, StoreError, TCP_VELOCITY_R_INDEX_KEY};
pub use supervisor::{
    ChildProcess, CommandSpawner, ProcessSupervisor, SpawnError, WorkerProcess, WorkerSpawnConfig,
    WorkerSpawner,
};
pub use version::{TCPVEL_VERSION, VersionInfo};
pub use worker::{WorkerConfig, WorkerError, WorkerExit, run_worker, run_worker_from_env};
