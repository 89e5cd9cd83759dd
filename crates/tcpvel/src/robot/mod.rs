//! Robot controller boundary.
//!
//! [`RobotLink`] is the narrow interface the producer needs from a controller SDK:
//! connect, subscribe to status topics, write a numeric register, disconnect. Raw status
//! messages are parsed into [`StatusMessage`] as soon as they arrive.

mod simulated;

pub use simulated::{SimulatedConfig, SimulatedRobot};

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::message::Position;

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_SUBSCRIBE_FREQUENCY_HZ: u32 = 200;

/// Status topics the producer subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    CartesianPosition,
    TpProgramStatus,
}

impl Topic {
    pub const ALL: [Topic; 2] = [Topic::CartesianPosition, Topic::TpProgramStatus];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CartesianPosition => "cartesian_position",
            Self::TpProgramStatus => "tp_program_status",
        }
    }

    pub fn from_path(path: &str) -> Option<Self> {
        match path {
            "cartesian_position" => Some(Self::CartesianPosition),
            "tp_program_status" => Some(Self::TpProgramStatus),
            _ => None,
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status message as delivered by the controller: a topic path and its values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawStatus {
    pub path: String,
    #[serde(default)]
    pub values: Value,
}

impl RawStatus {
    pub fn new(topic: Topic, values: Value) -> Self {
        Self {
            path: topic.as_str().to_string(),
            values,
        }
    }
}

/// Parsed status message.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusMessage {
    CartesianPosition(Position),
    ProgramStatus { program_name: String },
    Unknown { path: String },
}

impl StatusMessage {
    /// Parse a raw message.
    ///
    /// A position needs `values.data2.pose.data` with at least three numbers. A missing
    /// interpreter status means no program is running.
    pub fn parse(raw: &RawStatus) -> Result<Self, LinkError> {
        match Topic::from_path(&raw.path) {
            Some(Topic::CartesianPosition) => {
                let data = raw
                    .values
                    .pointer("/data2/pose/data")
                    .and_then(Value::as_array)
                    .ok_or_else(|| LinkError::Malformed {
                        topic: Topic::CartesianPosition,
                        reason: "missing data2.pose.data".into(),
                    })?;
                let coords: Vec<f64> = data.iter().take(3).filter_map(Value::as_f64).collect();
                match coords.as_slice() {
                    &[x, y, z] => Ok(Self::CartesianPosition(Position::new(x, y, z))),
                    _ => Err(LinkError::Malformed {
                        topic: Topic::CartesianPosition,
                        reason: format!("expected 3 numeric coordinates, got {}", coords.len()),
                    }),
                }
            }
            Some(Topic::TpProgramStatus) => {
                let program_name = raw
                    .values
                    .pointer("/interpreter_status/0/program_name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Ok(Self::ProgramStatus { program_name })
            }
            None => Ok(Self::Unknown {
                path: raw.path.clone(),
            }),
        }
    }
}

pub type StatusStream = BoxStream<'static, RawStatus>;

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("not connected")]
    NotConnected,
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("write to register R[{index}] failed: {reason}")]
    Register { index: u32, reason: String },
    #[error("malformed {topic} message: {reason}")]
    Malformed { topic: Topic, reason: String },
}

/// Controller connection used by the producer.
#[async_trait]
pub trait RobotLink: Send + Sync + 'static {
    async fn connect(&self, addr: &str) -> Result<(), LinkError>;

    /// Stream of raw status messages. Ends when the connection drops.
    async fn subscribe(
        &self,
        topics: &[Topic],
        frequency_hz: u32,
    ) -> Result<StatusStream, LinkError>;

    async fn write_register(&self, index: u32, value: f64) -> Result<(), LinkError>;

    async fn disconnect(&self);
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub interval: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RETRY_INTERVAL,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("gave up connecting to {addr} after {attempts} attempts: {last}")]
    GaveUp {
        addr: String,
        attempts: u32,
        last: LinkError,
    },
    #[error("connect cancelled")]
    Cancelled,
}

/// Connect with a fixed backoff. Returns the number of attempts it took.
pub async fn connect_with_retry(
    link: &dyn RobotLink,
    addr: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<u32, ConnectError> {
    let mut attempts = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(ConnectError::Cancelled);
        }
        attempts += 1;
        tracing::info!(addr, attempt = attempts, "Connecting to robot");

        let err = match link.connect(addr).await {
            Ok(()) => {
                tracing::info!(addr, attempts, "Robot connected");
                return Ok(attempts);
            }
            Err(e) => e,
        };
        tracing::warn!(addr, attempt = attempts, error = %err, "Robot connect failed");
        link.disconnect().await;

        if let Some(max) = policy.max_attempts
            && attempts >= max
        {
            return Err(ConnectError::GaveUp {
                addr: addr.to_string(),
                attempts,
                last: err,
            });
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(ConnectError::Cancelled),
            _ = tokio::time::sleep(policy.interval) => {}
        }
    }
}
