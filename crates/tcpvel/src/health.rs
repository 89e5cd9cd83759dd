//! Health status reported by `/health-check`.

use serde::{Deserialize, Serialize};

use crate::manager::{ManagerState, ManagerStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Health {
    /// Pipeline not started, or fully stopped.
    Stopped,
    Starting,
    /// Pipeline running with a live producer.
    Ready,
    /// Pipeline running but no producer process right now (restart pending).
    Degraded,
    Stopping,
}

impl Health {
    pub fn from_status(status: &ManagerStatus) -> Self {
        match status.state {
            ManagerState::Stopped => Health::Stopped,
            ManagerState::Starting => Health::Starting,
            ManagerState::Running if status.producer_pid.is_some() => Health::Ready,
            ManagerState::Running => Health::Degraded,
            ManagerState::Stopping => Health::Stopping,
        }
    }

    pub fn is_ready(&self) -> bool {
        *self == Health::Ready
    }
}
