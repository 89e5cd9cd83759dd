//! Wire protocol between the producer process and the server.
//!
//! One connection per producer incarnation. The first frame is `Hello`, every later
//! frame is `Telemetry` carrying a message already converted to plain JSON.

use serde::{Deserialize, Serialize};

/// Identity of one producer incarnation (one run between restarts).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IncarnationId(uuid::Uuid);

impl IncarnationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for IncarnationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for IncarnationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Frames sent from the producer to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    /// Must be the first frame on a connection.
    Hello { incarnation: IncarnationId, pid: u32 },

    /// Sequence numbers restart at zero for each incarnation.
    Telemetry { seq: u64, payload: serde_json::Value },
}
