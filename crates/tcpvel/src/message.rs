//! Telemetry message model.
//!
//! `TelemetryMessage` is what the producer emits, what crosses the channel (as a plain
//! JSON value) and what subscribers receive as a WebSocket text frame.

use serde::{Deserialize, Serialize};

/// Decimal places kept for velocities and positions on the wire.
pub const WIRE_PRECISION: u32 = 3;

/// Round to a fixed number of decimal places.
pub fn round_to(value: f64, places: u32) -> f64 {
    let factor = 10f64.powi(places as i32);
    (value * factor).round() / factor
}

/// TCP position in the robot's cartesian frame, millimetres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn distance_to(&self, other: &Position) -> f64 {
        let (dx, dy, dz) = (self.x - other.x, self.y - other.y, self.z - other.z);
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    pub fn rounded(&self, places: u32) -> Self {
        Self {
            x: round_to(self.x, places),
            y: round_to(self.y, places),
            z: round_to(self.z, places),
        }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// A position observed at time `t` (seconds on the producer's monotonic clock).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub position: Position,
    pub t: f64,
}

impl Sample {
    pub fn new(x: f64, y: f64, z: f64, t: f64) -> Self {
        Self {
            position: Position::new(x, y, z),
            t,
        }
    }

    pub fn at(position: Position, t: f64) -> Self {
        Self { position, t }
    }
}

/// Unit tag carried by velocity messages. Only mm/s is ever produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VelocityUnit {
    #[default]
    #[serde(rename = "mm/s")]
    MillimetersPerSecond,
}

/// Messages pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TelemetryMessage {
    /// TCP speed derived from two consecutive position samples.
    #[serde(rename = "tcp_velocity")]
    Velocity {
        velocity: f64,
        #[serde(default)]
        unit: VelocityUnit,
        position: Option<Position>,
    },

    /// Name of the TP program currently executing (empty when idle).
    RunningProgram { program_name: String },
}

impl TelemetryMessage {
    pub fn velocity(velocity: f64, position: Option<Position>) -> Self {
        Self::Velocity {
            velocity,
            unit: VelocityUnit::MillimetersPerSecond,
            position,
        }
    }

    pub fn running_program(program_name: impl Into<String>) -> Self {
        Self::RunningProgram {
            program_name: program_name.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Velocity { .. } => "tcp_velocity",
            Self::RunningProgram { .. } => "running_program",
        }
    }

    /// Convert to a plain JSON value that can cross the process boundary.
    pub fn to_serializable(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Parse a value received from the channel.
    pub fn from_serializable(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Wire form sent to subscribers.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
