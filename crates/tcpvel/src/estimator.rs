//! TCP velocity estimation from consecutive position samples.

use crate::message::{Sample, TelemetryMessage, WIRE_PRECISION};

/// Minimum spacing between two register syncs, seconds.
pub const REGISTER_SYNC_WINDOW_SECS: f64 = 1.0;

/// Motion state for one producer session.
///
/// Velocity has no meaning across a connection gap, so this is reset whenever the
/// producer reconnects or is restarted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MotionState {
    pub last_sample: Option<Sample>,
    pub last_velocity: f64,
    pub last_register_sync_time: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct VelocityEstimator {
    state: MotionState,
    precision: u32,
    sync_window: f64,
}

impl Default for VelocityEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl VelocityEstimator {
    pub fn new() -> Self {
        Self {
            state: MotionState::default(),
            precision: WIRE_PRECISION,
            sync_window: REGISTER_SYNC_WINDOW_SECS,
        }
    }

    pub fn with_precision(mut self, places: u32) -> Self {
        self.precision = places;
        self
    }

    pub fn with_sync_window(mut self, secs: f64) -> Self {
        self.sync_window = secs;
        self
    }

    pub fn state(&self) -> &MotionState {
        &self.state
    }

    pub fn last_velocity(&self) -> f64 {
        self.state.last_velocity
    }

    pub fn reset(&mut self) {
        self.state = MotionState::default();
    }

    /// Feed one sample. Returns a velocity message once two usable samples exist.
    ///
    /// Samples that do not advance time (`dt <= 0`) or carry non-finite values are
    /// dropped without touching the state.
    pub fn on_sample(&mut self, sample: Sample) -> Option<TelemetryMessage> {
        if !sample.position.is_finite() || !sample.t.is_finite() {
            tracing::debug!(?sample, "Dropping non-finite sample");
            return None;
        }

        let Some(last) = self.state.last_sample else {
            self.state.last_sample = Some(sample);
            return None;
        };

        let dt = sample.t - last.t;
        if dt <= 0.0 {
            tracing::trace!(dt, "Dropping sample with non-increasing timestamp");
            return None;
        }

        let velocity = sample.position.distance_to(&last.position) / dt;
        self.state.last_sample = Some(sample);
        self.state.last_velocity = velocity;

        Some(TelemetryMessage::velocity(
            crate::message::round_to(velocity, self.precision),
            Some(sample.position.rounded(self.precision)),
        ))
    }

    /// Whether the latest velocity should be pushed to the robot register now.
    ///
    /// The first call only opens the window; afterwards at most one `true` per
    /// rolling window.
    pub fn register_sync_due(&mut self, now: f64) -> bool {
        match self.state.last_register_sync_time {
            None => {
                self.state.last_register_sync_time = Some(now);
                false
            }
            Some(last) if now - last >= self.sync_window => {
                self.state.last_register_sync_time = Some(now);
                true
            }
            Some(_) => false,
        }
    }
}
