//! In-process robot that moves its TCP along a circle.

use std::f64::consts::TAU;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;

use super::{LinkError, RawStatus, RobotLink, StatusStream, Topic};
use crate::message::Position;

/// Every Nth tick also publishes program status.
const PROGRAM_STATUS_EVERY: u64 = 50;

#[derive(Debug, Clone)]
pub struct SimulatedConfig {
    pub center: Position,
    pub radius: f64,
    /// Time for one full revolution.
    pub period: Duration,
    pub program_name: String,
    /// Refuse this many connect attempts before accepting.
    pub fail_first_connects: u32,
    /// End each status stream after this many messages.
    pub stream_limit: Option<usize>,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            center: Position::new(500.0, 0.0, 300.0),
            radius: 100.0,
            period: Duration::from_secs(4),
            program_name: "MAIN".to_string(),
            fail_first_connects: 0,
            stream_limit: None,
        }
    }
}

impl SimulatedConfig {
    pub fn with_circle(mut self, center: Position, radius: f64, period: Duration) -> Self {
        self.center = center;
        self.radius = radius;
        self.period = period;
        self
    }

    pub fn with_program_name(mut self, name: impl Into<String>) -> Self {
        self.program_name = name.into();
        self
    }

    pub fn with_fail_first_connects(mut self, n: u32) -> Self {
        self.fail_first_connects = n;
        self
    }

    pub fn with_stream_limit(mut self, limit: Option<usize>) -> Self {
        self.stream_limit = limit;
        self
    }
}

pub struct SimulatedRobot {
    config: SimulatedConfig,
    connected: AtomicBool,
    connect_attempts: AtomicU32,
    registers: StdMutex<Vec<(u32, f64)>>,
}

impl SimulatedRobot {
    pub fn new(config: SimulatedConfig) -> Self {
        Self {
            config,
            connected: AtomicBool::new(false),
            connect_attempts: AtomicU32::new(0),
            registers: StdMutex::new(Vec::new()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Register writes seen so far, oldest first.
    pub fn register_writes(&self) -> Vec<(u32, f64)> {
        match self.registers.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn position_at(config: &SimulatedConfig, elapsed: Duration) -> Position {
        let period = config.period.as_secs_f64().max(f64::EPSILON);
        let angle = TAU * elapsed.as_secs_f64() / period;
        Position::new(
            config.center.x + config.radius * angle.cos(),
            config.center.y + config.radius * angle.sin(),
            config.center.z,
        )
    }
}

#[async_trait]
impl RobotLink for SimulatedRobot {
    async fn connect(&self, addr: &str) -> Result<(), LinkError> {
        let attempt = self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.config.fail_first_connects {
            return Err(LinkError::Connect(format!("{addr}: connection refused")));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(
        &self,
        topics: &[Topic],
        frequency_hz: u32,
    ) -> Result<StatusStream, LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        if topics.is_empty() {
            return Err(LinkError::Subscribe("no topics requested".into()));
        }

        let tick = Duration::from_secs_f64(1.0 / f64::from(frequency_hz.max(1)));
        let want_position = topics.contains(&Topic::CartesianPosition);
        let want_program = topics.contains(&Topic::TpProgramStatus);
        let config = self.config.clone();
        let started = Instant::now();

        let stream = futures::stream::unfold(0u64, move |n| {
            let config = config.clone();
            async move {
                tokio::time::sleep(tick).await;
                let mut batch = Vec::with_capacity(2);
                if want_program && n % PROGRAM_STATUS_EVERY == 0 {
                    batch.push(RawStatus::new(
                        Topic::TpProgramStatus,
                        json!({"interpreter_status": [{"program_name": config.program_name}]}),
                    ));
                }
                if want_position {
                    let p = SimulatedRobot::position_at(&config, started.elapsed());
                    batch.push(RawStatus::new(
                        Topic::CartesianPosition,
                        json!({"data2": {"pose": {"data": [p.x, p.y, p.z, 180.0, 0.0, 0.0]}}}),
                    ));
                }
                Some((futures::stream::iter(batch), n + 1))
            }
        })
        .flatten();

        Ok(match self.config.stream_limit {
            Some(limit) => stream.take(limit).boxed(),
            None => stream.boxed(),
        })
    }

    async fn write_register(&self, index: u32, value: f64) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::Register {
                index,
                reason: "not connected".into(),
            });
        }
        match self.registers.lock() {
            Ok(mut guard) => guard.push((index, value)),
            Err(poisoned) => poisoned.into_inner().push((index, value)),
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}
