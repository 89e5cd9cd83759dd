//! Fan-out of telemetry to connected subscribers.
//!
//! The subscriber map is only locked to mutate it or to take a snapshot. Sends happen
//! on the snapshot with no lock held, and subscribers whose send failed are removed in
//! one locked pass afterwards, so dead connections clean themselves up without a
//! heartbeat.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::consumer::{HandlerError, MessageHandler};
use crate::message::TelemetryMessage;

/// Identity of one subscriber connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SubscriberId(uuid::Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("subscriber connection closed")]
    Closed,
    #[error("send timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
}

/// One outbound connection. Implemented by the WebSocket layer.
#[async_trait]
pub trait Subscriber: Send + Sync {
    fn id(&self) -> SubscriberId;

    /// Deliver one text frame. Expected to complete quickly or fail.
    async fn send_text(&self, text: &str) -> Result<(), SendError>;
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub pruned: usize,
}

#[derive(Default)]
pub struct BroadcastHub {
    subscribers: RwLock<HashMap<SubscriberId, Arc<dyn Subscriber>>>,
    serialized: AtomicU64,
}

impl BroadcastHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a subscriber. Registering the same id twice keeps one entry.
    pub async fn register(&self, subscriber: Arc<dyn Subscriber>) -> usize {
        let id = subscriber.id();
        let count = {
            let mut subs = self.subscribers.write().await;
            subs.insert(id, subscriber);
            subs.len()
        };
        tracing::info!(subscriber = %id, online = count, "Subscriber connected");
        count
    }

    /// Remove a subscriber. Returns false if it was not registered.
    pub async fn unregister(&self, id: SubscriberId) -> bool {
        let (removed, count) = {
            let mut subs = self.subscribers.write().await;
            let removed = subs.remove(&id).is_some();
            (removed, subs.len())
        };
        if removed {
            tracing::info!(subscriber = %id, online = count, "Subscriber disconnected");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.subscribers.read().await.is_empty()
    }

    pub async fn contains(&self, id: SubscriberId) -> bool {
        self.subscribers.read().await.contains_key(&id)
    }

    /// Number of messages serialized for broadcast so far.
    pub fn serialized_count(&self) -> u64 {
        self.serialized.load(Ordering::Relaxed)
    }

    /// Serialize once and send to every subscriber.
    ///
    /// Never fails: delivery errors only prune the failing subscribers.
    pub async fn broadcast(&self, message: &TelemetryMessage) -> BroadcastReport {
        if self.is_empty().await {
            return BroadcastReport::default();
        }

        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(kind = message.kind(), error = %e, "Failed to serialize telemetry");
                return BroadcastReport::default();
            }
        };
        self.serialized.fetch_add(1, Ordering::Relaxed);

        self.broadcast_text(&text).await
    }

    /// Send an already-serialized frame to every subscriber.
    pub async fn broadcast_text(&self, text: &str) -> BroadcastReport {
        let snapshot: Vec<Arc<dyn Subscriber>> =
            self.subscribers.read().await.values().cloned().collect();
        if snapshot.is_empty() {
            return BroadcastReport::default();
        }

        let mut failed = Vec::new();
        let mut delivered = 0;
        for subscriber in &snapshot {
            match subscriber.send_text(text).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::debug!(subscriber = %subscriber.id(), error = %e, "Send failed");
                    failed.push(subscriber.id());
                }
            }
        }

        if !failed.is_empty() {
            let mut subs = self.subscribers.write().await;
            for id in &failed {
                subs.remove(id);
            }
            tracing::warn!(
                pruned = failed.len(),
                online = subs.len(),
                "Pruned dead subscriber connections"
            );
        }

        BroadcastReport {
            delivered,
            pruned: failed.len(),
        }
    }
}

#[async_trait]
impl MessageHandler for BroadcastHub {
    async fn handle(&self, message: TelemetryMessage) -> Result<(), HandlerError> {
        self.broadcast(&message).await;
        Ok(())
    }
}
