//! Consumer side of the producer channel.
//!
//! A single loop drains the channel and hands each message to a [`MessageHandler`].
//! Handler failures (errors or panics) are logged and swallowed so one bad message never
//! stops delivery.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::bridge::{ChannelReceiver, Poll};
use crate::message::TelemetryMessage;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("{0}")]
    Other(String),
}

/// Receives every message that crosses the channel, in order.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: TelemetryMessage) -> Result<(), HandlerError>;
}

#[derive(Debug, Default)]
pub struct ConsumerStats {
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl ConsumerStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Drain `rx` until cancelled or every sender is gone.
///
/// Polls without blocking; an empty poll sleeps for `poll_interval`.
pub async fn run_consumer_loop(
    mut rx: ChannelReceiver,
    handler: Arc<dyn MessageHandler>,
    poll_interval: Duration,
    cancel: CancellationToken,
    stats: Arc<ConsumerStats>,
) {
    tracing::debug!(?poll_interval, "Consumer loop started");

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let item = match rx.poll_item() {
            Poll::Item(item) => item,
            Poll::Empty => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => continue,
                }
            }
            Poll::Disconnected => {
                tracing::info!("Producer channel disconnected, consumer loop exiting");
                break;
            }
        };

        let message = match TelemetryMessage::from_serializable(item.payload) {
            Ok(message) => message,
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    incarnation = %item.incarnation,
                    seq = item.seq,
                    error = %HandlerError::from(e),
                    "Dropping malformed channel item"
                );
                continue;
            }
        };

        let kind = message.kind();
        let outcome = std::panic::AssertUnwindSafe(handler.handle(message))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {
                stats.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(kind, seq = item.seq, error = %e, "Message handler failed");
            }
            Err(_) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(kind, seq = item.seq, "Message handler panicked");
            }
        }

        // Let other tasks run between items during a burst.
        tokio::task::yield_now().await;
    }

    tracing::debug!(
        delivered = stats.delivered(),
        failed = stats.failed(),
        "Consumer loop stopped"
    );
}
