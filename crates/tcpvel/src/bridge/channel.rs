//! Cross-process telemetry channel.
//!
//! Parent side: [`CrossProcessChannel::open`] binds the socket and runs an accept loop.
//! Each producer connection gets a reader task that decodes frames and forwards them,
//! in order, into one bounded in-process queue. The queue outlives any single
//! connection, so a restarted producer just reconnects.
//!
//! Producer side: [`ChannelSender::connect`] returns a sender whose `put` never waits;
//! frames go through a bounded queue to a writer task that owns the socket.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::{SinkExt, StreamExt};
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use super::codec::JsonCodec;
use super::protocol::{Envelope, IncarnationId};
use super::transport::{ChannelListener, ChildChannelInfo, bind_listener, connect};
use crate::message::TelemetryMessage;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
    #[error("channel full, frame dropped")]
    Full,
    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("channel transport error: {0}")]
    Io(#[from] std::io::Error),
}

/// One frame delivered to the consumer, tagged with the incarnation that sent it.
#[derive(Debug, Clone)]
pub struct ChannelItem {
    pub incarnation: IncarnationId,
    pub seq: u64,
    pub payload: serde_json::Value,
}

/// Result of a non-blocking poll.
#[derive(Debug)]
pub enum Poll {
    Item(ChannelItem),
    Empty,
    Disconnected,
}

/// Parent-side handle: owns the listener task and the producer address.
pub struct CrossProcessChannel {
    info: ChildChannelInfo,
    cancel: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
}

pub struct ChannelReceiver {
    rx: mpsc::Receiver<ChannelItem>,
}

impl ChannelReceiver {
    pub fn poll_item(&mut self) -> Poll {
        match self.rx.try_recv() {
            Ok(item) => Poll::Item(item),
            Err(TryRecvError::Empty) => Poll::Empty,
            Err(TryRecvError::Disconnected) => Poll::Disconnected,
        }
    }

    pub async fn recv(&mut self) -> Option<ChannelItem> {
        self.rx.recv().await
    }
}

impl CrossProcessChannel {
    pub async fn open(capacity: usize) -> Result<(Self, ChannelReceiver), ChannelError> {
        let (listener, info) = bind_listener()?;
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let cancel = CancellationToken::new();

        let accept_task = tokio::spawn(accept_loop(listener, tx, cancel.clone()));

        tracing::info!(capacity, "Opened producer channel");
        Ok((
            Self {
                info,
                cancel,
                accept_task: Some(accept_task),
            },
            ChannelReceiver { rx },
        ))
    }

    pub fn child_info(&self) -> &ChildChannelInfo {
        &self.info
    }

    /// Stop accepting and drop all producer connections.
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.accept_task.take()
            && let Err(e) = task.await
            && !e.is_cancelled()
        {
            tracing::warn!(error = %e, "Channel accept task failed");
        }
        tracing::debug!("Producer channel closed");
    }
}

impl Drop for CrossProcessChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    listener: ChannelListener,
    tx: mpsc::Sender<ChannelItem>,
    cancel: CancellationToken,
) {
    let mut readers = Vec::new();
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok(stream) => {
                tracing::debug!("Producer connection accepted");
                readers.retain(|h: &JoinHandle<()>| !h.is_finished());
                readers.push(tokio::spawn(read_connection(
                    stream,
                    tx.clone(),
                    cancel.child_token(),
                )));
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to accept producer connection");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
                }
            }
        }
    }

    for reader in readers {
        let _ = reader.await;
    }
}

async fn read_connection(
    stream: UnixStream,
    tx: mpsc::Sender<ChannelItem>,
    cancel: CancellationToken,
) {
    let mut reader = FramedRead::new(stream, JsonCodec::<Envelope>::new());
    let mut incarnation: Option<IncarnationId> = None;

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = reader.next() => frame,
        };

        match frame {
            Some(Ok(Envelope::Hello { incarnation: id, pid })) => {
                tracing::info!(incarnation = %id, pid, "Producer connected");
                incarnation = Some(id);
            }
            Some(Ok(Envelope::Telemetry { seq, payload })) => {
                let Some(id) = incarnation else {
                    tracing::warn!(seq, "Telemetry before hello, dropping");
                    continue;
                };
                let item = ChannelItem {
                    incarnation: id,
                    seq,
                    payload,
                };
                let sent = tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = tx.send(item) => sent,
                };
                if sent.is_err() {
                    tracing::debug!("Channel receiver dropped, closing producer connection");
                    break;
                }
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Producer channel frame error");
                break;
            }
            None => {
                match incarnation {
                    Some(id) => tracing::info!(incarnation = %id, "Producer disconnected"),
                    None => tracing::debug!("Producer disconnected before hello"),
                }
                break;
            }
        }
    }
}

/// Producer-side sender.
pub struct ChannelSender {
    tx: mpsc::Sender<Envelope>,
    seq: AtomicU64,
    closed: CancellationToken,
}

impl ChannelSender {
    /// Connect, send `Hello`, and start the writer task.
    ///
    /// [`closed_token`](Self::closed_token) fires when the server side goes away (EOF
    /// on the socket or a failed write).
    pub async fn connect(
        info: &ChildChannelInfo,
        incarnation: IncarnationId,
        capacity: usize,
    ) -> Result<(Arc<Self>, JoinHandle<()>), ChannelError> {
        let stream = connect(info).await?;
        let (mut read_half, write_half) = stream.into_split();
        let mut writer = FramedWrite::new(write_half, JsonCodec::<Envelope>::new());

        writer
            .send(Envelope::Hello {
                incarnation,
                pid: std::process::id(),
            })
            .await?;

        let (tx, mut rx) = mpsc::channel::<Envelope>(capacity.max(1));
        let closed = CancellationToken::new();

        // The server never writes; EOF means it is gone.
        let closed_on_eof = closed.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
            closed_on_eof.cancel();
        });

        let closed_on_error = closed.clone();
        let writer_task = tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = closed_on_error.cancelled() => break,
                    frame = rx.recv() => frame,
                };
                let Some(frame) = frame else { break };
                if let Err(e) = writer.send(frame).await {
                    tracing::warn!(error = %e, "Failed to write to server channel");
                    break;
                }
            }
            closed_on_error.cancel();
        });

        Ok((
            Arc::new(Self {
                tx,
                seq: AtomicU64::new(0),
                closed,
            }),
            writer_task,
        ))
    }

    /// Enqueue a message without waiting. `Full` means the frame was dropped.
    pub fn put(&self, message: &TelemetryMessage) -> Result<(), ChannelError> {
        self.put_value(message.to_serializable()?)
    }

    pub fn put_value(&self, payload: serde_json::Value) -> Result<(), ChannelError> {
        if self.closed.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        match self.tx.try_send(Envelope::Telemetry { seq, payload }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ChannelError::Full),
            Err(TrySendError::Closed(_)) => Err(ChannelError::Closed),
        }
    }

    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}
