//! WebSocket subscribers.
//!
//! Each upgraded connection is split: the write half becomes a hub [`Subscriber`], the
//! read half is drained here only to notice the client going away.
//!
//! A failed or timed-out send gets the subscriber pruned from the hub, so the session
//! closes the socket as well. The client sees the close and can reconnect.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::hub::{SendError, Subscriber, SubscriberId};
use crate::service::TelemetryService;

/// Upper bound on one frame send; a client slower than this is dropped.
pub const WS_SEND_TIMEOUT: Duration = Duration::from_secs(1);

pub struct WsSubscriber {
    id: SubscriberId,
    sink: Mutex<SplitSink<WebSocket, Message>>,
    send_timeout: Duration,
    /// Cancelled once a send fails; the session then closes the socket.
    failed: CancellationToken,
}

impl WsSubscriber {
    pub fn new(sink: SplitSink<WebSocket, Message>, send_timeout: Duration) -> Self {
        Self {
            id: SubscriberId::new(),
            sink: Mutex::new(sink),
            send_timeout,
            failed: CancellationToken::new(),
        }
    }

    pub fn failed_token(&self) -> CancellationToken {
        self.failed.clone()
    }

    /// Best-effort close frame, bounded by the send timeout.
    async fn close(&self) {
        let mut sink = self.sink.lock().await;
        let close = async {
            sink.send(Message::Close(None)).await?;
            sink.close().await
        };
        if tokio::time::timeout(self.send_timeout, close).await.is_err() {
            tracing::debug!(subscriber = %self.id, "Close frame not sent in time");
        }
    }
}

#[async_trait]
impl Subscriber for WsSubscriber {
    fn id(&self) -> SubscriberId {
        self.id
    }

    async fn send_text(&self, text: &str) -> Result<(), SendError> {
        let mut sink = self.sink.lock().await;
        let send = sink.send(Message::Text(text.to_owned().into()));
        let result = match tokio::time::timeout(self.send_timeout, send).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SendError::Transport(e.to_string())),
            Err(_) => Err(SendError::Timeout(self.send_timeout)),
        };
        if result.is_err() {
            self.failed.cancel();
        }
        result
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(service): State<Arc<TelemetryService>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, service))
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    ClientClosed,
    SendFailed,
    Shutdown,
}

async fn handle_socket(socket: WebSocket, service: Arc<TelemetryService>) {
    let (sink, mut stream) = socket.split();
    let subscriber = Arc::new(WsSubscriber::new(sink, WS_SEND_TIMEOUT));
    let id = subscriber.id();
    let failed = subscriber.failed_token();
    service.hub().register(subscriber.clone()).await;

    let mut shutdown_rx = service.shutdown_rx();
    let end = loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    break SessionEnd::ClientClosed;
                }
                // Inbound frames carry nothing; pings are answered by axum.
                Some(Ok(_)) => {}
            },
            _ = failed.cancelled() => break SessionEnd::SendFailed,
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break SessionEnd::Shutdown;
                }
            }
        }
    };

    service.hub().unregister(id).await;
    if end != SessionEnd::ClientClosed {
        subscriber.close().await;
    }
    tracing::debug!(subscriber = %id, ?end, "WebSocket session ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::TelemetryMessage;
    use crate::service::tests::test_service;
    use crate::transport::http::serve_listener;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::tungstenite::Message as ClientMessage;

    struct Server {
        service: Arc<TelemetryService>,
        url: String,
        task: JoinHandle<anyhow::Result<()>>,
        _dir: tempfile::TempDir,
    }

    async fn start_server() -> Server {
        let dir = tempfile::tempdir().unwrap();
        let (service, _) = test_service(dir.path());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        let task = tokio::spawn(serve_listener(listener, service.clone()));
        Server {
            service,
            url,
            task,
            _dir: dir,
        }
    }

    async fn wait_for_subscribers(service: &TelemetryService, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while service.hub().len().await != n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("hub never reached {n} subscribers"));
    }

    /// Read until the server ends the connection.
    async fn read_until_closed<S>(client: &mut S)
    where
        S: futures::Stream<Item = Result<ClientMessage, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        tokio::time::timeout(Duration::from_secs(20), async {
            while let Some(Ok(msg)) = client.next().await {
                if let ClientMessage::Close(_) = msg {
                    break;
                }
            }
        })
        .await
        .expect("server never closed the connection");
    }

    #[tokio::test]
    async fn subscriber_lifecycle() {
        let server = start_server().await;
        let (mut client, _) = tokio_tungstenite::connect_async(&server.url).await.unwrap();
        wait_for_subscribers(&server.service, 1).await;

        let message = TelemetryMessage::running_program("MAIN");
        let report = server.service.hub().broadcast(&message).await;
        assert_eq!(report.delivered, 1);

        match client.next().await {
            Some(Ok(ClientMessage::Text(text))) => {
                assert_eq!(text.as_str(), message.to_json().unwrap());
            }
            other => panic!("expected a text frame, got {other:?}"),
        }

        client.close(None).await.unwrap();
        wait_for_subscribers(&server.service, 0).await;

        server.service.trigger_shutdown();
        server.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_closes_open_sessions() {
        let server = start_server().await;
        let (mut client, _) = tokio_tungstenite::connect_async(&server.url).await.unwrap();
        wait_for_subscribers(&server.service, 1).await;

        server.service.trigger_shutdown();
        read_until_closed(&mut client).await;

        tokio::time::timeout(Duration::from_secs(5), server.task)
            .await
            .expect("server did not shut down")
            .unwrap()
            .unwrap();
        assert!(server.service.hub().is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stalled_client_is_disconnected_and_can_reconnect() {
        let server = start_server().await;
        let (mut stalled, _) = tokio_tungstenite::connect_async(&server.url).await.unwrap();
        wait_for_subscribers(&server.service, 1).await;

        // The client reads nothing, so socket buffers fill until a send times out.
        let big = "x".repeat(4 * 1024 * 1024);
        let mut pruned = false;
        for _ in 0..32 {
            if server.service.hub().broadcast_text(&big).await.pruned == 1 {
                pruned = true;
                break;
            }
        }
        assert!(pruned, "stalled subscriber was never pruned");
        assert!(server.service.hub().is_empty().await);

        // Whatever was buffered drains, then the connection ends.
        read_until_closed(&mut stalled).await;

        let (mut fresh, _) = tokio_tungstenite::connect_async(&server.url).await.unwrap();
        wait_for_subscribers(&server.service, 1).await;
        let report = server
            .service
            .hub()
            .broadcast(&TelemetryMessage::velocity(5.0, None))
            .await;
        assert_eq!(report.delivered, 1);
        assert!(matches!(
            fresh.next().await,
            Some(Ok(ClientMessage::Text(_)))
        ));

        server.service.trigger_shutdown();
        server.task.await.unwrap().unwrap();
    }
}
