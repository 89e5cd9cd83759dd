//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::service::TelemetryService;

use super::routes::routes;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

impl ServerConfig {
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        let addr: SocketAddr = format!("{}:{}", self.host, self.port).parse()?;
        Ok(TcpListener::bind(addr).await?)
    }
}

/// Serve until SIGINT, SIGTERM or `/shutdown`, then stop the pipeline and flush state.
///
/// If the address cannot be bound the service is still shut down before the error is
/// returned.
pub async fn serve(config: ServerConfig, service: Arc<TelemetryService>) -> anyhow::Result<()> {
    let listener = match config.bind().await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(host = %config.host, port = config.port, error = %e, "Failed to bind");
            service.trigger_shutdown();
            service.shutdown().await;
            return Err(e);
        }
    };
    serve_listener(listener, service).await
}

/// Serve on an already-bound listener.
pub async fn serve_listener(
    listener: TcpListener,
    service: Arc<TelemetryService>,
) -> anyhow::Result<()> {
    let shutdown_rx = service.shutdown_rx();
    let app = routes(service.clone());
    let actual_addr = listener.local_addr()?;

    info!("Starting tcpvel server on {}", actual_addr);

    let signalled = Arc::clone(&service);
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal(shutdown_rx).await;
            // WebSocket sessions watch this flag.
            signalled.trigger_shutdown();
        })
        .await;

    info!("Server shutdown complete");

    // Stop the producer and flush even if serving failed.
    service.trigger_shutdown();
    service.shutdown().await;

    result?;
    Ok(())
}

/// Wait for shutdown signal (SIGTERM, SIGINT, or /shutdown endpoint).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. That only happens when the tokio
/// runtime is misconfigured, which should fail fast at startup.
async fn shutdown_signal(mut shutdown_rx: watch::Receiver<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler - is tokio runtime configured correctly?");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler - is tokio runtime configured correctly?")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let explicit_shutdown = async {
        while !*shutdown_rx.borrow() {
            if shutdown_rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
        _ = explicit_shutdown => {
            info!("Shutdown requested via /shutdown endpoint...");
        }
    }
}
