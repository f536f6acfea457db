//! Relay server lifecycle

use crate::config::RelayConfig;
use crate::http::{AppState, HEARTBEATS_PATH, create_router};
use crate::registry::SubscriptionRegistry;
use axum::Router;
use kuma_relay_upstream::Upstream;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How long `stop` waits for open streams to drain
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Error type for server operations
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Server configuration error: {0}")]
    Configuration(String),

    #[error("Failed to bind {addr}: {reason}")]
    Bind { addr: SocketAddr, reason: String },

    #[error("HTTP server error: {0}")]
    Serve(String),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server not running")]
    NotRunning,
}

struct Running {
    addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

/// HTTP relay bound to one upstream connection
pub struct RelayServer {
    config: RelayConfig,
    upstream: Arc<dyn Upstream>,
    state: AppState,
    running: Option<Running>,
}

impl RelayServer {
    /// Build the registry and handler state. Must be called within a Tokio runtime.
    pub fn new(config: RelayConfig, upstream: Arc<dyn Upstream>) -> Result<Self, ServerError> {
        config
            .validate()
            .map_err(|e| ServerError::Configuration(e.to_string()))?;

        let registry = SubscriptionRegistry::new(upstream.clone(), config.server.queue_capacity);
        let state = AppState::new(upstream.clone(), registry, config.server.ping_interval());

        Ok(Self {
            config,
            upstream,
            state,
            running: None,
        })
    }

    /// Handler state shared by every request
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// A router over this server's state, for serving elsewhere or testing
    pub fn router(&self) -> Router {
        create_router(self.state.clone(), self.config.server.enable_cors)
    }

    /// Address the listener is bound to while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.addr)
    }

    /// Whether `start` succeeded and `stop` has not run since
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Bind the listener and serve in the background
    pub async fn start(&mut self) -> Result<SocketAddr, ServerError> {
        if self.running.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        let addr = self
            .config
            .server
            .bind_addr()
            .map_err(|e| ServerError::Configuration(e.to_string()))?;

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr,
                reason: e.to_string(),
            })?;
        let addr = listener
            .local_addr()
            .map_err(|e| ServerError::Bind {
                addr,
                reason: e.to_string(),
            })?;

        // Fresh token so a stopped server can start again
        self.state.shutdown = CancellationToken::new();
        let shutdown = self.state.shutdown.clone();
        let app = self.router();

        info!("Kuma relay listening on {}", addr);
        info!("Endpoints:");
        info!("  GET    http://{}{}?monitorId=N - Heartbeat stream", addr, HEARTBEATS_PATH);
        info!("  GET    http://{}/health - Health check", addr);

        let graceful = shutdown.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(graceful.cancelled_owned())
                .await
            {
                error!("HTTP server error: {}", e);
            }
        });

        self.running = Some(Running {
            addr,
            shutdown,
            handle,
        });
        Ok(addr)
    }

    /// End every open stream, stop serving and close the upstream connection
    pub async fn stop(&mut self) -> Result<(), ServerError> {
        let running = self.running.take().ok_or(ServerError::NotRunning)?;
        info!("Stopping Kuma relay");

        running.shutdown.cancel();
        self.state.registry.close_all();

        let mut handle = running.handle;
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("HTTP server task ended abnormally: {}", e),
            Err(_) => {
                warn!("Open streams did not drain in time, aborting");
                handle.abort();
            }
        }

        self.upstream.disconnect().await;
        info!("Kuma relay stopped");
        Ok(())
    }

    /// Start, then serve until Ctrl-C
    pub async fn run(mut self) -> Result<(), ServerError> {
        self.start().await?;

        match signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => {
                error!("Failed to listen for shutdown signal: {}", e);
                self.stop().await?;
                return Err(ServerError::Serve(e.to_string()));
            }
        }

        self.stop().await
    }
}
