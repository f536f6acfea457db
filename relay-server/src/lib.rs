//! Server-Sent Events relay for Uptime Kuma heartbeats
//!
//! Browsers open `GET /api/uptime-kuma/heartbeats?monitorId=N` and receive a
//! stream of JSON messages for that one monitor. All viewers share a single
//! upstream Socket.IO connection; the [`SubscriptionRegistry`] fans its
//! heartbeats out to per-session queues and each [`StreamingSession`] writes
//! its queue to the viewer with periodic keep-alive pings.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use kuma_relay_server::{RelayConfig, RelayServer};
//! use kuma_relay_upstream::ConnectionManager;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RelayConfig::default();
//!     let upstream = Arc::new(ConnectionManager::new(config.upstream.clone()));
//!
//!     let server = RelayServer::new(config, upstream)?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
/// Axum routes and handlers
pub mod http;
pub mod registry;
/// Server lifecycle
pub mod server;
pub mod session;


pub use config::{ConfigError, LogFormat, LoggingConfig, RelayConfig, ServerSettings};
pub use http::{AppState, HealthResponse, HealthStatus, create_router};
pub use registry::{SubscriptionHandle, SubscriptionRegistry};
pub use server::{RelayServer, ServerError};
pub use session::{ChannelSink, CloseReason, EventSink, StreamingSession, WriteError};
