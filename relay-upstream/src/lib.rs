//! Upstream connection to the Uptime Kuma monitoring server
//!
//! Uptime Kuma publishes heartbeats over Socket.IO. This crate owns the one
//! shared connection the relay keeps to it:
//!
//! - [`packet`]: Engine.IO v4 / Socket.IO v5 text packet codec
//! - [`ConnectionManager`]: WebSocket connection with handshake, login and
//!   reconnect with capped exponential backoff
//! - [`Upstream`]: the seam the relay depends on, so tests can swap in a
//!   scripted upstream (`MockUpstream`, behind the `test-utils` feature)
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use kuma_relay_upstream::{ConnectionManager, Upstream, UpstreamConfig};
//!
//! # async fn example() -> Result<(), kuma_relay_upstream::UpstreamError> {
//! let upstream = ConnectionManager::new(UpstreamConfig::default());
//! let mut events = upstream.events();
//!
//! upstream.connect().await?;
//! while let Ok(heartbeat) = events.recv().await {
//!     println!("monitor {} is {}", heartbeat.monitor_id, heartbeat.status);
//! }
//! # Ok(())
//! # }
//! ```

/// Connection settings and reconnect policy
pub mod config;
/// The WebSocket-backed [`Upstream`] implementation
pub mod manager;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
/// Engine.IO / Socket.IO wire format
pub mod packet;


use async_trait::async_trait;
use kuma_relay_protocol::{ConnectionStatus, HeartbeatEvent};
use thiserror::Error as ThisError;
use tokio::sync::broadcast;

pub use config::{ReconnectPolicy, UpstreamConfig};
pub use manager::ConnectionManager;
#[cfg(any(test, feature = "test-utils"))]
pub use mock::MockUpstream;

/// Failure talking to Uptime Kuma
#[derive(Debug, Clone, ThisError)]
pub enum UpstreamError {
    /// The configuration cannot produce a usable endpoint
    #[error("Upstream configuration error: {0}")]
    Config(String),

    /// Unreachable server, failed WebSocket upgrade or rejected namespace
    #[error("Connection error: {0}")]
    Connection(String),

    /// Kuma rejected the login; carries Kuma's message
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The server sent something that is not valid Engine.IO / Socket.IO
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Handshake or login did not finish in time (milliseconds)
    #[error("Timed out after {0}ms")]
    Timeout(u64),

    /// The socket closed before the operation completed
    #[error("Connection closed: {0}")]
    Closed(String),
}

impl UpstreamError {
    /// Shorthand for [`UpstreamError::Connection`]
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Shorthand for [`UpstreamError::Authentication`]
    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    /// Shorthand for [`UpstreamError::Protocol`]
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Whether trying again later could succeed without changing configuration
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Timeout(_) | Self::Closed(_)
        )
    }
}

/// The single shared link to the upstream monitor service
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Establish and authenticate the connection.
    ///
    /// Returns at once when already connected. A caller arriving while an
    /// attempt is under way waits for it and gets the same result.
    async fn connect(&self) -> Result<(), UpstreamError>;

    /// Receiver for every heartbeat received upstream, across all monitors
    fn events(&self) -> broadcast::Receiver<HeartbeatEvent>;

    /// Current connection status, without waiting
    fn status(&self) -> ConnectionStatus;

    /// Close the connection; a later `connect` starts over
    async fn disconnect(&self);
}
