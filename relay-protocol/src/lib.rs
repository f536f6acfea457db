//! Core types for the Kuma heartbeat relay
//!
//! This crate holds the data model shared by the upstream connection manager
//! and the relay server: monitor identifiers, heartbeat events as emitted by
//! Uptime Kuma, connection status snapshots, and the messages written to
//! browser viewers over Server-Sent Events.
//!
//! # Quick Start
//!
//! ```rust
//! use kuma_relay_protocol::{MonitorId, StreamMessage};
//!
//! let monitor_id: MonitorId = "7".parse().unwrap();
//! let message = StreamMessage::connected(monitor_id);
//!
//! assert_eq!(
//!     message.to_json().unwrap(),
//!     "{\"type\":\"connected\",\"monitorId\":7}"
//! );
//! ```

pub mod error;
pub mod model;

#[cfg(test)]
mod model_tests;

pub use error::ValidationError;
pub use model::*;

/// Interval between keep-alive pings on a viewer stream, in seconds
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 30;
