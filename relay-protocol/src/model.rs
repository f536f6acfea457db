//! Heartbeat relay data model

use crate::error::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Identifier of a single monitored target in Uptime Kuma
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MonitorId(u64);

impl MonitorId {
    /// Wrap a raw Kuma monitor ID
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// The raw ID
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Parse an optional query parameter into a monitor ID
    pub fn from_param(param: Option<&str>) -> Result<Self, ValidationError> {
        match param {
            None => Err(ValidationError::MissingMonitorId),
            Some(raw) if raw.trim().is_empty() => Err(ValidationError::MissingMonitorId),
            Some(raw) => raw.parse(),
        }
    }
}

impl FromStr for MonitorId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        // u64::from_str accepts a leading '+', which is not a plain identifier
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ValidationError::InvalidMonitorId(s.to_string()));
        }
        trimmed
            .parse::<u64>()
            .map(Self)
            .map_err(|_| ValidationError::InvalidMonitorId(s.to_string()))
    }
}

impl fmt::Display for MonitorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for MonitorId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Status carried by a heartbeat
///
/// Kuma sends the numeric code; names are accepted on input as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawStatus", into = "u8")]
pub enum HeartbeatStatus {
    Down,
    Up,
    Pending,
    Maintenance,
}

impl HeartbeatStatus {
    /// Numeric code as used by Kuma
    pub fn code(self) -> u8 {
        match self {
            Self::Down => 0,
            Self::Up => 1,
            Self::Pending => 2,
            Self::Maintenance => 3,
        }
    }

    /// Lowercase name
    pub fn name(self) -> &'static str {
        match self {
            Self::Down => "down",
            Self::Up => "up",
            Self::Pending => "pending",
            Self::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for HeartbeatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<HeartbeatStatus> for u8 {
    fn from(status: HeartbeatStatus) -> Self {
        status.code()
    }
}

impl TryFrom<u8> for HeartbeatStatus {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::Down),
            1 => Ok(Self::Up),
            2 => Ok(Self::Pending),
            3 => Ok(Self::Maintenance),
            other => Err(format!("unknown heartbeat status code {other}")),
        }
    }
}

impl FromStr for HeartbeatStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "down" => Ok(Self::Down),
            "up" => Ok(Self::Up),
            "pending" => Ok(Self::Pending),
            "maintenance" => Ok(Self::Maintenance),
            other => Err(format!("unknown heartbeat status {other:?}")),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawStatus {
    Code(u8),
    Name(String),
}

impl TryFrom<RawStatus> for HeartbeatStatus {
    type Error = String;

    fn try_from(raw: RawStatus) -> Result<Self, Self::Error> {
        match raw {
            RawStatus::Code(code) => code.try_into(),
            RawStatus::Name(name) => name.parse(),
        }
    }
}

/// One status update for one monitor, as emitted by Uptime Kuma
///
/// Fields the relay does not interpret (`duration`, `important`,
/// `down_count`, ...) are kept in `extra` and forwarded unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatEvent {
    #[serde(rename = "monitorID")]
    pub monitor_id: MonitorId,
    pub status: HeartbeatStatus,
    /// Kuma stores `null` for checks that produced no message
    #[serde(default, deserialize_with = "null_as_empty")]
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

impl HeartbeatEvent {
    /// Event with an empty message and no extra fields
    pub fn new(monitor_id: MonitorId, status: HeartbeatStatus) -> Self {
        Self {
            monitor_id,
            status,
            msg: String::new(),
            time: None,
            ping: None,
            extra: Map::new(),
        }
    }

    pub fn with_msg(mut self, msg: impl Into<String>) -> Self {
        self.msg = msg.into();
        self
    }

    pub fn with_time(mut self, time: impl Into<String>) -> Self {
        self.time = Some(time.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Kuma flags status changes as important; sqlite backends send 0/1
    pub fn is_important(&self) -> bool {
        match self.extra.get("important") {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_u64() == Some(1),
            _ => false,
        }
    }
}

/// Lifecycle state of the single upstream connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of the upstream connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub connected: bool,
    pub authenticated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reconnect_attempts: u32,
}

impl ConnectionStatus {
    /// Snapshot with `connected` derived from `state`
    pub fn new(state: ConnectionState, authenticated: bool) -> Self {
        Self {
            state,
            connected: state == ConnectionState::Connected,
            authenticated,
            last_heartbeat_at: None,
            reconnect_attempts: 0,
        }
    }

    pub fn disconnected() -> Self {
        Self::new(ConnectionState::Disconnected, false)
    }

    /// Whether a connect attempt is already established or under way
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Connecting
        )
    }
}

/// A message written to a viewer's event stream
///
/// Serialized as one JSON object per SSE `data:` line, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamMessage {
    Connected {
        #[serde(rename = "monitorId")]
        monitor_id: MonitorId,
    },
    Status {
        #[serde(rename = "monitorId")]
        monitor_id: MonitorId,
        status: ConnectionStatus,
    },
    Heartbeat {
        #[serde(rename = "monitorId")]
        monitor_id: MonitorId,
        data: HeartbeatEvent,
    },
    Ping {
        timestamp: i64,
    },
    Error {
        #[serde(rename = "monitorId")]
        monitor_id: MonitorId,
        error: String,
    },
}

impl StreamMessage {
    /// First message of every successfully opened stream
    pub fn connected(monitor_id: MonitorId) -> Self {
        Self::Connected { monitor_id }
    }

    pub fn status(monitor_id: MonitorId, status: ConnectionStatus) -> Self {
        Self::Status { monitor_id, status }
    }

    /// Heartbeat addressed to the event's own monitor
    pub fn heartbeat(data: HeartbeatEvent) -> Self {
        Self::Heartbeat {
            monitor_id: data.monitor_id,
            data,
        }
    }

    /// Keep-alive stamped with the current time in epoch milliseconds
    pub fn ping() -> Self {
        Self::Ping {
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Connect failure; the stream closes after it
    pub fn error(monitor_id: MonitorId, error: impl Into<String>) -> Self {
        Self::Error {
            monitor_id,
            error: error.into(),
        }
    }

    /// The value of the `type` discriminator
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Status { .. } => "status",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Ping { .. } => "ping",
            Self::Error { .. } => "error",
        }
    }

    /// Single-line JSON document for one SSE `data:` field
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
