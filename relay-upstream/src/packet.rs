//! Engine.IO v4 / Socket.IO v5 text packet codec
//!
//! Only the text framing over WebSocket is supported; binary attachments and
//! HTTP long-polling payload batching are not used by Uptime Kuma's heartbeat
//! feed.
//!
//! ```text
//! 0{"sid":"..","pingInterval":25000,"pingTimeout":20000}   engine open
//! 2 / 3                                                    engine ping / pong
//! 40{"sid":".."}                                           socket connect
//! 42["heartbeat",{"monitorID":7,"status":1}]               socket event
//! 4217["login",{"username":"admin"}]                       event with ack id 17
//! 4317[{"ok":true,"token":".."}]                           ack for id 17
//! ```

use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Why a text frame could not be decoded
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    /// Zero-length frame
    #[error("empty packet")]
    Empty,

    /// First character is not an Engine.IO type
    #[error("unknown engine packet type {0:?}")]
    UnknownEngineType(char),

    /// Message carries an unknown Socket.IO type
    #[error("unknown socket packet type {0:?}")]
    UnknownSocketType(char),

    /// Binary event or ack
    #[error("binary packets are not supported")]
    Binary,

    /// JSON body missing or malformed
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

/// Handshake parameters sent by the server in the `open` packet
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenPayload {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: u64,
    #[serde(default)]
    pub max_payload: Option<u64>,
}

fn default_ping_interval() -> u64 {
    25_000
}

fn default_ping_timeout() -> u64 {
    20_000
}

impl OpenPayload {
    /// How long the connection may stay silent before it is considered dead
    pub fn liveness_window(&self) -> Duration {
        Duration::from_millis(self.ping_interval + self.ping_timeout)
    }
}

/// Engine.IO transport-level packet
#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(OpenPayload),
    Close,
    Ping(String),
    Pong(String),
    Message(SocketPacket),
    Upgrade,
    Noop,
}

impl EnginePacket {
    /// Parse one WebSocket text frame
    pub fn decode(text: &str) -> Result<Self, PacketError> {
        let mut chars = text.chars();
        let kind = chars.next().ok_or(PacketError::Empty)?;
        let rest = chars.as_str();

        match kind {
            '0' => serde_json::from_str(rest)
                .map(Self::Open)
                .map_err(|e| PacketError::InvalidPayload(e.to_string())),
            '1' => Ok(Self::Close),
            '2' => Ok(Self::Ping(rest.to_string())),
            '3' => Ok(Self::Pong(rest.to_string())),
            '4' => SocketPacket::decode(rest).map(Self::Message),
            '5' => Ok(Self::Upgrade),
            '6' => Ok(Self::Noop),
            other => Err(PacketError::UnknownEngineType(other)),
        }
    }

    /// Serialize to a WebSocket text frame
    pub fn encode(&self) -> String {
        match self {
            // Servers send `open`; clients never do, but keep the codec total
            Self::Open(open) => format!(
                "0{}",
                serde_json::json!({
                    "sid": open.sid,
                    "upgrades": open.upgrades,
                    "pingInterval": open.ping_interval,
                    "pingTimeout": open.ping_timeout,
                })
            ),
            Self::Close => "1".to_string(),
            Self::Ping(data) => format!("2{data}"),
            Self::Pong(data) => format!("3{data}"),
            Self::Message(packet) => format!("4{}", packet.encode()),
            Self::Upgrade => "5".to_string(),
            Self::Noop => "6".to_string(),
        }
    }
}

/// Socket.IO packet carried inside an Engine.IO message, default namespace only
#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect(Option<Value>),
    Disconnect,
    Event {
        id: Option<u64>,
        name: String,
        args: Vec<Value>,
    },
    Ack {
        id: u64,
        args: Vec<Value>,
    },
    ConnectError(Value),
}

impl SocketPacket {
    /// Event without an acknowledgement id
    pub fn event(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self::Event {
            id: None,
            name: name.into(),
            args,
        }
    }

    /// Event the peer answers with an `Ack` carrying the same `id`
    pub fn event_with_ack(id: u64, name: impl Into<String>, args: Vec<Value>) -> Self {
        Self::Event {
            id: Some(id),
            name: name.into(),
            args,
        }
    }

    /// Parse the payload of an Engine.IO message packet
    pub fn decode(text: &str) -> Result<Self, PacketError> {
        let mut chars = text.chars();
        let kind = chars.next().ok_or(PacketError::Empty)?;
        let rest = skip_namespace(chars.as_str());

        match kind {
            '0' => {
                let payload = if rest.is_empty() {
                    None
                } else {
                    Some(parse_json(rest)?)
                };
                Ok(Self::Connect(payload))
            }
            '1' => Ok(Self::Disconnect),
            '2' => {
                let (id, body) = split_ack_id(rest);
                let mut args = parse_array(body)?;
                if args.is_empty() {
                    return Err(PacketError::InvalidPayload("event without name".to_string()));
                }
                let name = match args.remove(0) {
                    Value::String(name) => name,
                    other => {
                        return Err(PacketError::InvalidPayload(format!(
                            "event name must be a string, got {other}"
                        )));
                    }
                };
                Ok(Self::Event { id, name, args })
            }
            '3' => {
                let (id, body) = split_ack_id(rest);
                let id = id.ok_or_else(|| PacketError::InvalidPayload("ack without id".to_string()))?;
                Ok(Self::Ack {
                    id,
                    args: parse_array(body)?,
                })
            }
            '4' => Ok(Self::ConnectError(if rest.is_empty() {
                Value::Null
            } else {
                parse_json(rest)?
            })),
            '5' | '6' => Err(PacketError::Binary),
            other => Err(PacketError::UnknownSocketType(other)),
        }
    }

    /// Serialize without the Engine.IO `4` prefix
    pub fn encode(&self) -> String {
        match self {
            Self::Connect(None) => "0".to_string(),
            Self::Connect(Some(payload)) => format!("0{payload}"),
            Self::Disconnect => "1".to_string(),
            Self::Event { id, name, args } => {
                let mut array = Vec::with_capacity(args.len() + 1);
                array.push(Value::String(name.clone()));
                array.extend(args.iter().cloned());
                let id = id.map(|id| id.to_string()).unwrap_or_default();
                format!("2{id}{}", Value::Array(array))
            }
            Self::Ack { id, args } => format!("3{id}{}", Value::Array(args.clone())),
            Self::ConnectError(payload) => format!("4{payload}"),
        }
    }

    /// Human-readable reason carried by a `ConnectError`
    pub fn connect_error_message(payload: &Value) -> String {
        payload
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| payload.to_string())
    }
}

/// Drop a `/nsp,` prefix; Kuma only uses the default namespace
fn skip_namespace(rest: &str) -> &str {
    if rest.starts_with('/') {
        match rest.find(',') {
            Some(idx) => &rest[idx + 1..],
            None => "",
        }
    } else {
        rest
    }
}

fn split_ack_id(rest: &str) -> (Option<u64>, &str) {
    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return (None, rest);
    }
    let (id, body) = rest.split_at(digits);
    (id.parse().ok(), body)
}

fn parse_json(text: &str) -> Result<Value, PacketError> {
    serde_json::from_str(text).map_err(|e| PacketError::InvalidPayload(e.to_string()))
}

fn parse_array(text: &str) -> Result<Vec<Value>, PacketError> {
    match parse_json(text)? {
        Value::Array(items) => Ok(items),
        other => Err(PacketError::InvalidPayload(format!(
            "expected array, got {other}"
        ))),
    }
}
