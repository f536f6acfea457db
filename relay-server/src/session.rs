//! One viewer's heartbeat stream for one monitor
//!
//! A [`StreamingSession`] connects the upstream, registers a listener, and
//! forwards queued heartbeats to an [`EventSink`] with a periodic keep-alive
//! ping. The listener handle, the ping timer and the sink are all owned by
//! [`StreamingSession::run`], so they are released together when it returns
//! or when its future is dropped.

use crate::registry::SubscriptionRegistry;
use async_trait::async_trait;
use kuma_relay_protocol::{DEFAULT_PING_INTERVAL_SECS, HeartbeatEvent, MonitorId, StreamMessage};
use kuma_relay_upstream::Upstream;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A message could not be written to the viewer
#[derive(Debug, Error)]
pub enum WriteError {
    /// The viewer is gone; the session tears down silently
    #[error("Viewer disconnected")]
    Disconnected,

    /// The message could not be serialized
    #[error("Failed to encode message: {0}")]
    Encode(String),
}

/// Destination of a session's stream messages
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Write one complete message
    async fn send(&mut self, message: &StreamMessage) -> Result<(), WriteError>;

    /// Flush and close; later sends fail
    async fn close(&mut self);

    /// Resolves once the viewer is gone. Sinks that cannot tell never resolve.
    async fn closed(&self) {
        std::future::pending::<()>().await
    }
}

/// Sink that hands encoded JSON documents to an SSE body stream
pub struct ChannelSink {
    tx: Option<mpsc::Sender<String>>,
}

impl ChannelSink {
    /// Wrap the sending half of a body channel
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Sink plus the receiving end for the response body
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn send(&mut self, message: &StreamMessage) -> Result<(), WriteError> {
        let tx = self.tx.as_ref().ok_or(WriteError::Disconnected)?;
        let json = message
            .to_json()
            .map_err(|e| WriteError::Encode(e.to_string()))?;
        tx.send(json).await.map_err(|_| WriteError::Disconnected)
    }

    async fn close(&mut self) {
        self.tx = None;
    }

    async fn closed(&self) {
        if let Some(tx) = &self.tx {
            tx.closed().await;
        }
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The viewer went away or the server is shutting down
    Cancelled,
    WriteFailed,
    /// Upstream connect failed; one error message was sent
    ConnectFailed,
    /// The registry dropped the listener
    SubscriptionClosed,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::Cancelled => "cancelled",
            Self::WriteFailed => "write failed",
            Self::ConnectFailed => "connect failed",
            Self::SubscriptionClosed => "subscription closed",
        };
        f.write_str(reason)
    }
}

enum Step {
    Cancelled,
    Heartbeat(Option<HeartbeatEvent>),
    Ping,
}

/// One viewer's stream for one monitor, from connect to teardown
pub struct StreamingSession<S: EventSink> {
    id: Uuid,
    monitor_id: MonitorId,
    upstream: Arc<dyn Upstream>,
    registry: SubscriptionRegistry,
    sink: S,
    cancel: CancellationToken,
    ping_interval: Duration,
}

impl<S: EventSink> StreamingSession<S> {
    /// Prepare a session; nothing happens until [`run`](Self::run).
    ///
    /// Cancelling `cancel` ends the stream from outside.
    pub fn new(
        monitor_id: MonitorId,
        upstream: Arc<dyn Upstream>,
        registry: SubscriptionRegistry,
        sink: S,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            monitor_id,
            upstream,
            registry,
            sink,
            cancel,
            ping_interval: Duration::from_secs(DEFAULT_PING_INTERVAL_SECS),
        }
    }

    /// Override the keep-alive period
    pub fn with_ping_interval(mut self, ping_interval: Duration) -> Self {
        self.ping_interval = ping_interval;
        self
    }

    /// Identifier used in this session's log lines
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Stream until cancelled or a write fails; always closes the sink
    pub async fn run(mut self) -> CloseReason {
        info!(session_id = %self.id, monitor_id = %self.monitor_id, "Heartbeat stream opened");

        let reason = self.stream().await;
        self.sink.close().await;

        info!(
            session_id = %self.id,
            monitor_id = %self.monitor_id,
            %reason,
            "Heartbeat stream closed"
        );
        reason
    }

    async fn stream(&mut self) -> CloseReason {
        if self.cancel.is_cancelled() {
            return CloseReason::Cancelled;
        }

        let connected = tokio::select! {
            _ = self.cancel.cancelled() => return CloseReason::Cancelled,
            result = self.upstream.connect() => result,
        };
        if let Err(e) = connected {
            warn!(session_id = %self.id, error = %e, "Upstream unavailable for heartbeat stream");
            let message = StreamMessage::error(self.monitor_id, e.to_string());
            if let Err(e) = self.sink.send(&message).await {
                debug!(session_id = %self.id, error = %e, "Could not deliver connect error");
            }
            return CloseReason::ConnectFailed;
        }

        if self.write(StreamMessage::connected(self.monitor_id)).await.is_err() {
            return CloseReason::WriteFailed;
        }

        let (subscription, mut queue) = self.registry.subscribe(self.monitor_id);
        debug!(session_id = %self.id, listener_id = %subscription.listener_id(), "Subscribed");

        let status = StreamMessage::status(self.monitor_id, self.upstream.status());
        if self.write(status).await.is_err() {
            return CloseReason::WriteFailed;
        }

        let mut keep_alive = interval_at(Instant::now() + self.ping_interval, self.ping_interval);
        keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            let step = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Step::Cancelled,
                _ = self.sink.closed() => Step::Cancelled,
                event = queue.recv() => Step::Heartbeat(event),
                _ = keep_alive.tick() => Step::Ping,
            };

            match step {
                Step::Cancelled => break CloseReason::Cancelled,
                Step::Heartbeat(None) => break CloseReason::SubscriptionClosed,
                Step::Heartbeat(Some(event)) => {
                    if self.write(StreamMessage::heartbeat(event)).await.is_err() {
                        break CloseReason::WriteFailed;
                    }
                }
                Step::Ping => {
                    if self.write(StreamMessage::ping()).await.is_err() {
                        break CloseReason::WriteFailed;
                    }
                }
            }
        };

        subscription.unsubscribe();
        reason
    }

    async fn write(&mut self, message: StreamMessage) -> Result<(), WriteError> {
        self.sink.send(&message).await.inspect_err(|e| {
            debug!(session_id = %self.id, kind = message.kind(), error = %e, "Stream write failed");
        })
    }
}
