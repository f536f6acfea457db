//! Scripted upstream for tests

use crate::manager::{AttemptOutcome, wait_for_attempt};
use crate::{Upstream, UpstreamError};
use async_trait::async_trait;
use kuma_relay_protocol::{ConnectionState, ConnectionStatus, HeartbeatEvent};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, watch};

/// In-memory [`Upstream`] whose connect outcome and events are driven by the test
pub struct MockUpstream {
    status: RwLock<ConnectionStatus>,
    events: broadcast::Sender<HeartbeatEvent>,
    outcome: watch::Sender<AttemptOutcome>,
    failure: Mutex<Option<UpstreamError>>,
    connect_delay: Mutex<Option<Duration>>,
    connect_calls: AtomicUsize,
}

impl Default for MockUpstream {
    fn default() -> Self {
        Self::new()
    }
}

impl MockUpstream {
    /// Disconnected upstream whose `connect` succeeds
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        let (outcome, _) = watch::channel(None);
        Self {
            status: RwLock::new(ConnectionStatus::disconnected()),
            events,
            outcome,
            failure: Mutex::new(None),
            connect_delay: Mutex::new(None),
            connect_calls: AtomicUsize::new(0),
        }
    }

    /// Upstream whose `connect` fails with `error`
    pub fn failing(error: UpstreamError) -> Self {
        let mock = Self::new();
        mock.set_failure(Some(error));
        mock
    }

    /// Upstream that is already connected and authenticated
    pub fn connected() -> Self {
        let mock = Self::new();
        mock.set_status(ConnectionStatus::new(ConnectionState::Connected, true));
        mock
    }

    /// Script the outcome of the next connect attempts; `None` succeeds
    pub fn set_failure(&self, failure: Option<UpstreamError>) {
        *self.failure.lock().unwrap_or_else(|e| e.into_inner()) = failure;
    }

    /// Make every `connect` wait before resolving
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock().unwrap_or_else(|e| e.into_inner()) = Some(delay);
    }

    /// Overwrite the reported status without running a connect
    pub fn set_status(&self, status: ConnectionStatus) {
        *self.status.write().unwrap_or_else(|e| e.into_inner()) = status;
    }

    /// Simulate the upstream link going away
    pub fn drop_connection(&self) {
        self.set_status(ConnectionStatus::disconnected());
        self.release_waiters();
    }

    fn release_waiters(&self) {
        self.outcome.send_if_modified(|outcome| {
            if outcome.is_some() {
                return false;
            }
            *outcome = Some(Err(UpstreamError::Closed("disconnected".to_string())));
            true
        });
    }

    /// Publish a heartbeat; returns how many receivers saw it
    pub fn emit(&self, event: HeartbeatEvent) -> usize {
        {
            let mut status = self.status.write().unwrap_or_else(|e| e.into_inner());
            status.last_heartbeat_at = Some(chrono::Utc::now());
        }
        self.events.send(event).unwrap_or(0)
    }

    /// How many times `connect` was called, including no-op calls
    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    /// Open receivers on the heartbeat channel
    pub fn receiver_count(&self) -> usize {
        self.events.receiver_count()
    }
}

#[async_trait]
impl Upstream for MockUpstream {
    async fn connect(&self) -> Result<(), UpstreamError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);

        // Same claim rules as the real manager: join an attempt under way
        let in_flight = {
            let mut status = self.status.write().unwrap_or_else(|e| e.into_inner());
            match status.state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting => Some(self.outcome.subscribe()),
                ConnectionState::Disconnected => {
                    *status = ConnectionStatus::new(ConnectionState::Connecting, false);
                    self.outcome.send_replace(None);
                    None
                }
            }
        };
        if let Some(outcome) = in_flight {
            return wait_for_attempt(outcome).await;
        }

        let delay = *self.connect_delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self
            .failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let result = match failure {
            Some(error) => {
                self.set_status(ConnectionStatus::disconnected());
                Err(error)
            }
            None => {
                self.set_status(ConnectionStatus::new(ConnectionState::Connected, true));
                Ok(())
            }
        };
        self.outcome.send_replace(Some(result.clone()));
        result
    }

    fn events(&self) -> broadcast::Receiver<HeartbeatEvent> {
        self.events.subscribe()
    }

    fn status(&self) -> ConnectionStatus {
        self.status
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn disconnect(&self) {
        self.drop_connection();
    }
}
