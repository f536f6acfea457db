//! WebSocket connection manager for the Kuma Socket.IO endpoint
//!
//! One [`ConnectionManager`] owns one live connection. `connect()` performs
//! the handshake and login on the caller's task; once established, a worker
//! task reads the socket, answers Engine.IO pings, publishes heartbeats and
//! re-establishes the link with capped exponential backoff when it drops.
//! Receivers obtained from [`Upstream::events`] survive reconnection.

use crate::packet::{EnginePacket, SocketPacket};
use crate::{Upstream, UpstreamConfig, UpstreamError};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use kuma_relay_protocol::{ConnectionState, ConnectionStatus, HeartbeatEvent};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const LOGIN_ACK_ID: u64 = 1;

/// Process-wide owner of the upstream Socket.IO connection
pub struct ConnectionManager {
    config: UpstreamConfig,
    shared: Arc<Shared>,
}

struct Shared {
    status: RwLock<ConnectionStatus>,
    events: broadcast::Sender<HeartbeatEvent>,
    /// Result of the latest connect attempt; `None` while one is running
    outcome: watch::Sender<AttemptOutcome>,
    worker: Mutex<Option<Worker>>,
}

pub(crate) type AttemptOutcome = Option<Result<(), UpstreamError>>;

/// What a `connect` caller should do, decided under the status lock
#[derive(Debug)]
enum Claim {
    Connected,
    InFlight(watch::Receiver<AttemptOutcome>),
    Owner,
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// An established, handshaken connection
struct Link {
    ws: WsStream,
    liveness: Duration,
    authenticated: bool,
}

enum PumpExit {
    Cancelled,
    Dropped(String),
}

impl Shared {
    fn update(&self, f: impl FnOnce(&mut ConnectionStatus)) {
        let mut status = self.status.write().unwrap_or_else(|e| e.into_inner());
        f(&mut status);
        status.connected = status.state == ConnectionState::Connected;
    }

    fn snapshot(&self) -> ConnectionStatus {
        self.status
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Claim the right to connect, or join the attempt already running
    fn begin_connect(&self) -> Claim {
        let mut status = self.status.write().unwrap_or_else(|e| e.into_inner());
        match status.state {
            ConnectionState::Connected => Claim::Connected,
            ConnectionState::Connecting => Claim::InFlight(self.outcome.subscribe()),
            ConnectionState::Disconnected => {
                status.state = ConnectionState::Connecting;
                status.connected = false;
                status.authenticated = false;
                self.outcome.send_replace(None);
                Claim::Owner
            }
        }
    }

    /// Publish how the running attempt ended to everyone waiting on it
    fn settle(&self, outcome: Result<(), UpstreamError>) {
        self.outcome.send_replace(Some(outcome));
    }

    fn mark_connected(&self, authenticated: bool) {
        self.update(|status| {
            status.state = ConnectionState::Connected;
            status.authenticated = authenticated;
            status.reconnect_attempts = 0;
        });
    }

    fn mark_reconnecting(&self, attempt: u32) {
        self.update(|status| {
            status.state = ConnectionState::Connecting;
            status.authenticated = false;
            status.reconnect_attempts = attempt;
        });
        self.outcome.send_replace(None);
    }

    /// Also releases callers still waiting on an attempt that never settled
    fn mark_disconnected(&self) {
        self.update(|status| {
            status.state = ConnectionState::Disconnected;
            status.authenticated = false;
        });
        self.outcome.send_if_modified(|outcome| {
            if outcome.is_some() {
                return false;
            }
            *outcome = Some(Err(UpstreamError::Closed(
                "connection attempt abandoned".to_string(),
            )));
            true
        });
    }

    fn publish(&self, event: HeartbeatEvent) {
        self.update(|status| status.last_heartbeat_at = Some(chrono::Utc::now()));
        if event.is_important() {
            info!(monitor_id = %event.monitor_id, status = %event.status, "Monitor status changed");
        } else {
            trace!(monitor_id = %event.monitor_id, status = %event.status, "Upstream heartbeat");
        }
        // No receivers is fine: nobody is watching any monitor right now
        let _ = self.events.send(event);
    }
}

/// Wait for the attempt another caller is running and share its result
pub(crate) async fn wait_for_attempt(
    mut outcome: watch::Receiver<AttemptOutcome>,
) -> Result<(), UpstreamError> {
    match outcome.wait_for(Option::is_some).await {
        Ok(settled) => settled
            .clone()
            .unwrap_or_else(|| Err(UpstreamError::Closed("connection attempt abandoned".to_string()))),
        Err(_) => Err(UpstreamError::Closed(
            "connection manager dropped".to_string(),
        )),
    }
}

/// Resets the state if a `connect` future is dropped mid-handshake
struct ConnectAttempt<'a> {
    shared: &'a Shared,
    finished: bool,
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.shared.mark_disconnected();
        }
    }
}

impl ConnectionManager {
    /// Create a disconnected manager; nothing is opened until `connect`
    pub fn new(config: UpstreamConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let (outcome, _) = watch::channel(None);
        Self {
            config,
            shared: Arc::new(Shared {
                status: RwLock::new(ConnectionStatus::disconnected()),
                events,
                outcome,
                worker: Mutex::new(None),
            }),
        }
    }

    /// Settings this manager connects with
    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    fn spawn_worker(&self, link: Link) {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_link(
            self.shared.clone(),
            self.config.clone(),
            link,
            cancel.clone(),
        ));

        let previous = self
            .shared
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(Worker { cancel, handle });
        if let Some(previous) = previous {
            // Only reachable after the old worker gave up and reset the state
            previous.cancel.cancel();
        }
    }
}

#[async_trait]
impl Upstream for ConnectionManager {
    async fn connect(&self) -> Result<(), UpstreamError> {
        match self.shared.begin_connect() {
            Claim::Connected => return Ok(()),
            Claim::InFlight(outcome) => {
                debug!("Upstream connect already under way, waiting for it");
                return wait_for_attempt(outcome).await;
            }
            Claim::Owner => {}
        }

        let mut attempt = ConnectAttempt {
            shared: &self.shared,
            finished: false,
        };

        info!(url = %self.config.url, "Connecting to Uptime Kuma");
        let result = establish(&self.config).await;
        attempt.finished = true;

        match result {
            Ok(link) => {
                self.shared.mark_connected(link.authenticated);
                info!(
                    authenticated = link.authenticated,
                    "Connected to Uptime Kuma"
                );
                self.spawn_worker(link);
                self.shared.settle(Ok(()));
                Ok(())
            }
            Err(e) => {
                self.shared.settle(Err(e.clone()));
                self.shared.mark_disconnected();
                warn!(error = %e, "Failed to connect to Uptime Kuma");
                Err(e)
            }
        }
    }

    fn events(&self) -> broadcast::Receiver<HeartbeatEvent> {
        self.shared.events.subscribe()
    }

    fn status(&self) -> ConnectionStatus {
        self.shared.snapshot()
    }

    async fn disconnect(&self) {
        let worker = self
            .shared
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        if let Some(worker) = worker {
            worker.cancel.cancel();
            if let Err(e) = worker.handle.await {
                warn!(error = %e, "Upstream worker ended abnormally");
            }
            info!("Disconnected from Uptime Kuma");
        }
        self.shared.mark_disconnected();
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(worker) = self
            .shared
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            worker.cancel.cancel();
        }
    }
}

/// Open the WebSocket, join the default namespace and log in
async fn establish(config: &UpstreamConfig) -> Result<Link, UpstreamError> {
    let url = config.socket_url()?;
    let connect_timeout = config.connect_timeout();
    let timeout_ms = connect_timeout.as_millis() as u64;

    let (mut ws, _) = tokio::time::timeout(connect_timeout, connect_async(url.as_str()))
        .await
        .map_err(|_| UpstreamError::Timeout(timeout_ms))?
        .map_err(|e| UpstreamError::connection(format!("Failed to reach {url}: {e}")))?;

    let liveness = tokio::time::timeout(connect_timeout, join_namespace(&mut ws))
        .await
        .map_err(|_| UpstreamError::Timeout(timeout_ms))??;

    let authenticated = match config.credentials() {
        Some((username, password)) => {
            let mut payload = json!({ "username": username, "password": password });
            if let Some(token) = config.two_factor_token.as_deref().filter(|t| !t.is_empty()) {
                payload["token"] = json!(token);
            }
            let auth_timeout = config.auth_timeout();
            tokio::time::timeout(auth_timeout, login(&mut ws, payload))
                .await
                .map_err(|_| UpstreamError::Timeout(auth_timeout.as_millis() as u64))??;
            info!(username, "Authenticated with Uptime Kuma");
            true
        }
        None => {
            debug!("No Kuma credentials configured, skipping login");
            false
        }
    };

    Ok(Link {
        ws,
        liveness,
        authenticated,
    })
}

async fn join_namespace(ws: &mut WsStream) -> Result<Duration, UpstreamError> {
    let open = match next_packet(ws).await? {
        EnginePacket::Open(open) => open,
        other => {
            return Err(UpstreamError::protocol(format!(
                "Expected open packet, got {other:?}"
            )));
        }
    };
    debug!(sid = %open.sid, ping_interval = open.ping_interval, "Engine.IO session opened");

    send_packet(ws, &EnginePacket::Message(SocketPacket::Connect(None))).await?;

    loop {
        match next_packet(ws).await? {
            EnginePacket::Message(SocketPacket::Connect(_)) => return Ok(open.liveness_window()),
            EnginePacket::Message(SocketPacket::ConnectError(payload)) => {
                return Err(UpstreamError::connection(format!(
                    "Namespace connect rejected: {}",
                    SocketPacket::connect_error_message(&payload)
                )));
            }
            EnginePacket::Ping(data) => send_packet(ws, &EnginePacket::Pong(data)).await?,
            EnginePacket::Close => {
                return Err(UpstreamError::Closed(
                    "server closed during handshake".to_string(),
                ));
            }
            other => trace!(?other, "Ignoring packet during handshake"),
        }
    }
}

async fn login(ws: &mut WsStream, payload: Value) -> Result<(), UpstreamError> {
    let request = SocketPacket::event_with_ack(LOGIN_ACK_ID, "login", vec![payload]);
    send_packet(ws, &EnginePacket::Message(request)).await?;

    loop {
        match next_packet(ws).await? {
            EnginePacket::Message(SocketPacket::Ack { id, args }) if id == LOGIN_ACK_ID => {
                return check_login_response(args.first());
            }
            EnginePacket::Ping(data) => send_packet(ws, &EnginePacket::Pong(data)).await?,
            EnginePacket::Close | EnginePacket::Message(SocketPacket::Disconnect) => {
                return Err(UpstreamError::Closed(
                    "server closed during login".to_string(),
                ));
            }
            other => trace!(?other, "Ignoring packet while waiting for login"),
        }
    }
}

/// Kuma answers `{ok: true, token}` on success and `{ok: false, msg}` otherwise
pub(crate) fn check_login_response(response: Option<&Value>) -> Result<(), UpstreamError> {
    let Some(response) = response else {
        return Err(UpstreamError::authentication("Empty login response"));
    };

    if response.as_bool() == Some(true) {
        return Ok(());
    }
    if response.get("ok").and_then(Value::as_bool) == Some(true) {
        return Ok(());
    }
    if response
        .get("token")
        .and_then(Value::as_str)
        .is_some_and(|token| !token.is_empty())
    {
        return Ok(());
    }
    if response.get("tokenRequired").and_then(Value::as_bool) == Some(true) {
        return Err(UpstreamError::authentication(
            "Two-factor token required",
        ));
    }

    let msg = response
        .get("msg")
        .and_then(Value::as_str)
        .unwrap_or("Kuma login failed");
    Err(UpstreamError::authentication(msg))
}

async fn next_packet(ws: &mut WsStream) -> Result<EnginePacket, UpstreamError> {
    loop {
        match ws.next().await {
            None => return Err(UpstreamError::Closed("stream ended".to_string())),
            Some(Err(e)) => return Err(UpstreamError::connection(e.to_string())),
            Some(Ok(Message::Text(text))) => {
                return EnginePacket::decode(&text)
                    .map_err(|e| UpstreamError::protocol(e.to_string()));
            }
            Some(Ok(Message::Close(frame))) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .unwrap_or_else(|| "no reason".to_string());
                return Err(UpstreamError::Closed(reason));
            }
            Some(Ok(_)) => continue,
        }
    }
}

async fn send_packet(ws: &mut WsStream, packet: &EnginePacket) -> Result<(), UpstreamError> {
    ws.send(Message::Text(packet.encode()))
        .await
        .map_err(|e| UpstreamError::connection(format!("Failed to send packet: {e}")))
}

async fn run_link(
    shared: Arc<Shared>,
    config: UpstreamConfig,
    mut link: Link,
    cancel: CancellationToken,
) {
    loop {
        match pump(&shared, &mut link, &cancel).await {
            PumpExit::Cancelled => {
                let _ = send_packet(&mut link.ws, &EnginePacket::Message(SocketPacket::Disconnect)).await;
                let _ = link.ws.close(None).await;
                shared.mark_disconnected();
                return;
            }
            PumpExit::Dropped(reason) => warn!(%reason, "Upstream connection lost"),
        }

        if !config.reconnect.enabled {
            shared.mark_disconnected();
            return;
        }

        match reconnect(&shared, &config, &cancel).await {
            Some(next) => link = next,
            None => {
                shared.mark_disconnected();
                return;
            }
        }
    }
}

async fn reconnect(
    shared: &Shared,
    config: &UpstreamConfig,
    cancel: &CancellationToken,
) -> Option<Link> {
    let policy = &config.reconnect;

    for attempt in 1..=policy.max_attempts {
        shared.mark_reconnecting(attempt);
        let delay = policy.delay_for(attempt);
        info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting to Uptime Kuma");

        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => return None,
            result = establish(config) => result,
        };

        match result {
            Ok(link) => {
                shared.mark_connected(link.authenticated);
                shared.settle(Ok(()));
                info!(attempt, "Reconnected to Uptime Kuma");
                return Some(link);
            }
            Err(e) if !e.is_retryable() => {
                error!(attempt, error = %e, "Reconnect rejected, not retrying");
                shared.settle(Err(e));
                return None;
            }
            Err(e) => {
                warn!(attempt, error = %e, "Reconnect attempt failed");
                shared.settle(Err(e));
            }
        }
    }

    error!(
        attempts = policy.max_attempts,
        "Giving up on Uptime Kuma after repeated reconnect failures"
    );
    None
}

async fn pump(shared: &Shared, link: &mut Link, cancel: &CancellationToken) -> PumpExit {
    let mut deadline = Instant::now() + link.liveness;

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return PumpExit::Cancelled,
            _ = tokio::time::sleep_until(deadline) => {
                return PumpExit::Dropped("no ping from server".to_string());
            }
            frame = link.ws.next() => frame,
        };

        let text = match frame {
            None => return PumpExit::Dropped("stream ended".to_string()),
            Some(Err(e)) => return PumpExit::Dropped(e.to_string()),
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) => return PumpExit::Dropped("closed by server".to_string()),
            Some(Ok(_)) => continue,
        };
        deadline = Instant::now() + link.liveness;

        let packet = match EnginePacket::decode(&text) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(error = %e, "Ignoring undecodable upstream packet");
                continue;
            }
        };

        match packet {
            EnginePacket::Ping(data) => {
                if let Err(e) = send_packet(&mut link.ws, &EnginePacket::Pong(data)).await {
                    return PumpExit::Dropped(e.to_string());
                }
            }
            EnginePacket::Close | EnginePacket::Message(SocketPacket::Disconnect) => {
                return PumpExit::Dropped("server closed the session".to_string());
            }
            EnginePacket::Message(SocketPacket::Event { name, args, .. }) => {
                handle_event(shared, &name, args);
            }
            other => trace!(?other, "Ignoring upstream packet"),
        }
    }
}

fn handle_event(shared: &Shared, name: &str, args: Vec<Value>) {
    if name != "heartbeat" {
        trace!(event = name, "Ignoring upstream event");
        return;
    }

    let Some(payload) = args.into_iter().next() else {
        warn!("Heartbeat event without payload");
        return;
    };

    match serde_json::from_value::<HeartbeatEvent>(payload) {
        Ok(event) => shared.publish(event),
        Err(e) => warn!(error = %e, "Dropping malformed heartbeat"),
    }
}
