//! In-process stand-in for an Uptime Kuma server
//!
//! Speaks just enough Engine.IO / Socket.IO over WebSocket to accept the
//! relay: the open handshake, namespace connect, the `login` event with an
//! acknowledgement, server pings, and pushed `heartbeat` events.

use futures_util::{SinkExt, StreamExt};
use kuma_relay_upstream::packet::{EnginePacket, SocketPacket};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct FakeKumaConfig {
    pub username: String,
    pub password: String,
    pub ping_interval_ms: u64,
    pub ping_timeout_ms: u64,
    /// Stop sending Engine.IO pings so clients hit their liveness timeout
    pub silent: bool,
    /// Reject the namespace connect with this message
    pub reject_connect: Option<String>,
}

impl Default for FakeKumaConfig {
    fn default() -> Self {
        Self {
            username: "admin".to_string(),
            password: "admin123".to_string(),
            ping_interval_ms: 25_000,
            ping_timeout_ms: 20_000,
            silent: false,
            reject_connect: None,
        }
    }
}

struct FakeState {
    config: FakeKumaConfig,
    heartbeats: broadcast::Sender<Value>,
    kick: broadcast::Sender<()>,
    logins: Mutex<Vec<Value>>,
    reject_logins: AtomicBool,
    connections: AtomicUsize,
    joined: AtomicUsize,
}

pub struct FakeKuma {
    addr: SocketAddr,
    state: Arc<FakeState>,
    accept_task: JoinHandle<()>,
}

impl FakeKuma {
    pub async fn start(config: FakeKumaConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (heartbeats, _) = broadcast::channel(64);
        let (kick, _) = broadcast::channel(4);

        let state = Arc::new(FakeState {
            config,
            heartbeats,
            kick,
            logins: Mutex::new(Vec::new()),
            reject_logins: AtomicBool::new(false),
            connections: AtomicUsize::new(0),
            joined: AtomicUsize::new(0),
        });

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_client(stream, accept_state.clone()));
            }
        });

        Self {
            addr,
            state,
            accept_task,
        }
    }

    pub async fn start_default() -> Self {
        Self::start(FakeKumaConfig::default()).await
    }

    /// Base URL as a Kuma user would configure it
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Push a `heartbeat` event to every joined client; returns how many got it
    pub fn send_heartbeat(&self, payload: Value) -> usize {
        self.state.heartbeats.send(payload).unwrap_or(0)
    }

    pub fn heartbeat(&self, monitor_id: u64, status: u8, msg: &str) -> usize {
        self.send_heartbeat(json!({
            "monitorID": monitor_id,
            "status": status,
            "msg": msg,
            "time": "2024-05-01 12:00:00.000",
            "ping": 12,
            "important": false,
        }))
    }

    pub fn logins(&self) -> Vec<Value> {
        self.state.logins.lock().unwrap().clone()
    }

    /// Refuse every later login, as after a password change
    pub fn reject_logins(&self) {
        self.state.reject_logins.store(true, Ordering::SeqCst);
    }

    /// WebSocket connections accepted so far
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Clients that completed the namespace connect
    pub fn joined(&self) -> usize {
        self.state.joined.load(Ordering::SeqCst)
    }

    /// Close every open client connection; new connections are still accepted
    pub fn drop_clients(&self) {
        let _ = self.state.kick.send(());
    }

    /// Stop accepting and drop every client
    pub fn shutdown(&self) {
        self.accept_task.abort();
        self.drop_clients();
    }
}

impl Drop for FakeKuma {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn serve_client(stream: TcpStream, state: Arc<FakeState>) {
    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let id = state.connections.fetch_add(1, Ordering::SeqCst) + 1;
    let config = &state.config;

    let open = json!({
        "sid": format!("fake-sid-{id}"),
        "upgrades": [],
        "pingInterval": config.ping_interval_ms,
        "pingTimeout": config.ping_timeout_ms,
        "maxPayload": 1_000_000,
    });
    if ws.send(Message::Text(format!("0{open}"))).await.is_err() {
        return;
    }

    let mut heartbeats = state.heartbeats.subscribe();
    let mut kick = state.kick.subscribe();
    let period = Duration::from_millis(config.ping_interval_ms);
    let mut ping = interval_at(Instant::now() + period, period);
    let mut joined = false;

    loop {
        let outgoing = tokio::select! {
            frame = ws.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    _ => break,
                };
                match EnginePacket::decode(&text) {
                    Ok(packet) => match respond(&state, packet, &mut joined) {
                        Reply::Send(packet) => Some(packet),
                        Reply::Nothing => None,
                        Reply::Hangup => break,
                    },
                    Err(e) => {
                        debug!(error = %e, "Fake Kuma ignoring packet");
                        None
                    }
                }
            }
            heartbeat = heartbeats.recv(), if joined => match heartbeat {
                Ok(payload) => Some(EnginePacket::Message(SocketPacket::event("heartbeat", vec![payload]))),
                Err(_) => None,
            },
            _ = kick.recv() => break,
            _ = ping.tick(), if !config.silent => Some(EnginePacket::Ping(String::new())),
        };

        if let Some(packet) = outgoing {
            if ws.send(Message::Text(packet.encode())).await.is_err() {
                break;
            }
        }
    }

    let _ = ws.close(None).await;
}

enum Reply {
    Send(EnginePacket),
    Nothing,
    Hangup,
}

fn respond(state: &FakeState, packet: EnginePacket, joined: &mut bool) -> Reply {
    match packet {
        EnginePacket::Message(SocketPacket::Connect(_)) => {
            if let Some(message) = &state.config.reject_connect {
                return Reply::Send(EnginePacket::Message(SocketPacket::ConnectError(
                    json!({ "message": message }),
                )));
            }
            // Kuma lets anyone join and only gates data behind login; the
            // relay always logs in first when it has credentials
            *joined = true;
            state.joined.fetch_add(1, Ordering::SeqCst);
            Reply::Send(EnginePacket::Message(SocketPacket::Connect(Some(
                json!({ "sid": "fake-socket" }),
            ))))
        }
        EnginePacket::Message(SocketPacket::Event {
            id: Some(id),
            name,
            args,
        }) if name == "login" => {
            let payload = args.into_iter().next().unwrap_or(Value::Null);
            state.logins.lock().unwrap().push(payload.clone());

            let accepted = !state.reject_logins.load(Ordering::SeqCst)
                && payload["username"] == state.config.username.as_str()
                && payload["password"] == state.config.password.as_str();
            let response = if accepted {
                json!({ "ok": true, "token": "fake-jwt" })
            } else {
                json!({ "ok": false, "msg": "Incorrect username or password." })
            };
            Reply::Send(EnginePacket::Message(SocketPacket::Ack {
                id,
                args: vec![response],
            }))
        }
        EnginePacket::Message(SocketPacket::Disconnect) | EnginePacket::Close => Reply::Hangup,
        _ => Reply::Nothing,
    }
}
