//! HTTP surface: the per-monitor SSE stream and a health probe

use crate::registry::SubscriptionRegistry;
use crate::session::{ChannelSink, StreamingSession};
use axum::{
    Router,
    extract::{Query, State},
    http::{HeaderName, HeaderValue, StatusCode, header},
    response::{
        IntoResponse, Json, Response,
        sse::{Event, Sse},
    },
    routing::get,
};
use kuma_relay_protocol::{ConnectionStatus, MonitorId};
use kuma_relay_upstream::Upstream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, info};

/// Path of the heartbeat stream endpoint
pub const HEARTBEATS_PATH: &str = "/api/uptime-kuma/heartbeats";

/// Messages buffered between a session and its response body
const SINK_BUFFER: usize = 64;

/// Shared state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub upstream: Arc<dyn Upstream>,
    pub registry: SubscriptionRegistry,
    pub ping_interval: Duration,
    /// Parent of every session's cancellation token
    pub shutdown: CancellationToken,
    pub started_at: Instant,
}

impl AppState {
    /// State with a fresh shutdown token, stamped with the start time
    pub fn new(
        upstream: Arc<dyn Upstream>,
        registry: SubscriptionRegistry,
        ping_interval: Duration,
    ) -> Self {
        Self {
            upstream,
            registry,
            ping_interval,
            shutdown: CancellationToken::new(),
            started_at: Instant::now(),
        }
    }
}

/// Routes for the heartbeat stream and health probe
pub fn create_router(state: AppState, enable_cors: bool) -> Router {
    let router = Router::new()
        .route(HEARTBEATS_PATH, get(handle_heartbeats))
        .route("/health", get(handle_health))
        .with_state(state);

    if enable_cors {
        router.layer(CorsLayer::very_permissive())
    } else {
        router
    }
}

/// Query string of the heartbeat stream endpoint
#[derive(Debug, Deserialize)]
pub struct HeartbeatQuery {
    #[serde(rename = "monitorId")]
    monitor_id: Option<String>,
}

async fn handle_heartbeats(
    State(state): State<AppState>,
    Query(query): Query<HeartbeatQuery>,
) -> Response {
    let monitor_id = match MonitorId::from_param(query.monitor_id.as_deref()) {
        Ok(id) => id,
        Err(e) => {
            debug!(error = %e, input = ?e.input(), "Rejected heartbeat stream request");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    let (sink, mut rx) = ChannelSink::channel(SINK_BUFFER);
    let cancel = state.shutdown.child_token();
    let viewer = cancel.clone().drop_guard();

    let session = StreamingSession::new(
        monitor_id,
        state.upstream.clone(),
        state.registry.clone(),
        sink,
        cancel,
    )
    .with_ping_interval(state.ping_interval);
    info!(session_id = %session.id(), %monitor_id, "Starting heartbeat stream");
    tokio::spawn(session.run());

    let stream = async_stream::stream! {
        // Dropping the body (viewer gone) cancels the session
        let _viewer = viewer;
        while let Some(json) = rx.recv().await {
            yield Ok::<_, Infallible>(Event::default().data(json));
        }
    };

    let mut response = Sse::new(stream).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    response
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub upstream: ConnectionStatus,
    /// Monitors with at least one open stream
    pub monitors: usize,
    /// Streams subscribed to a monitor; streams still connecting upstream are not counted
    pub listeners: usize,
}

/// Overall relay health
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Upstream connected
    Healthy,
    /// Upstream down or reconnecting; streams stay open
    Degraded,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let upstream = state.upstream.status();
    let status = if upstream.connected {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        upstream,
        monitors: state.registry.monitor_count(),
        listeners: state.registry.total_listeners(),
    })
}
