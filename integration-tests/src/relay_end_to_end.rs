//! Browser-to-Kuma scenarios through the real relay server

use crate::fake_kuma::FakeKuma;
use crate::test_utils::*;
use kuma_relay_protocol::MonitorId;
use kuma_relay_server::{RelayConfig, RelayServer};
use kuma_relay_upstream::{ConnectionManager, Upstream, UpstreamConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const WAIT: Duration = Duration::from_secs(5);

async fn start_relay(upstream_config: UpstreamConfig) -> (RelayServer, SocketAddr) {
    let mut config = RelayConfig::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;
    config.upstream = upstream_config;

    let upstream: Arc<dyn Upstream> = Arc::new(ConnectionManager::new(config.upstream.clone()));
    let mut server = RelayServer::new(config, upstream).unwrap();
    let addr = server.start().await.unwrap();
    (server, addr)
}

async fn open_stream(addr: SocketAddr, monitor: &str) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET /api/uptime-kuma/heartbeats?monitorId={monitor} HTTP/1.1\r\nHost: {addr}\r\nAccept: text/event-stream\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    stream
}

#[tokio::test]
async fn test_viewer_receives_only_its_monitor() {
    let kuma = FakeKuma::start_default().await;
    let (mut server, addr) = start_relay(upstream_config(&kuma.url())).await;

    let mut stream = open_stream(addr, "7").await;
    let mut received = String::new();
    read_until(&mut stream, &mut received, "\"type\":\"status\"", WAIT)
        .await
        .unwrap();

    assert!(received.starts_with("HTTP/1.1 200"));
    assert!(received.contains("text/event-stream"));
    let connected = received
        .find("data: {\"type\":\"connected\",\"monitorId\":7}")
        .unwrap();
    let status = received.find("\"type\":\"status\"").unwrap();
    assert!(connected < status);
    assert!(received.contains("\"authenticated\":true"));

    kuma.heartbeat(9, 0, "other monitor");
    kuma.heartbeat(7, 1, "OK");
    read_until(&mut stream, &mut received, "\"type\":\"heartbeat\"", WAIT)
        .await
        .unwrap();
    read_until(&mut stream, &mut received, "\"msg\":\"OK\"", WAIT)
        .await
        .unwrap();

    assert!(received.contains("\"monitorID\":7"));
    assert!(received.contains("\"status\":1"));
    assert!(!received.contains("other monitor"));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_viewers_share_one_upstream() {
    let kuma = FakeKuma::start_default().await;
    let (mut server, addr) = start_relay(upstream_config(&kuma.url())).await;

    let mut first = open_stream(addr, "1").await;
    let mut second = open_stream(addr, "2").await;
    let mut first_buf = String::new();
    let mut second_buf = String::new();
    read_until(&mut first, &mut first_buf, "\"type\":\"status\"", WAIT)
        .await
        .unwrap();
    read_until(&mut second, &mut second_buf, "\"type\":\"status\"", WAIT)
        .await
        .unwrap();
    assert_eq!(kuma.connections(), 1);

    kuma.heartbeat(2, 1, "for-two");
    kuma.heartbeat(1, 1, "for-one");

    read_until(&mut first, &mut first_buf, "for-one", WAIT)
        .await
        .unwrap();
    read_until(&mut second, &mut second_buf, "for-two", WAIT)
        .await
        .unwrap();
    assert!(!first_buf.contains("for-two"));
    assert!(!second_buf.contains("for-one"));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_login_failure_reaches_viewer_as_error() {
    let kuma = FakeKuma::start_default().await;
    let config = upstream_config(&kuma.url()).with_credentials("admin", "wrong");
    let (mut server, addr) = start_relay(config).await;

    let mut stream = open_stream(addr, "7").await;
    let mut received = String::new();
    read_until(&mut stream, &mut received, "Incorrect username or password.", WAIT)
        .await
        .unwrap();

    assert!(received.contains("data: {\"type\":\"error\",\"monitorId\":7,\"error\":"));
    assert!(!received.contains("\"type\":\"connected\""));
    assert!(!received.contains("\"type\":\"status\""));
    assert_eq!(server.state().registry.monitor_count(), 0);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_login_failure_reaches_every_opening_viewer() {
    let kuma = FakeKuma::start_default().await;
    let config = upstream_config(&kuma.url()).with_credentials("admin", "wrong");
    let (mut server, addr) = start_relay(config).await;

    let mut first = open_stream(addr, "7").await;
    let mut second = open_stream(addr, "8").await;
    let mut first_buf = String::new();
    let mut second_buf = String::new();
    read_until(&mut first, &mut first_buf, "\"type\":\"error\"", WAIT)
        .await
        .unwrap();
    read_until(&mut second, &mut second_buf, "\"type\":\"error\"", WAIT)
        .await
        .unwrap();

    for buf in [&first_buf, &second_buf] {
        assert!(buf.contains("Incorrect username or password."));
        assert!(!buf.contains("\"type\":\"connected\""));
    }
    assert_eq!(server.state().registry.monitor_count(), 0);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_invalid_monitor_id_never_touches_upstream() {
    let kuma = FakeKuma::start_default().await;
    let (mut server, addr) = start_relay(upstream_config(&kuma.url())).await;

    let mut stream = open_stream(addr, "abc").await;
    let mut received = String::new();
    read_until(&mut stream, &mut received, "Invalid monitorId", WAIT)
        .await
        .unwrap();
    assert!(received.starts_with("HTTP/1.1 400"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(kuma.connections(), 0);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_viewer_disconnect_releases_listener() {
    let kuma = FakeKuma::start_default().await;
    let (mut server, addr) = start_relay(upstream_config(&kuma.url())).await;

    let mut stream = open_stream(addr, "5").await;
    let mut received = String::new();
    read_until(&mut stream, &mut received, "\"type\":\"status\"", WAIT)
        .await
        .unwrap();
    assert_eq!(server.state().registry.listener_count(MonitorId::new(5)), 1);

    drop(stream);

    // The relay notices on its next write, so give it something to write
    wait_for_condition(
        || {
            kuma.heartbeat(5, 1, "warmup");
            server.state().registry.monitor_count() == 0
        },
        WAIT,
    )
    .await
    .unwrap();

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_health_reflects_upstream() {
    let kuma = FakeKuma::start_default().await;
    let (mut server, addr) = start_relay(upstream_config(&kuma.url())).await;

    let mut stream = open_stream(addr, "1").await;
    let mut received = String::new();
    read_until(&mut stream, &mut received, "\"type\":\"status\"", WAIT)
        .await
        .unwrap();

    let mut health = TcpStream::connect(addr).await.unwrap();
    health
        .write_all(format!("GET /health HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let mut body = String::new();
    health.read_to_string(&mut body).await.unwrap();

    assert!(body.starts_with("HTTP/1.1 200"));
    assert!(body.contains("\"status\":\"healthy\""));
    assert!(body.contains("\"monitors\":1"));

    server.stop().await.unwrap();
}
