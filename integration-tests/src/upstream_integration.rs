//! Connection manager against a fake Kuma server

use crate::fake_kuma::{FakeKuma, FakeKumaConfig};
use crate::test_utils::*;
use assert_matches::assert_matches;
use kuma_relay_protocol::{ConnectionState, HeartbeatStatus};
use kuma_relay_upstream::{ConnectionManager, ReconnectPolicy, Upstream, UpstreamError};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_connect_logs_in_and_receives_heartbeats() {
    let kuma = FakeKuma::start_default().await;
    let manager = ConnectionManager::new(upstream_config(&kuma.url()));
    let mut events = manager.events();

    manager.connect().await.unwrap();

    let status = manager.status();
    assert_eq!(status.state, ConnectionState::Connected);
    assert!(status.connected);
    assert!(status.authenticated);

    let logins = kuma.logins();
    assert_eq!(logins.len(), 1);
    assert_eq!(logins[0]["username"], "admin");
    assert_eq!(logins[0]["password"], "admin123");
    assert!(logins[0].get("token").is_none());

    wait_for_condition(|| kuma.heartbeat(7, 1, "OK") > 0, WAIT)
        .await
        .unwrap();
    let event = tokio::time::timeout(WAIT, events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.monitor_id.get(), 7);
    assert_eq!(event.status, HeartbeatStatus::Up);
    assert_eq!(event.msg, "OK");
    assert_eq!(event.ping, Some(12.0));
    assert!(manager.status().last_heartbeat_at.is_some());

    manager.disconnect().await;
    assert_eq!(manager.status().state, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_wrong_password_fails_with_kuma_message() {
    let kuma = FakeKuma::start_default().await;
    let config = upstream_config(&kuma.url()).with_credentials("admin", "wrong");
    let manager = ConnectionManager::new(config);

    let err = manager.connect().await.unwrap_err();
    assert_matches!(err, UpstreamError::Authentication(msg) if msg == "Incorrect username or password.");
    assert_eq!(manager.status().state, ConnectionState::Disconnected);
    assert!(!manager.status().authenticated);
}

#[tokio::test]
async fn test_concurrent_connects_all_see_login_failure() {
    let kuma = FakeKuma::start_default().await;
    let config = upstream_config(&kuma.url()).with_credentials("admin", "wrong");
    let manager = ConnectionManager::new(config);

    let (a, b, c) = tokio::join!(manager.connect(), manager.connect(), manager.connect());
    for result in [a, b, c] {
        assert_matches!(result, Err(UpstreamError::Authentication(msg)) if msg == "Incorrect username or password.");
    }

    assert_eq!(kuma.connections(), 1);
    assert_eq!(kuma.logins().len(), 1);
    assert_eq!(manager.status().state, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_two_factor_token_is_sent() {
    let kuma = FakeKuma::start_default().await;
    let mut config = upstream_config(&kuma.url());
    config.two_factor_token = Some("123456".to_string());
    let manager = ConnectionManager::new(config);

    manager.connect().await.unwrap();
    assert_eq!(kuma.logins()[0]["token"], "123456");
    manager.disconnect().await;
}

#[tokio::test]
async fn test_without_credentials_skips_login() {
    let kuma = FakeKuma::start_default().await;
    let manager = ConnectionManager::new(upstream_config(&kuma.url()).without_credentials());

    manager.connect().await.unwrap();

    assert!(manager.status().connected);
    assert!(!manager.status().authenticated);
    assert!(kuma.logins().is_empty());
    manager.disconnect().await;
}

#[tokio::test]
async fn test_rejected_namespace_is_connection_error() {
    let kuma = FakeKuma::start(FakeKumaConfig {
        reject_connect: Some("Not allowed".to_string()),
        ..Default::default()
    })
    .await;
    let manager = ConnectionManager::new(upstream_config(&kuma.url()));

    let err = manager.connect().await.unwrap_err();
    assert_matches!(err, UpstreamError::Connection(msg) if msg.contains("Not allowed"));
}

#[tokio::test]
async fn test_concurrent_connects_open_one_connection() {
    let kuma = FakeKuma::start_default().await;
    let manager = Arc::new(ConnectionManager::new(upstream_config(&kuma.url())));

    let (a, b, c) = tokio::join!(manager.connect(), manager.connect(), manager.connect());
    assert!(a.is_ok() && b.is_ok() && c.is_ok());

    wait_for_condition(|| manager.status().connected, WAIT)
        .await
        .unwrap();
    assert_eq!(kuma.connections(), 1);

    manager.connect().await.unwrap();
    assert_eq!(kuma.connections(), 1);
    manager.disconnect().await;
}

#[tokio::test]
async fn test_reconnects_after_server_drops_connection() {
    let kuma = FakeKuma::start_default().await;
    let manager = ConnectionManager::new(upstream_config(&kuma.url()));
    let mut events = manager.events();
    manager.connect().await.unwrap();

    kuma.drop_clients();

    wait_for_condition(|| kuma.joined() >= 2 && manager.status().connected, WAIT)
        .await
        .unwrap();
    assert_eq!(manager.status().reconnect_attempts, 0);
    assert_eq!(kuma.logins().len(), 2);

    // The receiver taken before the drop keeps working
    wait_for_condition(|| kuma.heartbeat(3, 0, "down") > 0, WAIT)
        .await
        .unwrap();
    let event = tokio::time::timeout(WAIT, events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.monitor_id.get(), 3);
    assert_eq!(event.status, HeartbeatStatus::Down);

    manager.disconnect().await;
}

#[tokio::test]
async fn test_silent_server_is_treated_as_dead() {
    let kuma = FakeKuma::start(FakeKumaConfig {
        ping_interval_ms: 100,
        ping_timeout_ms: 100,
        silent: true,
        ..Default::default()
    })
    .await;
    let manager = ConnectionManager::new(upstream_config(&kuma.url()));
    manager.connect().await.unwrap();

    wait_for_condition(|| kuma.connections() >= 2, WAIT)
        .await
        .unwrap();
    manager.disconnect().await;
}

#[tokio::test]
async fn test_gives_up_after_max_attempts() {
    let kuma = FakeKuma::start_default().await;
    let mut config = upstream_config(&kuma.url());
    config.reconnect = ReconnectPolicy {
        enabled: true,
        initial_delay_ms: 10,
        max_delay_ms: 20,
        max_attempts: 2,
    };
    let manager = ConnectionManager::new(config);
    manager.connect().await.unwrap();

    kuma.shutdown();

    wait_for_condition(
        || manager.status().state == ConnectionState::Disconnected,
        WAIT,
    )
    .await
    .unwrap();
    assert!(!manager.status().connected);
}

#[tokio::test]
async fn test_rejected_login_stops_reconnecting() {
    let kuma = FakeKuma::start_default().await;
    let manager = ConnectionManager::new(upstream_config(&kuma.url()));
    manager.connect().await.unwrap();

    kuma.reject_logins();
    kuma.drop_clients();

    wait_for_condition(|| kuma.logins().len() >= 2, WAIT)
        .await
        .unwrap();
    wait_for_condition(
        || manager.status().state == ConnectionState::Disconnected,
        WAIT,
    )
    .await
    .unwrap();

    // Longer than the whole backoff schedule of the test policy
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(kuma.logins().len(), 2);
    assert_eq!(kuma.connections(), 2);
}

#[tokio::test]
async fn test_no_reconnect_when_disabled() {
    let kuma = FakeKuma::start_default().await;
    let mut config = upstream_config(&kuma.url());
    config.reconnect = ReconnectPolicy::disabled();
    let manager = ConnectionManager::new(config);
    manager.connect().await.unwrap();

    kuma.drop_clients();

    wait_for_condition(
        || manager.status().state == ConnectionState::Disconnected,
        WAIT,
    )
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(kuma.connections(), 1);

    // An explicit connect starts over
    manager.connect().await.unwrap();
    assert_eq!(kuma.connections(), 2);
    manager.disconnect().await;
}

#[tokio::test]
async fn test_unreachable_server_fails_fast() {
    let kuma = FakeKuma::start_default().await;
    let url = kuma.url();
    kuma.shutdown();
    drop(kuma);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let manager = ConnectionManager::new(upstream_config(&url));
    let err = manager.connect().await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(manager.status().state, ConnectionState::Disconnected);
}
