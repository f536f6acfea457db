//! Integration tests for the Kuma heartbeat relay
//!
//! The real [`kuma_relay_upstream::ConnectionManager`] and HTTP server run
//! against [`fake_kuma::FakeKuma`], an in-process Socket.IO server.

#![allow(clippy::uninlined_format_args)] // Allow traditional format strings in tests

pub mod fake_kuma;
#[cfg(test)]
mod relay_end_to_end;
#[cfg(test)]
mod upstream_integration;

/// Common test utilities for integration tests
pub mod test_utils {
    use kuma_relay_upstream::{ReconnectPolicy, UpstreamConfig};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    /// Upstream config for a fake server with fast reconnects
    pub fn upstream_config(url: &str) -> UpstreamConfig {
        UpstreamConfig {
            connect_timeout_secs: 2,
            auth_timeout_secs: 2,
            reconnect: ReconnectPolicy {
                enabled: true,
                initial_delay_ms: 20,
                max_delay_ms: 100,
                max_attempts: 5,
            },
            ..UpstreamConfig::new(url)
        }
    }

    /// Wait for a condition with timeout
    pub async fn wait_for_condition<F>(
        mut condition: F,
        timeout_duration: Duration,
    ) -> Result<(), Box<dyn std::error::Error>>
    where
        F: FnMut() -> bool,
    {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout_duration {
            if condition() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Err("Condition timeout".into())
    }

    /// Read from a raw HTTP connection until `needle` shows up
    pub async fn read_until(
        stream: &mut TcpStream,
        buffer: &mut String,
        needle: &str,
        timeout_duration: Duration,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let deadline = tokio::time::Instant::now() + timeout_duration;
        let mut chunk = [0u8; 4096];
        while !buffer.contains(needle) {
            let n = tokio::time::timeout_at(deadline, stream.read(&mut chunk)).await??;
            if n == 0 {
                return Err(format!("connection closed before {needle:?}").into());
            }
            buffer.push_str(&String::from_utf8_lossy(&chunk[..n]));
        }
        Ok(())
    }
}
