//! Upstream connection configuration

use crate::UpstreamError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Where and how to reach Uptime Kuma
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL of the Kuma server (http, https, ws or wss)
    pub url: String,
    /// Socket.IO mount path
    pub socket_path: String,
    /// Login user; no login is attempted when unset
    pub username: Option<String>,
    pub password: Option<String>,
    /// TOTP code when the account has 2FA enabled
    pub two_factor_token: Option<String>,
    /// Timeout for the WebSocket and Socket.IO handshake
    pub connect_timeout_secs: u64,
    /// Timeout waiting for the login acknowledgement
    pub auth_timeout_secs: u64,
    /// Capacity of the heartbeat broadcast channel
    pub event_buffer: usize,
    pub reconnect: ReconnectPolicy,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:3003".to_string(),
            socket_path: "/socket.io/".to_string(),
            username: Some("admin".to_string()),
            password: Some("admin123".to_string()),
            two_factor_token: None,
            connect_timeout_secs: 10,
            auth_timeout_secs: 10,
            event_buffer: 1024,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl UpstreamConfig {
    /// Defaults pointed at `url`
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Log in as `username` after connecting
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Connect anonymously
    pub fn without_credentials(mut self) -> Self {
        self.username = None;
        self.password = None;
        self.two_factor_token = None;
        self
    }

    /// Credentials are configured when both user and password are non-empty
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => Some((user, pass)),
            _ => None,
        }
    }

    /// Bound on the WebSocket and namespace handshake
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Bound on waiting for the login acknowledgement
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    /// WebSocket URL of the Engine.IO endpoint
    ///
    /// `http://kuma:3001` becomes `ws://kuma:3001/socket.io/?EIO=4&transport=websocket`.
    pub fn socket_url(&self) -> Result<Url, UpstreamError> {
        let mut url = Url::parse(&self.url)
            .map_err(|e| UpstreamError::Config(format!("Invalid upstream URL {}: {e}", self.url)))?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(UpstreamError::Config(format!(
                    "Unsupported upstream URL scheme: {other}"
                )));
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| UpstreamError::Config(format!("Cannot use scheme {scheme}")))?;

        let base = url.path().trim_end_matches('/').to_string();
        let mount = self.socket_path.trim_matches('/');
        url.set_path(&format!("{base}/{mount}/"));
        url.set_query(Some("EIO=4&transport=websocket"));
        Ok(url)
    }

    /// Check the URL and reconnect policy before any connect
    pub fn validate(&self) -> Result<(), UpstreamError> {
        self.socket_url()?;
        if self.event_buffer == 0 {
            return Err(UpstreamError::Config(
                "event_buffer must be greater than zero".to_string(),
            ));
        }
        self.reconnect.validate()
    }
}

/// Capped exponential backoff for re-establishing a dropped connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_ms: 1000,
            max_delay_ms: 5000,
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Never reconnect after a drop
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Delay before the given attempt (1-based), doubling up to the cap
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .initial_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    pub fn validate(&self) -> Result<(), UpstreamError> {
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(UpstreamError::Config(format!(
                "initial_delay_ms ({}) exceeds max_delay_ms ({})",
                self.initial_delay_ms, self.max_delay_ms
            )));
        }
        Ok(())
    }
}
