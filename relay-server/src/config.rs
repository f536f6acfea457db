//! Relay configuration and logging setup

use crate::registry::DEFAULT_QUEUE_CAPACITY;
use kuma_relay_protocol::DEFAULT_PING_INTERVAL_SECS;
use kuma_relay_upstream::UpstreamConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration could not be loaded or applied
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid TOML for [`RelayConfig`]
    #[error("Failed to parse config file: {0}")]
    Parse(String),

    /// A value is out of range or inconsistent
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// The tracing subscriber could not be installed
    #[error("Logging setup error: {0}")]
    Logging(String),
}

impl ConfigError {
    /// Shorthand for [`ConfigError::Invalid`]
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

/// Complete relay configuration, loadable from TOML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerSettings,
    pub upstream: UpstreamConfig,
    pub logging: LoggingConfig,
}

impl RelayConfig {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every section
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.upstream
            .validate()
            .map_err(|e| ConfigError::invalid(e.to_string()))
    }
}

/// HTTP listener and per-session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    /// 0 picks a free port
    pub port: u16,
    /// Keep-alive ping period for idle streams
    pub ping_interval_secs: u64,
    /// Heartbeats buffered per viewer before events are dropped
    pub queue_capacity: usize,
    pub enable_cors: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            ping_interval_secs: DEFAULT_PING_INTERVAL_SECS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            enable_cors: true,
        }
    }
}

impl ServerSettings {
    /// Keep-alive period as a `Duration`
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    /// Listener address; `host` must be an IP literal
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| ConfigError::invalid(format!("Invalid address {}:{}: {e}", self.host, self.port)))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_addr()?;
        if self.ping_interval_secs == 0 {
            return Err(ConfigError::invalid("ping_interval_secs must be greater than zero"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::invalid("queue_capacity must be greater than zero"));
        }
        Ok(())
    }
}

/// How and where log lines are written
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive; `RUST_LOG` takes precedence
    pub level: String,
    pub format: LogFormat,
    pub output: LogOutput,
}

/// Log line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum LogFormat {
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "pretty")]
    Pretty,
    #[serde(rename = "compact")]
    Compact,
}

/// Log destination stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogOutput {
    #[serde(rename = "stdout")]
    Stdout,
    #[serde(rename = "stderr")]
    Stderr,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            output: LogOutput::Stdout,
        }
    }
}

impl LoggingConfig {
    /// Install the global tracing subscriber
    pub fn initialize(&self) -> Result<(), ConfigError> {
        use tracing_subscriber::fmt::writer::BoxMakeWriter;
        use tracing_subscriber::{EnvFilter, fmt, prelude::*};

        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.level))
            .map_err(|e| ConfigError::Logging(format!("Invalid log level: {e}")))?;

        let writer = match self.output {
            LogOutput::Stdout => BoxMakeWriter::new(std::io::stdout),
            LogOutput::Stderr => BoxMakeWriter::new(std::io::stderr),
        };

        let result = match self.format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(writer))
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().pretty().with_writer(writer))
                .try_init(),
            LogFormat::Compact => tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().compact().with_writer(writer))
                .try_init(),
        };

        result.map_err(|e| ConfigError::Logging(e.to_string()))
    }
}
