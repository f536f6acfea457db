//! Command-line interface for the `kuma-relay` binary

use crate::config::{ConfigError, LogFormat, RelayConfig};
use clap::Parser;
use std::path::PathBuf;

/// Relay Uptime Kuma heartbeats to browsers as Server-Sent Events
#[derive(Debug, Parser)]
#[command(name = "kuma-relay", version, about)]
pub struct Cli {
    /// TOML configuration file; flags and environment override it
    #[arg(short, long, env = "RELAY_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "RELAY_HOST")]
    pub host: Option<String>,

    #[arg(short, long, env = "RELAY_PORT")]
    pub port: Option<u16>,

    /// Base URL of the Uptime Kuma server
    #[arg(long = "kuma-url", env = "UPTIME_KUMA_API_URL")]
    pub kuma_url: Option<String>,

    #[arg(long, env = "UPTIME_KUMA_USERNAME")]
    pub username: Option<String>,

    #[arg(long, env = "UPTIME_KUMA_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// TOTP code for accounts with two-factor authentication
    #[arg(long = "two-factor-token", env = "UPTIME_KUMA_2FA_TOKEN", hide_env_values = true)]
    pub two_factor_token: Option<String>,

    /// Connect without logging in
    #[arg(long, conflicts_with_all = ["username", "password"])]
    pub no_login: bool,

    #[arg(long)]
    pub log_level: Option<String>,

    #[arg(long, value_enum)]
    pub log_format: Option<LogFormat>,
}

impl Cli {
    /// Resolve the effective configuration: file, then flags and environment
    pub fn into_config(self) -> Result<RelayConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => RelayConfig::from_file(path)?,
            None => RelayConfig::default(),
        };

        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(url) = self.kuma_url {
            config.upstream.url = url;
        }
        if let Some(username) = self.username {
            config.upstream.username = Some(username);
        }
        if let Some(password) = self.password {
            config.upstream.password = Some(password);
        }
        if let Some(token) = self.two_factor_token {
            config.upstream.two_factor_token = Some(token);
        }
        if self.no_login {
            config.upstream = config.upstream.without_credentials();
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        if let Some(format) = self.log_format {
            config.logging.format = format;
        }

        config.validate()?;
        Ok(config)
    }
}
