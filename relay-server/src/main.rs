use clap::Parser;
use kuma_relay_server::cli::Cli;
use kuma_relay_server::RelayServer;
use kuma_relay_upstream::{ConnectionManager, Upstream};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Cli::parse().into_config()?;
    config.logging.initialize()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        upstream = %config.upstream.url,
        login = config.upstream.credentials().is_some(),
        "Starting Kuma heartbeat relay"
    );

    let upstream: Arc<dyn Upstream> = Arc::new(ConnectionManager::new(config.upstream.clone()));
    let server = RelayServer::new(config, upstream)?;
    server.run().await?;

    Ok(())
}
