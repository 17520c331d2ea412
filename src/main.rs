//! Relaybox DNS proxy - entry point.

use anyhow::{Context, Result};
use tracing::info;

use relaybox::{Config, Proxy};

async fn run() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load configuration from {config_path}"))?;

    info!("starting relaybox...");
    let proxy = Proxy::new(config)
        .await
        .context("failed to assemble proxy")?;
    proxy.start().await.context("failed to start listeners")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for shutdown signal")?;
    info!("ctrl-c received, shutting down...");
    proxy.shutdown().await;

    info!("shutdown complete");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    run().await
}
