//! Engine entrypoint: load config, connect, run until interrupted.

use anyhow::{Context, Result};
use tracing::info;

use cadence::{config, observability, Engine};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let config = config::try_get_config().context("failed to load configuration")?;
    let engine = Engine::start(&config).await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("interrupt received");

    engine.shutdown().await
}
