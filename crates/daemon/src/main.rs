mod caddy;
mod supervisor;

use anyhow::Context;
use common::config::Config;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::load().context("invalid configuration")?;
    info!(
        state_dir = %config.state_dir.display(),
        admin = %config.admin.base_url,
        caddy = %config.caddy_bin.display(),
        "starting portwrap-daemon"
    );

    supervisor::run(config).await.inspect_err(|e| {
        error!("daemon stopped with an error: {e:#}");
    })
}
