use anyhow::{Context, Result};
use dweb_gatewayd::config::Config;
use dweb_gatewayd::gateway;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("dweb_gatewayd=info"))
        )
        .init();

    tracing::info!("Starting dweb-gatewayd");

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/dweb/gatewayd.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    let gateway = gateway::start(config).await?;

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    gateway.shutdown().await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
