use anyhow::Result;
use peernet_node::{PeerNetConfig, PeerNetworkManager};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = PeerNetConfig::load();
    tracing::info!(node_id = %config.node_id, url = %config.self_url(), "Starting peer overlay node");

    let manager = PeerNetworkManager::new(config)?;
    manager.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    manager.stop().await;

    Ok(())
}
