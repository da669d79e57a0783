//! PointBridge agent binary.

use anyhow::Result;
use pointbridge_agent::{Agent, AgentConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting PointBridge Agent"
    );

    // Load configuration
    let config = AgentConfig::from_env()?;

    let agent = Agent::new(config)?;
    tracing::info!(node_id = %agent.node_id(), "Agent initialized");

    // Run agent
    agent.run().await?;

    Ok(())
}
