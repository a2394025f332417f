//! Gridboot node binary
//!
//! Joins the grid on the local network, claims an identifier, prints the
//! resulting replication settings as JSON and keeps answering peers until
//! interrupted.

mod summary;

use gridboot_discovery::{DiscoveryConfig, DiscoveryNode};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::summary::DiscoverySummary;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gridboot_node=info,gridboot_discovery=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = DiscoveryConfig::from_env()?;
    tracing::info!(
        port = config.broadcast_port,
        replication_port = config.replication_port,
        "Starting gridboot node"
    );

    let mut node = DiscoveryNode::start(config).await?;

    // Ctrl-C aborts discovery between rounds, or ends the node afterwards.
    let shutdown = node.shutdown_handle();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutting down");
                shutdown.shutdown();
            }
        }
    });

    let discovery = match node.discover().await {
        Ok(discovery) => discovery,
        Err(e) => {
            tracing::error!(error = %e, "Discovery failed");
            node.shutdown().await?;
            return Err(e.into());
        }
    };

    let summary = DiscoverySummary::new(node.local(), &discovery, node.known_nodes());
    println!("{}", serde_json::to_string_pretty(&summary)?);

    // Keep answering late joiners.
    shutdown.wait().await;
    node.shutdown().await?;

    Ok(())
}
