//! Hybridstore - storage and database failover coordinator
//!
//! Serves the coordinator API over HTTP. Configuration comes from an
//! optional TOML file (HYBRIDSTORE_CONFIG_FILE) with HYBRIDSTORE_*
//! environment overrides.

use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hybridstore::config::Config;
use hybridstore::server::{build_state, Server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    hybridstore::metrics::init_metrics()?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting hybridstore");
    info!(?config, "Configuration loaded");

    let state = build_state(&config).await?;
    let preferred = state.coordinator.preferred().await;
    info!(preferred = %preferred, "Coordinator initialized");

    let server = Server::new(config, state);

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal");
    };

    if let Err(e) = server.start(shutdown_signal).await {
        error!(error = %e, "Server error");
        return Err(e);
    }

    info!("Server shutdown complete");
    Ok(())
}
