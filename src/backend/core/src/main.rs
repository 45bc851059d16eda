//! Bazaar cache server - Main entry point
//!
//! Runs the multi-tier cache with the configured invalidation rules attached
//! to an in-process change feed, until a shutdown signal arrives.

use std::sync::Arc;

use bazaar_cache::{
    cache::MultiLayerCache,
    config::Config,
    invalidation::{BroadcastChangeFeed, InvalidationManager},
    telemetry::init_logging,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = match std::env::var("BAZAAR_CONFIG") {
        Ok(path) => Config::from_file(&path)?,
        Err(_) => Config::load().unwrap_or_else(|e| {
            eprintln!("Warning: Could not load config: {}. Using defaults.", e);
            Config::default()
        }),
    };

    init_logging(&config.logging)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Bazaar cache server"
    );

    // Durable tier
    let durable = config.cache.durable.connect().await;

    let cache = MultiLayerCache::new(config.cache_config(), durable);
    cache.start_sweeper();
    tracing::info!(
        fast_capacity = config.cache.fast_capacity,
        durable = cache.stats().await.durable.map(|d| d.backend).unwrap_or_else(|| "none".to_string()),
        "Cache initialized"
    );

    // Invalidation
    let feed = Arc::new(BroadcastChangeFeed::default());
    let manager = InvalidationManager::new(cache.clone(), feed, config.invalidation_config());
    for rule in config.rules()? {
        manager.add_rule(rule).await;
    }
    manager.start().await;

    shutdown_signal().await;

    // Cleanup
    manager.stop().await;
    cache.shutdown().await;
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
