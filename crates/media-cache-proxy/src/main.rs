//! Media Cache Proxy - caching proxy in front of a media origin
//!
//! Serves media from a disk-backed hybrid blob cache, fetching from the
//! origin once per key on a miss.

mod error;
mod proxy;
mod server;
mod types;

use crate::error::{ProxyError, Result};
use crate::proxy::OriginFetcher;
use crate::server::{start_server, ServerState, SharedState};
use crate::types::ProxyConfig;
use hybrid_blob_cache::{HybridCache, MemoryMetadataStore, MetadataStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{prelude::*, EnvFilter};

const METADATA_FLUSH_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let env_filter =
        EnvFilter::from_default_env().add_directive("media_cache_proxy=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    };

    info!("Starting Media Cache Proxy...");

    let config = ProxyConfig::from_env()?;
    info!("Port: {}", config.port);
    info!("Origin: {}", config.origin_url);
    info!("Cache dir: {:?}", config.cache_dir);
    info!(
        "Max cache size: {} MB",
        config.max_cache_size / (1024 * 1024)
    );
    info!(
        "Max queued writes: {} MB",
        config.max_queued_bytes / (1024 * 1024)
    );

    let store: Arc<dyn MetadataStore> = Arc::new(MemoryMetadataStore::with_snapshot(
        config.metadata_shards,
        config.metadata_path(),
        METADATA_FLUSH_INTERVAL,
    ));
    let cache = HybridCache::new(config.cache_options(), store)?;
    cache.start().await?;

    let fetcher = OriginFetcher::new(config.origin_url.clone());
    let state: SharedState = Arc::new(ServerState::new(cache, fetcher));

    let served = start_server(state.clone(), config.port, shutdown_signal()).await;

    info!("Draining queued cache writes...");
    state.cache.stop().await?;

    served.map_err(|e| ProxyError::Config(format!("Server error: {}", e)))?;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
