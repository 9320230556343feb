//! multi-layer-cache: run the cache manager as a standalone process.
//!
//! Builds the configured layer stack, starts the warming and metrics timers
//! and logs cache events until interrupted.

use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use multi_layer_cache::config::{Cli, Config};
use multi_layer_cache::layers::remote::RemoteConnection;
use multi_layer_cache::{new_shared_manager, CacheEvent, CacheManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "multi_layer_cache=debug"
    } else {
        "multi_layer_cache=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter.into());
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }

    info!("multi-layer-cache v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(&cli.config)?;
    info!(
        layers = ?config.layer_order(),
        strategy = %config.manager.default_strategy,
        memory_max_size = config.memory.max_size,
        memory_max_items = config.memory.max_items,
        "Configuration loaded"
    );

    let remote = connect_remote(&config).await?;
    let manager = new_shared_manager(CacheManager::from_config(config, remote).await?);

    let mut events = manager.subscribe();
    let listener = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(CacheEvent::LowHitRate(stats)) => {
                    warn!(hit_rate = stats.global.hit_rate, "Hit rate below threshold")
                }
                Ok(CacheEvent::HighResponseTime(stats)) => warn!(
                    avg_response_time_ms = stats.global.avg_response_time,
                    "Response time above threshold"
                ),
                Ok(CacheEvent::Metrics(stats)) => info!(
                    hits = stats.global.hits,
                    misses = stats.global.misses,
                    hit_rate = stats.global.hit_rate,
                    total_size = stats.global.total_size,
                    "Metrics"
                ),
                Ok(event) => debug!(event = event.name(), "Cache event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event listener lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    info!("Cache manager running, press Ctrl-C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }

    info!("Shutting down");
    manager.close().await;
    listener.abort();

    let encoder = prometheus::TextEncoder::new();
    match encoder.encode_to_string(&manager.prometheus_registry().gather()) {
        Ok(text) => debug!("Final metrics:\n{text}"),
        Err(e) => warn!(error = %e, "Failed to encode metrics"),
    }
    Ok(())
}

#[cfg(feature = "redis")]
async fn connect_remote(config: &Config) -> anyhow::Result<Option<Arc<dyn RemoteConnection>>> {
    use multi_layer_cache::layers::remote::RedisConnection;

    if !config.remote.enabled {
        return Ok(None);
    }
    let connection = RedisConnection::connect(&config.remote.url).await?;
    info!(url = %config.remote.url, "Connected to remote store");
    Ok(Some(Arc::new(connection)))
}

#[cfg(not(feature = "redis"))]
async fn connect_remote(config: &Config) -> anyhow::Result<Option<Arc<dyn RemoteConnection>>> {
    if config.remote.enabled {
        anyhow::bail!("remote layer enabled but built without the `redis` feature");
    }
    Ok(None)
}
