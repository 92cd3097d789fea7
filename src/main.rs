use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use offline_media_cache::cache::{
    BlobStore, CacheResponder, OfflineEngine, ResponderServer, StreamUrlMatcher,
};
use offline_media_cache::config::Config;
use offline_media_cache::db::{Database, OfflineRepository, OfflineRepositoryImpl};

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG wins over the default filter
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("offline_media_cache=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting offline media cache");

    let config = Config::load().context("Failed to load configuration")?;

    let db = Database::connect(&config.database_path()?).await?;
    db.migrate().await?;
    let repository: Arc<dyn OfflineRepository> =
        Arc::new(OfflineRepositoryImpl::new(db.get_connection()));

    let cache_dir = config.cache.cache_directory()?;
    info!("Blob cache at {}", cache_dir.display());
    let blobs = BlobStore::open(&cache_dir).await?;

    let client = config.network.build_client()?;

    let (handle, engine) = OfflineEngine::new(
        config.cache.clone(),
        repository.clone(),
        blobs.clone(),
        client.clone(),
        config.network.retry_config(),
    )?;
    let engine_task = tokio::spawn(engine.run());

    let responder = CacheResponder::new(
        blobs,
        repository,
        StreamUrlMatcher::new(config.cache.stream_path_markers.clone()),
    );
    let server = ResponderServer::bind(&config.server.listen_addr, responder, client).await?;
    info!(
        "Playback URLs look like {}",
        server.proxy_url("https://media.example/stream/book.mp3")
    );

    if config.server.stats_interval_secs > 0 {
        let stats = server.stats().clone();
        let period = Duration::from_secs(config.server.stats_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick fires immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                info!("{}", stats.format_report());
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");

    server.shutdown();
    if let Err(e) = handle.shutdown().await {
        error!("Engine did not shut down cleanly: {}", e);
    }
    if let Err(e) = engine_task.await {
        error!("Engine task failed: {}", e);
    }

    info!("{}", server.stats().format_report());
    Ok(())
}
