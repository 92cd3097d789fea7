#![allow(dead_code)]

use offline_media_cache::cache::{
    BlobStore, CacheResponder, OfflineCacheConfig, OfflineEngine, OfflineEngineHandle,
    RetryConfig, StreamUrlMatcher, proxy,
};
use offline_media_cache::db::{Database, OfflineRepository, OfflineRepositoryImpl};
use offline_media_cache::events::{EventSubscriber, OfflineEvent};
use offline_media_cache::models::BookStatus;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Engine, storage and proxy router over a temporary directory.
pub struct TestContext {
    pub handle: OfflineEngineHandle,
    pub events: EventSubscriber,
    pub blobs: BlobStore,
    pub repository: Arc<dyn OfflineRepository>,
    pub router: axum::Router,
    _temp_dir: TempDir,
}

impl TestContext {
    pub async fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");

        let db = Database::connect(&temp_dir.path().join("offline.db"))
            .await
            .expect("Failed to connect to test database");
        db.migrate().await.expect("Failed to run migrations");
        let repository: Arc<dyn OfflineRepository> =
            Arc::new(OfflineRepositoryImpl::new(db.get_connection()));

        let blobs = BlobStore::open(temp_dir.path().join("blobs"))
            .await
            .expect("Failed to open blob store");

        let config = test_config();
        let client = reqwest::Client::new();
        let (handle, engine) = OfflineEngine::new(
            config.clone(),
            repository.clone(),
            blobs.clone(),
            client.clone(),
            RetryConfig::none(),
        )
        .expect("Failed to create engine");
        let events = handle.subscribe();
        tokio::spawn(engine.run());

        let responder = CacheResponder::new(
            blobs.clone(),
            repository.clone(),
            StreamUrlMatcher::new(config.stream_path_markers.clone()),
        );
        let router = proxy::router(responder, client);

        Self {
            handle,
            events,
            blobs,
            repository,
            router,
            _temp_dir: temp_dir,
        }
    }

    /// Wait for the book-level status event `status` of `book_id`.
    pub async fn wait_for_book(&mut self, book_id: &str, status: BookStatus) {
        let events = &mut self.events;
        let wait = async {
            loop {
                let event = events.recv().await.expect("Event bus closed");
                if let OfflineEvent::Status(status_event) = event
                    && status_event.is_book_level()
                    && status_event.book_id.as_ref().map(|id| id.as_str()) == Some(book_id)
                    && status_event.status == status
                {
                    return;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(10), wait)
            .await
            .unwrap_or_else(|_| panic!("Timed out waiting for {} to become {:?}", book_id, status));
    }
}

/// Small windows so a 13-byte audiobook is chunked into 5 + 5 + 3.
pub fn test_config() -> OfflineCacheConfig {
    OfflineCacheConfig {
        chunk_size_bytes: 5,
        chunk_threshold_bytes: 12,
        progress_emit_interval_ms: 0,
        persist_interval_ms: 0,
        resume_on_startup: false,
        ..OfflineCacheConfig::default()
    }
}

/// `/proxy?url=...` for `origin_url`.
pub fn proxy_path(origin_url: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(origin_url.as_bytes()).collect();
    format!("/proxy?url={}", encoded)
}
