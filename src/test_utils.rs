#![cfg(test)]

use crate::cache::BlobStore;
use crate::db::connection::Database;
use anyhow::Result;
use sea_orm::DatabaseConnection as SeaOrmConnection;
use std::sync::Arc;
use tempfile::TempDir;

/// Test database wrapper that handles setup and teardown
pub struct TestDatabase {
    pub connection: Arc<SeaOrmConnection>,
    _temp_dir: TempDir,
}

impl TestDatabase {
    /// Create a new test database with migrations
    pub async fn new() -> Result<Self> {
        let temp_dir = TempDir::new()?;
        let db_path = temp_dir.path().join("test.db");

        let db = Database::connect(&db_path).await?;
        db.migrate().await?;

        Ok(Self {
            connection: db.get_connection(),
            _temp_dir: temp_dir,
        })
    }

    /// Get a clone of the database connection
    pub fn connection(&self) -> Arc<SeaOrmConnection> {
        self.connection.clone()
    }
}

/// Blob store in a fresh temporary directory; keep the `TempDir` alive.
pub async fn temp_blob_store() -> (TempDir, BlobStore) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let store = BlobStore::open(dir.path())
        .await
        .expect("Failed to open blob store");
    (dir, store)
}

/// Common test utilities
pub mod common {
    use std::future::Future;
    use std::time::Duration;
    use tokio::time::sleep;

    /// Wait for an async condition to become true
    pub async fn wait_for_async<F, Fut>(mut condition: F, max_wait: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let start = std::time::Instant::now();

        while start.elapsed() < max_wait {
            if condition().await {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }

        false
    }
}
