pub mod offline_repository;

use sea_orm::DatabaseConnection;
use std::sync::Arc;

/// Base repository implementation holder
#[derive(Debug)]
pub struct BaseRepository {
    pub db: Arc<DatabaseConnection>,
}

impl BaseRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

pub use offline_repository::{OfflineRepository, OfflineRepositoryImpl};
