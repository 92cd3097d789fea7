pub mod connection;
pub mod entities;
pub mod migrations;
pub mod repository;

pub use connection::{Database, DatabaseConnection};
pub use repository::{OfflineRepository, OfflineRepositoryImpl};
