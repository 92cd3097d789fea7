// Library entry: the offline cache engine, its metadata store and the local responder.
// The binary in src/main.rs wires these together.

#![allow(clippy::result_large_err)]

pub mod cache;
pub mod config;
pub mod db;
pub mod events;
pub mod models;
pub mod utils;

#[cfg(test)]
mod test_utils;

pub use cache::{OfflineEngine, OfflineEngineHandle, ResponderServer};
pub use config::Config;
pub use utils::CacheError;
