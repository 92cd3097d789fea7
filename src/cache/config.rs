use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::models::MediaType;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineCacheConfig {
    /// Directory holding the blob store
    pub cache_directory: Option<PathBuf>,

    /// Window size of chunked audiobook downloads in bytes
    pub chunk_size_bytes: u64,

    /// Audiobook files at or above this size are chunked
    pub chunk_threshold_bytes: u64,

    /// Minimum spacing between progress broadcasts
    pub progress_emit_interval_ms: u64,

    /// Minimum spacing between progress writes to the metadata store
    pub persist_interval_ms: u64,

    /// Buffer of the event broadcast channel
    pub event_capacity: usize,

    /// Re-enqueue books left `queued`/`downloading` by a previous process
    pub resume_on_startup: bool,

    /// Path fragments that mark a URL as an interceptable media stream
    pub stream_path_markers: Vec<String>,
}

impl Default for OfflineCacheConfig {
    fn default() -> Self {
        Self {
            cache_directory: None,
            chunk_size_bytes: 5 * MIB,
            chunk_threshold_bytes: 25 * MIB,
            progress_emit_interval_ms: 120,
            persist_interval_ms: 500,
            event_capacity: 256,
            resume_on_startup: true,
            stream_path_markers: vec!["/stream/".to_string(), "/file/".to_string()],
        }
    }
}

impl OfflineCacheConfig {
    /// Get the cache directory path, using platform-specific defaults if not set
    pub fn cache_directory(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.cache_directory {
            Ok(dir.clone())
        } else {
            Self::default_cache_directory()
        }
    }

    /// `<cache_dir>/offline-media-cache`, e.g. `~/.cache/offline-media-cache` on Linux
    pub fn default_cache_directory() -> Result<PathBuf> {
        let cache_dir =
            dirs::cache_dir().ok_or_else(|| anyhow::anyhow!("Failed to get cache directory"))?;
        Ok(cache_dir.join("offline-media-cache"))
    }

    /// Chunking policy: only audiobooks at or above the threshold.
    pub fn should_chunk(&self, media_type: MediaType, bytes_total: u64) -> bool {
        media_type == MediaType::Audiobook && bytes_total >= self.chunk_threshold_bytes
    }

    pub fn progress_emit_interval(&self) -> Duration {
        Duration::from_millis(self.progress_emit_interval_ms)
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_millis(self.persist_interval_ms)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size_bytes == 0 {
            return Err(anyhow::anyhow!("chunk_size_bytes must be greater than 0"));
        }

        if self.chunk_threshold_bytes == 0 {
            return Err(anyhow::anyhow!(
                "chunk_threshold_bytes must be greater than 0"
            ));
        }

        if self.event_capacity == 0 {
            return Err(anyhow::anyhow!("event_capacity must be greater than 0"));
        }

        if self.stream_path_markers.iter().all(|m| m.is_empty()) {
            return Err(anyhow::anyhow!(
                "stream_path_markers must contain at least one non-empty marker"
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OfflineCacheConfig::default();
        assert_eq!(config.chunk_size_bytes, 5 * 1024 * 1024);
        assert_eq!(config.chunk_threshold_bytes, 25 * 1024 * 1024);
        assert_eq!(config.progress_emit_interval(), Duration::from_millis(120));
        assert_eq!(config.persist_interval(), Duration::from_millis(500));
        assert!(config.resume_on_startup);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_chunking_policy() {
        let config = OfflineCacheConfig::default();
        let threshold = config.chunk_threshold_bytes;

        assert!(config.should_chunk(MediaType::Audiobook, threshold));
        assert!(config.should_chunk(MediaType::Audiobook, threshold * 4));
        assert!(!config.should_chunk(MediaType::Audiobook, threshold - 1));
        assert!(!config.should_chunk(MediaType::Ebook, threshold * 4));
        assert!(!config.should_chunk(MediaType::Unknown, threshold * 4));
    }

    #[test]
    fn test_config_validation() {
        let mut config = OfflineCacheConfig::default();

        config.chunk_size_bytes = 0;
        assert!(config.validate().is_err());

        config = OfflineCacheConfig::default();
        config.event_capacity = 0;
        assert!(config.validate().is_err());

        config = OfflineCacheConfig::default();
        config.stream_path_markers = vec![String::new()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_explicit_cache_directory_wins() {
        let config = OfflineCacheConfig {
            cache_directory: Some(PathBuf::from("/tmp/omc")),
            ..Default::default()
        };
        assert_eq!(config.cache_directory().unwrap(), PathBuf::from("/tmp/omc"));
    }
}
