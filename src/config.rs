use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::cache::OfflineCacheConfig;
use crate::cache::chunk_downloader::RetryConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cache: OfflineCacheConfig,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle read timeout on a response body
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    #[serde(default = "default_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_delay")]
    pub retry_initial_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub retry_max_delay_ms: u64,

    #[serde(default = "default_backoff")]
    pub retry_backoff_multiplier: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address of the local responder proxy; port 0 picks a free one
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Seconds between proxy statistics log lines; 0 disables them
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            info!("No config file found, using defaults");
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!("Loading config from {:?}", path);
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;
        config.cache.validate().context("Invalid [cache] section")?;
        info!("Config loaded successfully");
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents).context("Failed to write config file")?;

        debug!("Config saved to {:?}", path);
        Ok(())
    }

    /// Explicit database path, or `<data_dir>/offline-media-cache/offline.db`
    pub fn database_path(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.database.path {
            return Ok(path.clone());
        }
        let data_dir = dirs::data_dir().context("Failed to get data directory")?;
        Ok(data_dir.join("offline-media-cache").join("offline.db"))
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("Failed to get config directory")?;
        Ok(config_dir.join("offline-media-cache").join("config.toml"))
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            backoff_multiplier: self.retry_backoff_multiplier,
        }
    }

    /// Origin client shared by both fetchers and the pass-through proxy.
    pub fn build_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .connect_timeout(self.connect_timeout())
            .read_timeout(self.read_timeout())
            .build()
            .context("Failed to build HTTP client")
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            max_retries: default_retries(),
            retry_initial_delay_ms: default_initial_delay(),
            retry_max_delay_ms: default_max_delay(),
            retry_backoff_multiplier: default_backoff(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            stats_interval_secs: default_stats_interval(),
        }
    }
}

// Default value functions
fn default_connect_timeout() -> u64 { 10 }
fn default_read_timeout() -> u64 { 60 }
fn default_retries() -> u32 { 3 }
fn default_initial_delay() -> u64 { 500 }
fn default_max_delay() -> u64 { 10_000 }
fn default_backoff() -> f64 { 2.0 }
fn default_listen_addr() -> String { "127.0.0.1:0".to_string() }
fn default_stats_interval() -> u64 { 300 }

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_file_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[cache]
chunk_size_bytes = 1048576
resume_on_startup = false

[server]
listen_addr = "127.0.0.1:8799"
"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.cache.chunk_size_bytes, 1024 * 1024);
        assert!(!config.cache.resume_on_startup);
        assert_eq!(config.cache.chunk_threshold_bytes, 25 * 1024 * 1024);
        assert_eq!(config.server.listen_addr, "127.0.0.1:8799");
        assert_eq!(config.network.max_retries, 3);
        assert!(config.database.path.is_none());
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.database.path = Some(dir.path().join("offline.db"));
        config.network.max_retries = 7;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.network.max_retries, 7);
        assert_eq!(loaded.database_path().unwrap(), dir.path().join("offline.db"));
    }

    #[test]
    fn test_invalid_cache_section_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[cache]\nchunk_size_bytes = 0\n").unwrap();

        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn test_retry_config_from_network_section() {
        let retry = NetworkConfig::default().retry_config();
        assert_eq!(retry.max_retries, 3);
        assert_eq!(retry.initial_delay, Duration::from_millis(500));
        assert_eq!(retry.max_delay, Duration::from_secs(10));
    }
}
