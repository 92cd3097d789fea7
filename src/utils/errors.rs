use thiserror::Error;

/// Failures on the fetch and read paths.
///
/// Storage and metadata helpers return `anyhow::Result`; those errors are
/// wrapped as [`CacheError::Storage`] when they cross into a fetch or read.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cannot determine total size of {url}")]
    UnresolvableSize { url: String },

    #[error("Origin answered {status} for {url}")]
    HttpStatus {
        status: reqwest::StatusCode,
        url: String,
    },

    #[error("Network error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Chunk {index} of {url} has {actual} bytes, expected {expected}")]
    ShortChunk {
        url: String,
        index: u64,
        expected: u64,
        actual: u64,
    },

    #[error("Origin reports {actual} bytes for {url}, expected {expected}")]
    SizeMismatch {
        url: String,
        expected: u64,
        actual: u64,
    },

    #[error("Chunk {index} of {url} is not cached")]
    MissingChunk { url: String, index: u64 },

    #[error("Download cancelled")]
    Cancelled,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Offline engine is not running")]
    EngineStopped,

    #[error("Storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl CacheError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
