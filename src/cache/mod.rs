pub mod blob_store;
pub(crate) mod book_job;
pub mod chunk_downloader;
pub mod config;
pub mod downloader;
pub mod engine;
pub mod keys;
pub mod progress;
pub mod proxy;
pub mod range;
pub mod stats;
pub mod status;


pub use blob_store::{BlobMeta, BlobStore, BlobWriter, CachedBlob};
pub use chunk_downloader::{ChunkDownloader, ChunkedOutcome, RetryConfig};
pub use config::OfflineCacheConfig;
pub use downloader::{WholeFileDownloader, WholeFileOutcome};
pub use engine::{OfflineEngine, OfflineEngineHandle};
pub use keys::{StreamUrlMatcher, canonicalize_url, chunk_key};
pub use progress::{NoProgress, ProgressSink};
pub use proxy::{CacheResponder, Interception, ResponderServer};
pub use range::{ByteRange, RangeError, parse_range_header};
pub use stats::ProxyStats;
pub use status::StatusReporter;
