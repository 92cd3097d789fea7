use bytes::Bytes;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, HeaderMap, RANGE};
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::blob_store::{BlobMeta, BlobStore};
use super::keys::{chunk_key, chunk_window};
use super::progress::ProgressSink;
use crate::db::repository::OfflineRepository;
use crate::models::ChunkedUrlMetadata;
use crate::utils::CacheError;

/// Configuration for chunk download retries
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Initial delay before first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// No retries; used by tests that want failures to surface at once.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }
}

/// Result of a completed chunked fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkedOutcome {
    pub bytes_total: u64,
    pub content_type: Option<String>,
    /// Chunks that were already cached and skipped
    pub chunks_reused: u64,
    pub chunks_fetched: u64,
}

/// Caches one large file as independently addressable fixed-size windows.
pub struct ChunkDownloader {
    client: Client,
    blobs: BlobStore,
    repository: Arc<dyn OfflineRepository>,
    retry_config: RetryConfig,
}

impl ChunkDownloader {
    pub fn new(client: Client, blobs: BlobStore, repository: Arc<dyn OfflineRepository>) -> Self {
        Self {
            client,
            blobs,
            repository,
            retry_config: RetryConfig::default(),
        }
    }

    /// Create a ChunkDownloader with custom retry configuration
    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    /// Download every missing chunk of `url`.
    ///
    /// `expected_total` of 0 means unknown; the size is then probed from the
    /// origin. Chunks already in the blob store count as downloaded and are
    /// not refetched.
    pub async fn fetch(
        &self,
        url: &str,
        expected_total: u64,
        chunk_size: u64,
        cancel: &CancellationToken,
        progress: &mut dyn ProgressSink,
    ) -> Result<ChunkedOutcome, CacheError> {
        if chunk_size == 0 {
            return Err(CacheError::InvalidRequest("chunk size must be non-zero".into()));
        }

        let total = if expected_total > 0 {
            expected_total
        } else {
            self.probe_total(url, cancel).await?
        };
        let chunk_count = total.div_ceil(chunk_size);
        debug!(
            "Chunked fetch of {} ({} bytes, {} chunks of {})",
            url, total, chunk_count, chunk_size
        );

        // Written before the first chunk so the responder can do range math early
        self.persist_metadata(&ChunkedUrlMetadata::new(url, chunk_size, total, None))
            .await;

        let mut downloaded = 0u64;
        let mut content_type: Option<String> = None;
        let mut reused = 0u64;
        let mut fetched = 0u64;

        for index in 0..chunk_count {
            if cancel.is_cancelled() {
                return Err(CacheError::Cancelled);
            }

            let (start, end) = chunk_window(index, chunk_size, total);
            let expected_len = end - start + 1;
            let key = chunk_key(url, index, chunk_size);

            if let Ok(Some(meta)) = self.blobs.head(&key).await
                && meta.content_length == expected_len
            {
                if index == 0 {
                    content_type = meta.content_type;
                }
                reused += 1;
                downloaded += expected_len;
                progress.report(downloaded, total).await;
                continue;
            }

            let (data, chunk_type) = self
                .fetch_chunk_with_retry(url, index, (start, end), total, cancel)
                .await?;
            if index == 0 {
                content_type = chunk_type.clone();
            }

            let meta = BlobMeta::new(&key)
                .with_content_type(chunk_type)
                .with_chunk(index, chunk_size);
            self.blobs.put(&key, &data, meta).await?;

            fetched += 1;
            downloaded += expected_len;
            debug!("Chunk {}/{} of {} landed", index + 1, chunk_count, url);
            progress.report(downloaded, total).await;
        }

        self.persist_metadata(&ChunkedUrlMetadata::new(
            url,
            chunk_size,
            total,
            content_type.clone(),
        ))
        .await;

        info!(
            "Cached {} in {} chunks ({} fetched, {} reused)",
            url, chunk_count, fetched, reused
        );

        Ok(ChunkedOutcome {
            bytes_total: total,
            content_type,
            chunks_reused: reused,
            chunks_fetched: fetched,
        })
    }

    async fn persist_metadata(&self, metadata: &ChunkedUrlMetadata) {
        if let Err(e) = self.repository.put_chunked_url(metadata).await {
            warn!("Failed to record chunked metadata for {}: {:#}", metadata.url, e);
        }
    }

    /// Learn the authoritative size: `HEAD` first, then a one-byte range GET.
    pub async fn probe_total(&self, url: &str, cancel: &CancellationToken) -> Result<u64, CacheError> {
        let head = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CacheError::Cancelled),
            response = self.client.head(url).send() => response,
        };
        match head {
            Ok(response) if response.status().is_success() => {
                if let Some(total) = header_u64(response.headers(), CONTENT_LENGTH).filter(|t| *t > 0) {
                    return Ok(total);
                }
            }
            Ok(response) => debug!("HEAD {} answered {}", url, response.status()),
            Err(e) => debug!("HEAD {} failed: {}", url, e),
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CacheError::Cancelled),
            response = self.client.get(url).header(RANGE, "bytes=0-0").send() => response?,
        };

        let total = match response.status() {
            StatusCode::PARTIAL_CONTENT => response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(total_from_content_range),
            status if status.is_success() => header_u64(response.headers(), CONTENT_LENGTH),
            status => {
                return Err(CacheError::HttpStatus {
                    status,
                    url: url.to_string(),
                });
            }
        };

        total
            .filter(|t| *t > 0)
            .ok_or_else(|| CacheError::UnresolvableSize {
                url: url.to_string(),
            })
    }

    async fn fetch_chunk_with_retry(
        &self,
        url: &str,
        index: u64,
        window: (u64, u64),
        total: u64,
        cancel: &CancellationToken,
    ) -> Result<(Bytes, Option<String>), CacheError> {
        let mut attempt = 0;
        let mut delay = self.retry_config.initial_delay;

        loop {
            attempt += 1;

            match self.try_fetch_chunk(url, index, window, total, cancel).await {
                Ok(chunk) => {
                    if attempt > 1 {
                        info!(
                            "Fetched chunk {} of {} after {} attempts",
                            index, url, attempt
                        );
                    }
                    return Ok(chunk);
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    if attempt > self.retry_config.max_retries || !is_retryable(&e) {
                        error!(
                            "Failed to fetch chunk {} of {} after {} attempts: {}",
                            index, url, attempt, e
                        );
                        return Err(e);
                    }

                    warn!(
                        "Attempt {} failed for chunk {} of {}: {}. Retrying in {:?}...",
                        attempt, index, url, e, delay
                    );

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(CacheError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }

                    delay = self.retry_config.next_delay(delay);
                }
            }
        }
    }

    /// One range request for exactly `[start, end]` of a `total`-byte file.
    async fn try_fetch_chunk(
        &self,
        url: &str,
        index: u64,
        (start, end): (u64, u64),
        total: u64,
        cancel: &CancellationToken,
    ) -> Result<(Bytes, Option<String>), CacheError> {
        let request = self
            .client
            .get(url)
            .header(RANGE, format!("bytes={}-{}", start, end))
            .send();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CacheError::Cancelled),
            response = request => response?,
        };

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            return Err(CacheError::HttpStatus {
                status,
                url: url.to_string(),
            });
        }

        // A manifest size that disagrees with the origin would cache a truncated file
        let origin_total = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(total_from_content_range);
        if let Some(origin_total) = origin_total
            && origin_total != total
        {
            return Err(CacheError::SizeMismatch {
                url: url.to_string(),
                expected: total,
                actual: origin_total,
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CacheError::Cancelled),
            body = response.bytes() => body?,
        };

        let expected = end - start + 1;
        let data = if status == StatusCode::OK {
            // Origin ignored the range and sent the whole file
            if body.len() as u64 > total {
                return Err(CacheError::SizeMismatch {
                    url: url.to_string(),
                    expected: total,
                    actual: body.len() as u64,
                });
            }
            if (body.len() as u64) <= end {
                return Err(CacheError::ShortChunk {
                    url: url.to_string(),
                    index,
                    expected,
                    actual: body.len() as u64,
                });
            }
            body.slice(start as usize..=end as usize)
        } else {
            body
        };

        if data.len() as u64 != expected {
            return Err(CacheError::ShortChunk {
                url: url.to_string(),
                index,
                expected,
                actual: data.len() as u64,
            });
        }

        Ok((data, content_type))
    }
}

fn is_retryable(err: &CacheError) -> bool {
    match err {
        CacheError::HttpStatus { status, .. } => {
            status.is_server_error()
                || *status == StatusCode::REQUEST_TIMEOUT
                || *status == StatusCode::TOO_MANY_REQUESTS
        }
        CacheError::Http(_) | CacheError::ShortChunk { .. } => true,
        _ => false,
    }
}

fn header_u64(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Total from `bytes 0-0/1234`; `None` for `*` totals.
fn total_from_content_range(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::progress::NoProgress;
    use crate::db::repository::OfflineRepositoryImpl;
    use crate::test_utils::{TestDatabase, temp_blob_store};

    struct Recorder(Vec<(u64, u64)>);

    #[async_trait::async_trait]
    impl ProgressSink for Recorder {
        async fn report(&mut self, downloaded: u64, total: u64) {
            self.0.push((downloaded, total));
        }
    }

    const BODY: &[u8] = b"abcdefghijklm";

    async fn downloader() -> (TestDatabase, tempfile::TempDir, ChunkDownloader) {
        let db = TestDatabase::new().await.unwrap();
        let (dir, blobs) = temp_blob_store().await;
        let repo = Arc::new(OfflineRepositoryImpl::new(db.connection()));
        let downloader =
            ChunkDownloader::new(Client::new(), blobs, repo).with_retry_config(RetryConfig::none());
        (db, dir, downloader)
    }

    #[test]
    fn test_total_from_content_range() {
        assert_eq!(total_from_content_range("bytes 0-0/1234"), Some(1234));
        assert_eq!(total_from_content_range("bytes 0-0/*"), None);
        assert_eq!(total_from_content_range("garbage"), None);
    }

    #[test]
    fn test_backoff_is_capped() {
        let retry = RetryConfig {
            max_retries: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        };
        assert_eq!(retry.next_delay(Duration::from_millis(500)), Duration::from_secs(1));
        assert_eq!(retry.next_delay(Duration::from_secs(1)), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_fetches_every_window_and_records_metadata() {
        let mut server = mockito::Server::new_async().await;
        let url = format!("{}/stream/book.mp3", server.url());

        let mut mocks = Vec::new();
        for (range, body) in [("bytes=0-4", &BODY[0..5]), ("bytes=5-9", &BODY[5..10]), ("bytes=10-12", &BODY[10..13])] {
            mocks.push(
                server
                    .mock("GET", "/stream/book.mp3")
                    .match_header("range", range)
                    .with_status(206)
                    .with_header("content-type", "audio/mpeg")
                    .with_body(body)
                    .expect(1)
                    .create_async()
                    .await,
            );
        }

        let (_db, _dir, downloader) = downloader().await;
        let mut progress = Recorder(Vec::new());
        let outcome = downloader
            .fetch(&url, 13, 5, &CancellationToken::new(), &mut progress)
            .await
            .unwrap();

        for mock in &mocks {
            mock.assert_async().await;
        }
        assert_eq!(outcome.chunks_fetched, 3);
        assert_eq!(outcome.content_type.as_deref(), Some("audio/mpeg"));
        assert_eq!(progress.0, vec![(5, 13), (10, 13), (13, 13)]);

        let chunk = downloader.blobs.get(&chunk_key(&url, 1, 5)).await.unwrap().unwrap();
        assert_eq!(&chunk.data[..], b"fghij");
        assert_eq!(chunk.meta.chunk_index, Some(1));

        let metadata = downloader.repository.get_chunked_url(&url).await.unwrap().unwrap();
        assert_eq!(metadata.bytes_total, 13);
        assert_eq!(metadata.content_type.as_deref(), Some("audio/mpeg"));
    }

    #[tokio::test]
    async fn test_cached_chunks_are_not_refetched() {
        let mut server = mockito::Server::new_async().await;
        let url = format!("{}/stream/book.mp3", server.url());

        let (_db, _dir, downloader) = downloader().await;
        for index in 0..2u64 {
            let (start, end) = chunk_window(index, 5, 13);
            downloader
                .blobs
                .put(
                    &chunk_key(&url, index, 5),
                    &BODY[start as usize..=end as usize],
                    BlobMeta::new("").with_chunk(index, 5),
                )
                .await
                .unwrap();
        }

        let early = server
            .mock("GET", "/stream/book.mp3")
            .match_header("range", mockito::Matcher::Regex("bytes=(0-4|5-9)".into()))
            .expect(0)
            .create_async()
            .await;
        let last = server
            .mock("GET", "/stream/book.mp3")
            .match_header("range", "bytes=10-12")
            .with_status(206)
            .with_body(&BODY[10..13])
            .expect(1)
            .create_async()
            .await;

        let outcome = downloader
            .fetch(&url, 13, 5, &CancellationToken::new(), &mut NoProgress)
            .await
            .unwrap();

        early.assert_async().await;
        last.assert_async().await;
        assert_eq!(outcome.chunks_reused, 2);
        assert_eq!(outcome.chunks_fetched, 1);
    }

    #[tokio::test]
    async fn test_origin_ignoring_ranges_is_sliced() {
        let mut server = mockito::Server::new_async().await;
        let url = format!("{}/stream/book.mp3", server.url());
        server
            .mock("GET", "/stream/book.mp3")
            .with_status(200)
            .with_body(BODY)
            .create_async()
            .await;

        let (_db, _dir, downloader) = downloader().await;
        downloader
            .fetch(&url, 13, 5, &CancellationToken::new(), &mut NoProgress)
            .await
            .unwrap();

        let chunk = downloader.blobs.get(&chunk_key(&url, 2, 5)).await.unwrap().unwrap();
        assert_eq!(&chunk.data[..], b"klm");
    }

    #[tokio::test]
    async fn test_short_chunk_fails_the_file() {
        let mut server = mockito::Server::new_async().await;
        let url = format!("{}/stream/book.mp3", server.url());
        server
            .mock("GET", "/stream/book.mp3")
            .with_status(206)
            .with_body("ab")
            .create_async()
            .await;

        let (_db, _dir, downloader) = downloader().await;
        let err = downloader
            .fetch(&url, 13, 5, &CancellationToken::new(), &mut NoProgress)
            .await
            .unwrap_err();

        assert!(matches!(err, CacheError::ShortChunk { index: 0, actual: 2, .. }));
        assert!(!downloader.blobs.contains(&chunk_key(&url, 0, 5)).await);
    }

    #[tokio::test]
    async fn test_error_status_fails_the_file() {
        let mut server = mockito::Server::new_async().await;
        let url = format!("{}/stream/book.mp3", server.url());
        server
            .mock("GET", "/stream/book.mp3")
            .with_status(404)
            .create_async()
            .await;

        let (_db, _dir, downloader) = downloader().await;
        let err = downloader
            .fetch(&url, 13, 5, &CancellationToken::new(), &mut NoProgress)
            .await
            .unwrap_err();

        assert!(matches!(err, CacheError::HttpStatus { status, .. } if status == StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let mut server = mockito::Server::new_async().await;
        let url = format!("{}/stream/book.mp3", server.url());
        // Mocks are served in creation order until their expected hits are used up
        let flaky = server
            .mock("GET", "/stream/book.mp3")
            .with_status(503)
            .expect(1)
            .create_async()
            .await;
        let healthy = server
            .mock("GET", "/stream/book.mp3")
            .with_status(206)
            .with_body("abcde")
            .expect(1)
            .create_async()
            .await;

        let (_db, _dir, downloader) = downloader().await;
        let downloader = downloader.with_retry_config(RetryConfig {
            max_retries: 2,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            backoff_multiplier: 2.0,
        });

        let outcome = downloader
            .fetch(&url, 5, 5, &CancellationToken::new(), &mut NoProgress)
            .await
            .unwrap();

        flaky.assert_async().await;
        healthy.assert_async().await;
        assert_eq!(outcome.chunks_fetched, 1);
    }

    #[tokio::test]
    async fn test_size_probe_falls_back_to_range_request() {
        let mut server = mockito::Server::new_async().await;
        let url = format!("{}/stream/book.mp3", server.url());
        server
            .mock("HEAD", "/stream/book.mp3")
            .with_status(405)
            .create_async()
            .await;
        server
            .mock("GET", "/stream/book.mp3")
            .match_header("range", "bytes=0-0")
            .with_status(206)
            .with_header("content-range", "bytes 0-0/13")
            .with_body("a")
            .create_async()
            .await;

        let (_db, _dir, downloader) = downloader().await;
        let total = downloader
            .probe_total(&url, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(total, 13);
    }

    #[tokio::test]
    async fn test_unresolvable_size() {
        let mut server = mockito::Server::new_async().await;
        let url = format!("{}/stream/book.mp3", server.url());
        server
            .mock("HEAD", "/stream/book.mp3")
            .with_status(404)
            .create_async()
            .await;
        server
            .mock("GET", "/stream/book.mp3")
            .with_status(206)
            .with_header("content-range", "bytes 0-0/*")
            .with_body("a")
            .create_async()
            .await;

        let (_db, _dir, downloader) = downloader().await;
        let err = downloader
            .fetch(&url, 0, 5, &CancellationToken::new(), &mut NoProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::UnresolvableSize { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let (_db, _dir, downloader) = downloader().await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = downloader
            .fetch("http://127.0.0.1:9/stream/x", 13, 5, &cancel, &mut NoProgress)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_origin_total_disagreeing_with_manifest_fails_the_file() {
        let mut server = mockito::Server::new_async().await;
        let url = format!("{}/stream/book.mp3", server.url());
        // The file is 13 bytes but the manifest claims 10
        server
            .mock("GET", "/stream/book.mp3")
            .match_header("range", "bytes=0-4")
            .with_status(206)
            .with_header("content-range", "bytes 0-4/13")
            .with_body(&BODY[0..5])
            .create_async()
            .await;

        let (_db, _dir, downloader) = downloader().await;
        let err = downloader
            .fetch(&url, 10, 5, &CancellationToken::new(), &mut NoProgress)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CacheError::SizeMismatch { expected: 10, actual: 13, .. }
        ));
        assert!(!downloader.blobs.contains(&chunk_key(&url, 0, 5)).await);
    }

    #[tokio::test]
    async fn test_full_body_longer_than_manifest_fails_the_file() {
        let mut server = mockito::Server::new_async().await;
        let url = format!("{}/stream/book.mp3", server.url());
        server
            .mock("GET", "/stream/book.mp3")
            .with_status(200)
            .with_body(BODY)
            .create_async()
            .await;

        let (_db, _dir, downloader) = downloader().await;
        let err = downloader
            .fetch(&url, 10, 5, &CancellationToken::new(), &mut NoProgress)
            .await
            .unwrap_err();

        assert!(matches!(err, CacheError::SizeMismatch { actual: 13, .. }));
    }
}
