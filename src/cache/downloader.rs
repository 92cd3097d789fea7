use futures::StreamExt;
use reqwest::Client;
use reqwest::header::{CONTENT_TYPE, HeaderMap};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::blob_store::{BlobMeta, BlobStore};
use super::progress::ProgressSink;
use crate::utils::CacheError;

/// Origin headers replayed when a whole-file blob is served.
const KEPT_HEADERS: &[&str] = &[
    "content-type",
    "content-disposition",
    "etag",
    "last-modified",
    "cache-control",
];

/// Result of a completed whole-file fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct WholeFileOutcome {
    pub bytes_total: u64,
    pub content_type: Option<String>,
}

/// Caches one file as a single blob, reporting bytes as the body drains.
pub struct WholeFileDownloader {
    client: Client,
    blobs: BlobStore,
}

impl WholeFileDownloader {
    pub fn new(client: Client, blobs: BlobStore) -> Self {
        Self { client, blobs }
    }

    /// Stream `url` into the blob stored under `url`.
    ///
    /// Total for progress: `Content-Length`, else `expected_total`, else 0.
    /// Nothing is published unless the whole body arrives.
    pub async fn fetch(
        &self,
        url: &str,
        expected_total: u64,
        cancel: &CancellationToken,
        progress: &mut dyn ProgressSink,
    ) -> Result<WholeFileOutcome, CacheError> {
        debug!("Whole-file fetch of {}", url);

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CacheError::Cancelled),
            response = self.client.get(url).send() => response?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(CacheError::HttpStatus {
                status,
                url: url.to_string(),
            });
        }

        let total = response
            .content_length()
            .filter(|len| *len > 0)
            .unwrap_or(expected_total);
        let headers = kept_headers(response.headers());
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut writer = self.blobs.begin(url).await?;
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CacheError::Cancelled),
                next = stream.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk?;

            writer.write(&chunk).await?;
            progress.report(writer.bytes_written(), total).await;
        }

        let written = writer.bytes_written();
        let meta = BlobMeta::new(url)
            .with_content_type(content_type.clone())
            .with_headers(headers);
        writer.commit(meta).await?;

        info!("Cached {} as a single blob ({} bytes)", url, written);

        Ok(WholeFileOutcome {
            bytes_total: written,
            content_type,
        })
    }
}

fn kept_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    KEPT_HEADERS
        .iter()
        .filter_map(|name| {
            let value = headers.get(*name)?.to_str().ok()?;
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::progress::NoProgress;
    use crate::test_utils::temp_blob_store;

    struct Recorder(Vec<(u64, u64)>);

    #[async_trait::async_trait]
    impl ProgressSink for Recorder {
        async fn report(&mut self, downloaded: u64, total: u64) {
            self.0.push((downloaded, total));
        }
    }

    #[tokio::test]
    async fn test_stores_body_and_headers() {
        let mut server = mockito::Server::new_async().await;
        let url = format!("{}/file/book.epub", server.url());
        let body = vec![7u8; 100];
        server
            .mock("GET", "/file/book.epub")
            .with_status(200)
            .with_header("content-type", "application/epub+zip")
            .with_header("etag", "\"v1\"")
            .with_header("x-internal", "drop-me")
            .with_body(&body)
            .create_async()
            .await;

        let (_dir, blobs) = temp_blob_store().await;
        let downloader = WholeFileDownloader::new(Client::new(), blobs.clone());
        let mut progress = Recorder(Vec::new());

        let outcome = downloader
            .fetch(&url, 0, &CancellationToken::new(), &mut progress)
            .await
            .unwrap();

        assert_eq!(outcome.bytes_total, 100);
        assert_eq!(progress.0.last(), Some(&(100, 100)));
        assert!(progress.0.windows(2).all(|w| w[0].0 <= w[1].0));

        let blob = blobs.get(&url).await.unwrap().unwrap();
        assert_eq!(blob.data.len(), 100);
        assert_eq!(blob.meta.content_type.as_deref(), Some("application/epub+zip"));
        assert!(blob.meta.headers.iter().any(|(k, v)| k == "etag" && v == "\"v1\""));
        assert!(!blob.meta.headers.iter().any(|(k, _)| k == "x-internal"));
    }

    #[tokio::test]
    async fn test_error_status_caches_nothing() {
        let mut server = mockito::Server::new_async().await;
        let url = format!("{}/file/missing.epub", server.url());
        server
            .mock("GET", "/file/missing.epub")
            .with_status(500)
            .with_body("oops")
            .create_async()
            .await;

        let (_dir, blobs) = temp_blob_store().await;
        let downloader = WholeFileDownloader::new(Client::new(), blobs.clone());

        let err = downloader
            .fetch(&url, 10, &CancellationToken::new(), &mut NoProgress)
            .await
            .unwrap_err();

        assert!(matches!(err, CacheError::HttpStatus { .. }));
        assert!(!blobs.contains(&url).await);
    }

    #[tokio::test]
    async fn test_cancelled_fetch_caches_nothing() {
        let (_dir, blobs) = temp_blob_store().await;
        let downloader = WholeFileDownloader::new(Client::new(), blobs.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let url = "http://127.0.0.1:9/file/x.epub";
        let err = downloader
            .fetch(url, 10, &cancel, &mut NoProgress)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(!blobs.contains(url).await);
    }

    /// Cancels the fetch as soon as the first bytes land.
    struct CancelOnFirstBytes(CancellationToken);

    #[async_trait::async_trait]
    impl ProgressSink for CancelOnFirstBytes {
        async fn report(&mut self, _downloaded: u64, _total: u64) {
            self.0.cancel();
        }
    }

    #[tokio::test]
    async fn test_cancelled_mid_stream_caches_nothing() {
        use axum::{Router, body::Body, routing::get};
        use futures::stream;

        // First bytes arrive, the rest never does
        let app = Router::new().route(
            "/file/slow.epub",
            get(|| async {
                let head = stream::iter([Ok::<_, std::io::Error>(bytes::Bytes::from_static(b"abcde"))]);
                Body::from_stream(head.chain(stream::pending()))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/file/slow.epub", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let (_dir, blobs) = temp_blob_store().await;
        let downloader = WholeFileDownloader::new(Client::new(), blobs.clone());
        let cancel = CancellationToken::new();
        let mut sink = CancelOnFirstBytes(cancel.clone());

        let err = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            downloader.fetch(&url, 10, &cancel, &mut sink),
        )
        .await
        .expect("fetch did not notice the cancellation")
        .unwrap_err();

        assert!(err.is_cancelled());
        assert!(!blobs.contains(&url).await);
        assert!(blobs.head(&url).await.unwrap().is_none());
    }
}
