use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

use super::blob_store::BlobStore;
use super::keys::chunk_key;
use crate::db::repository::OfflineRepository;
use crate::models::{
    BookDownloadRecord, BookId, BookStatus, BookStatusSummary, FileDownloadState, FileStatus,
    FileStatusSummary,
};

/// Whether every byte of `file` is present in the blob store.
///
/// Chunked files need all of their chunks; a file whose total is still
/// unknown can't be proven complete.
pub(crate) async fn is_file_cached(blobs: &BlobStore, file: &FileDownloadState) -> Option<bool> {
    if !file.chunked {
        return Some(blobs.contains(&file.url).await);
    }

    let chunk_count = file.chunk_count();
    if chunk_count == 0 {
        return None;
    }
    for index in 0..chunk_count {
        if !blobs.contains(&chunk_key(&file.url, index, file.chunk_size)).await {
            return Some(false);
        }
    }
    Some(true)
}

/// Answers "how far along is book X" from the metadata store, corrected by
/// what the blob store actually holds.
#[derive(Clone)]
pub struct StatusReporter {
    repository: Arc<dyn OfflineRepository>,
    blobs: BlobStore,
}

impl StatusReporter {
    pub fn new(repository: Arc<dyn OfflineRepository>, blobs: BlobStore) -> Self {
        Self { repository, blobs }
    }

    pub async fn query(&self, book_ids: &[BookId]) -> BTreeMap<String, BookStatusSummary> {
        let mut books = BTreeMap::new();
        for book_id in book_ids {
            let summary = self.book_status(book_id).await;
            books.insert(book_id.to_string(), summary);
        }
        books
    }

    pub async fn book_status(&self, book_id: &BookId) -> BookStatusSummary {
        match self.repository.get_book(book_id).await {
            Ok(Some(record)) => self.summarize(&record).await,
            Ok(None) => BookStatusSummary::not_started(),
            Err(e) => {
                warn!("Failed to load record for {}: {:#}", book_id, e);
                BookStatusSummary {
                    error: Some(format!("{e:#}")),
                    ..BookStatusSummary::not_started()
                }
            }
        }
    }

    async fn summarize(&self, record: &BookDownloadRecord) -> BookStatusSummary {
        let mut files = Vec::with_capacity(record.files.len());
        for file in &record.files {
            // The blob store wins over the persisted status when they disagree
            let ready = match is_file_cached(&self.blobs, file).await {
                Some(cached) => cached,
                None => file.status == FileStatus::Ready,
            };

            let (status, bytes_downloaded) = if ready {
                (FileStatus::Ready, file.bytes_total)
            } else if file.status == FileStatus::Ready {
                // Persisted as ready but evicted since
                (FileStatus::Queued, 0)
            } else {
                (file.status, file.bytes_downloaded.min(file.bytes_total))
            };

            files.push(FileStatusSummary {
                file_id: file.file_id.clone(),
                url: file.url.clone(),
                status,
                bytes_total: file.bytes_total,
                bytes_downloaded,
            });
        }

        let bytes_total: u64 = files.iter().map(|f| f.bytes_total).sum();
        let bytes_downloaded: u64 = files.iter().map(|f| f.bytes_downloaded).sum();
        let all_ready = !files.is_empty() && files.iter().all(|f| f.status == FileStatus::Ready);

        let status = if files.is_empty() {
            BookStatus::Failed
        } else if all_ready {
            BookStatus::Ready
        } else {
            aggregate_status(record.status, &files)
        };

        let progress = if all_ready {
            1.0
        } else if bytes_total > 0 {
            (bytes_downloaded as f64 / bytes_total as f64).min(1.0)
        } else {
            0.0
        };

        BookStatusSummary {
            status,
            progress,
            bytes_total,
            bytes_downloaded,
            error: record.error.clone(),
            files,
        }
    }
}

/// `failed` > `downloading` > `queued` > `partial`.
///
/// Only a record that is still in flight can be queued or downloading; a
/// finished record with missing bytes (evicted since) is partial.
fn aggregate_status(record_status: BookStatus, files: &[FileStatusSummary]) -> BookStatus {
    let any = |status: FileStatus| files.iter().any(|f| f.status == status);

    if any(FileStatus::Failed) {
        BookStatus::Failed
    } else if !record_status.is_unfinished() {
        BookStatus::Partial
    } else if record_status == BookStatus::Downloading || any(FileStatus::Downloading) {
        BookStatus::Downloading
    } else {
        BookStatus::Queued
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::blob_store::BlobMeta;
    use crate::db::repository::OfflineRepositoryImpl;
    use crate::models::{FileId, MediaType};
    use crate::test_utils::{TestDatabase, temp_blob_store};

    fn file(url: &str, status: FileStatus, total: u64, chunked: bool) -> FileDownloadState {
        FileDownloadState {
            url: url.to_string(),
            bytes_total: total,
            bytes_downloaded: 0,
            file_id: FileId::new(url.rsplit('/').next().unwrap_or(url)),
            media_type: if chunked { MediaType::Audiobook } else { MediaType::Ebook },
            status,
            chunked,
            chunk_size: if chunked { 5 } else { 0 },
        }
    }

    async fn setup() -> (TestDatabase, tempfile::TempDir, Arc<OfflineRepositoryImpl>, BlobStore) {
        let db = TestDatabase::new().await.unwrap();
        let (dir, blobs) = temp_blob_store().await;
        let repo = Arc::new(OfflineRepositoryImpl::new(db.connection()));
        (db, dir, repo, blobs)
    }

    #[tokio::test]
    async fn test_unknown_book_is_not_started() {
        let (_db, _dir, repo, blobs) = setup().await;
        let reporter = StatusReporter::new(repo, blobs);

        let books = reporter.query(&[BookId::new("nope")]).await;
        let summary = &books["nope"];
        assert_eq!(summary.status, BookStatus::NotStarted);
        assert_eq!(summary.progress, 0.0);
        assert_eq!(summary.bytes_total, 0);
    }

    #[tokio::test]
    async fn test_cache_overrides_lagging_status() {
        let (_db, _dir, repo, blobs) = setup().await;
        let url = "https://m.example/file/a.epub";

        let mut record = BookDownloadRecord::new(
            BookId::new("b"),
            vec![file(url, FileStatus::Downloading, 4, false)],
        );
        record.status = BookStatus::Downloading;
        repo.put_book(&record).await.unwrap();
        blobs.put(url, b"abcd", BlobMeta::new(url)).await.unwrap();

        let reporter = StatusReporter::new(repo, blobs);
        let summary = reporter.book_status(&BookId::new("b")).await;
        assert_eq!(summary.status, BookStatus::Ready);
        assert_eq!(summary.bytes_downloaded, 4);
        assert_eq!(summary.progress, 1.0);
    }

    #[tokio::test]
    async fn test_chunked_file_needs_every_chunk() {
        let (_db, _dir, repo, blobs) = setup().await;
        let url = "https://m.example/stream/a.mp3";

        let record = BookDownloadRecord::new(
            BookId::new("b"),
            vec![file(url, FileStatus::Queued, 13, true)],
        );
        repo.put_book(&record).await.unwrap();
        blobs
            .put(&chunk_key(url, 0, 5), b"abcde", BlobMeta::new(""))
            .await
            .unwrap();

        let reporter = StatusReporter::new(repo, blobs.clone());
        assert_eq!(
            reporter.book_status(&BookId::new("b")).await.status,
            BookStatus::Queued
        );

        for index in 1..3 {
            blobs
                .put(&chunk_key(url, index, 5), b"x", BlobMeta::new(""))
                .await
                .unwrap();
        }
        assert_eq!(
            reporter.book_status(&BookId::new("b")).await.status,
            BookStatus::Ready
        );
    }

    #[tokio::test]
    async fn test_status_precedence() {
        let (_db, _dir, repo, blobs) = setup().await;

        let mut failed = BookDownloadRecord::new(
            BookId::new("failed"),
            vec![
                file("https://m/file/1", FileStatus::Failed, 10, false),
                file("https://m/file/2", FileStatus::Downloading, 10, false),
            ],
        );
        failed.status = BookStatus::Downloading;
        repo.put_book(&failed).await.unwrap();

        let mut downloading = BookDownloadRecord::new(
            BookId::new("downloading"),
            vec![
                file("https://m/file/3", FileStatus::Queued, 10, false),
                file("https://m/file/4", FileStatus::Downloading, 10, false),
            ],
        );
        downloading.status = BookStatus::Downloading;
        repo.put_book(&downloading).await.unwrap();

        let queued = BookDownloadRecord::new(
            BookId::new("queued"),
            vec![file("https://m/file/5", FileStatus::Queued, 10, false)],
        );
        repo.put_book(&queued).await.unwrap();

        let mut evicted = BookDownloadRecord::new(
            BookId::new("evicted"),
            vec![file("https://m/file/6", FileStatus::Ready, 10, false)],
        );
        evicted.status = BookStatus::Ready;
        repo.put_book(&evicted).await.unwrap();

        let reporter = StatusReporter::new(repo, blobs);
        let books = reporter
            .query(&[
                BookId::new("failed"),
                BookId::new("downloading"),
                BookId::new("queued"),
                BookId::new("evicted"),
            ])
            .await;

        assert_eq!(books["failed"].status, BookStatus::Failed);
        assert_eq!(books["downloading"].status, BookStatus::Downloading);
        assert_eq!(books["queued"].status, BookStatus::Queued);
        assert_eq!(books["evicted"].status, BookStatus::Partial);
        assert_eq!(books["evicted"].bytes_downloaded, 0);
    }
}
