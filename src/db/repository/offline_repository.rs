use super::BaseRepository;
use crate::db::entities::{
    BookDownload, BookDownloadActiveModel, BookDownloadModel, ChunkedUrl, ChunkedUrlActiveModel,
    ChunkedUrlModel, book_downloads, chunked_urls,
};
use crate::models::{BookDownloadRecord, BookId, BookStatus, ChunkedUrlMetadata, FileDownloadState};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use std::sync::Arc;

/// Durable metadata for book manifests and chunked URLs.
#[async_trait]
pub trait OfflineRepository: Send + Sync {
    // Book records
    async fn get_book(&self, book_id: &BookId) -> Result<Option<BookDownloadRecord>>;
    /// Insert or replace the whole record.
    async fn put_book(&self, record: &BookDownloadRecord) -> Result<()>;
    async fn delete_book(&self, book_id: &BookId) -> Result<()>;
    async fn list_books(&self) -> Result<Vec<BookDownloadRecord>>;
    /// Records a previous process left `queued` or `downloading`, oldest first.
    async fn list_unfinished_books(&self) -> Result<Vec<BookDownloadRecord>>;

    // Chunked URL metadata
    async fn get_chunked_url(&self, url: &str) -> Result<Option<ChunkedUrlMetadata>>;
    async fn put_chunked_url(&self, metadata: &ChunkedUrlMetadata) -> Result<()>;
    async fn delete_chunked_url(&self, url: &str) -> Result<()>;

    /// Wipe both tables.
    async fn clear_all(&self) -> Result<()>;
}

#[derive(Debug)]
pub struct OfflineRepositoryImpl {
    base: BaseRepository,
}

impl OfflineRepositoryImpl {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            base: BaseRepository::new(db),
        }
    }
}

fn book_from_model(model: BookDownloadModel) -> Result<BookDownloadRecord> {
    let files: Vec<FileDownloadState> = serde_json::from_value(model.files)
        .with_context(|| format!("Corrupt file list for book {}", model.book_id))?;
    // Unknown strings come from a newer or damaged store; treat as needing work
    let status = BookStatus::parse(&model.status).unwrap_or(BookStatus::Queued);

    Ok(BookDownloadRecord {
        book_id: BookId::new(model.book_id),
        updated_at: model.updated_at,
        status,
        files,
        error: model.error,
    })
}

fn book_to_active_model(record: &BookDownloadRecord) -> Result<BookDownloadActiveModel> {
    let files = serde_json::to_value(&record.files).context("Failed to serialize file list")?;
    Ok(BookDownloadActiveModel {
        book_id: Set(record.book_id.as_str().to_string()),
        status: Set(record.status.as_str().to_string()),
        files: Set(files),
        error: Set(record.error.clone()),
        updated_at: Set(record.updated_at),
    })
}

fn chunked_from_model(model: ChunkedUrlModel) -> ChunkedUrlMetadata {
    ChunkedUrlMetadata {
        url: model.url,
        chunked: model.chunked,
        chunk_size: model.chunk_size.max(0) as u64,
        bytes_total: model.bytes_total.max(0) as u64,
        content_type: model.content_type,
        updated_at: model.updated_at,
    }
}

#[async_trait]
impl OfflineRepository for OfflineRepositoryImpl {
    async fn get_book(&self, book_id: &BookId) -> Result<Option<BookDownloadRecord>> {
        let model = BookDownload::find_by_id(book_id.as_str())
            .one(self.base.db.as_ref())
            .await
            .context("Failed to load book record")?;

        model.map(book_from_model).transpose()
    }

    async fn put_book(&self, record: &BookDownloadRecord) -> Result<()> {
        let active_model = book_to_active_model(record)?;

        BookDownload::insert(active_model)
            .on_conflict(
                OnConflict::column(book_downloads::Column::BookId)
                    .update_columns([
                        book_downloads::Column::Status,
                        book_downloads::Column::Files,
                        book_downloads::Column::Error,
                        book_downloads::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(self.base.db.as_ref())
            .await
            .with_context(|| format!("Failed to persist book record {}", record.book_id))?;

        Ok(())
    }

    async fn delete_book(&self, book_id: &BookId) -> Result<()> {
        BookDownload::delete_by_id(book_id.as_str())
            .exec(self.base.db.as_ref())
            .await
            .with_context(|| format!("Failed to delete book record {book_id}"))?;
        Ok(())
    }

    async fn list_books(&self) -> Result<Vec<BookDownloadRecord>> {
        let models = BookDownload::find()
            .order_by_asc(book_downloads::Column::UpdatedAt)
            .all(self.base.db.as_ref())
            .await
            .context("Failed to list book records")?;

        models.into_iter().map(book_from_model).collect()
    }

    async fn list_unfinished_books(&self) -> Result<Vec<BookDownloadRecord>> {
        let models = BookDownload::find()
            .filter(book_downloads::Column::Status.is_in([
                BookStatus::Queued.as_str(),
                BookStatus::Downloading.as_str(),
            ]))
            .order_by_asc(book_downloads::Column::UpdatedAt)
            .all(self.base.db.as_ref())
            .await
            .context("Failed to list unfinished book records")?;

        models.into_iter().map(book_from_model).collect()
    }

    async fn get_chunked_url(&self, url: &str) -> Result<Option<ChunkedUrlMetadata>> {
        let model = ChunkedUrl::find_by_id(url)
            .one(self.base.db.as_ref())
            .await
            .context("Failed to load chunked url metadata")?;

        Ok(model.map(chunked_from_model))
    }

    async fn put_chunked_url(&self, metadata: &ChunkedUrlMetadata) -> Result<()> {
        let active_model = ChunkedUrlActiveModel {
            url: Set(metadata.url.clone()),
            chunked: Set(metadata.chunked),
            chunk_size: Set(metadata.chunk_size as i64),
            bytes_total: Set(metadata.bytes_total as i64),
            content_type: Set(metadata.content_type.clone()),
            updated_at: Set(metadata.updated_at),
        };

        ChunkedUrl::insert(active_model)
            .on_conflict(
                OnConflict::column(chunked_urls::Column::Url)
                    .update_columns([
                        chunked_urls::Column::Chunked,
                        chunked_urls::Column::ChunkSize,
                        chunked_urls::Column::BytesTotal,
                        chunked_urls::Column::ContentType,
                        chunked_urls::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(self.base.db.as_ref())
            .await
            .with_context(|| format!("Failed to persist chunked metadata for {}", metadata.url))?;

        Ok(())
    }

    async fn delete_chunked_url(&self, url: &str) -> Result<()> {
        ChunkedUrl::delete_by_id(url)
            .exec(self.base.db.as_ref())
            .await
            .with_context(|| format!("Failed to delete chunked metadata for {url}"))?;
        Ok(())
    }

    async fn clear_all(&self) -> Result<()> {
        let txn = self
            .base
            .db
            .begin()
            .await
            .context("Failed to begin transaction")?;

        BookDownload::delete_many()
            .exec(&txn)
            .await
            .context("Failed to clear book records")?;
        ChunkedUrl::delete_many()
            .exec(&txn)
            .await
            .context("Failed to clear chunked metadata")?;

        txn.commit().await.context("Failed to commit clear")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FileId, FileStatus, MediaType};
    use crate::test_utils::TestDatabase;

    fn sample_book(id: &str) -> BookDownloadRecord {
        BookDownloadRecord::new(
            BookId::new(id),
            vec![FileDownloadState {
                url: "https://media.example/stream/a.mp3".to_string(),
                bytes_total: 23,
                bytes_downloaded: 0,
                file_id: FileId::new("f1"),
                media_type: MediaType::Audiobook,
                status: FileStatus::Queued,
                chunked: true,
                chunk_size: 5,
            }],
        )
    }

    #[tokio::test]
    async fn test_book_round_trip_and_overwrite() {
        let db = TestDatabase::new().await.unwrap();
        let repo = OfflineRepositoryImpl::new(db.connection());

        assert!(repo.get_book(&BookId::new("b1")).await.unwrap().is_none());

        let mut record = sample_book("b1");
        repo.put_book(&record).await.unwrap();

        let loaded = repo.get_book(&BookId::new("b1")).await.unwrap().unwrap();
        assert_eq!(loaded.files, record.files);
        assert_eq!(loaded.status, BookStatus::Queued);

        record.files[0].mark_ready();
        record.status = BookStatus::Ready;
        repo.put_book(&record).await.unwrap();

        let loaded = repo.get_book(&BookId::new("b1")).await.unwrap().unwrap();
        assert_eq!(loaded.status, BookStatus::Ready);
        assert_eq!(loaded.files[0].bytes_downloaded, 23);
        assert_eq!(repo.list_books().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unfinished_books() {
        let db = TestDatabase::new().await.unwrap();
        let repo = OfflineRepositoryImpl::new(db.connection());

        let queued = sample_book("queued");
        let mut downloading = sample_book("downloading");
        downloading.status = BookStatus::Downloading;
        let mut ready = sample_book("ready");
        ready.status = BookStatus::Ready;

        for record in [&queued, &downloading, &ready] {
            repo.put_book(record).await.unwrap();
        }

        let mut ids: Vec<String> = repo
            .list_unfinished_books()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.book_id.to_string())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["downloading", "queued"]);
    }

    #[tokio::test]
    async fn test_chunked_url_metadata() {
        let db = TestDatabase::new().await.unwrap();
        let repo = OfflineRepositoryImpl::new(db.connection());
        let url = "https://media.example/stream/a.mp3";

        let mut metadata = ChunkedUrlMetadata::new(url, 5, 23, None);
        repo.put_chunked_url(&metadata).await.unwrap();

        metadata.content_type = Some("audio/mpeg".to_string());
        repo.put_chunked_url(&metadata).await.unwrap();

        let loaded = repo.get_chunked_url(url).await.unwrap().unwrap();
        assert!(loaded.chunked);
        assert_eq!(loaded.chunk_size, 5);
        assert_eq!(loaded.bytes_total, 23);
        assert_eq!(loaded.content_type.as_deref(), Some("audio/mpeg"));

        repo.delete_chunked_url(url).await.unwrap();
        assert!(repo.get_chunked_url(url).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_and_clear_all() {
        let db = TestDatabase::new().await.unwrap();
        let repo = OfflineRepositoryImpl::new(db.connection());

        repo.put_book(&sample_book("b1")).await.unwrap();
        repo.put_book(&sample_book("b2")).await.unwrap();
        repo.put_chunked_url(&ChunkedUrlMetadata::new("https://m/stream/x", 5, 10, None))
            .await
            .unwrap();

        repo.delete_book(&BookId::new("b1")).await.unwrap();
        assert!(repo.get_book(&BookId::new("b1")).await.unwrap().is_none());
        // Deleting a missing record is not an error
        repo.delete_book(&BookId::new("b1")).await.unwrap();

        repo.clear_all().await.unwrap();
        assert!(repo.list_books().await.unwrap().is_empty());
        assert!(repo.get_chunked_url("https://m/stream/x").await.unwrap().is_none());
    }
}
