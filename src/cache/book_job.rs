use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::blob_store::BlobStore;
use super::chunk_downloader::ChunkDownloader;
use super::config::OfflineCacheConfig;
use super::downloader::WholeFileDownloader;
use super::progress::{ProgressSink, ProgressThrottle};
use super::status::is_file_cached;
use crate::db::repository::OfflineRepository;
use crate::events::{EventBus, ProgressEvent, StatusEvent};
use crate::models::{BookDownloadRecord, BookId, BookStatus, FileStatus};
use crate::utils::CacheError;

/// Everything a book download needs, shared between the engine and its jobs.
pub(crate) struct JobContext {
    pub config: OfflineCacheConfig,
    pub repository: Arc<dyn OfflineRepository>,
    pub blobs: BlobStore,
    pub chunked: ChunkDownloader,
    pub whole: WholeFileDownloader,
    pub events: EventBus,
}

impl JobContext {
    /// Best-effort write; bookkeeping failures never stop a download.
    pub async fn persist(&self, record: &BookDownloadRecord) {
        if let Err(e) = self.repository.put_book(record).await {
            warn!("Failed to persist record for {}: {:#}", record.book_id, e);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobOutcome {
    Finished(BookStatus),
    Cancelled,
}

/// Download every file of one book, sequentially.
///
/// Per-file failures are recorded on the file and do not stop the book. A
/// cancelled job leaves the record as it was last persisted.
pub(crate) async fn run_book(
    ctx: &JobContext,
    book_id: &BookId,
    cancel: &CancellationToken,
) -> JobOutcome {
    let record = match ctx.repository.get_book(book_id).await {
        Ok(record) => record,
        Err(e) => {
            warn!("Failed to load record for {}: {:#}", book_id, e);
            None
        }
    };

    let Some(mut record) = record.filter(|r| !r.files.is_empty()) else {
        warn!("Book {} has nothing to download", book_id);
        if let Ok(Some(mut empty)) = ctx.repository.get_book(book_id).await {
            empty.status = BookStatus::Failed;
            empty.error = Some("No files to download".to_string());
            empty.touch();
            ctx.persist(&empty).await;
        }
        ctx.events.emit_status(
            StatusEvent::book(book_id.clone(), BookStatus::Failed).with_error("No files to download"),
        );
        return JobOutcome::Finished(BookStatus::Failed);
    };

    // Resume: the blob store decides what is cached, not the persisted status
    for file in record.files.iter_mut() {
        match is_file_cached(&ctx.blobs, file).await {
            Some(true) if file.status != FileStatus::Ready => {
                debug!("{} already cached, marking ready", file.url);
                file.mark_ready();
            }
            Some(false) if file.status == FileStatus::Ready => {
                info!("{} was ready but its blobs are gone, fetching again", file.url);
                file.status = FileStatus::Queued;
                file.bytes_downloaded = 0;
            }
            _ => {}
        }
    }

    record.status = BookStatus::Downloading;
    record.error = None;
    record.touch();
    ctx.persist(&record).await;
    ctx.events
        .emit_status(StatusEvent::book(book_id.clone(), BookStatus::Downloading));
    info!("Downloading book {} ({} files)", book_id, record.files.len());

    let mut ready_bytes = record.ready_bytes();
    let mut emit_throttle = ProgressThrottle::new(ctx.config.progress_emit_interval());
    let mut persist_throttle = ProgressThrottle::new(ctx.config.persist_interval());

    for index in 0..record.files.len() {
        if record.files[index].status == FileStatus::Ready {
            continue;
        }
        if cancel.is_cancelled() {
            return JobOutcome::Cancelled;
        }

        let file = {
            let file = &mut record.files[index];
            file.status = FileStatus::Downloading;
            file.bytes_downloaded = 0;
            file.clone()
        };
        ctx.persist(&record).await;
        ctx.events.emit_status(StatusEvent::file(
            book_id.clone(),
            file.file_id.clone(),
            &file.url,
            BookStatus::Downloading,
        ));

        emit_throttle.reset();
        persist_throttle.reset();
        let result = {
            let mut sink = BookProgress {
                ctx,
                record: &mut record,
                index,
                ready_bytes,
                emit_throttle: &mut emit_throttle,
                persist_throttle: &mut persist_throttle,
            };

            if file.chunked {
                ctx.chunked
                    .fetch(&file.url, file.bytes_total, file.chunk_size, cancel, &mut sink)
                    .await
                    .map(|outcome| outcome.bytes_total)
            } else {
                ctx.whole
                    .fetch(&file.url, file.bytes_total, cancel, &mut sink)
                    .await
                    .map(|outcome| outcome.bytes_total)
            }
        };

        match result {
            Ok(bytes_total) => {
                let state = &mut record.files[index];
                state.bytes_total = bytes_total;
                state.mark_ready();
                ready_bytes += bytes_total;
                info!("File {} of book {} is ready", file.file_id, book_id);

                ctx.events.emit_progress(ProgressEvent {
                    book_id: book_id.clone(),
                    file_id: Some(file.file_id.clone()),
                    media_type: Some(file.media_type),
                    url: Some(file.url.clone()),
                    bytes_downloaded: bytes_total,
                    bytes_total,
                    progress_overall: Some(overall(ready_bytes, 0, record.bytes_total())),
                });
                ctx.events.emit_status(StatusEvent::file(
                    book_id.clone(),
                    file.file_id.clone(),
                    &file.url,
                    BookStatus::Ready,
                ));
            }
            Err(CacheError::Cancelled) => {
                debug!("Download of book {} cancelled", book_id);
                return JobOutcome::Cancelled;
            }
            Err(e) => {
                warn!("File {} of book {} failed: {}", file.file_id, book_id, e);
                record.files[index].status = FileStatus::Failed;
                record.error = Some(format!("{}: {}", file.file_id, e));
                ctx.events.emit_status(
                    StatusEvent::file(
                        book_id.clone(),
                        file.file_id.clone(),
                        &file.url,
                        BookStatus::Failed,
                    )
                    .with_error(e.to_string()),
                );
            }
        }

        record.touch();
        ctx.persist(&record).await;
    }

    let terminal = record.terminal_status();
    record.status = terminal;
    record.touch();
    ctx.persist(&record).await;

    let mut event = StatusEvent::book(book_id.clone(), terminal);
    if let Some(ref error) = record.error {
        event = event.with_error(error.clone());
    }
    ctx.events.emit_status(event);
    info!("Book {} finished: {}", book_id, terminal);

    JobOutcome::Finished(terminal)
}

fn overall(ready_bytes: u64, in_flight: u64, book_total: u64) -> f64 {
    if book_total == 0 {
        return 0.0;
    }
    ((ready_bytes + in_flight) as f64 / book_total as f64).min(1.0)
}

/// Turns raw fetcher callbacks into throttled events and persists.
struct BookProgress<'a> {
    ctx: &'a JobContext,
    record: &'a mut BookDownloadRecord,
    index: usize,
    ready_bytes: u64,
    emit_throttle: &'a mut ProgressThrottle,
    persist_throttle: &'a mut ProgressThrottle,
}

#[async_trait]
impl<'a> ProgressSink for BookProgress<'a> {
    async fn report(&mut self, bytes_downloaded: u64, bytes_total: u64) {
        let file = &mut self.record.files[self.index];
        file.bytes_downloaded = file.bytes_downloaded.max(bytes_downloaded);
        if file.bytes_total == 0 && bytes_total > 0 {
            file.bytes_total = bytes_total;
        }

        if self.emit_throttle.ready() {
            let file = &self.record.files[self.index];
            let event = ProgressEvent {
                book_id: self.record.book_id.clone(),
                file_id: Some(file.file_id.clone()),
                media_type: Some(file.media_type),
                url: Some(file.url.clone()),
                bytes_downloaded: file.bytes_downloaded,
                bytes_total,
                progress_overall: Some(overall(
                    self.ready_bytes,
                    file.bytes_downloaded,
                    self.record.bytes_total(),
                )),
            };
            self.ctx.events.emit_progress(event);
        }

        if self.persist_throttle.ready() {
            self.record.touch();
            self.ctx.persist(self.record).await;
        }
    }
}
