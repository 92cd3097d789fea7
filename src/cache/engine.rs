use anyhow::{Context, Result};
use reqwest::Client;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::blob_store::BlobStore;
use super::book_job::{JobContext, JobOutcome, run_book};
use super::chunk_downloader::{ChunkDownloader, RetryConfig};
use super::config::OfflineCacheConfig;
use super::downloader::WholeFileDownloader;
use super::keys::{canonicalize_url, chunk_key};
use super::status::StatusReporter;
use crate::db::repository::OfflineRepository;
use crate::events::{EventBus, EventFilter, EventSubscriber, StatusEvent};
use crate::models::{
    BookDownloadRecord, BookId, BookStatus, CacheFileRequest, FileDownloadState, FileStatus,
    OfflineCommand, QueryReply, RequestId,
};
use crate::utils::CacheError;

/// Commands for the engine actor
#[derive(Debug)]
enum EngineCommand {
    /// Persist a fresh manifest for a book and queue it
    CacheBook {
        book_id: BookId,
        files: Vec<CacheFileRequest>,
        respond_to: oneshot::Sender<Result<(), CacheError>>,
    },
    /// Queue an already persisted book
    Enqueue {
        book_id: BookId,
        respond_to: oneshot::Sender<()>,
    },
    ClearBook {
        book_id: BookId,
        respond_to: oneshot::Sender<()>,
    },
    ClearAll {
        respond_to: oneshot::Sender<()>,
    },
    /// Sent by a download task when it returns, however it returns
    JobFinished { job_id: u64 },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

struct ActiveDownload {
    job_id: u64,
    book_id: BookId,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Reports a download task's end to the actor, even if the task panicked.
struct FinishGuard {
    job_id: u64,
    sender: mpsc::UnboundedSender<EngineCommand>,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        let _ = self.sender.send(EngineCommand::JobFinished {
            job_id: self.job_id,
        });
    }
}

/// Owns the download queue. At most one book downloads at a time.
///
/// All queue state lives here and is only touched from [`OfflineEngine::run`].
pub struct OfflineEngine {
    ctx: Arc<JobContext>,
    command_receiver: mpsc::UnboundedReceiver<EngineCommand>,
    // Weak so that dropping every handle still stops the loop
    command_sender: mpsc::WeakUnboundedSender<EngineCommand>,
    pending: VecDeque<BookId>,
    active: Option<ActiveDownload>,
    next_job_id: u64,
}

impl OfflineEngine {
    /// Create the engine and its handle. The caller spawns [`OfflineEngine::run`].
    pub fn new(
        config: OfflineCacheConfig,
        repository: Arc<dyn OfflineRepository>,
        blobs: BlobStore,
        client: Client,
        retry_config: RetryConfig,
    ) -> Result<(OfflineEngineHandle, Self)> {
        config.validate().context("Invalid offline cache configuration")?;

        let events = EventBus::new(config.event_capacity);
        let status = StatusReporter::new(repository.clone(), blobs.clone());
        let ctx = Arc::new(JobContext {
            chunked: ChunkDownloader::new(client.clone(), blobs.clone(), repository.clone())
                .with_retry_config(retry_config),
            whole: WholeFileDownloader::new(client, blobs.clone()),
            config,
            repository,
            blobs,
            events: events.clone(),
        });

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let handle = OfflineEngineHandle {
            command_sender: cmd_tx.clone(),
            events,
            status,
        };
        let engine = Self {
            ctx,
            command_receiver: cmd_rx,
            command_sender: cmd_tx.downgrade(),
            pending: VecDeque::new(),
            active: None,
            next_job_id: 0,
        };

        Ok((handle, engine))
    }

    /// Run the command loop until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        info!("Offline engine starting");

        if self.ctx.config.resume_on_startup {
            self.resume_unfinished().await;
        }

        while let Some(command) = self.command_receiver.recv().await {
            match command {
                EngineCommand::CacheBook {
                    book_id,
                    files,
                    respond_to,
                } => {
                    let result = self.cache_book(book_id, files).await;
                    let _ = respond_to.send(result);
                }
                EngineCommand::Enqueue {
                    book_id,
                    respond_to,
                } => {
                    self.enqueue(book_id);
                    let _ = respond_to.send(());
                }
                EngineCommand::ClearBook {
                    book_id,
                    respond_to,
                } => {
                    self.clear_book(&book_id).await;
                    let _ = respond_to.send(());
                }
                EngineCommand::ClearAll { respond_to } => {
                    self.clear_all().await;
                    let _ = respond_to.send(());
                }
                EngineCommand::JobFinished { job_id } => {
                    self.job_finished(job_id);
                }
                EngineCommand::Shutdown { respond_to } => {
                    info!("Offline engine shutting down");
                    self.cancel_active().await;
                    let _ = respond_to.send(());
                    return;
                }
            }
        }

        self.cancel_active().await;
        info!("Offline engine stopped");
    }

    async fn resume_unfinished(&mut self) {
        match self.ctx.repository.list_unfinished_books().await {
            Ok(records) => {
                if !records.is_empty() {
                    info!("Resuming {} unfinished book downloads", records.len());
                }
                for record in records {
                    self.enqueue(record.book_id);
                }
            }
            Err(e) => warn!("Failed to list unfinished downloads: {:#}", e),
        }
    }

    async fn cache_book(
        &mut self,
        book_id: BookId,
        files: Vec<CacheFileRequest>,
    ) -> Result<(), CacheError> {
        let files: Vec<FileDownloadState> =
            files.into_iter().map(|f| self.file_state(f)).collect();

        // A new manifest for the book in flight replaces it and goes first
        let superseded = self.is_active(&book_id);
        if superseded {
            info!("Superseding in-flight download of book {}", book_id);
            self.cancel_active().await;
        }

        let record = BookDownloadRecord::new(book_id.clone(), files);
        if let Err(e) = self.ctx.repository.put_book(&record).await {
            error!("Failed to persist manifest for book {}: {:#}", book_id, e);
            self.ctx.events.emit_status(
                StatusEvent::book(book_id, BookStatus::Failed).with_error(format!("{e:#}")),
            );
            self.start_next();
            return Err(CacheError::Storage(e));
        }

        self.ctx
            .events
            .emit_status(StatusEvent::book(book_id.clone(), BookStatus::Queued));

        if superseded {
            self.pending.retain(|id| id != &book_id);
            self.pending.push_front(book_id);
            self.start_next();
        } else {
            self.enqueue(book_id);
        }
        Ok(())
    }

    fn file_state(&self, request: CacheFileRequest) -> FileDownloadState {
        let config = &self.ctx.config;
        let chunked = config.should_chunk(request.media_type, request.bytes_total);
        FileDownloadState {
            url: canonicalize_url(&request.url),
            bytes_total: request.bytes_total,
            bytes_downloaded: 0,
            file_id: request.file_id,
            media_type: request.media_type,
            status: FileStatus::Queued,
            chunked,
            chunk_size: if chunked { config.chunk_size_bytes } else { 0 },
        }
    }

    /// No-op when the book is already queued or downloading.
    fn enqueue(&mut self, book_id: BookId) {
        if self.is_active(&book_id) || self.pending.contains(&book_id) {
            debug!("Book {} already queued", book_id);
            return;
        }
        self.pending.push_back(book_id);
        self.start_next();
    }

    fn is_active(&self, book_id: &BookId) -> bool {
        self.active.as_ref().is_some_and(|a| &a.book_id == book_id)
    }

    fn start_next(&mut self) {
        if self.active.is_some() {
            return;
        }
        let Some(sender) = self.command_sender.upgrade() else {
            return;
        };
        let Some(book_id) = self.pending.pop_front() else {
            return;
        };

        let job_id = self.next_job_id;
        self.next_job_id += 1;

        let cancel = CancellationToken::new();
        let ctx = self.ctx.clone();
        let token = cancel.clone();
        let id = book_id.clone();

        debug!("Starting job {} for book {}", job_id, book_id);
        let handle = tokio::spawn(async move {
            let _guard = FinishGuard { job_id, sender };
            match run_book(&ctx, &id, &token).await {
                JobOutcome::Finished(status) => debug!("Job {} finished: {}", job_id, status),
                JobOutcome::Cancelled => debug!("Job {} cancelled", job_id),
            }
        });

        self.active = Some(ActiveDownload {
            job_id,
            book_id,
            cancel,
            handle,
        });
    }

    fn job_finished(&mut self, job_id: u64) {
        // Jobs that were cancelled and awaited already cleared `active`
        if self.active.as_ref().is_some_and(|a| a.job_id == job_id) {
            self.active = None;
        }
        self.start_next();
    }

    /// Cancel the running download and wait for it to unwind.
    async fn cancel_active(&mut self) -> Option<BookId> {
        let active = self.active.take()?;
        active.cancel.cancel();
        if let Err(e) = active.handle.await {
            if e.is_panic() {
                error!("Download of book {} panicked", active.book_id);
            }
        }
        Some(active.book_id)
    }

    async fn clear_book(&mut self, book_id: &BookId) {
        if self.is_active(book_id) {
            self.cancel_active().await;
        }
        self.pending.retain(|id| id != book_id);

        match self.ctx.repository.get_book(book_id).await {
            Ok(Some(record)) => {
                for file in &record.files {
                    self.remove_file_blobs(file).await;
                }
            }
            Ok(None) => debug!("Book {} has no record to clear", book_id),
            Err(e) => warn!("Failed to load record for {}: {:#}", book_id, e),
        }

        if let Err(e) = self.ctx.repository.delete_book(book_id).await {
            warn!("Failed to delete record for {}: {:#}", book_id, e);
        }

        info!("Cleared book {}", book_id);
        self.ctx
            .events
            .emit_status(StatusEvent::book(book_id.clone(), BookStatus::Cleared));
        self.start_next();
    }

    async fn remove_file_blobs(&self, file: &FileDownloadState) {
        let blobs = &self.ctx.blobs;
        let repository = &self.ctx.repository;

        if file.chunked {
            // The stored metadata may know a total the manifest didn't
            let mut layouts = vec![(file.chunk_size, file.chunk_count())];
            match repository.get_chunked_url(&file.url).await {
                Ok(Some(meta)) => layouts.push((meta.chunk_size, meta.chunk_count())),
                Ok(None) => {}
                Err(e) => warn!("Failed to load chunk metadata for {}: {:#}", file.url, e),
            }
            layouts.sort_unstable();
            layouts.dedup_by_key(|(chunk_size, _)| *chunk_size);

            for (chunk_size, count) in layouts {
                for index in 0..count {
                    let key = chunk_key(&file.url, index, chunk_size);
                    if let Err(e) = blobs.delete(&key).await {
                        warn!("Failed to delete {}: {:#}", key, e);
                    }
                }
            }

            if let Err(e) = repository.delete_chunked_url(&file.url).await {
                warn!("Failed to delete chunk metadata for {}: {:#}", file.url, e);
            }
        }

        if let Err(e) = blobs.delete(&file.url).await {
            warn!("Failed to delete {}: {:#}", file.url, e);
        }
    }

    async fn clear_all(&mut self) {
        self.cancel_active().await;
        self.pending.clear();

        if let Err(e) = self.ctx.blobs.clear().await {
            warn!("Failed to clear blob store: {:#}", e);
        }
        if let Err(e) = self.ctx.repository.clear_all().await {
            warn!("Failed to clear offline metadata: {:#}", e);
        }

        info!("Cleared all offline media");
        self.ctx.events.emit_status(StatusEvent::cleared_all());
    }
}

/// Handle for talking to the engine actor
#[derive(Clone)]
pub struct OfflineEngineHandle {
    command_sender: mpsc::UnboundedSender<EngineCommand>,
    events: EventBus,
    status: StatusReporter,
}

impl OfflineEngineHandle {
    /// Apply a command. Only [`OfflineCommand::QueryBooks`] produces a reply.
    pub async fn dispatch(&self, command: OfflineCommand) -> Result<Option<QueryReply>, CacheError> {
        command.validate()?;

        match command {
            OfflineCommand::CacheBook { book_id, files } => {
                self.request(|respond_to| EngineCommand::CacheBook {
                    book_id,
                    files,
                    respond_to,
                })
                .await??;
                Ok(None)
            }
            OfflineCommand::ClearBook { book_id } => {
                self.request(|respond_to| EngineCommand::ClearBook {
                    book_id,
                    respond_to,
                })
                .await?;
                Ok(None)
            }
            OfflineCommand::ClearAll => {
                self.request(|respond_to| EngineCommand::ClearAll { respond_to })
                    .await?;
                Ok(None)
            }
            OfflineCommand::QueryBooks {
                book_ids,
                request_id,
            } => Ok(Some(self.reply(book_ids, request_id).await)),
        }
    }

    /// Resolves once the manifest is persisted and queued.
    pub async fn cache_book(
        &self,
        book_id: impl Into<BookId>,
        files: Vec<CacheFileRequest>,
    ) -> Result<(), CacheError> {
        self.dispatch(OfflineCommand::CacheBook {
            book_id: book_id.into(),
            files,
        })
        .await
        .map(|_| ())
    }

    /// Resolves once the book's blobs and record are gone.
    pub async fn clear_book(&self, book_id: impl Into<BookId>) -> Result<(), CacheError> {
        self.dispatch(OfflineCommand::ClearBook {
            book_id: book_id.into(),
        })
        .await
        .map(|_| ())
    }

    pub async fn clear_all(&self) -> Result<(), CacheError> {
        self.dispatch(OfflineCommand::ClearAll).await.map(|_| ())
    }

    /// Queue a book whose record is already persisted.
    pub async fn enqueue(&self, book_id: impl Into<BookId>) -> Result<(), CacheError> {
        let book_id = book_id.into();
        if book_id.is_empty() {
            return Err(CacheError::InvalidRequest("bookId must not be empty".into()));
        }
        self.request(|respond_to| EngineCommand::Enqueue {
            book_id,
            respond_to,
        })
        .await
    }

    pub async fn query_books(
        &self,
        book_ids: Vec<BookId>,
        request_id: impl Into<RequestId>,
    ) -> Result<QueryReply, CacheError> {
        let request_id = request_id.into();
        OfflineCommand::QueryBooks {
            book_ids: book_ids.clone(),
            request_id: request_id.clone(),
        }
        .validate()?;
        Ok(self.reply(book_ids, request_id).await)
    }

    pub fn subscribe(&self) -> EventSubscriber {
        self.events.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> EventSubscriber {
        self.events.subscribe_filtered(filter)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Cancel the running download and stop the actor.
    pub async fn shutdown(&self) -> Result<(), CacheError> {
        self.request(|respond_to| EngineCommand::Shutdown { respond_to })
            .await
    }

    async fn reply(&self, book_ids: Vec<BookId>, request_id: RequestId) -> QueryReply {
        QueryReply {
            request_id,
            books: self.status.query(&book_ids).await,
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> EngineCommand,
    ) -> Result<T, CacheError> {
        let (sender, receiver) = oneshot::channel();
        self.command_sender
            .send(command(sender))
            .map_err(|_| CacheError::EngineStopped)?;
        receiver.await.map_err(|_| CacheError::EngineStopped)
    }
}
