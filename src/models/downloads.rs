use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::identifiers::{BookId, FileId};

/// Kind of media a file belongs to; only audiobooks are eligible for chunking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Ebook,
    Audiobook,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Per-file download status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Queued,
    Downloading,
    Ready,
    Failed,
}

/// Book-level status, as persisted and as broadcast.
///
/// `Cleared` and `ClearedAll` only ever appear on status events; they are
/// never stored on a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookStatus {
    NotStarted,
    Queued,
    Downloading,
    Ready,
    Failed,
    Partial,
    Cleared,
    ClearedAll,
}

impl BookStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Partial => "partial",
            Self::Cleared => "cleared",
            Self::ClearedAll => "cleared_all",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "not_started" => Self::NotStarted,
            "queued" => Self::Queued,
            "downloading" => Self::Downloading,
            "ready" => Self::Ready,
            "failed" => Self::Failed,
            "partial" => Self::Partial,
            "cleared" => Self::Cleared,
            "cleared_all" => Self::ClearedAll,
            _ => return None,
        })
    }

    /// A stale `queued`/`downloading` record means a previous process died
    /// before finishing the book.
    pub fn is_unfinished(self) -> bool {
        matches!(self, Self::Queued | Self::Downloading)
    }
}

impl fmt::Display for BookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Download state of one media file within a book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDownloadState {
    /// Canonical URL (fragment stripped)
    pub url: String,
    pub bytes_total: u64,
    pub bytes_downloaded: u64,
    pub file_id: FileId,
    pub media_type: MediaType,
    pub status: FileStatus,
    pub chunked: bool,
    /// Only meaningful when `chunked`
    pub chunk_size: u64,
}

impl FileDownloadState {
    /// Number of chunk blobs backing this file; zero for whole-file entries
    /// or when the total size is still unknown.
    pub fn chunk_count(&self) -> u64 {
        if !self.chunked || self.chunk_size == 0 {
            return 0;
        }
        self.bytes_total.div_ceil(self.chunk_size)
    }

    pub fn mark_ready(&mut self) {
        self.status = FileStatus::Ready;
        self.bytes_downloaded = self.bytes_total;
    }
}

/// One checked-out book: its manifest and per-file progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookDownloadRecord {
    pub book_id: BookId,
    pub updated_at: DateTime<Utc>,
    pub status: BookStatus,
    pub files: Vec<FileDownloadState>,
    pub error: Option<String>,
}

impl BookDownloadRecord {
    pub fn new(book_id: BookId, files: Vec<FileDownloadState>) -> Self {
        Self {
            book_id,
            updated_at: Utc::now(),
            status: BookStatus::Queued,
            files,
            error: None,
        }
    }

    pub fn bytes_total(&self) -> u64 {
        self.files.iter().map(|f| f.bytes_total).sum()
    }

    pub fn ready_bytes(&self) -> u64 {
        self.files
            .iter()
            .filter(|f| f.status == FileStatus::Ready)
            .map(|f| f.bytes_total)
            .sum()
    }

    /// Terminal status once every file reached a terminal per-file status.
    pub fn terminal_status(&self) -> BookStatus {
        if self.files.is_empty() {
            return BookStatus::Failed;
        }
        if self.files.iter().all(|f| f.status == FileStatus::Ready) {
            BookStatus::Ready
        } else if self.files.iter().any(|f| f.status == FileStatus::Failed) {
            BookStatus::Failed
        } else {
            BookStatus::Partial
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Chunking parameters for a cached URL, keyed purely by URL so the responder
/// can serve ranges without walking book records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkedUrlMetadata {
    pub url: String,
    pub chunked: bool,
    pub chunk_size: u64,
    pub bytes_total: u64,
    pub content_type: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ChunkedUrlMetadata {
    pub fn new(
        url: impl Into<String>,
        chunk_size: u64,
        bytes_total: u64,
        content_type: Option<String>,
    ) -> Self {
        Self {
            url: url.into(),
            chunked: true,
            chunk_size,
            bytes_total,
            content_type,
            updated_at: Utc::now(),
        }
    }

    pub fn chunk_count(&self) -> u64 {
        if self.chunk_size == 0 {
            return 0;
        }
        self.bytes_total.div_ceil(self.chunk_size)
    }
}
