use serde::{Deserialize, Serialize};

use crate::models::{BookId, BookStatus, FileId, MediaType};

/// Incremental byte progress for one file of a book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub book_id: BookId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<FileId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<MediaType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub bytes_downloaded: u64,
    pub bytes_total: u64,
    /// Whole-book progress, 0.0 ..= 1.0
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_overall: Option<f64>,
}

/// Status transition of a book, or of one file when `file_id`/`url` are set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    /// Absent only for `cleared_all`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub book_id: Option<BookId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<FileId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub status: BookStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusEvent {
    pub fn book(book_id: BookId, status: BookStatus) -> Self {
        Self {
            book_id: Some(book_id),
            file_id: None,
            url: None,
            status,
            error: None,
        }
    }

    pub fn file(book_id: BookId, file_id: FileId, url: impl Into<String>, status: BookStatus) -> Self {
        Self {
            book_id: Some(book_id),
            file_id: Some(file_id),
            url: Some(url.into()),
            status,
            error: None,
        }
    }

    pub fn cleared_all() -> Self {
        Self {
            book_id: None,
            file_id: None,
            url: None,
            status: BookStatus::ClearedAll,
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Book-scoped (not file-scoped) event.
    pub fn is_book_level(&self) -> bool {
        self.file_id.is_none() && self.url.is_none()
    }
}

/// Everything broadcast to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum OfflineEvent {
    Progress(ProgressEvent),
    Status(StatusEvent),
}

impl OfflineEvent {
    pub fn book_id(&self) -> Option<&BookId> {
        match self {
            Self::Progress(p) => Some(&p.book_id),
            Self::Status(s) => s.book_id.as_ref(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Progress(_) => "progress",
            Self::Status(_) => "status",
        }
    }
}

impl From<ProgressEvent> for OfflineEvent {
    fn from(event: ProgressEvent) -> Self {
        Self::Progress(event)
    }
}

impl From<StatusEvent> for OfflineEvent {
    fn from(event: StatusEvent) -> Self {
        Self::Status(event)
    }
}
