use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

use super::downloads::{BookStatus, FileStatus, MediaType};
use super::identifiers::{BookId, FileId, RequestId};
use crate::utils::CacheError;

/// One file of a book manifest, as sent by the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheFileRequest {
    pub url: String,
    #[serde(default)]
    pub bytes_total: u64,
    pub file_id: FileId,
    #[serde(default)]
    pub media_type: MediaType,
}

impl CacheFileRequest {
    pub fn new(
        url: impl Into<String>,
        bytes_total: u64,
        file_id: impl Into<FileId>,
        media_type: MediaType,
    ) -> Self {
        Self {
            url: url.into(),
            bytes_total,
            file_id: file_id.into(),
            media_type,
        }
    }
}

/// Commands accepted by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum OfflineCommand {
    CacheBook {
        book_id: BookId,
        files: Vec<CacheFileRequest>,
    },
    ClearBook {
        book_id: BookId,
    },
    ClearAll,
    QueryBooks {
        book_ids: Vec<BookId>,
        request_id: RequestId,
    },
}

impl OfflineCommand {
    /// Checks required fields before the command reaches the engine.
    pub fn validate(&self) -> Result<(), CacheError> {
        match self {
            Self::CacheBook { book_id, files } => {
                require_book_id(book_id)?;
                for file in files {
                    validate_file(file)?;
                }
                Ok(())
            }
            Self::ClearBook { book_id } => require_book_id(book_id),
            Self::ClearAll => Ok(()),
            Self::QueryBooks { book_ids, .. } => book_ids.iter().try_for_each(require_book_id),
        }
    }
}

fn require_book_id(book_id: &BookId) -> Result<(), CacheError> {
    if book_id.is_empty() {
        return Err(CacheError::InvalidRequest("bookId must not be empty".into()));
    }
    Ok(())
}

fn validate_file(file: &CacheFileRequest) -> Result<(), CacheError> {
    let url = Url::parse(file.url.trim())
        .map_err(|e| CacheError::InvalidRequest(format!("invalid url {:?}: {}", file.url, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(CacheError::InvalidRequest(format!(
            "unsupported url scheme {:?}",
            url.scheme()
        )));
    }
    if file.file_id.is_empty() {
        return Err(CacheError::InvalidRequest(format!(
            "fileId missing for {}",
            file.url
        )));
    }
    Ok(())
}

/// Per-file line of a status reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStatusSummary {
    pub file_id: FileId,
    pub url: String,
    pub status: FileStatus,
    pub bytes_total: u64,
    pub bytes_downloaded: u64,
}

/// Point-in-time download status of one book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookStatusSummary {
    pub status: BookStatus,
    /// 0.0 ..= 1.0
    pub progress: f64,
    pub bytes_total: u64,
    pub bytes_downloaded: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileStatusSummary>,
}

impl BookStatusSummary {
    pub fn not_started() -> Self {
        Self {
            status: BookStatus::NotStarted,
            progress: 0.0,
            bytes_total: 0,
            bytes_downloaded: 0,
            error: None,
            files: Vec::new(),
        }
    }
}

/// Reply to [`OfflineCommand::QueryBooks`], keyed by the caller's request id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryReply {
    pub request_id: RequestId,
    pub books: BTreeMap<String, BookStatusSummary>,
}
