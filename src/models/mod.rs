pub mod commands;
pub mod downloads;
mod identifiers;

pub use commands::{
    BookStatusSummary, CacheFileRequest, FileStatusSummary, OfflineCommand, QueryReply,
};
pub use downloads::{
    BookDownloadRecord, BookStatus, ChunkedUrlMetadata, FileDownloadState, FileStatus, MediaType,
};
pub use identifiers::{BookId, FileId, RequestId};
