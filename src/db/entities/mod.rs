pub mod book_downloads;
pub mod chunked_urls;

// Re-export entities for convenience
pub use book_downloads::{
    ActiveModel as BookDownloadActiveModel, Entity as BookDownload, Model as BookDownloadModel,
};
pub use chunked_urls::{
    ActiveModel as ChunkedUrlActiveModel, Entity as ChunkedUrl, Model as ChunkedUrlModel,
};
