pub mod errors;

pub use errors::CacheError;
