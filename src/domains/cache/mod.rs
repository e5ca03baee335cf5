pub mod repository;
pub mod types;

pub use repository::SqliteCacheRepository;
pub use types::{CacheEntry, CacheValue};
