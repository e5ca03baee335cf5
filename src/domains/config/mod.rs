pub mod repository;
pub mod types;

pub use repository::SqliteConfigRepository;
pub use types::{Config, TranscriberSource};
