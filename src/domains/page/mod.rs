pub mod repository;
pub mod types;

pub use repository::SqlitePageRepository;
pub use types::Page;
