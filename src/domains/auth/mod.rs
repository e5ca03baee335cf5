pub mod repository;
pub mod service;
pub mod types;

pub use repository::SqliteDriveTokenRepository;
pub use service::TokenProvider;
pub use types::{DriveCredentials, DriveToken};
