use thiserror::Error;

/// Database errors
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Record not found: {0} with ID {1}")]
    NotFound(String, String),

    #[error("Database is locked")]
    Locked,

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Database error: {0}")]
    Other(String),
}

/// Sync-specific errors. The variants map onto the engine's recovery
/// behavior: Network aborts the pass, Auth stops the scheduler, the rest
/// count against the offending blob's failure ceiling.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Schema incompatible for table '{table}': {reason}")]
    SchemaIncompatible { table: String, reason: String },

    #[error("Corrupt remote blob: {0}")]
    CorruptBlob(String),

    #[error("Failed to apply remote change: {0}")]
    Apply(String),
}

impl SyncError {
    /// True when the error should stop the scheduler until the application
    /// re-authorizes the remote store.
    pub fn is_auth(&self) -> bool {
        matches!(self, SyncError::Auth(_))
    }
}

/// Domain-level errors
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Entity not found: {0} with ID {1}")]
    EntityNotFound(String, String),

    #[error("File error: {0}")]
    File(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DomainError {
    /// The sync taxonomy of this error, when it has one.
    pub fn as_sync(&self) -> Option<&SyncError> {
        match self {
            DomainError::Sync(e) => Some(e),
            _ => None,
        }
    }
}

/// Service-level errors (the engine surface)
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    #[error("Sync is disabled: {0}")]
    SyncDisabled(String),

    #[error("External service error: {0}")]
    ExternalService(String),
}

impl From<DbError> for ServiceError {
    fn from(e: DbError) -> Self {
        ServiceError::Domain(DomainError::Database(e))
    }
}
