pub mod cloud_storage;
pub mod entity_merger;
pub mod journal;
pub mod repository;
pub mod service;
pub mod snapshot;
pub mod types;

pub use cloud_storage::{DriveRemoteStore, RemoteStore};
pub use journal::ChangeJournal;
pub use service::{HttpNetworkProbe, NetworkProbe, SyncEngine};
pub use types::{AffectedTables, ChangeOperation, ChangeRecord};
