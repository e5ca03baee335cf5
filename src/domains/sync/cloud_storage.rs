use crate::domains::auth::service::TokenProvider;
use crate::domains::sync::types::{ChangeRecord, RemoteFile};
use crate::errors::{DomainError, DomainResult, SyncError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Blob name prefixes in the shared folder. A blob is a snapshot iff its
/// name starts with the snapshot prefix, a change iff it starts with the
/// change prefix; anything else is ignored by the engine.
pub const SNAPSHOT_PREFIX: &str = "snapshot_";
pub const CHANGES_PREFIX: &str = "changes_";

/// `snapshot_<unix-seconds>.db.gz`
pub fn compose_snapshot_name(t: DateTime<Utc>) -> String {
    format!("{}{}.db.gz", SNAPSHOT_PREFIX, t.timestamp())
}

/// `changes_<ChangeID>.json`
pub fn compose_change_name(change_id: &str) -> String {
    format!("{}{}.json", CHANGES_PREFIX, change_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteFileKind {
    Snapshot,
    Change,
    Foreign,
}

impl RemoteFileKind {
    pub fn classify(name: &str) -> Self {
        if name.starts_with(SNAPSHOT_PREFIX) {
            RemoteFileKind::Snapshot
        } else if name.starts_with(CHANGES_PREFIX) {
            RemoteFileKind::Change
        } else {
            RemoteFileKind::Foreign
        }
    }
}

/// Narrow capability over the shared cloud folder. All metadata in the
/// returned [`RemoteFile`]s comes from the remote's authoritative values.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Blobs created strictly after `ts`, ascending by creation time.
    async fn list_after(&self, ts: DateTime<Utc>) -> DomainResult<Vec<RemoteFile>>;

    /// The most recently created snapshot blob, if any.
    async fn latest_snapshot(&self) -> DomainResult<Option<RemoteFile>>;

    /// Create a new change blob carrying the record's JSON body.
    async fn upload_change(&self, record: &ChangeRecord) -> DomainResult<RemoteFile>;

    /// Delete every blob whose name contains the ChangeID; returns what was
    /// deleted so processed markers can be rescinded.
    async fn delete_change(&self, change_id: &str) -> DomainResult<Vec<RemoteFile>>;

    /// Create a new snapshot blob from an archive stream.
    async fn upload_snapshot(&self, body: Vec<u8>) -> DomainResult<RemoteFile>;

    async fn download(&self, file_id: &str) -> DomainResult<Vec<u8>>;

    /// Best-effort delete of every blob created strictly before `ts`.
    async fn prune_before(&self, ts: DateTime<Utc>) -> DomainResult<()>;
}

const LIST_TIMEOUT: Duration = Duration::from_secs(10);
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(120);

/// HTTP implementation against a drive-folder API: a flat file listing
/// with server-assigned ids and creation times, multipart uploads, and
/// per-file download/delete endpoints.
pub struct DriveRemoteStore {
    client: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenProvider>,
}

#[derive(Debug, Deserialize)]
struct DriveFileMeta {
    id: String,
    name: String,
    #[serde(rename = "createdTime")]
    created_time: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct DriveFileList {
    files: Vec<DriveFileMeta>,
}

impl From<DriveFileMeta> for RemoteFile {
    fn from(meta: DriveFileMeta) -> Self {
        RemoteFile {
            id: meta.id,
            name: meta.name,
            created_at: meta.created_time,
        }
    }
}

fn network_err(context: &str, e: reqwest::Error) -> DomainError {
    DomainError::Sync(SyncError::Network(format!("{}: {}", context, e)))
}

impl DriveRemoteStore {
    pub fn new(base_url: &str, tokens: Arc<TokenProvider>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
        }
    }

    async fn bearer(&self) -> DomainResult<String> {
        self.tokens.bearer().await
    }

    /// Map non-success statuses onto the engine's error taxonomy.
    async fn check_status(context: &str, response: reqwest::Response) -> DomainResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(DomainError::Sync(SyncError::Auth(format!(
                "{}: {} {}",
                context, status, body
            ))));
        }
        Err(DomainError::Sync(SyncError::Network(format!(
            "{}: {} {}",
            context, status, body
        ))))
    }

    async fn list_files(&self, query: &[(&str, String)]) -> DomainResult<Vec<RemoteFile>> {
        let token = self.bearer().await?;
        let response = self
            .client
            .get(format!("{}/files", self.base_url))
            .bearer_auth(token)
            .query(query)
            .timeout(LIST_TIMEOUT)
            .send()
            .await
            .map_err(|e| network_err("list files", e))?;
        let response = Self::check_status("list files", response).await?;
        let list: DriveFileList = response
            .json()
            .await
            .map_err(|e| network_err("parse file list", e))?;
        Ok(list.files.into_iter().map(RemoteFile::from).collect())
    }

    async fn upload(&self, name: &str, body: Vec<u8>) -> DomainResult<RemoteFile> {
        let token = self.bearer().await?;
        let form = reqwest::multipart::Form::new()
            .text("name", name.to_string())
            .part("media", reqwest::multipart::Part::bytes(body).file_name(name.to_string()));
        let response = self
            .client
            .post(format!("{}/files", self.base_url))
            .bearer_auth(token)
            .multipart(form)
            .timeout(TRANSFER_TIMEOUT)
            .send()
            .await
            .map_err(|e| network_err("upload file", e))?;
        let response = Self::check_status("upload file", response).await?;
        let meta: DriveFileMeta = response
            .json()
            .await
            .map_err(|e| network_err("parse upload response", e))?;
        Ok(meta.into())
    }

    async fn delete_file(&self, file_id: &str) -> DomainResult<()> {
        let token = self.bearer().await?;
        let response = self
            .client
            .delete(format!("{}/files/{}", self.base_url, file_id))
            .bearer_auth(token)
            .timeout(LIST_TIMEOUT)
            .send()
            .await
            .map_err(|e| network_err("delete file", e))?;
        Self::check_status("delete file", response).await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for DriveRemoteStore {
    async fn list_after(&self, ts: DateTime<Utc>) -> DomainResult<Vec<RemoteFile>> {
        let mut files = self
            .list_files(&[
                ("createdAfter", ts.to_rfc3339()),
                ("orderBy", "createdTime".to_string()),
            ])
            .await?;
        // The ordering contract is ours even if the remote ignores orderBy.
        files.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        files.retain(|f| f.created_at > ts);
        Ok(files)
    }

    async fn latest_snapshot(&self) -> DomainResult<Option<RemoteFile>> {
        let files = self
            .list_files(&[("prefix", SNAPSHOT_PREFIX.to_string())])
            .await?;
        Ok(files.into_iter().max_by_key(|f| f.created_at))
    }

    async fn upload_change(&self, record: &ChangeRecord) -> DomainResult<RemoteFile> {
        let body = serde_json::to_vec(record)
            .map_err(|e| DomainError::Internal(format!("encode change record: {}", e)))?;
        self.upload(&compose_change_name(&record.change_id), body).await
    }

    async fn delete_change(&self, change_id: &str) -> DomainResult<Vec<RemoteFile>> {
        let matches = self
            .list_files(&[("nameContains", change_id.to_string())])
            .await?;
        let mut deleted = Vec::with_capacity(matches.len());
        for file in matches {
            self.delete_file(&file.id).await?;
            deleted.push(file);
        }
        Ok(deleted)
    }

    async fn upload_snapshot(&self, body: Vec<u8>) -> DomainResult<RemoteFile> {
        self.upload(&compose_snapshot_name(Utc::now()), body).await
    }

    async fn download(&self, file_id: &str) -> DomainResult<Vec<u8>> {
        let token = self.bearer().await?;
        let response = self
            .client
            .get(format!("{}/files/{}/content", self.base_url, file_id))
            .bearer_auth(token)
            .timeout(TRANSFER_TIMEOUT)
            .send()
            .await
            .map_err(|e| network_err("download file", e))?;
        let response = Self::check_status("download file", response).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| network_err("read file body", e))?;
        Ok(bytes.to_vec())
    }

    async fn prune_before(&self, ts: DateTime<Utc>) -> DomainResult<()> {
        let files = self
            .list_files(&[("createdBefore", ts.to_rfc3339())])
            .await?;
        let mut last_err = None;
        for file in files.into_iter().filter(|f| f.created_at < ts) {
            if let Err(e) = self.delete_file(&file.id).await {
                log::warn!("prune: failed to delete {}: {}", file.name, e);
                last_err = Some(e);
            }
        }
        match last_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

/// In-memory remote folder with a deterministic second-granular clock.
/// Upload order fixes creation-time order, which is what the scheduler
/// tests lean on.
#[cfg(test)]
pub(crate) mod memory {
    use super::*;
    use std::sync::Mutex;

    struct MemoryState {
        files: Vec<(RemoteFile, Vec<u8>)>,
        clock: DateTime<Utc>,
        next_id: u64,
        prune_calls: Vec<DateTime<Utc>>,
    }

    pub(crate) struct MemoryRemote {
        state: Mutex<MemoryState>,
    }

    impl MemoryRemote {
        pub(crate) fn new(base: DateTime<Utc>) -> Self {
            Self {
                state: Mutex::new(MemoryState {
                    files: Vec::new(),
                    clock: crate::domains::sync::types::truncate_to_seconds(base),
                    next_id: 1,
                    prune_calls: Vec::new(),
                }),
            }
        }

        pub(crate) fn started_now() -> Self {
            Self::new(Utc::now())
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
            self.state.lock().unwrap_or_else(|e| e.into_inner())
        }

        fn store(state: &mut MemoryState, name: String, body: Vec<u8>) -> RemoteFile {
            state.clock += chrono::Duration::seconds(1);
            let file = RemoteFile {
                id: format!("mem-{}", state.next_id),
                name,
                created_at: state.clock,
            };
            state.next_id += 1;
            state.files.push((file.clone(), body));
            file
        }

        /// Seed a blob with an explicit creation time (e.g. an old snapshot).
        pub(crate) fn put_file_at(
            &self,
            name: &str,
            body: Vec<u8>,
            created_at: DateTime<Utc>,
        ) -> RemoteFile {
            let mut state = self.lock();
            let file = RemoteFile {
                id: format!("mem-{}", state.next_id),
                name: name.to_string(),
                created_at,
            };
            state.next_id += 1;
            state.files.push((file.clone(), body));
            file
        }

        pub(crate) fn file_names(&self) -> Vec<String> {
            self.lock().files.iter().map(|(f, _)| f.name.clone()).collect()
        }

        pub(crate) fn body_of(&self, file_id: &str) -> Option<Vec<u8>> {
            self.lock()
                .files
                .iter()
                .find(|(f, _)| f.id == file_id)
                .map(|(_, b)| b.clone())
        }

        pub(crate) fn prune_calls(&self) -> Vec<DateTime<Utc>> {
            self.lock().prune_calls.clone()
        }
    }

    #[async_trait]
    impl RemoteStore for MemoryRemote {
        async fn list_after(&self, ts: DateTime<Utc>) -> DomainResult<Vec<RemoteFile>> {
            let state = self.lock();
            let mut files: Vec<RemoteFile> = state
                .files
                .iter()
                .map(|(f, _)| f.clone())
                .filter(|f| f.created_at > ts)
                .collect();
            files.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            Ok(files)
        }

        async fn latest_snapshot(&self) -> DomainResult<Option<RemoteFile>> {
            let state = self.lock();
            Ok(state
                .files
                .iter()
                .map(|(f, _)| f.clone())
                .filter(|f| f.name.starts_with(SNAPSHOT_PREFIX))
                .max_by_key(|f| f.created_at))
        }

        async fn upload_change(&self, record: &ChangeRecord) -> DomainResult<RemoteFile> {
            let body = serde_json::to_vec(record)
                .map_err(|e| DomainError::Internal(format!("encode change record: {}", e)))?;
            let mut state = self.lock();
            let name = compose_change_name(&record.change_id);
            Ok(Self::store(&mut state, name, body))
        }

        async fn delete_change(&self, change_id: &str) -> DomainResult<Vec<RemoteFile>> {
            let mut state = self.lock();
            let (deleted, kept): (Vec<_>, Vec<_>) = state
                .files
                .drain(..)
                .partition(|(f, _)| f.name.contains(change_id));
            state.files = kept;
            Ok(deleted.into_iter().map(|(f, _)| f).collect())
        }

        async fn upload_snapshot(&self, body: Vec<u8>) -> DomainResult<RemoteFile> {
            let mut state = self.lock();
            let name = compose_snapshot_name(state.clock + chrono::Duration::seconds(1));
            Ok(Self::store(&mut state, name, body))
        }

        async fn download(&self, file_id: &str) -> DomainResult<Vec<u8>> {
            self.body_of(file_id).ok_or_else(|| {
                DomainError::Sync(SyncError::Network(format!("no such file: {}", file_id)))
            })
        }

        async fn prune_before(&self, ts: DateTime<Utc>) -> DomainResult<()> {
            let mut state = self.lock();
            state.prune_calls.push(ts);
            state.files.retain(|(f, _)| f.created_at >= ts);
            Ok(())
        }
    }
}
