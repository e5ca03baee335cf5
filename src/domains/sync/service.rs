use crate::database;
use crate::domains::sync::cloud_storage::{RemoteFileKind, RemoteStore};
use crate::domains::sync::entity_merger::StoreMerger;
use crate::domains::sync::journal::ChangeJournal;
use crate::domains::sync::repository::{
    ProcessedChangeRepository, RemoteApplyFailureRepository, SyncStateRepository,
};
use crate::domains::sync::snapshot::FileArchiver;
use crate::domains::sync::types::{AffectedTables, ChangeRecord, RemoteFile};
use crate::errors::{DomainError, DomainResult, SyncError};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};

/// Default scheduler tick.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(10);

/// A change blob failing more often than this is skipped as poison.
const CHANGE_FAILURE_CEILING: i64 = 5;
/// Snapshots get a higher ceiling; a failing snapshot is a bigger loss.
const SNAPSHOT_FAILURE_CEILING: i64 = 10;

/// Minimum age of the latest snapshot before a new one is taken.
const SNAPSHOT_WINDOW_DAYS: i64 = 7;

const MAX_PARALLEL_UPLOADS: usize = 3;
const PRUNE_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Local connectivity probe; an offline verdict skips the tick.
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    async fn is_online(&self) -> bool;
}

/// Probes reachability of the remote's base URL.
pub struct HttpNetworkProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpNetworkProbe {
    pub fn new(url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl NetworkProbe for HttpNetworkProbe {
    async fn is_online(&self) -> bool {
        self.client.head(&self.url).send().await.is_ok()
    }
}

pub type SuccessCallback = Box<dyn Fn(AffectedTables) + Send + Sync>;
pub type FailureCallback = Box<dyn Fn(String) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickOutcome {
    Ran,
    SkippedBusy,
    SkippedOffline,
    AuthFailure,
}

/// The synchronization engine: one periodic scheduler driving worker
/// passes that pull remote blobs, snapshot-compact the folder, and push
/// the local journal.
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    main_db_path: PathBuf,
    remote: Arc<dyn RemoteStore>,
    probe: Arc<dyn NetworkProbe>,
    journal: Arc<ChangeJournal>,
    sync_state: SyncStateRepository,
    processed: ProcessedChangeRepository,
    failures: RemoteApplyFailureRepository,
    merger: StoreMerger,
    main_pool: SqlitePool,
    tick_interval: Duration,
    enabled: bool,
    /// Written only by the scheduler task, read by the tick predicate.
    is_syncing: AtomicBool,
    /// Creation time of the latest known snapshot, cached so
    /// latest_snapshot() is asked at most once per window.
    last_snapshot_at: Mutex<Option<DateTime<Utc>>>,
    on_success: Mutex<Option<SuccessCallback>>,
    on_failure: Mutex<Option<FailureCallback>>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    upload_sem: Arc<Semaphore>,
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        main_pool: SqlitePool,
        local_pool: SqlitePool,
        main_db_path: PathBuf,
        remote: Arc<dyn RemoteStore>,
        probe: Arc<dyn NetworkProbe>,
        enabled: bool,
        tick_interval: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                main_db_path,
                remote,
                probe,
                journal: Arc::new(ChangeJournal::new(local_pool.clone())),
                sync_state: SyncStateRepository::new(local_pool.clone()),
                processed: ProcessedChangeRepository::new(local_pool.clone()),
                failures: RemoteApplyFailureRepository::new(local_pool),
                merger: StoreMerger::new(main_pool.clone()),
                main_pool,
                tick_interval: tick_interval.unwrap_or(DEFAULT_TICK_INTERVAL),
                enabled,
                is_syncing: AtomicBool::new(false),
                last_snapshot_at: Mutex::new(None),
                on_success: Mutex::new(None),
                on_failure: Mutex::new(None),
                stop_tx: Mutex::new(None),
                upload_sem: Arc::new(Semaphore::new(MAX_PARALLEL_UPLOADS)),
            }),
        }
    }

    /// The journal sink to attach to entity repositories, so their write
    /// hooks land in this engine's LOCAL store.
    pub fn journal(&self) -> Arc<ChangeJournal> {
        self.inner.journal.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.is_syncing.load(Ordering::Acquire)
    }

    pub fn set_on_success(&self, cb: SuccessCallback) {
        *lock(&self.inner.on_success) = Some(cb);
    }

    pub fn set_on_failure(&self, cb: FailureCallback) {
        *lock(&self.inner.on_failure) = Some(cb);
    }

    /// Start the periodic scheduler. No-op when sync is disabled or the
    /// scheduler is already running.
    pub fn start(&self) {
        if !self.inner.enabled {
            log::warn!("sync is disabled (no credentials); scheduler not started");
            return;
        }
        let mut guard = lock(&self.inner.stop_tx);
        if guard.is_some() {
            return;
        }
        let (tx, mut rx) = watch::channel(false);
        *guard = Some(tx);
        drop(guard);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if inner.tick().await == TickOutcome::AuthFailure {
                            // Stop until the application re-authorizes.
                            log::error!("authentication failed; stopping sync scheduler");
                            lock(&inner.stop_tx).take();
                            break;
                        }
                    }
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }
            log::info!("sync scheduler stopped");
        });
    }

    /// Halt the ticker. A pass already underway runs to completion.
    pub fn stop(&self) {
        if let Some(tx) = lock(&self.inner.stop_tx).take() {
            let _ = tx.send(true);
        }
    }
}

impl EngineInner {
    async fn tick(&self) -> TickOutcome {
        if self.is_syncing.load(Ordering::Acquire) {
            return TickOutcome::SkippedBusy;
        }
        if !self.probe.is_online().await {
            log::debug!("offline; skipping sync tick");
            return TickOutcome::SkippedOffline;
        }

        self.is_syncing.store(true, Ordering::Release);
        let outcome = self.run_pass().await;
        self.is_syncing.store(false, Ordering::Release);
        outcome
    }

    /// One worker pass: apply remote changes, snapshot if due, notify,
    /// push the local journal.
    async fn run_pass(&self) -> TickOutcome {
        let mut affected = AffectedTables::default();
        let mut last_error: Option<DomainError> = None;

        if let Err(e) = self.apply_remote_changes(&mut affected).await {
            log::error!("apply remote changes failed: {}", e);
            last_error = Some(e);
        }

        if let Err(e) = self.snapshot_if_due().await {
            log::error!("snapshot failed: {}", e);
            last_error = Some(e);
        }

        let outcome = match &last_error {
            Some(e) if matches!(e.as_sync(), Some(s) if s.is_auth()) => TickOutcome::AuthFailure,
            _ => TickOutcome::Ran,
        };

        match last_error {
            None => {
                if let Some(cb) = lock(&self.on_success).as_ref() {
                    cb(affected);
                }
            }
            Some(e) => {
                if let Some(cb) = lock(&self.on_failure).as_ref() {
                    cb(e.to_string());
                }
            }
        }

        // Push failures are retried next pass and do not affect this
        // pass's success/failure event.
        if let Err(e) = self.push_local_journal().await {
            log::error!("journal push failed: {}", e);
        }

        outcome
    }

    /// §Pull: apply every remote blob after the cursor, in creation order.
    async fn apply_remote_changes(&self, affected: &mut AffectedTables) -> DomainResult<()> {
        let mut cursor = self.sync_state.get_cursor().await?;
        let files = self.remote.list_after(cursor).await?;

        for file in files {
            let kind = RemoteFileKind::classify(&file.name);
            if kind == RemoteFileKind::Foreign {
                continue;
            }
            // Clock-skew guard: never walk backwards.
            if file.created_at <= cursor {
                continue;
            }
            if self.processed.contains(&file.id).await? {
                cursor = self.sync_state.save_cursor(file.created_at).await?;
                continue;
            }

            let result = match kind {
                RemoteFileKind::Snapshot => self.apply_snapshot(&file, affected).await,
                RemoteFileKind::Change => self.apply_change_file(&file, affected).await,
                RemoteFileKind::Foreign => Ok(()),
            };

            if let Err(e) = result {
                // Transport problems are not the blob's fault: retry the
                // whole step next tick without counting.
                if matches!(e.as_sync(), Some(SyncError::Network(_)) | Some(SyncError::Auth(_))) {
                    return Err(e);
                }
                let count = self.failures.get(&file.id).await? + 1;
                self.failures.save(&file.id, count).await?;
                let ceiling = match kind {
                    RemoteFileKind::Snapshot => SNAPSHOT_FAILURE_CEILING,
                    _ => CHANGE_FAILURE_CEILING,
                };
                if count <= ceiling {
                    return Err(e);
                }
                log::error!(
                    "skipping poison blob {} after {} failed applies: {}",
                    file.name,
                    count,
                    e
                );
            }

            self.failures.save(&file.id, 0).await?;
            cursor = self.sync_state.save_cursor(file.created_at).await?;
            self.processed.put(&file.id).await?;
        }
        Ok(())
    }

    async fn apply_snapshot(
        &self,
        file: &RemoteFile,
        affected: &mut AffectedTables,
    ) -> DomainResult<()> {
        log::info!("applying remote snapshot {}", file.name);
        let bytes = self.remote.download(&file.id).await?;

        // The temp directory is removed on every exit path by its guard.
        let tmp = tempfile::tempdir()
            .map_err(|e| DomainError::File(format!("create temp dir: {}", e)))?;
        let dir = tmp.path().to_path_buf();
        let db_path = tokio::task::spawn_blocking(move || FileArchiver::extract(&bytes, &dir))
            .await
            .map_err(|e| DomainError::Internal(format!("extract task: {}", e)))??;

        let source = database::open_snapshot_source(&db_path).await.map_err(|e| {
            DomainError::Sync(SyncError::CorruptBlob(format!(
                "snapshot store unreadable: {}",
                e
            )))
        })?;
        let result = self.merger.merge_snapshot(&source).await;
        source.close().await;

        affected.merge(result?);
        Ok(())
    }

    async fn apply_change_file(
        &self,
        file: &RemoteFile,
        affected: &mut AffectedTables,
    ) -> DomainResult<()> {
        log::debug!("applying remote change {}", file.name);
        let bytes = self.remote.download(&file.id).await?;
        let record: ChangeRecord = serde_json::from_slice(&bytes).map_err(|e| {
            DomainError::Sync(SyncError::CorruptBlob(format!(
                "unparseable change blob {}: {}",
                file.name, e
            )))
        })?;
        affected.merge(self.merger.apply_change(&record).await?);
        Ok(())
    }

    /// §Compact: snapshot the MAIN store once a week, when no remote work
    /// is pending, then prune everything the snapshot subsumes.
    async fn snapshot_if_due(&self) -> DomainResult<()> {
        let now = Utc::now();
        let window = ChronoDuration::days(SNAPSHOT_WINDOW_DAYS);

        if let Some(cached) = *lock(&self.last_snapshot_at) {
            if now - cached < window {
                return Ok(());
            }
        }
        if let Some(latest) = self.remote.latest_snapshot().await? {
            if now - latest.created_at < window {
                *lock(&self.last_snapshot_at) = Some(latest.created_at);
                return Ok(());
            }
        }

        // Snapshotting while changes remain unprocessed could subsume
        // them on another device.
        let cursor = self.sync_state.get_cursor().await?;
        if !self.remote.list_after(cursor).await?.is_empty() {
            return Ok(());
        }

        // Flush the WAL so the main file alone carries the full state.
        if let Err(e) = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.main_pool)
            .await
        {
            log::warn!("wal checkpoint before snapshot failed: {}", e);
        }

        let files = database::main_store_files(&self.main_db_path);
        let body = tokio::task::spawn_blocking(move || FileArchiver::archive(&files))
            .await
            .map_err(|e| DomainError::Internal(format!("archive task: {}", e)))??;

        let snapshot = self.remote.upload_snapshot(body).await?;
        log::info!("uploaded snapshot {}", snapshot.name);
        self.sync_state.save_cursor(snapshot.created_at).await?;
        self.processed.put(&snapshot.id).await?;

        let cutoff = snapshot.created_at - ChronoDuration::seconds(1);
        if let Err(e) = self.remote.prune_before(cutoff).await {
            log::warn!("prune failed, retrying once: {}", e);
            tokio::time::sleep(PRUNE_RETRY_DELAY).await;
            if let Err(e) = self.remote.prune_before(cutoff).await {
                log::error!("prune retry failed: {}", e);
            }
        }

        // Local bookkeeping cleanup is best-effort; the prune invariant is
        // eventual.
        if let Err(e) = self.failures.delete_created_before(cutoff).await {
            log::error!("failure-counter cleanup failed: {}", e);
        }
        if let Err(e) = self.processed.delete_created_before(cutoff).await {
            log::error!("processed-marker cleanup failed: {}", e);
        }
        if let Err(e) = self.journal.delete_created_before(cutoff).await {
            log::error!("journal cleanup failed: {}", e);
        }

        *lock(&self.last_snapshot_at) = Some(snapshot.created_at);
        Ok(())
    }

    /// §Push: upload every unsynced journal entry, newest image wins.
    /// Uploads fan out under a small concurrency cap; failures are logged
    /// and retried next pass.
    async fn push_local_journal(&self) -> DomainResult<()> {
        let pending = self.journal.unsynced().await?;
        if pending.is_empty() {
            return Ok(());
        }

        let tasks = pending.into_iter().map(|entry| {
            let remote = self.remote.clone();
            let processed = self.processed.clone();
            let journal = self.journal.clone();
            let sem = self.upload_sem.clone();
            async move {
                let _permit = sem
                    .acquire()
                    .await
                    .map_err(|e| DomainError::Internal(format!("semaphore closed: {}", e)))?;

                // Delete-before-upload: stale blobs for this ChangeID go
                // away, and rescinding their processed markers makes other
                // devices re-apply the newer upload.
                let deleted = remote.delete_change(&entry.change_id).await?;
                for old in &deleted {
                    processed.delete(&old.id).await?;
                }

                let record = ChangeRecord::from(&entry);
                let blob = remote.upload_change(&record).await?;
                processed.put(&blob.id).await?;
                journal.mark_synced_if_unchanged(&entry).await?;
                Ok::<String, DomainError>(entry.change_id)
            }
        });

        for result in futures::future::join_all(tasks).await {
            match result {
                Ok(change_id) => log::debug!("pushed {}", change_id),
                Err(e) => log::error!("failed to push journal entry: {}", e),
            }
        }
        Ok(())
    }
}
