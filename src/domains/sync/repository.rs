use crate::domains::sync::types::{parse_datetime, sync_epoch, truncate_to_seconds};
use crate::errors::{DbError, DomainError, DomainResult};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

fn db_err(e: sqlx::Error) -> DomainError {
    DomainError::Database(DbError::from(e))
}

/// The device's sync cursor: the high-watermark creation time of remote
/// blobs known to have been applied or safely skipped.
#[derive(Clone)]
pub struct SyncStateRepository {
    pool: SqlitePool,
}

impl SyncStateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Current cursor, or the epoch default for a fresh device. The default
    /// is persisted on first read.
    pub async fn get_cursor(&self) -> DomainResult<DateTime<Utc>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT sync_time_offset FROM sync_state WHERE id = 1")
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;

        match row {
            Some((offset,)) => parse_datetime(&offset, "sync_state.sync_time_offset"),
            None => self.save_cursor(sync_epoch()).await,
        }
    }

    /// Persist a new cursor, clamped to the epoch default and truncated to
    /// second precision. Returns the value actually stored.
    pub async fn save_cursor(&self, t: DateTime<Utc>) -> DomainResult<DateTime<Utc>> {
        let clamped = truncate_to_seconds(t.max(sync_epoch()));
        sqlx::query(
            r#"
            INSERT INTO sync_state (id, sync_time_offset) VALUES (1, ?)
            ON CONFLICT(id) DO UPDATE SET sync_time_offset = excluded.sync_time_offset
            "#,
        )
        .bind(clamped.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(clamped)
    }
}

/// Set of remote blob ids this device has already consumed. Membership
/// means the blob is safe to skip even if the cursor regressed.
#[derive(Clone)]
pub struct ProcessedChangeRepository {
    pool: SqlitePool,
}

impl ProcessedChangeRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn contains(&self, file_id: &str) -> DomainResult<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM processed_changes WHERE file_id = ? LIMIT 1")
                .bind(file_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(row.is_some())
    }

    pub async fn put(&self, file_id: &str) -> DomainResult<()> {
        if self.contains(file_id).await? {
            return Ok(());
        }
        sqlx::query("INSERT INTO processed_changes (file_id, created_at) VALUES (?, ?)")
            .bind(file_id)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Rescind a marker, so a replaced remote blob's successor is applied.
    pub async fn delete(&self, file_id: &str) -> DomainResult<()> {
        sqlx::query("DELETE FROM processed_changes WHERE file_id = ?")
            .bind(file_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn delete_created_before(&self, cutoff: DateTime<Utc>) -> DomainResult<u64> {
        let result = sqlx::query("DELETE FROM processed_changes WHERE created_at < ?")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}

/// Monotonic per-blob failure counters. A blob whose counter exceeds its
/// ceiling is treated as poison and skipped for liveness.
#[derive(Clone)]
pub struct RemoteApplyFailureRepository {
    pool: SqlitePool,
}

impl RemoteApplyFailureRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, file_id: &str) -> DomainResult<i64> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT count FROM remote_apply_failures WHERE file_id = ?")
                .bind(file_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(row.map(|(c,)| c).unwrap_or(0))
    }

    pub async fn save(&self, file_id: &str, count: i64) -> DomainResult<()> {
        sqlx::query(
            r#"
            INSERT INTO remote_apply_failures (file_id, count, created_at) VALUES (?, ?, ?)
            ON CONFLICT(file_id) DO UPDATE SET count = excluded.count
            "#,
        )
        .bind(file_id)
        .bind(count)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn delete_created_before(&self, cutoff: DateTime<Utc>) -> DomainResult<u64> {
        let result = sqlx::query("DELETE FROM remote_apply_failures WHERE created_at < ?")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_util::open_test_stores;

    #[tokio::test]
    async fn fresh_device_cursor_defaults_to_epoch_and_persists() {
        let stores = open_test_stores().await;
        let repo = SyncStateRepository::new(stores.local.clone());

        let cursor = repo.get_cursor().await.unwrap();
        assert_eq!(cursor, sync_epoch());

        // The default was saved on first read.
        let row: Option<(String,)> =
            sqlx::query_as("SELECT sync_time_offset FROM sync_state WHERE id = 1")
                .fetch_optional(&stores.local)
                .await
                .unwrap();
        assert!(row.is_some());
    }

    #[tokio::test]
    async fn save_cursor_clamps_and_truncates() {
        let stores = open_test_stores().await;
        let repo = SyncStateRepository::new(stores.local.clone());

        // Below the epoch default: clamped up.
        let ancient = DateTime::parse_from_rfc3339("1999-12-31T23:59:59Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(repo.save_cursor(ancient).await.unwrap(), sync_epoch());

        // Sub-second precision: truncated.
        let t = DateTime::parse_from_rfc3339("2026-03-01T10:20:30.900Z")
            .unwrap()
            .with_timezone(&Utc);
        let stored = repo.save_cursor(t).await.unwrap();
        assert_eq!(stored.to_rfc3339(), "2026-03-01T10:20:30+00:00");
        assert_eq!(repo.get_cursor().await.unwrap(), stored);
    }

    #[tokio::test]
    async fn processed_markers_behave_as_a_set() {
        let stores = open_test_stores().await;
        let repo = ProcessedChangeRepository::new(stores.local.clone());

        assert!(!repo.contains("f1").await.unwrap());
        repo.put("f1").await.unwrap();
        repo.put("f1").await.unwrap();
        assert!(repo.contains("f1").await.unwrap());

        repo.delete("f1").await.unwrap();
        assert!(!repo.contains("f1").await.unwrap());
    }

    #[tokio::test]
    async fn failure_counters_accumulate_and_reset() {
        let stores = open_test_stores().await;
        let repo = RemoteApplyFailureRepository::new(stores.local.clone());

        assert_eq!(repo.get("f1").await.unwrap(), 0);
        repo.save("f1", 1).await.unwrap();
        repo.save("f1", 2).await.unwrap();
        assert_eq!(repo.get("f1").await.unwrap(), 2);

        repo.save("f1", 0).await.unwrap();
        assert_eq!(repo.get("f1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn bookkeeping_cleanup_respects_cutoff() {
        let stores = open_test_stores().await;
        let processed = ProcessedChangeRepository::new(stores.local.clone());
        let failures = RemoteApplyFailureRepository::new(stores.local.clone());

        processed.put("f1").await.unwrap();
        failures.save("f1", 3).await.unwrap();

        let past = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(processed.delete_created_before(past).await.unwrap(), 0);
        assert_eq!(failures.delete_created_before(past).await.unwrap(), 0);

        let future = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(processed.delete_created_before(future).await.unwrap(), 1);
        assert_eq!(failures.delete_created_before(future).await.unwrap(), 1);
        assert!(!processed.contains("f1").await.unwrap());
        assert_eq!(failures.get("f1").await.unwrap(), 0);
    }
}
