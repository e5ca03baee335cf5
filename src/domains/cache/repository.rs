use crate::domains::cache::types::{CacheEntry, CacheRow, CacheValue};
use crate::domains::sync::journal::ChangeJournal;
use crate::domains::sync::types::ChangeOperation;
use crate::errors::{DbError, DomainError, DomainResult};
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;

/// Repository for the key/value cache. Rows are addressed by their unique
/// `key`; the autoincrement id is local-only and never leaves the device.
pub struct SqliteCacheRepository {
    pool: SqlitePool,
    journal: Option<Arc<ChangeJournal>>,
}

fn db_err(e: sqlx::Error) -> DomainError {
    DomainError::Database(DbError::from(e))
}

impl SqliteCacheRepository {
    pub fn new(pool: SqlitePool, journal: Option<Arc<ChangeJournal>>) -> Self {
        Self { pool, journal }
    }

    /// The cached value for a key, unwrapped from its envelope.
    pub async fn get(&self, key: &str) -> DomainResult<Option<serde_json::Value>> {
        let row: Option<CacheRow> =
            sqlx::query_as("SELECT * FROM caches WHERE key = ? AND deleted_at IS NULL")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        let entry = row.map(CacheEntry::try_from).transpose()?;
        Ok(entry.and_then(|e| e.value).map(|v| v.value))
    }

    /// Upsert by key; re-saving a soft-deleted key revives it.
    pub async fn save(&self, key: &str, value: serde_json::Value) -> DomainResult<CacheEntry> {
        let now = Utc::now().to_rfc3339();
        let envelope = serde_json::to_string(&CacheValue { value })
            .map_err(|e| DomainError::Internal(format!("serialize cache value: {}", e)))?;
        sqlx::query(
            r#"
            INSERT INTO caches (key, value, created_at, updated_at, deleted_at)
            VALUES (?, ?, ?, ?, NULL)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at,
                deleted_at = NULL
            "#,
        )
        .bind(key)
        .bind(&envelope)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let row = self.fetch_row(key).await?;
        self.journal_row(&row, ChangeOperation::Save).await;
        CacheEntry::try_from(row)
    }

    /// Soft delete. Remote devices receive the tombstone as a DELETE
    /// change and drop the row outright.
    pub async fn delete(&self, key: &str) -> DomainResult<()> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE caches SET deleted_at = ?, updated_at = ? WHERE key = ? AND deleted_at IS NULL",
        )
        .bind(&now)
        .bind(&now)
        .bind(key)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(DomainError::EntityNotFound("caches".into(), key.to_string()));
        }

        let row = self.fetch_row(key).await?;
        self.journal_row(&row, ChangeOperation::Delete).await;
        Ok(())
    }

    async fn fetch_row(&self, key: &str) -> DomainResult<CacheRow> {
        let row: CacheRow = sqlx::query_as("SELECT * FROM caches WHERE key = ?")
            .bind(key)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row)
    }

    async fn journal_row(&self, row: &CacheRow, op: ChangeOperation) {
        if let Some(journal) = &self.journal {
            match serde_json::to_value(row) {
                Ok(image) => {
                    journal
                        .record_best_effort("caches", &row.key, op, &image)
                        .await
                }
                Err(e) => log::error!("failed to serialize cache image for journal: {}", e),
            }
        }
    }
}
