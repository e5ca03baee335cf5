use crate::domains::sync::types::{change_id, ChangeLogEntry, ChangeLogRow, ChangeOperation};
use crate::errors::{DbError, DomainError, DomainResult};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

/// The change journal: write-hook sink over the LOCAL store.
///
/// Every successful mutation of a replicated entity lands here as a pending
/// row keyed by ChangeID, so repeated writes to the same (table, row, op)
/// coalesce onto one entry. The entry keeps its id and creation timestamp
/// across coalesces; the post-image and updated_at are overwritten and the
/// synced flag drops back to false.
pub struct ChangeJournal {
    pool: SqlitePool,
}

impl ChangeJournal {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a mutation's post-image. Upserts by ChangeID.
    pub async fn record(
        &self,
        table: &str,
        row_id: &str,
        op: ChangeOperation,
        post_image: &serde_json::Value,
    ) -> DomainResult<()> {
        let now = Utc::now().to_rfc3339();
        let new_data = post_image.to_string();
        sqlx::query(
            r#"
            INSERT INTO change_log
                (change_id, table_name, row_id, operation, new_data, synced, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 0, ?, ?)
            ON CONFLICT(change_id) DO UPDATE SET
                new_data = excluded.new_data,
                synced = 0,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(change_id(table, row_id, op))
        .bind(table)
        .bind(row_id)
        .bind(op.as_str())
        .bind(new_data)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| DomainError::Database(DbError::from(e)))?;
        Ok(())
    }

    /// Write-hook entry point: journal-append failures are logged, never
    /// surfaced to the caller's SAVE/DELETE.
    pub async fn record_best_effort(
        &self,
        table: &str,
        row_id: &str,
        op: ChangeOperation,
        post_image: &serde_json::Value,
    ) {
        if let Err(e) = self.record(table, row_id, op, post_image).await {
            log::error!(
                "failed to journal {} {}:{}: {}",
                op.as_str(),
                table,
                row_id,
                e
            );
        }
    }

    /// All entries not yet proved uploaded.
    pub async fn unsynced(&self) -> DomainResult<Vec<ChangeLogEntry>> {
        let rows: Vec<ChangeLogRow> = sqlx::query_as(
            r#"
            SELECT id, change_id, table_name, row_id, operation, new_data,
                   synced, created_at, updated_at
            FROM change_log
            WHERE synced = 0
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DomainError::Database(DbError::from(e)))?;

        rows.into_iter().map(ChangeLogEntry::try_from).collect()
    }

    /// Mark an entry synced, unless a later mutation raced with the upload
    /// and advanced its updated_at. Returns whether the mark stuck.
    pub async fn mark_synced_if_unchanged(&self, entry: &ChangeLogEntry) -> DomainResult<bool> {
        let result = sqlx::query(
            "UPDATE change_log SET synced = 1 WHERE change_id = ? AND updated_at = ?",
        )
        .bind(&entry.change_id)
        .bind(entry.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| DomainError::Database(DbError::from(e)))?;
        Ok(result.rows_affected() > 0)
    }

    /// Post-snapshot cleanup: drop entries created before the cutoff.
    pub async fn delete_created_before(&self, cutoff: DateTime<Utc>) -> DomainResult<u64> {
        let result = sqlx::query("DELETE FROM change_log WHERE created_at < ?")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(|e| DomainError::Database(DbError::from(e)))?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_util::open_test_stores;
    use serde_json::json;

    #[tokio::test]
    async fn repeated_saves_coalesce_onto_one_pending_entry() {
        let stores = open_test_stores().await;
        let journal = ChangeJournal::new(stores.local.clone());

        for title in ["A", "B", "C"] {
            journal
                .record(
                    "pages",
                    "p1",
                    ChangeOperation::Save,
                    &json!({"id": "p1", "title": title}),
                )
                .await
                .unwrap();
        }

        let pending = journal.unsynced().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].change_id, "pages-p1-SAVE");
        assert_eq!(pending[0].new_data["title"], "C");
        assert!(!pending[0].synced);
    }

    #[tokio::test]
    async fn coalesce_preserves_id_and_creation_time() {
        let stores = open_test_stores().await;
        let journal = ChangeJournal::new(stores.local.clone());

        journal
            .record("pages", "p1", ChangeOperation::Save, &json!({"title": "A"}))
            .await
            .unwrap();
        let first = journal.unsynced().await.unwrap().remove(0);

        journal
            .record("pages", "p1", ChangeOperation::Save, &json!({"title": "B"}))
            .await
            .unwrap();
        let second = journal.unsynced().await.unwrap().remove(0);

        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
    }

    #[tokio::test]
    async fn save_and_delete_are_distinct_entries() {
        let stores = open_test_stores().await;
        let journal = ChangeJournal::new(stores.local.clone());

        journal
            .record("pages", "p1", ChangeOperation::Save, &json!({"title": "A"}))
            .await
            .unwrap();
        journal
            .record("pages", "p1", ChangeOperation::Delete, &json!({"id": "p1"}))
            .await
            .unwrap();

        let pending = journal.unsynced().await.unwrap();
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test]
    async fn mark_synced_skips_entries_mutated_since_upload_started() {
        let stores = open_test_stores().await;
        let journal = ChangeJournal::new(stores.local.clone());

        journal
            .record("pages", "p1", ChangeOperation::Save, &json!({"title": "A"}))
            .await
            .unwrap();
        let snapshot = journal.unsynced().await.unwrap().remove(0);

        // A clean mark sticks.
        assert!(journal.mark_synced_if_unchanged(&snapshot).await.unwrap());
        assert!(journal.unsynced().await.unwrap().is_empty());

        // A mutation racing with the upload leaves the entry pending.
        journal
            .record("pages", "p1", ChangeOperation::Save, &json!({"title": "B"}))
            .await
            .unwrap();
        let newer = journal.unsynced().await.unwrap().remove(0);
        // Force distinct updated_at for the stale handle.
        let mut stale = newer.clone();
        stale.updated_at = snapshot.updated_at - chrono::Duration::seconds(1);
        assert!(!journal.mark_synced_if_unchanged(&stale).await.unwrap());
        assert_eq!(journal.unsynced().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cleanup_deletes_only_rows_before_cutoff() {
        let stores = open_test_stores().await;
        let journal = ChangeJournal::new(stores.local.clone());

        journal
            .record("pages", "p1", ChangeOperation::Save, &json!({"title": "A"}))
            .await
            .unwrap();
        let entry = journal.unsynced().await.unwrap().remove(0);

        let before = entry.created_at - chrono::Duration::seconds(10);
        assert_eq!(journal.delete_created_before(before).await.unwrap(), 0);

        let after = entry.created_at + chrono::Duration::seconds(10);
        assert_eq!(journal.delete_created_before(after).await.unwrap(), 1);
        assert!(journal.unsynced().await.unwrap().is_empty());
    }
}
