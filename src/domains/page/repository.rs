use crate::domains::page::types::{Page, PageRow};
use crate::domains::sync::journal::ChangeJournal;
use crate::domains::sync::types::ChangeOperation;
use crate::errors::{DbError, DomainError, DomainResult};
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;

/// Repository for note pages. Mutations feed the change journal when a
/// sink is attached; soft-deleted pages are filtered from reads.
pub struct SqlitePageRepository {
    pool: SqlitePool,
    journal: Option<Arc<ChangeJournal>>,
}

fn db_err(e: sqlx::Error) -> DomainError {
    DomainError::Database(DbError::from(e))
}

impl SqlitePageRepository {
    pub fn new(pool: SqlitePool, journal: Option<Arc<ChangeJournal>>) -> Self {
        Self { pool, journal }
    }

    /// All live pages, tree-ordered.
    pub async fn list(&self) -> DomainResult<Vec<Page>> {
        let rows: Vec<PageRow> = sqlx::query_as(
            "SELECT * FROM pages WHERE deleted_at IS NULL ORDER BY parent_id, sort_order, title",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(Page::try_from).collect()
    }

    pub async fn get(&self, id: &str) -> DomainResult<Option<Page>> {
        let row: Option<PageRow> =
            sqlx::query_as("SELECT * FROM pages WHERE id = ? AND deleted_at IS NULL")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        row.map(Page::try_from).transpose()
    }

    /// Upsert by primary key; the stored creation timestamp survives.
    pub async fn save(&self, page: &Page) -> DomainResult<Page> {
        let now = Utc::now().to_rfc3339();
        let blocks = page.blocks.as_ref().map(|b| b.to_string());
        sqlx::query(
            r#"
            INSERT INTO pages
                (id, title, html_content, blocks, is_folder, expanded,
                 sort_order, parent_id, created_at, updated_at, deleted_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                html_content = excluded.html_content,
                blocks = excluded.blocks,
                is_folder = excluded.is_folder,
                expanded = excluded.expanded,
                sort_order = excluded.sort_order,
                parent_id = excluded.parent_id,
                updated_at = excluded.updated_at,
                deleted_at = NULL
            "#,
        )
        .bind(&page.id)
        .bind(&page.title)
        .bind(&page.html_content)
        .bind(blocks)
        .bind(page.is_folder as i64)
        .bind(page.expanded as i64)
        .bind(page.sort_order)
        .bind(&page.parent_id)
        .bind(page.created_at.to_rfc3339())
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let row = self.fetch_row(&page.id).await?;
        self.journal_row(&row, ChangeOperation::Save).await;
        Page::try_from(row)
    }

    /// Soft delete. Remote devices receive the tombstone as a DELETE
    /// change and drop the row outright.
    pub async fn delete(&self, id: &str) -> DomainResult<()> {
        let now = Utc::now().to_rfc3339();
        let result =
            sqlx::query("UPDATE pages SET deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL")
                .bind(&now)
                .bind(&now)
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(DomainError::EntityNotFound("pages".into(), id.to_string()));
        }

        let row = self.fetch_row(id).await?;
        self.journal_row(&row, ChangeOperation::Delete).await;
        Ok(())
    }

    /// Move a page within the tree.
    pub async fn update_order(
        &self,
        id: &str,
        parent_id: Option<&str>,
        sort_order: i64,
    ) -> DomainResult<Page> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE pages SET parent_id = ?, sort_order = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(parent_id)
        .bind(sort_order)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(DomainError::EntityNotFound("pages".into(), id.to_string()));
        }

        let row = self.fetch_row(id).await?;
        self.journal_row(&row, ChangeOperation::Save).await;
        Page::try_from(row)
    }

    async fn fetch_row(&self, id: &str) -> DomainResult<PageRow> {
        let row: PageRow = sqlx::query_as("SELECT * FROM pages WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row)
    }

    async fn journal_row(&self, row: &PageRow, op: ChangeOperation) {
        if let Some(journal) = &self.journal {
            match serde_json::to_value(row) {
                Ok(image) => journal.record_best_effort("pages", &row.id, op, &image).await,
                Err(e) => log::error!("failed to serialize page image for journal: {}", e),
            }
        }
    }
}
