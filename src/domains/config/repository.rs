use crate::domains::config::types::{Config, ConfigRow};
use crate::domains::sync::journal::ChangeJournal;
use crate::domains::sync::types::ChangeOperation;
use crate::errors::{DbError, DomainError, DomainResult};
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;

/// Repository for the configuration singleton. Mutations feed the change
/// journal when a sink is attached.
pub struct SqliteConfigRepository {
    pool: SqlitePool,
    journal: Option<Arc<ChangeJournal>>,
}

impl SqliteConfigRepository {
    pub fn new(pool: SqlitePool, journal: Option<Arc<ChangeJournal>>) -> Self {
        Self { pool, journal }
    }

    pub async fn get(&self) -> DomainResult<Option<Config>> {
        let row: Option<ConfigRow> =
            sqlx::query_as("SELECT * FROM config WHERE deleted_at IS NULL LIMIT 1")
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| DomainError::Database(DbError::from(e)))?;
        row.map(Config::try_from).transpose()
    }

    /// Replace the singleton, creating it if absent. The stored creation
    /// timestamp survives replacement.
    pub async fn save(&self, draft: &Config) -> DomainResult<Config> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO config
                (id, notion_api_key, openai_api_key, transcriber_source,
                 whisper_model_name, use_gpu, created_at, updated_at, deleted_at)
            VALUES (1, ?, ?, ?, ?, ?, ?, ?, NULL)
            ON CONFLICT(id) DO UPDATE SET
                notion_api_key = excluded.notion_api_key,
                openai_api_key = excluded.openai_api_key,
                transcriber_source = excluded.transcriber_source,
                whisper_model_name = excluded.whisper_model_name,
                use_gpu = excluded.use_gpu,
                updated_at = excluded.updated_at,
                deleted_at = NULL
            "#,
        )
        .bind(&draft.notion_api_key)
        .bind(&draft.openai_api_key)
        .bind(draft.transcriber_source.as_str())
        .bind(&draft.whisper_model_name)
        .bind(draft.use_gpu as i64)
        .bind(draft.created_at.to_rfc3339())
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| DomainError::Database(DbError::from(e)))?;

        let row = self.fetch_row().await?;
        if let Some(journal) = &self.journal {
            let image = serde_json::to_value(&row)
                .map_err(|e| DomainError::Internal(format!("serialize config image: {}", e)))?;
            journal
                .record_best_effort("config", "1", ChangeOperation::Save, &image)
                .await;
        }
        Config::try_from(row)
    }

    async fn fetch_row(&self) -> DomainResult<ConfigRow> {
        let row: ConfigRow = sqlx::query_as("SELECT * FROM config WHERE id = 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| DomainError::Database(DbError::from(e)))?;
        Ok(row)
    }
}
