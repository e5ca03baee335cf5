use crate::errors::{DbError, DbResult};
use sqlx::SqlitePool;

// Embed all migration SQL files at compile time.
const MAIN_ENTITIES: &str = include_str!("../migrations/main/20240901000000_entities.sql");
const LOCAL_SYNC_BOOKKEEPING: &str =
    include_str!("../migrations/local/20240901000000_sync_bookkeeping.sql");

const MAIN_MIGRATIONS: &[(&str, &str)] = &[("20240901000000_entities.sql", MAIN_ENTITIES)];

const LOCAL_MIGRATIONS: &[(&str, &str)] =
    &[("20240901000000_sync_bookkeeping.sql", LOCAL_SYNC_BOOKKEEPING)];

/// Apply pending migrations to the MAIN (replicated) store.
pub async fn run_main_migrations(pool: &SqlitePool) -> DbResult<()> {
    apply_migrations(pool, MAIN_MIGRATIONS).await
}

/// Apply pending migrations to the LOCAL (per-device) store.
pub async fn run_local_migrations(pool: &SqlitePool) -> DbResult<()> {
    apply_migrations(pool, LOCAL_MIGRATIONS).await
}

async fn apply_migrations(pool: &SqlitePool, migrations: &[(&str, &str)]) -> DbResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            name TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    for (name, sql) in migrations {
        let already_applied: Option<(String,)> =
            sqlx::query_as("SELECT name FROM schema_migrations WHERE name = ?")
                .bind(name)
                .fetch_optional(pool)
                .await?;
        if already_applied.is_some() {
            continue;
        }

        log::info!("applying migration {}", name);
        sqlx::raw_sql(sql)
            .execute(pool)
            .await
            .map_err(|e| DbError::Migration(format!("{}: {}", name, e)))?;

        sqlx::query("INSERT INTO schema_migrations (name, applied_at) VALUES (?, ?)")
            .bind(name)
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(pool)
            .await?;
    }

    Ok(())
}
