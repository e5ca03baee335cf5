use crate::errors::DbResult;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Base name of the replicated store. Snapshot archives are located by this
/// name, so it is part of the remote wire format.
pub const MAIN_DB_NAME: &str = "database.sqlite";

/// Base name of the per-device bookkeeping store. Never replicated.
pub const LOCAL_DB_NAME: &str = "unsynced-database.sqlite";

fn connect_options(path: &Path) -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true)
        .pragma("cache_size", "-2000")
        .pragma("temp_store", "MEMORY")
}

async fn open_store(path: &Path) -> DbResult<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(connect_options(path))
        .await?;
    Ok(pool)
}

/// Open the replicated MAIN store under the application home directory and
/// apply its migrations.
pub async fn open_main_store(home_dir: &Path) -> DbResult<SqlitePool> {
    let pool = open_store(&home_dir.join(MAIN_DB_NAME)).await?;
    crate::db_migration::run_main_migrations(&pool).await?;
    Ok(pool)
}

/// Open the per-device LOCAL store under the application home directory and
/// apply its migrations.
pub async fn open_local_store(home_dir: &Path) -> DbResult<SqlitePool> {
    let pool = open_store(&home_dir.join(LOCAL_DB_NAME)).await?;
    crate::db_migration::run_local_migrations(&pool).await?;
    Ok(pool)
}

/// Open a store extracted from a snapshot archive. The copy is disposable,
/// so the connection is writable: SQLite needs write access to recover a
/// WAL that was archived alongside the main file.
pub async fn open_snapshot_source(path: &Path) -> DbResult<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(false)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// The MAIN store's on-disk files: the database itself plus any WAL/journal
/// companions sharing its base path that currently exist.
pub fn main_store_files(main_db_path: &Path) -> Vec<PathBuf> {
    let mut files = vec![main_db_path.to_path_buf()];
    for suffix in ["-wal", "-shm", "-journal"] {
        let mut name = main_db_path.as_os_str().to_os_string();
        name.push(suffix);
        let companion = PathBuf::from(name);
        if companion.exists() {
            files.push(companion);
        }
    }
    files
}
