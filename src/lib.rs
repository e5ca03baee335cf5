// Public modules
pub mod database;
pub mod domains;
pub mod errors;
pub mod utils;

// Private modules
mod db_migration;

use crate::domains::auth::{DriveCredentials, SqliteDriveTokenRepository, TokenProvider};
use crate::domains::cache::SqliteCacheRepository;
use crate::domains::config::SqliteConfigRepository;
use crate::domains::page::SqlitePageRepository;
use crate::domains::sync::{DriveRemoteStore, HttpNetworkProbe, SyncEngine};
use crate::errors::ServiceResult;
use sqlx::SqlitePool;
use std::path::Path;
use std::sync::Arc;

/// Everything the desktop shell works with: the two stores, the entity
/// repositories (wired into the engine's change journal), and the sync
/// engine itself.
pub struct App {
    pub main_pool: SqlitePool,
    pub local_pool: SqlitePool,
    pub config: SqliteConfigRepository,
    pub pages: SqlitePageRepository,
    pub caches: SqliteCacheRepository,
    pub engine: SyncEngine,
}

/// Open both stores under the application home directory, run migrations,
/// and wire the sync engine against the given remote folder endpoint.
///
/// Sync credentials are looked up in `<home>/credentials/`; when absent the
/// engine reports `is_enabled() == false` and `start()` is a no-op.
pub async fn initialize(home_dir: &Path, remote_base_url: &str) -> ServiceResult<App> {
    let main_pool = database::open_main_store(home_dir).await?;
    let local_pool = database::open_local_store(home_dir).await?;

    let credentials = DriveCredentials::load(&home_dir.join("credentials"));
    let enabled = credentials.is_some();
    let tokens = Arc::new(TokenProvider::new(
        SqliteDriveTokenRepository::new(local_pool.clone()),
        credentials,
    ));
    let remote = Arc::new(DriveRemoteStore::new(remote_base_url, tokens));
    let probe = Arc::new(HttpNetworkProbe::new(remote_base_url));

    let engine = SyncEngine::new(
        main_pool.clone(),
        local_pool.clone(),
        home_dir.join(database::MAIN_DB_NAME),
        remote,
        probe,
        enabled,
        None,
    );
    let journal = engine.journal();

    Ok(App {
        config: SqliteConfigRepository::new(main_pool.clone(), Some(journal.clone())),
        pages: SqlitePageRepository::new(main_pool.clone(), Some(journal.clone())),
        caches: SqliteCacheRepository::new(main_pool.clone(), Some(journal)),
        main_pool,
        local_pool,
        engine,
    })
}
