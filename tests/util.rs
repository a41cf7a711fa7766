#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use serde_json::{Map, Value};
use sqlx::SqlitePool;

use hearthkeep_lib::{
    config::SyncConfig,
    db::open_memory_pool,
    ledger::{self, LedgerEntry},
    migrate::apply_migrations,
    sync::{MemoryRemote, RemoteEndpoint, SyncOutcome},
    AppState,
};

pub async fn temp_pool() -> SqlitePool {
    let pool = open_memory_pool().await.expect("open sqlite::memory:");
    apply_migrations(&pool).await.expect("apply migrations");
    pool
}

pub fn fields(value: Value) -> Map<String, Value> {
    value.as_object().cloned().expect("object literal")
}

/// Short delays so trigger tests stay fast; debounce stays long enough to
/// observe skips.
pub fn test_sync_config() -> SyncConfig {
    SyncConfig {
        debounce_ms: 60_000,
        trigger_delay_ms: 25,
        push_batch_size: 25,
        interval_secs: 0,
        remote_url: None,
    }
}

/// A local store wired to `remote`, as one device would be.
pub async fn device(remote: &MemoryRemote, config: SyncConfig) -> AppState {
    let remote: Arc<dyn RemoteEndpoint> = Arc::new(remote.clone());
    AppState::from_pool(temp_pool().await, &config, Some(remote))
        .await
        .expect("wire device")
}

pub async fn sync(state: &AppState) -> SyncOutcome {
    state.perform_sync(true, |_| {}).await
}

pub async fn ledger_entries(pool: &SqlitePool) -> Vec<LedgerEntry> {
    ledger::outstanding(pool).await.expect("read ledger")
}

pub async fn row_count(pool: &SqlitePool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(pool)
        .await
        .expect("count rows")
}
