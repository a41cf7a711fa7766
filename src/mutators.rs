//! Change-aware mutators: the only write path into the record store.
//!
//! Each call writes the entity and its ledger entry in one transaction, then
//! publishes the touched tables so live queries see the write before the
//! call returns.

use futures::FutureExt;
use serde_json::{json, Map, Value};
use sqlx::SqlitePool;

use crate::{
    db,
    ledger::{self, Operation, LEDGER_TABLE},
    live::ChangeBus,
    op_logging::LogScope,
    store::{self, ListOptions, Record, StoreError},
    sync::SyncStateHandle,
    time::now_ms,
    AppResult,
};

#[derive(Clone)]
pub struct Mutator {
    pool: SqlitePool,
    bus: ChangeBus,
    state: Option<SyncStateHandle>,
}

impl Mutator {
    pub fn new(pool: SqlitePool, bus: ChangeBus) -> Self {
        Self {
            pool,
            bus,
            state: None,
        }
    }

    /// Keep `SyncState::pending_changes` current after every write.
    pub fn with_state(mut self, state: SyncStateHandle) -> Self {
        self.state = Some(state);
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn bus(&self) -> &ChangeBus {
        &self.bus
    }

    pub async fn create_with_sync(&self, table: &str, record: Record) -> AppResult<Record> {
        let scope = LogScope::new("create_with_sync", Some(table), Some(&record.id));
        let result = self.create_inner(table, record).await;
        self.finish(&scope, result, |rec| json!({ "updated_at": rec.updated_at }))
    }

    async fn create_inner(&self, table: &str, mut record: Record) -> AppResult<Record> {
        let table = store::ensure_table(table)?;
        let now = now_ms();
        record.fields = store::strip_reserved(record.fields);
        record.created_at = now;
        record.updated_at = now;

        let record = db::run_in_tx(&self.pool, move |tx| {
            async move {
                if store::get(&mut **tx, table, &record.id).await?.is_some() {
                    return Err(StoreError::AlreadyExists {
                        table: table.to_string(),
                        id: record.id.clone(),
                    });
                }
                store::insert(&mut **tx, table, &record).await?;
                ledger::record_write(
                    &mut **tx,
                    table,
                    &record.id,
                    &record.to_value(),
                    Operation::Create,
                    now,
                )
                .await?;
                Ok::<_, StoreError>(record)
            }
            .boxed()
        })
        .await?;

        self.after_commit(table).await;
        Ok(record)
    }

    /// Shallow merge of `patch` into the stored record. `null` values are
    /// stored as `null`, not removed.
    pub async fn update_with_sync(
        &self,
        table: &str,
        id: &str,
        patch: Map<String, Value>,
    ) -> AppResult<Record> {
        let scope = LogScope::new("update_with_sync", Some(table), Some(id));
        let result = self.update_inner(table, id, patch).await;
        self.finish(&scope, result, |rec| json!({ "updated_at": rec.updated_at }))
    }

    async fn update_inner(
        &self,
        table: &str,
        id: &str,
        patch: Map<String, Value>,
    ) -> AppResult<Record> {
        let table = store::ensure_table(table)?;
        let id = id.to_string();
        let now = now_ms();

        let record = db::run_in_tx(&self.pool, move |tx| {
            async move {
                let Some(mut record) = store::get(&mut **tx, table, &id).await? else {
                    return Err(StoreError::NotFound {
                        table: table.to_string(),
                        id,
                    });
                };
                record.apply_patch(patch);
                // never move backwards if the wall clock does
                record.updated_at = now.max(record.updated_at);
                store::replace(&mut **tx, table, &record).await?;
                ledger::record_write(
                    &mut **tx,
                    table,
                    &record.id,
                    &record.to_value(),
                    Operation::Update,
                    record.updated_at,
                )
                .await?;
                Ok::<_, StoreError>(record)
            }
            .boxed()
        })
        .await?;

        self.after_commit(table).await;
        Ok(record)
    }

    /// Returns `false` without writing anything when `id` is already gone.
    pub async fn delete_with_sync(&self, table: &str, id: &str) -> AppResult<bool> {
        let scope = LogScope::new("delete_with_sync", Some(table), Some(id));
        let result = self.delete_inner(table, id).await;
        self.finish(&scope, result, |deleted| json!({ "deleted": deleted }))
    }

    async fn delete_inner(&self, table: &str, id: &str) -> AppResult<bool> {
        let table = store::ensure_table(table)?;
        let id = id.to_string();
        let now = now_ms();

        let deleted = db::run_in_tx(&self.pool, move |tx| {
            async move {
                let Some(record) = store::get(&mut **tx, table, &id).await? else {
                    return Ok(false);
                };
                store::remove(&mut **tx, table, &id).await?;
                ledger::record_write(
                    &mut **tx,
                    table,
                    &id,
                    &record.to_value(),
                    Operation::Delete,
                    now,
                )
                .await?;
                Ok::<_, StoreError>(true)
            }
            .boxed()
        })
        .await?;

        if deleted {
            self.after_commit(table).await;
        }
        Ok(deleted)
    }

    pub async fn get(&self, table: &str, id: &str) -> AppResult<Option<Record>> {
        Ok(store::get(&self.pool, table, id).await?)
    }

    pub async fn list(&self, table: &str, options: &ListOptions) -> AppResult<Vec<Record>> {
        Ok(store::list(&self.pool, table, options).await?)
    }

    async fn after_commit(&self, table: &'static str) {
        self.bus.publish(&[table, LEDGER_TABLE]).await;
        if let Some(state) = &self.state {
            state.refresh_pending(&self.pool).await;
        }
    }

    fn finish<T>(
        &self,
        scope: &LogScope,
        result: AppResult<T>,
        details: impl FnOnce(&T) -> Value,
    ) -> AppResult<T> {
        match &result {
            Ok(value) => scope.success(details(value)),
            Err(err) => scope.fail(err),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db::open_memory_pool, error::MUTATION_NOT_FOUND, migrate::apply_migrations};

    async fn mutator() -> Mutator {
        let pool = open_memory_pool().await.expect("pool");
        apply_migrations(&pool).await.expect("migrations");
        let bus = ChangeBus::new(pool.clone());
        Mutator::new(pool, bus)
    }

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn patch_keeps_nulls_and_ignores_id() {
        let m = mutator().await;
        m.create_with_sync("tasks", Record::new("t1", fields(json!({"title": "a", "due": 1}))))
            .await
            .unwrap();
        let rec = m
            .update_with_sync("tasks", "t1", fields(json!({"due": null, "id": "t2"})))
            .await
            .unwrap();
        assert_eq!(rec.id, "t1");
        assert_eq!(rec.get("due"), Some(&Value::Null));
        assert_eq!(rec.get("title"), Some(&json!("a")));
    }

    #[tokio::test]
    async fn update_of_missing_record_is_not_found() {
        let m = mutator().await;
        let err = m
            .update_with_sync("tasks", "nope", Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), MUTATION_NOT_FOUND);
        assert_eq!(ledger::pending_count(m.pool()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn publish_reaches_change_feed() {
        let m = mutator().await;
        let mut feed = m.bus().subscribe_changes();
        m.create_with_sync("meals", Record::new("m1", Map::new()))
            .await
            .unwrap();
        let change = feed.recv().await.unwrap();
        assert_eq!(change.tables, vec!["meals".to_string(), LEDGER_TABLE.to_string()]);
    }
}
