//! Sync metadata ledger: at most one outstanding entry per
//! `(table_name, record_id)`, holding the full snapshot of the last local
//! write. Entries leave the ledger only when the remote acknowledges the
//! exact revision that was pushed.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{sqlite::SqliteRow, Executor, Row, Sqlite, SqliteConnection};
use ts_rs::TS;

use crate::store::StoreError;

/// Name published on the change bus whenever outstanding entries change.
pub const LEDGER_TABLE: &str = "sync_ledger";

/// Rejections in a row after which an entry counts as stalled.
pub const STALLED_AFTER_ATTEMPTS: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(StoreError::InvalidPayload(format!(
                "unknown ledger operation {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub table_name: String,
    pub record_id: String,
    pub data: Value,
    pub operation: Operation,
    pub revision: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
    pub attempts: i64,
    pub last_error: Option<String>,
}

impl LedgerEntry {
    pub fn is_tombstone(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Result of clearing an entry after the remote acknowledged a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The acknowledged revision was current; the entry is gone.
    Cleared,
    /// A newer local write landed while the push was in flight; the entry
    /// stays outstanding (a pending `create` becomes `update`).
    Superseded,
}

const ENTRY_COLUMNS: &str = "table_name, record_id, data, operation, revision, created_at, \
                             updated_at, deleted_at, attempts, last_error";

fn row_to_entry(row: SqliteRow) -> Result<LedgerEntry, StoreError> {
    let data: String = row.try_get("data")?;
    let operation: String = row.try_get("operation")?;
    Ok(LedgerEntry {
        table_name: row.try_get("table_name")?,
        record_id: row.try_get("record_id")?,
        data: serde_json::from_str(&data)?,
        operation: operation.parse()?,
        revision: row.try_get("revision")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        deleted_at: row.try_get("deleted_at")?,
        attempts: row.try_get("attempts")?,
        last_error: row.try_get("last_error")?,
    })
}

pub async fn get<'e, E>(
    exec: E,
    table: &str,
    record_id: &str,
) -> Result<Option<LedgerEntry>, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "SELECT {ENTRY_COLUMNS} FROM sync_ledger WHERE table_name = ? AND record_id = ?"
    );
    let row = sqlx::query(&sql)
        .bind(table)
        .bind(record_id)
        .fetch_optional(exec)
        .await?;
    row.map(row_to_entry).transpose()
}

/// Upsert the entry for a local write. `operation` is the kind of write
/// that just happened; the stored operation follows the collapse rules:
/// an un-acknowledged `create` stays `create` across later updates, a
/// delete always wins.
pub(crate) async fn record_write(
    conn: &mut SqliteConnection,
    table: &str,
    record_id: &str,
    snapshot: &Value,
    operation: Operation,
    now: i64,
) -> Result<LedgerEntry, StoreError> {
    let existing = get(&mut *conn, table, record_id).await?;
    let stored_op = match (operation, existing.as_ref().map(|e| e.operation)) {
        (Operation::Update, Some(Operation::Create)) => Operation::Create,
        (op, _) => op,
    };
    let deleted_at = (stored_op == Operation::Delete).then_some(now);

    sqlx::query(
        "INSERT INTO sync_ledger (table_name, record_id, data, operation, revision, \
                                  created_at, updated_at, deleted_at, attempts, last_error) \
         VALUES (?, ?, ?, ?, 1, ?, ?, ?, 0, NULL) \
         ON CONFLICT(table_name, record_id) DO UPDATE SET \
           data = excluded.data, \
           operation = excluded.operation, \
           revision = sync_ledger.revision + 1, \
           updated_at = excluded.updated_at, \
           deleted_at = excluded.deleted_at, \
           attempts = 0, \
           last_error = NULL",
    )
    .bind(table)
    .bind(record_id)
    .bind(snapshot.to_string())
    .bind(stored_op.as_str())
    .bind(now)
    .bind(now)
    .bind(deleted_at)
    .execute(&mut *conn)
    .await?;

    get(&mut *conn, table, record_id)
        .await?
        .ok_or_else(|| StoreError::NotFound {
            table: "sync_ledger".into(),
            id: format!("{table}/{record_id}"),
        })
}

/// Every outstanding entry, oldest write first.
pub async fn outstanding<'e, E>(exec: E) -> Result<Vec<LedgerEntry>, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "SELECT {ENTRY_COLUMNS} FROM sync_ledger ORDER BY updated_at, table_name, record_id"
    );
    let rows = sqlx::query(&sql).fetch_all(exec).await?;
    rows.into_iter().map(row_to_entry).collect()
}

pub async fn outstanding_by_table<'e, E>(
    exec: E,
) -> Result<BTreeMap<String, Vec<LedgerEntry>>, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let mut grouped: BTreeMap<String, Vec<LedgerEntry>> = BTreeMap::new();
    for entry in outstanding(exec).await? {
        grouped.entry(entry.table_name.clone()).or_default().push(entry);
    }
    Ok(grouped)
}

pub async fn pending_count<'e, E>(exec: E) -> Result<i64, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM sync_ledger")
        .fetch_one(exec)
        .await?)
}

pub(crate) async fn acknowledge(
    conn: &mut SqliteConnection,
    table: &str,
    record_id: &str,
    revision: i64,
) -> Result<AckOutcome, StoreError> {
    let res = sqlx::query(
        "DELETE FROM sync_ledger WHERE table_name = ? AND record_id = ? AND revision = ?",
    )
    .bind(table)
    .bind(record_id)
    .bind(revision)
    .execute(&mut *conn)
    .await?;

    if res.rows_affected() > 0 {
        sqlx::query("DELETE FROM sync_deferred WHERE table_name = ? AND record_id = ?")
            .bind(table)
            .bind(record_id)
            .execute(&mut *conn)
            .await?;
        return Ok(AckOutcome::Cleared);
    }

    // The remote now knows the record, so the newer write must not be sent
    // as a second create.
    sqlx::query(
        "UPDATE sync_ledger SET operation = 'update' \
         WHERE table_name = ? AND record_id = ? AND operation = 'create'",
    )
    .bind(table)
    .bind(record_id)
    .execute(&mut *conn)
    .await?;
    Ok(AckOutcome::Superseded)
}

/// Count a failed push; returns the entry's attempts so far, or `None` when
/// the entry is gone.
pub(crate) async fn record_rejection<'e, E>(
    exec: E,
    table: &str,
    record_id: &str,
    reason: &str,
) -> Result<Option<i64>, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let attempts = sqlx::query_scalar(
        "UPDATE sync_ledger SET attempts = attempts + 1, last_error = ? \
         WHERE table_name = ? AND record_id = ? \
         RETURNING attempts",
    )
    .bind(reason)
    .bind(table)
    .bind(record_id)
    .fetch_optional(exec)
    .await?;
    Ok(attempts)
}

/// Entries the remote has refused at least [`STALLED_AFTER_ATTEMPTS`] times.
pub async fn stalled_count<'e, E>(exec: E) -> Result<i64, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    Ok(
        sqlx::query_scalar("SELECT COUNT(*) FROM sync_ledger WHERE attempts >= ?")
            .bind(STALLED_AFTER_ATTEMPTS)
            .fetch_one(exec)
            .await?,
    )
}

/// A remote change held back because the record has an outstanding local write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredChange {
    pub table_name: String,
    pub record_id: String,
    pub operation: Operation,
    pub data: Value,
    pub remote_updated_at: i64,
    pub received_at: i64,
}

/// Keep only the newest deferred change per record.
pub(crate) async fn defer<'e, E>(exec: E, change: &DeferredChange) -> Result<(), StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO sync_deferred (table_name, record_id, operation, data, \
                                    remote_updated_at, received_at) \
         VALUES (?, ?, ?, ?, ?, ?) \
         ON CONFLICT(table_name, record_id) DO UPDATE SET \
           operation = excluded.operation, \
           data = excluded.data, \
           remote_updated_at = excluded.remote_updated_at, \
           received_at = excluded.received_at \
         WHERE excluded.remote_updated_at >= sync_deferred.remote_updated_at",
    )
    .bind(&change.table_name)
    .bind(&change.record_id)
    .bind(change.operation.as_str())
    .bind(change.data.to_string())
    .bind(change.remote_updated_at)
    .bind(change.received_at)
    .execute(exec)
    .await?;
    Ok(())
}

pub async fn deferred<'e, E>(exec: E) -> Result<Vec<DeferredChange>, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(
        "SELECT table_name, record_id, operation, data, remote_updated_at, received_at \
         FROM sync_deferred ORDER BY received_at, table_name, record_id",
    )
    .fetch_all(exec)
    .await?;
    rows.into_iter()
        .map(|row| -> Result<DeferredChange, StoreError> {
            let operation: String = row.try_get("operation")?;
            let data: String = row.try_get("data")?;
            Ok(DeferredChange {
                table_name: row.try_get("table_name")?,
                record_id: row.try_get("record_id")?,
                operation: operation.parse()?,
                data: serde_json::from_str(&data)?,
                remote_updated_at: row.try_get("remote_updated_at")?,
                received_at: row.try_get("received_at")?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db::open_memory_pool, migrate::apply_migrations};
    use serde_json::json;

    async fn pool() -> sqlx::SqlitePool {
        let pool = open_memory_pool().await.expect("pool");
        apply_migrations(&pool).await.expect("migrations");
        pool
    }

    #[tokio::test]
    async fn create_then_update_stays_create() {
        let pool = pool().await;
        let mut conn = pool.acquire().await.unwrap();
        record_write(&mut conn, "tasks", "t1", &json!({"v": 1}), Operation::Create, 10)
            .await
            .unwrap();
        let entry = record_write(&mut conn, "tasks", "t1", &json!({"v": 2}), Operation::Update, 20)
            .await
            .unwrap();
        assert_eq!(entry.operation, Operation::Create);
        assert_eq!(entry.revision, 2);
        assert_eq!(entry.created_at, 10);
        assert_eq!(entry.updated_at, 20);
        assert_eq!(entry.data, json!({"v": 2}));
        assert_eq!(pending_count(&mut *conn).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_sets_tombstone() {
        let pool = pool().await;
        let mut conn = pool.acquire().await.unwrap();
        record_write(&mut conn, "tasks", "t1", &json!({}), Operation::Create, 10)
            .await
            .unwrap();
        let entry = record_write(&mut conn, "tasks", "t1", &json!({}), Operation::Delete, 30)
            .await
            .unwrap();
        assert_eq!(entry.operation, Operation::Delete);
        assert_eq!(entry.deleted_at, Some(30));
        assert!(entry.is_tombstone());
    }

    #[tokio::test]
    async fn stale_ack_keeps_newer_write_as_update() {
        let pool = pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let pushed = record_write(&mut conn, "tasks", "t1", &json!({"v": 1}), Operation::Create, 10)
            .await
            .unwrap();
        record_write(&mut conn, "tasks", "t1", &json!({"v": 2}), Operation::Update, 20)
            .await
            .unwrap();

        let outcome = acknowledge(&mut conn, "tasks", "t1", pushed.revision)
            .await
            .unwrap();
        assert_eq!(outcome, AckOutcome::Superseded);
        let entry = get(&mut *conn, "tasks", "t1").await.unwrap().unwrap();
        assert_eq!(entry.operation, Operation::Update);
        assert_eq!(entry.data, json!({"v": 2}));

        let outcome = acknowledge(&mut conn, "tasks", "t1", entry.revision)
            .await
            .unwrap();
        assert_eq!(outcome, AckOutcome::Cleared);
        assert!(get(&mut *conn, "tasks", "t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejection_is_counted_and_cleared_by_next_write() {
        let pool = pool().await;
        let mut conn = pool.acquire().await.unwrap();
        record_write(&mut conn, "meals", "m1", &json!({}), Operation::Create, 10)
            .await
            .unwrap();
        let attempts = record_rejection(&mut *conn, "meals", "m1", "quota").await.unwrap();
        assert_eq!(attempts, Some(1));
        let entry = get(&mut *conn, "meals", "m1").await.unwrap().unwrap();
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.last_error.as_deref(), Some("quota"));
        assert_eq!(
            record_rejection(&mut *conn, "meals", "gone", "quota").await.unwrap(),
            None
        );

        let entry = record_write(&mut conn, "meals", "m1", &json!({"x": 1}), Operation::Update, 11)
            .await
            .unwrap();
        assert_eq!(entry.attempts, 0);
        assert!(entry.last_error.is_none());
    }

    #[tokio::test]
    async fn repeated_rejections_mark_entry_stalled() {
        let pool = pool().await;
        let mut conn = pool.acquire().await.unwrap();
        for id in ["m1", "m2"] {
            record_write(&mut conn, "meals", id, &json!({}), Operation::Create, 10)
                .await
                .unwrap();
        }
        for _ in 1..STALLED_AFTER_ATTEMPTS {
            record_rejection(&mut *conn, "meals", "m1", "quota").await.unwrap();
        }
        assert_eq!(stalled_count(&mut *conn).await.unwrap(), 0);

        record_rejection(&mut *conn, "meals", "m1", "quota").await.unwrap();
        record_rejection(&mut *conn, "meals", "m2", "quota").await.unwrap();
        assert_eq!(stalled_count(&mut *conn).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn deferred_keeps_newest_remote_change() {
        let pool = pool().await;
        let change = |at: i64, v: i64| DeferredChange {
            table_name: "tasks".into(),
            record_id: "t1".into(),
            operation: Operation::Update,
            data: json!({"v": v}),
            remote_updated_at: at,
            received_at: at,
        };
        defer(&pool, &change(20, 2)).await.unwrap();
        defer(&pool, &change(10, 1)).await.unwrap();
        let rows = deferred(&pool).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].data, json!({"v": 2}));
    }

    #[test]
    fn operation_round_trips_through_text() {
        for op in [Operation::Create, Operation::Update, Operation::Delete] {
            assert_eq!(op.as_str().parse::<Operation>().unwrap(), op);
        }
        assert!("upsert".parse::<Operation>().is_err());
    }
}
