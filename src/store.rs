//! Local record store: one SQLite table per entity, domain fields kept as a
//! JSON object next to the lifecycle timestamps.
//!
//! Write functions are crate-private; application code mutates through
//! [`crate::mutators::Mutator`] so that every change reaches the ledger.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::{sqlite::SqliteRow, Executor, Row, Sqlite};
use thiserror::Error;

use crate::{
    error::{
        MUTATION_ALREADY_EXISTS, MUTATION_INVALID_PAYLOAD, MUTATION_NOT_FOUND,
        MUTATION_UNKNOWN_TABLE, STORAGE_TRANSACTION,
    },
    id::new_record_id,
    AppError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSpec {
    pub name: &'static str,
    pub id_prefix: &'static str,
}

pub const TABLES: &[TableSpec] = &[
    TableSpec { name: "tasks", id_prefix: "task" },
    TableSpec { name: "meals", id_prefix: "meal" },
    TableSpec { name: "maintenance_items", id_prefix: "maint" },
    TableSpec { name: "wallets", id_prefix: "wallet" },
    TableSpec { name: "transactions", id_prefix: "txn" },
    TableSpec { name: "categories", id_prefix: "cat" },
    TableSpec { name: "keto_entries", id_prefix: "keto" },
    TableSpec { name: "shopping_items", id_prefix: "shop" },
];

/// Keys owned by the store; patches and payloads cannot set them.
const RESERVED_KEYS: &[&str] = &["id", "created_at", "updated_at"];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("record {id} not found in {table}")]
    NotFound { table: String, id: String },
    #[error("record {id} already exists in {table}")]
    AlreadyExists { table: String, id: String },
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<StoreError> for AppError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::UnknownTable(table) => {
                AppError::new(MUTATION_UNKNOWN_TABLE, "Unknown table").with_context("table", table)
            }
            StoreError::NotFound { table, id } => {
                AppError::new(MUTATION_NOT_FOUND, "Record not found")
                    .with_context("table", table)
                    .with_context("id", id)
            }
            StoreError::AlreadyExists { table, id } => {
                AppError::new(MUTATION_ALREADY_EXISTS, "Record already exists")
                    .with_context("table", table)
                    .with_context("id", id)
            }
            StoreError::InvalidPayload(msg) => AppError::new(MUTATION_INVALID_PAYLOAD, msg),
            StoreError::Sqlx(err) => AppError::new(
                STORAGE_TRANSACTION,
                "Local write failed and was rolled back",
            )
            .with_cause(err),
            StoreError::Json(err) => AppError::new(
                STORAGE_TRANSACTION,
                "Local write failed and was rolled back",
            )
            .with_cause(err),
        }
    }
}

pub fn table_spec(table: &str) -> Result<&'static TableSpec, StoreError> {
    TABLES
        .iter()
        .find(|spec| spec.name == table)
        .ok_or_else(|| StoreError::UnknownTable(table.to_string()))
}

pub fn ensure_table(table: &str) -> Result<&'static str, StoreError> {
    table_spec(table).map(|spec| spec.name)
}

pub fn table_names() -> impl Iterator<Item = &'static str> {
    TABLES.iter().map(|spec| spec.name)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

impl Record {
    /// A record with an explicit id; timestamps are assigned on write.
    pub fn new(id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            fields: strip_reserved(fields),
            created_at: 0,
            updated_at: 0,
        }
    }

    /// A record with a fresh, table-prefixed id.
    pub fn generate(table: &str, fields: Map<String, Value>) -> Result<Self, StoreError> {
        let spec = table_spec(table)?;
        Ok(Self::new(new_record_id(spec.id_prefix), fields))
    }

    /// Build from a JSON object such as a pulled snapshot or CLI payload.
    pub fn from_value(value: Value) -> Result<Self, StoreError> {
        match value {
            Value::Object(_) => {
                let record: Record = serde_json::from_value(value)?;
                if record.id.trim().is_empty() {
                    return Err(StoreError::InvalidPayload("record id is empty".into()));
                }
                Ok(record)
            }
            other => Err(StoreError::InvalidPayload(format!(
                "expected a JSON object, got {other}"
            ))),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn to_value(&self) -> Value {
        let mut map = self.fields.clone();
        map.insert("id".into(), Value::String(self.id.clone()));
        map.insert("created_at".into(), Value::from(self.created_at));
        map.insert("updated_at".into(), Value::from(self.updated_at));
        Value::Object(map)
    }

    /// Shallow key-wise merge; reserved keys in the patch are ignored.
    pub fn apply_patch(&mut self, patch: Map<String, Value>) {
        for (key, value) in strip_reserved(patch) {
            self.fields.insert(key, value);
        }
    }
}

pub(crate) fn strip_reserved(mut fields: Map<String, Value>) -> Map<String, Value> {
    for key in RESERVED_KEYS {
        fields.remove(*key);
    }
    fields
}

fn row_to_record(row: SqliteRow) -> Result<Record, StoreError> {
    let data: String = row.try_get("data")?;
    let fields = match serde_json::from_str::<Value>(&data)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    Ok(Record {
        id: row.try_get("id")?,
        fields,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// `created_at`, `updated_at` or `id`, optionally followed by `ASC`/`DESC`.
    pub order_by: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    /// Hide records whose domain `is_active` flag is false.
    pub active_only: bool,
}

fn order_clause(order_by: Option<&str>) -> Result<String, StoreError> {
    let Some(raw) = order_by else {
        return Ok("created_at, id".to_string());
    };
    let mut parts = raw.split_whitespace();
    let column = match parts.next().map(str::to_ascii_lowercase).as_deref() {
        Some("created_at") => "created_at",
        Some("updated_at") => "updated_at",
        Some("id") => "id",
        _ => return Err(StoreError::InvalidPayload(format!("cannot order by {raw}"))),
    };
    let direction = match parts.next().map(str::to_ascii_uppercase).as_deref() {
        None | Some("ASC") => "ASC",
        Some("DESC") => "DESC",
        Some(other) => {
            return Err(StoreError::InvalidPayload(format!(
                "unknown sort direction {other}"
            )))
        }
    };
    if parts.next().is_some() {
        return Err(StoreError::InvalidPayload(format!("cannot order by {raw}")));
    }
    Ok(format!("{column} {direction}, id {direction}"))
}

pub async fn get<'e, E>(exec: E, table: &str, id: &str) -> Result<Option<Record>, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let table = ensure_table(table)?;
    let sql = format!("SELECT id, data, created_at, updated_at FROM {table} WHERE id = ?");
    let row = sqlx::query(&sql).bind(id).fetch_optional(exec).await?;
    row.map(row_to_record).transpose()
}

pub async fn list<'e, E>(
    exec: E,
    table: &str,
    options: &ListOptions,
) -> Result<Vec<Record>, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let table = ensure_table(table)?;
    let order = order_clause(options.order_by.as_deref())?;
    let filter = if options.active_only {
        " WHERE COALESCE(json_extract(data, '$.is_active'), 1) != 0"
    } else {
        ""
    };
    let sql = format!(
        "SELECT id, data, created_at, updated_at FROM {table}{filter} ORDER BY {order} LIMIT ? OFFSET ?"
    );
    let rows = sqlx::query(&sql)
        .bind(options.limit.unwrap_or(-1))
        .bind(options.offset.unwrap_or(0))
        .fetch_all(exec)
        .await?;
    rows.into_iter().map(row_to_record).collect()
}

pub async fn count<'e, E>(exec: E, table: &str) -> Result<i64, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let table = ensure_table(table)?;
    let sql = format!("SELECT COUNT(*) FROM {table}");
    Ok(sqlx::query_scalar(&sql).fetch_one(exec).await?)
}

pub(crate) async fn insert<'e, E>(exec: E, table: &str, record: &Record) -> Result<(), StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let table = ensure_table(table)?;
    let sql = format!(
        "INSERT INTO {table} (id, data, created_at, updated_at) VALUES (?, ?, ?, ?)"
    );
    sqlx::query(&sql)
        .bind(&record.id)
        .bind(Value::Object(record.fields.clone()).to_string())
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(exec)
        .await?;
    Ok(())
}

pub(crate) async fn replace<'e, E>(exec: E, table: &str, record: &Record) -> Result<bool, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let table = ensure_table(table)?;
    let sql = format!("UPDATE {table} SET data = ?, updated_at = ? WHERE id = ?");
    let res = sqlx::query(&sql)
        .bind(Value::Object(record.fields.clone()).to_string())
        .bind(record.updated_at)
        .bind(&record.id)
        .execute(exec)
        .await?;
    Ok(res.rows_affected() > 0)
}

/// Insert or overwrite with the given snapshot, timestamps included.
pub(crate) async fn upsert<'e, E>(exec: E, table: &str, record: &Record) -> Result<(), StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let table = ensure_table(table)?;
    let sql = format!(
        "INSERT INTO {table} (id, data, created_at, updated_at) VALUES (?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET data = excluded.data, \
         created_at = excluded.created_at, updated_at = excluded.updated_at"
    );
    sqlx::query(&sql)
        .bind(&record.id)
        .bind(Value::Object(record.fields.clone()).to_string())
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(exec)
        .await?;
    Ok(())
}

pub(crate) async fn remove<'e, E>(exec: E, table: &str, id: &str) -> Result<bool, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let table = ensure_table(table)?;
    let sql = format!("DELETE FROM {table} WHERE id = ?");
    let res = sqlx::query(&sql).bind(id).execute(exec).await?;
    Ok(res.rows_affected() > 0)
}
