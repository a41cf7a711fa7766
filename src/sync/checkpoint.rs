use sqlx::{Executor, Sqlite};

use crate::store::StoreError;

pub const WATERMARK_KEY: &str = "pull_watermark";
pub const LAST_SYNC_KEY: &str = "last_sync_at";

pub async fn get<'e, E>(exec: E, key: &str) -> Result<Option<String>, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    Ok(
        sqlx::query_scalar("SELECT value FROM sync_checkpoint WHERE key = ?")
            .bind(key)
            .fetch_optional(exec)
            .await?,
    )
}

pub(crate) async fn set<'e, E>(exec: E, key: &str, value: &str, now: i64) -> Result<(), StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO sync_checkpoint (key, value, updated_at) VALUES (?, ?, ?) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
    )
    .bind(key)
    .bind(value)
    .bind(now)
    .execute(exec)
    .await?;
    Ok(())
}

pub async fn watermark<'e, E>(exec: E) -> Result<Option<String>, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    get(exec, WATERMARK_KEY).await
}

/// Epoch ms of the last successful sync.
pub async fn last_sync_at<'e, E>(exec: E) -> Result<Option<i64>, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    Ok(get(exec, LAST_SYNC_KEY)
        .await?
        .and_then(|raw| raw.parse::<i64>().ok()))
}
