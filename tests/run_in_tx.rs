use anyhow::Result;
use futures::FutureExt;
use tempfile::tempdir;

use hearthkeep_lib::db::{open_sqlite_pool, run_in_tx};

#[path = "util.rs"]
mod util;

async fn parents_and_children(pool: &sqlx::SqlitePool) -> Result<()> {
    sqlx::query("CREATE TABLE parents (id TEXT PRIMARY KEY)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE TABLE children (id TEXT PRIMARY KEY, parent_id TEXT NOT NULL REFERENCES parents(id))",
    )
    .execute(pool)
    .await?;
    sqlx::query("INSERT INTO parents (id) VALUES ('p1')")
        .execute(pool)
        .await?;
    Ok(())
}

#[tokio::test]
async fn rolls_back_on_foreign_key_violation() -> Result<()> {
    let dir = tempdir()?;
    let pool = open_sqlite_pool(&dir.path().join("tx.sqlite3")).await?;
    parents_and_children(&pool).await?;

    let res = run_in_tx(&pool, |tx| {
        async move {
            sqlx::query("INSERT INTO children (id, parent_id) VALUES ('c1', 'p1')")
                .execute(&mut **tx)
                .await?;
            sqlx::query("INSERT INTO children (id, parent_id) VALUES ('c2', 'nope')")
                .execute(&mut **tx)
                .await?;
            Ok::<_, sqlx::Error>(())
        }
        .boxed()
    })
    .await;

    assert!(res.is_err());
    assert_eq!(util::row_count(&pool, "children").await, 0);
    Ok(())
}

#[tokio::test]
async fn commits_and_returns_value() -> Result<()> {
    let dir = tempdir()?;
    let pool = open_sqlite_pool(&dir.path().join("tx.sqlite3")).await?;
    parents_and_children(&pool).await?;

    let inserted = run_in_tx(&pool, |tx| {
        async move {
            let res = sqlx::query("INSERT INTO children (id, parent_id) VALUES ('c1', 'p1')")
                .execute(&mut **tx)
                .await?;
            Ok::<_, sqlx::Error>(res.rows_affected())
        }
        .boxed()
    })
    .await?;

    assert_eq!(inserted, 1);
    assert_eq!(util::row_count(&pool, "children").await, 1);
    Ok(())
}

#[derive(Debug)]
enum StepError {
    Sql(sqlx::Error),
    Refused,
}

impl From<sqlx::Error> for StepError {
    fn from(err: sqlx::Error) -> Self {
        StepError::Sql(err)
    }
}

#[tokio::test]
async fn caller_error_after_write_rolls_back() -> Result<()> {
    let pool = util::temp_pool().await;
    parents_and_children(&pool).await?;

    let res = run_in_tx(&pool, |tx| {
        async move {
            sqlx::query("INSERT INTO children (id, parent_id) VALUES ('c1', 'p1')")
                .execute(&mut **tx)
                .await?;
            Err::<(), _>(StepError::Refused)
        }
        .boxed()
    })
    .await;

    assert!(matches!(res, Err(StepError::Refused)));
    assert!(!matches!(res, Err(StepError::Sql(_))));
    assert_eq!(util::row_count(&pool, "children").await, 0);
    Ok(())
}
