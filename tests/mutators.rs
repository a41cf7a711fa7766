#![allow(clippy::unwrap_used, clippy::expect_used)]

use serde_json::json;

use hearthkeep_lib::{
    db::open_sqlite_pool,
    error::{MUTATION_ALREADY_EXISTS, MUTATION_UNKNOWN_TABLE, STORAGE_TRANSACTION},
    ledger::{self, Operation},
    live::ChangeBus,
    migrate::apply_migrations,
    store, AppError, ListOptions, Mutator, Record,
};

#[path = "util.rs"]
mod util;
use util::{fields, ledger_entries, row_count, temp_pool};

async fn mutator() -> Mutator {
    let pool = temp_pool().await;
    Mutator::new(pool.clone(), ChangeBus::new(pool))
}

async fn fail_ledger_writes(m: &Mutator) {
    sqlx::query(
        "CREATE TRIGGER fail_ledger BEFORE INSERT ON sync_ledger \
         BEGIN SELECT RAISE(ABORT, 'injected ledger fault'); END",
    )
    .execute(m.pool())
    .await
    .unwrap();
}

async fn fail_entity_updates(m: &Mutator) {
    sqlx::query(
        "CREATE TRIGGER fail_tasks BEFORE UPDATE ON tasks \
         BEGIN SELECT RAISE(ABORT, 'injected entity fault'); END",
    )
    .execute(m.pool())
    .await
    .unwrap();
}

#[tokio::test]
async fn create_writes_record_and_ledger_together() {
    let m = mutator().await;
    let rec = m
        .create_with_sync("tasks", Record::new("t1", fields(json!({"title": "Buy milk"}))))
        .await
        .unwrap();
    assert!(rec.created_at > 0);
    assert_eq!(rec.created_at, rec.updated_at);

    let entries = ledger_entries(m.pool()).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].table_name, "tasks");
    assert_eq!(entries[0].record_id, "t1");
    assert_eq!(entries[0].operation, Operation::Create);
    assert_eq!(entries[0].data["title"], json!("Buy milk"));
    assert!(entries[0].deleted_at.is_none());
}

#[tokio::test]
async fn failed_ledger_write_rolls_back_create() {
    let m = mutator().await;
    fail_ledger_writes(&m).await;
    let revision = m.bus().revision();

    let err = m
        .create_with_sync("tasks", Record::new("t1", fields(json!({"title": "x"}))))
        .await
        .unwrap_err();

    assert_eq!(err.code(), STORAGE_TRANSACTION);
    assert!(err.cause().is_some());
    assert_eq!(row_count(m.pool(), "tasks").await, 0);
    assert!(ledger_entries(m.pool()).await.is_empty());
    assert_eq!(m.bus().revision(), revision, "no notification for a rolled back write");
}

#[tokio::test]
async fn failed_ledger_write_rolls_back_update_and_delete() {
    let m = mutator().await;
    m.create_with_sync("tasks", Record::new("t1", fields(json!({"title": "before"}))))
        .await
        .unwrap();
    let before = ledger_entries(m.pool()).await;
    fail_ledger_writes(&m).await;

    let err = m
        .update_with_sync("tasks", "t1", fields(json!({"title": "after"})))
        .await
        .unwrap_err();
    assert_eq!(err.code(), STORAGE_TRANSACTION);
    let stored = m.get("tasks", "t1").await.unwrap().unwrap();
    assert_eq!(stored.get("title"), Some(&json!("before")));

    let err = m.delete_with_sync("tasks", "t1").await.unwrap_err();
    assert_eq!(err.code(), STORAGE_TRANSACTION);
    assert!(m.get("tasks", "t1").await.unwrap().is_some());

    assert_eq!(ledger_entries(m.pool()).await, before);
}

#[tokio::test]
async fn failed_entity_write_leaves_ledger_untouched() {
    let m = mutator().await;
    m.create_with_sync("tasks", Record::new("t1", fields(json!({"title": "before"}))))
        .await
        .unwrap();
    let before = ledger_entries(m.pool()).await;
    fail_entity_updates(&m).await;

    let err = m
        .update_with_sync("tasks", "t1", fields(json!({"title": "after"})))
        .await
        .unwrap_err();
    assert_eq!(err.code(), STORAGE_TRANSACTION);
    assert_eq!(ledger_entries(m.pool()).await, before);
}

#[tokio::test]
async fn delete_twice_is_a_noop_the_second_time() {
    let m = mutator().await;
    m.create_with_sync("meals", Record::new("m1", fields(json!({"name": "Soup"}))))
        .await
        .unwrap();

    assert!(m.delete_with_sync("meals", "m1").await.unwrap());
    let after_first = ledger_entries(m.pool()).await;
    let revision = m.bus().revision();

    assert!(!m.delete_with_sync("meals", "m1").await.unwrap());
    assert_eq!(ledger_entries(m.pool()).await, after_first);
    assert_eq!(m.bus().revision(), revision);
    assert_eq!(row_count(m.pool(), "meals").await, 0);
}

#[tokio::test]
async fn delete_of_never_existing_id_writes_nothing() {
    let m = mutator().await;
    assert!(!m.delete_with_sync("wallets", "wallet-missing").await.unwrap());
    assert!(ledger_entries(m.pool()).await.is_empty());
}

#[tokio::test]
async fn delete_keeps_last_snapshot_in_tombstone() {
    let m = mutator().await;
    m.create_with_sync("tasks", Record::new("t1", fields(json!({"title": "Buy milk"}))))
        .await
        .unwrap();
    m.delete_with_sync("tasks", "t1").await.unwrap();

    let entry = ledger::get(m.pool(), "tasks", "t1").await.unwrap().unwrap();
    assert_eq!(entry.operation, Operation::Delete);
    assert!(entry.deleted_at.is_some());
    assert_eq!(entry.data["title"], json!("Buy milk"));
}

#[tokio::test]
async fn duplicate_create_is_rejected() {
    let m = mutator().await;
    m.create_with_sync("tasks", Record::new("t1", Default::default()))
        .await
        .unwrap();
    let err = m
        .create_with_sync("tasks", Record::new("t1", Default::default()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), MUTATION_ALREADY_EXISTS);
    assert_eq!(ledger_entries(m.pool()).await.len(), 1);
}

#[tokio::test]
async fn unknown_table_fails_before_storage() {
    let m = mutator().await;
    let err = m
        .create_with_sync("users", Record::new("u1", Default::default()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), MUTATION_UNKNOWN_TABLE);
    let err = m.delete_with_sync("users", "u1").await.unwrap_err();
    assert_eq!(err.code(), MUTATION_UNKNOWN_TABLE);
}

#[tokio::test]
async fn active_only_hides_inactive_records() {
    let m = mutator().await;
    for (id, active) in [("c1", json!(true)), ("c2", json!(false)), ("c3", json!(null))] {
        m.create_with_sync(
            "categories",
            Record::new(id, fields(json!({"name": id, "is_active": active}))),
        )
        .await
        .unwrap();
    }
    let all = m.list("categories", &ListOptions::default()).await.unwrap();
    assert_eq!(all.len(), 3);

    let options = ListOptions {
        active_only: true,
        order_by: Some("id desc".into()),
        ..ListOptions::default()
    };
    let visible: Vec<String> = m
        .list("categories", &options)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(visible, vec!["c3".to_string(), "c1".to_string()]);
    assert_eq!(store::count(m.pool(), "categories").await.unwrap(), 3);
}

#[tokio::test]
async fn live_query_sees_removal_and_tombstone_in_one_revision() {
    let m = mutator().await;
    m.create_with_sync("tasks", Record::new("t1", Default::default()))
        .await
        .unwrap();

    let mut query = m.bus().live_query(&["tasks", ledger::LEDGER_TABLE], |pool| async move {
        let tasks = store::count(&pool, "tasks").await?;
        let tombstones: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sync_ledger WHERE deleted_at IS NOT NULL")
                .fetch_one(&pool)
                .await?;
        Ok::<_, AppError>((tasks, tombstones))
    });
    assert_eq!(query.ready().await, Some((1, 0)));

    m.delete_with_sync("tasks", "t1").await.unwrap();
    let snapshot = query.snapshot();
    assert_eq!(snapshot.value, Some((0, 1)));
    assert_eq!(snapshot.revision, m.bus().revision());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writes_on_a_file_database_all_land() {
    let dir = tempfile::tempdir().unwrap();
    let pool = open_sqlite_pool(&dir.path().join("hearthkeep.sqlite3"))
        .await
        .unwrap();
    apply_migrations(&pool).await.unwrap();
    let m = Mutator::new(pool.clone(), ChangeBus::new(pool));

    for i in 0..16 {
        m.create_with_sync("tasks", Record::new(format!("t{i}"), fields(json!({"n": 0}))))
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for round in 1..=5 {
        for i in 0..16 {
            let m = m.clone();
            handles.push(tokio::spawn(async move {
                m.update_with_sync("tasks", &format!("t{i}"), fields(json!({ "round": round })))
                    .await
            }));
        }
    }
    let mut failures = Vec::new();
    for handle in handles {
        if let Err(err) = handle.await.unwrap() {
            failures.push(format!("{} / {:?}", err.code(), err.cause()));
        }
    }
    assert!(failures.is_empty(), "{} writes failed: {failures:?}", failures.len());

    let entries = ledger_entries(m.pool()).await;
    assert_eq!(entries.len(), 16);
    for entry in &entries {
        assert_eq!(entry.operation, Operation::Create);
        assert_eq!(entry.revision, 6, "{}", entry.record_id);
        assert!(entry.data.get("round").is_some());
    }
    assert_eq!(row_count(m.pool(), "tasks").await, 16);
}
