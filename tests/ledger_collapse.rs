#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeMap;

use proptest::prelude::*;
use serde_json::json;

use hearthkeep_lib::{ledger::Operation, live::ChangeBus, Mutator, Record};

#[path = "util.rs"]
mod util;
use util::{fields, ledger_entries, temp_pool};

#[derive(Debug, Clone)]
enum Step {
    Write { id: usize, n: i64 },
    Delete { id: usize },
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => (0usize..3, any::<i64>()).prop_map(|(id, n)| Step::Write { id, n }),
        1 => (0usize..3).prop_map(|id| Step::Delete { id }),
    ]
}

/// What the ledger should hold for one record after a run of writes.
#[derive(Debug, Default)]
struct Expected {
    exists: bool,
    operation: Option<Operation>,
    n: Option<i64>,
}

async fn run(steps: Vec<Step>) {
    let pool = temp_pool().await;
    let m = Mutator::new(pool.clone(), ChangeBus::new(pool));
    let mut model: BTreeMap<String, Expected> = BTreeMap::new();

    for step in steps {
        match step {
            Step::Write { id, n } => {
                let id = format!("t{id}");
                let expected = model.entry(id.clone()).or_default();
                if expected.exists {
                    m.update_with_sync("tasks", &id, fields(json!({ "n": n })))
                        .await
                        .unwrap();
                    if expected.operation != Some(Operation::Create) {
                        expected.operation = Some(Operation::Update);
                    }
                } else {
                    m.create_with_sync("tasks", Record::new(id.clone(), fields(json!({ "n": n }))))
                        .await
                        .unwrap();
                    expected.exists = true;
                    expected.operation = Some(Operation::Create);
                }
                expected.n = Some(n);
            }
            Step::Delete { id } => {
                let id = format!("t{id}");
                let deleted = m.delete_with_sync("tasks", &id).await.unwrap();
                let expected = model.entry(id).or_default();
                assert_eq!(deleted, expected.exists);
                if deleted {
                    expected.exists = false;
                    expected.operation = Some(Operation::Delete);
                }
            }
        }
    }

    let entries = ledger_entries(m.pool()).await;
    let touched: Vec<(&String, &Expected)> = model
        .iter()
        .filter(|(_, expected)| expected.operation.is_some())
        .collect();
    assert_eq!(entries.len(), touched.len(), "one entry per touched record");

    for (id, expected) in touched {
        let entry = entries
            .iter()
            .find(|e| &e.record_id == id)
            .unwrap_or_else(|| panic!("no ledger entry for {id}"));
        assert_eq!(Some(entry.operation), expected.operation, "operation for {id}");
        assert_eq!(entry.deleted_at.is_some(), !expected.exists);
        assert_eq!(entry.data["n"], json!(expected.n), "snapshot for {id}");

        let stored = m.get("tasks", id).await.unwrap();
        assert_eq!(stored.is_some(), expected.exists);
        if let Some(record) = stored {
            assert_eq!(entry.data, record.to_value());
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn ledger_keeps_one_collapsed_entry_per_record(steps in prop::collection::vec(step(), 1..24)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(run(steps));
    }
}

#[tokio::test]
async fn update_after_create_stays_create() {
    let pool = temp_pool().await;
    let m = Mutator::new(pool.clone(), ChangeBus::new(pool));
    m.create_with_sync("wallets", Record::new("w1", fields(json!({"name": "Cash"}))))
        .await
        .unwrap();
    m.update_with_sync("wallets", "w1", fields(json!({"name": "Petty cash"})))
        .await
        .unwrap();

    let entries = ledger_entries(m.pool()).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].operation, Operation::Create);
    assert_eq!(entries[0].revision, 2);
    assert_eq!(entries[0].data["name"], json!("Petty cash"));
}

#[tokio::test]
async fn delete_overrides_earlier_create() {
    let pool = temp_pool().await;
    let m = Mutator::new(pool.clone(), ChangeBus::new(pool));
    m.create_with_sync("meals", Record::new("m1", fields(json!({"name": "Stew"}))))
        .await
        .unwrap();
    m.delete_with_sync("meals", "m1").await.unwrap();

    let entries = ledger_entries(m.pool()).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].operation, Operation::Delete);
    assert!(entries[0].is_tombstone());
}
