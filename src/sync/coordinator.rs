//! Sync run: migration, collecting, pushing, pulling, applying, complete.
//!
//! Each stage commits before the next starts. Runs are serialized by a lock,
//! so a second caller waits for the first and then re-checks the debounce
//! window. Failures come back in [`SyncOutcome::error`]; work committed by
//! earlier stages or batches stays committed.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use ts_rs::TS;

use super::{
    checkpoint,
    progress::{SyncProgress, SyncStep},
    remote::{PushAck, PushItem, RemoteChange, RemoteEndpoint},
    state::SyncStateHandle,
};
use crate::{
    config::SyncConfig,
    db,
    error::SYNC_MIGRATION,
    ledger::{self, AckOutcome, DeferredChange, LedgerEntry, LEDGER_TABLE},
    live::ChangeBus,
    migrate,
    store::{self, Record, StoreError},
    time::now_ms,
    AppError, AppResult,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct SyncOutcome {
    pub success: bool,
    pub pushed: usize,
    pub pulled: usize,
    pub deferred: usize,
    pub rejected: usize,
    /// The run was skipped because the last sync is recent enough.
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub error: Option<AppError>,
}

impl SyncOutcome {
    fn skipped() -> Self {
        Self {
            success: true,
            skipped: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
struct Tally {
    pushed: usize,
    pulled: usize,
    deferred: usize,
    rejected: usize,
}

#[derive(Debug, Default)]
struct Settled {
    acked: usize,
    rejected: usize,
}

#[derive(Debug, Default)]
struct Applied {
    tables: BTreeSet<&'static str>,
    deferred: usize,
}

pub struct SyncCoordinator {
    pool: SqlitePool,
    bus: ChangeBus,
    remote: Arc<dyn RemoteEndpoint>,
    config: SyncConfig,
    state: SyncStateHandle,
    run_lock: Mutex<()>,
}

impl SyncCoordinator {
    pub fn new(
        pool: SqlitePool,
        bus: ChangeBus,
        remote: Arc<dyn RemoteEndpoint>,
        config: SyncConfig,
    ) -> Self {
        Self {
            pool,
            bus,
            remote,
            config,
            state: SyncStateHandle::default(),
            run_lock: Mutex::new(()),
        }
    }

    /// Share a state handle with the mutators and UI.
    pub fn with_state(mut self, state: SyncStateHandle) -> Self {
        self.state = state;
        self
    }

    pub fn state(&self) -> &SyncStateHandle {
        &self.state
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn perform_sync<P>(&self, force: bool, on_progress: P) -> SyncOutcome
    where
        P: Fn(SyncProgress) + Send + Sync,
    {
        let _running = self.run_lock.lock().await;

        if !force && self.recently_synced().await {
            debug!(target: "hearthkeep", event = "sync_skipped", reason = "debounce");
            return SyncOutcome::skipped();
        }

        self.state.begin();
        let started = Instant::now();
        info!(target: "hearthkeep", event = "sync_started", force);

        let mut tally = Tally::default();
        let result = self.run(&on_progress, &mut tally).await;
        let pending = ledger::pending_count(&self.pool).await.ok();
        if let Ok(stalled) = ledger::stalled_count(&self.pool).await {
            self.state.update(|s| s.stalled_changes = stalled);
        }
        let outcome = SyncOutcome {
            success: result.is_ok(),
            pushed: tally.pushed,
            pulled: tally.pulled,
            deferred: tally.deferred,
            rejected: tally.rejected,
            skipped: false,
            error: result.as_ref().err().cloned(),
        };

        match result {
            Ok(finished_at) => {
                self.state.succeed(finished_at, pending.unwrap_or_default());
                info!(
                    target: "hearthkeep",
                    event = "sync_finished",
                    pushed = outcome.pushed,
                    pulled = outcome.pulled,
                    deferred = outcome.deferred,
                    rejected = outcome.rejected,
                    duration_ms = started.elapsed().as_millis() as u64
                );
            }
            Err(err) => {
                err.log_with_event("sync_failed");
                self.state.fail(&err, pending);
            }
        }
        outcome
    }

    async fn recently_synced(&self) -> bool {
        match checkpoint::last_sync_at(&self.pool).await {
            Ok(Some(last)) => {
                let window = i64::try_from(self.config.debounce_ms).unwrap_or(i64::MAX);
                now_ms().saturating_sub(last) < window
            }
            Ok(None) => false,
            // checkpoint table missing before the first migration
            Err(_) => false,
        }
    }

    async fn run<P>(&self, progress: &P, tally: &mut Tally) -> AppResult<i64>
    where
        P: Fn(SyncProgress) + Send + Sync,
    {
        progress(SyncProgress::started(
            SyncStep::Migration,
            "Checking local schema",
        ));
        let applied = migrate::apply_migrations(&self.pool).await.map_err(|e| {
            AppError::new(SYNC_MIGRATION, "Local schema upgrade failed").with_cause(e)
        })?;
        progress(SyncProgress::finished(
            SyncStep::Migration,
            if applied.is_empty() {
                "Local schema is current".to_string()
            } else {
                format!("Applied {} migrations", applied.len())
            },
        ));

        progress(SyncProgress::started(
            SyncStep::Collecting,
            "Collecting local changes",
        ));
        let entries: Vec<LedgerEntry> = ledger::outstanding_by_table(&self.pool)
            .await?
            .into_values()
            .flatten()
            .collect();
        let total = entries.len() as u64;
        progress(SyncProgress::counted(
            SyncStep::Collecting,
            format!("{total} local changes"),
            total,
            total,
        ));

        self.push_all(&entries, progress, tally).await?;

        progress(SyncProgress::started(
            SyncStep::Pulling,
            "Fetching remote changes",
        ));
        let since = checkpoint::watermark(&self.pool).await?;
        let response = self.remote.pull(since.clone()).await?;
        tally.pulled = response.changes.len();
        let pulled = tally.pulled as u64;
        progress(SyncProgress::counted(
            SyncStep::Pulling,
            format!("{pulled} remote changes"),
            pulled,
            pulled,
        ));

        progress(SyncProgress::started(
            SyncStep::Applying,
            "Applying remote changes",
        ));
        let applied = self.apply(response.changes).await?;
        tally.deferred = applied.deferred;
        if !applied.tables.is_empty() {
            let tables: Vec<&str> = applied.tables.iter().copied().collect();
            self.bus.publish(&tables).await;
        }
        progress(SyncProgress::finished(
            SyncStep::Applying,
            format!("{} changes deferred", applied.deferred),
        ));

        let finished_at = now_ms();
        let watermark = response.watermark.or(since);
        db::run_in_tx(&self.pool, move |tx| {
            async move {
                if let Some(watermark) = watermark {
                    checkpoint::set(
                        &mut **tx,
                        checkpoint::WATERMARK_KEY,
                        &watermark,
                        finished_at,
                    )
                    .await?;
                }
                checkpoint::set(
                    &mut **tx,
                    checkpoint::LAST_SYNC_KEY,
                    &finished_at.to_string(),
                    finished_at,
                )
                .await?;
                Ok::<_, StoreError>(())
            }
            .boxed()
        })
        .await?;
        progress(SyncProgress::finished(
            SyncStep::Complete,
            format!("Pushed {}, pulled {}", tally.pushed, tally.pulled),
        ));
        Ok(finished_at)
    }

    async fn push_all<P>(
        &self,
        entries: &[LedgerEntry],
        progress: &P,
        tally: &mut Tally,
    ) -> AppResult<()>
    where
        P: Fn(SyncProgress) + Send + Sync,
    {
        let total = entries.len() as u64;
        progress(SyncProgress::counted(
            SyncStep::Pushing,
            "Sending local changes",
            0,
            total,
        ));

        let mut sent = 0u64;
        for batch in entries.chunks(self.config.push_batch_size.max(1)) {
            let items: Vec<PushItem> = batch.iter().map(PushItem::from).collect();
            let acks = self.remote.push(items).await?;
            let settled = self.settle(batch.to_vec(), acks).await?;
            tally.pushed += settled.acked;
            tally.rejected += settled.rejected;
            self.bus.publish(&[LEDGER_TABLE]).await;

            sent += batch.len() as u64;
            progress(SyncProgress::counted(
                SyncStep::Pushing,
                format!("Sent {sent} of {total}"),
                sent,
                total,
            ));
        }
        Ok(())
    }

    /// Clear acknowledged entries and record rejections for one batch.
    async fn settle(&self, batch: Vec<LedgerEntry>, acks: Vec<PushAck>) -> AppResult<Settled> {
        let mut by_key: HashMap<(String, String), PushAck> = acks
            .into_iter()
            .map(|ack| ((ack.table_name.clone(), ack.record_id.clone()), ack))
            .collect();

        let settled = db::run_in_tx(&self.pool, move |tx| {
            async move {
                let mut settled = Settled::default();
                for entry in &batch {
                    let key = (entry.table_name.clone(), entry.record_id.clone());
                    let reason = match by_key.remove(&key) {
                        Some(ack) if ack.accepted => {
                            let outcome = ledger::acknowledge(
                                &mut **tx,
                                &entry.table_name,
                                &entry.record_id,
                                entry.revision,
                            )
                            .await?;
                            if outcome == AckOutcome::Superseded {
                                debug!(
                                    target: "hearthkeep",
                                    event = "sync_ack_superseded",
                                    table = %entry.table_name,
                                    record_id = %entry.record_id
                                );
                            }
                            settled.acked += 1;
                            continue;
                        }
                        Some(ack) => ack.error.unwrap_or_else(|| "rejected".to_string()),
                        None => "no acknowledgment".to_string(),
                    };
                    warn!(
                        target: "hearthkeep",
                        event = "sync_push_rejected",
                        table = %entry.table_name,
                        record_id = %entry.record_id,
                        reason = %reason
                    );
                    let attempts = ledger::record_rejection(
                        &mut **tx,
                        &entry.table_name,
                        &entry.record_id,
                        &reason,
                    )
                    .await?;
                    if attempts == Some(ledger::STALLED_AFTER_ATTEMPTS) {
                        // pulled changes for this record stay deferred until it is accepted
                        warn!(
                            target: "hearthkeep",
                            event = "sync_push_stalled",
                            table = %entry.table_name,
                            record_id = %entry.record_id,
                            attempts = ledger::STALLED_AFTER_ATTEMPTS,
                            reason = %reason
                        );
                    }
                    settled.rejected += 1;
                }
                Ok::<_, StoreError>(settled)
            }
            .boxed()
        })
        .await?;
        Ok(settled)
    }

    /// Apply pulled changes in one transaction. Records with an outstanding
    /// local write are deferred instead of overwritten.
    async fn apply(&self, changes: Vec<RemoteChange>) -> AppResult<Applied> {
        if changes.is_empty() {
            return Ok(Applied::default());
        }
        let received_at = now_ms();

        let applied = db::run_in_tx(&self.pool, move |tx| {
            async move {
                let mut applied = Applied::default();
                for change in changes {
                    let Ok(table) = store::ensure_table(&change.table_name) else {
                        warn!(
                            target: "hearthkeep",
                            event = "sync_change_skipped",
                            table = %change.table_name,
                            record_id = %change.record_id,
                            reason = "unknown table"
                        );
                        continue;
                    };

                    if ledger::get(&mut **tx, table, &change.record_id)
                        .await?
                        .is_some()
                    {
                        info!(
                            target: "hearthkeep",
                            event = "sync_conflict_deferred",
                            table,
                            record_id = %change.record_id,
                            operation = %change.operation
                        );
                        ledger::defer(
                            &mut **tx,
                            &DeferredChange {
                                table_name: table.to_string(),
                                record_id: change.record_id,
                                operation: change.operation,
                                data: change.data,
                                remote_updated_at: change.updated_at,
                                received_at,
                            },
                        )
                        .await?;
                        applied.deferred += 1;
                        continue;
                    }

                    if change.operation == ledger::Operation::Delete {
                        store::remove(&mut **tx, table, &change.record_id).await?;
                    } else {
                        match remote_record(&change) {
                            Ok(record) => store::upsert(&mut **tx, table, &record).await?,
                            Err(err) => {
                                warn!(
                                    target: "hearthkeep",
                                    event = "sync_change_skipped",
                                    table,
                                    record_id = %change.record_id,
                                    reason = %err
                                );
                                continue;
                            }
                        }
                    }
                    applied.tables.insert(table);
                }
                Ok::<_, StoreError>(applied)
            }
            .boxed()
        })
        .await?;
        Ok(applied)
    }
}

/// Local record for a pulled snapshot. The change's record id wins over any
/// `id` inside the payload.
fn remote_record(change: &RemoteChange) -> Result<Record, StoreError> {
    let Value::Object(fields) = &change.data else {
        return Err(StoreError::InvalidPayload(format!(
            "remote snapshot for {} is not an object",
            change.record_id
        )));
    };
    let stamp = |key: &str| {
        fields
            .get(key)
            .and_then(Value::as_i64)
            .unwrap_or(change.updated_at)
    };
    Ok(Record {
        id: change.record_id.clone(),
        created_at: stamp("created_at"),
        updated_at: stamp("updated_at"),
        fields: store::strip_reserved(fields.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Operation;
    use serde_json::json;

    #[test]
    fn remote_record_uses_change_identity() {
        let change = RemoteChange {
            table_name: "tasks".into(),
            record_id: "t1".into(),
            operation: Operation::Update,
            data: json!({"id": "other", "title": "x", "created_at": 3}),
            updated_at: 9,
        };
        let record = remote_record(&change).unwrap();
        assert_eq!(record.id, "t1");
        assert_eq!(record.created_at, 3);
        assert_eq!(record.updated_at, 9);
        assert_eq!(record.fields.len(), 1);
    }

    #[test]
    fn non_object_snapshot_is_invalid() {
        let change = RemoteChange {
            table_name: "tasks".into(),
            record_id: "t1".into(),
            operation: Operation::Create,
            data: Value::Null,
            updated_at: 1,
        };
        assert!(matches!(
            remote_record(&change),
            Err(StoreError::InvalidPayload(_))
        ));
    }

    #[test]
    fn skipped_outcome_counts_as_success() {
        let outcome = SyncOutcome::skipped();
        assert!(outcome.success && outcome.skipped);
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            json!({"success": true, "pushed": 0, "pulled": 0, "deferred": 0, "rejected": 0, "skipped": true})
        );
    }
}
