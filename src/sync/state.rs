use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::watch;
use tracing::warn;
use ts_rs::TS;

use crate::{error::SYNC_UNAUTHORIZED, ledger, AppError};

/// What the UI shows next to the sync indicator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct SyncState {
    pub is_syncing: bool,
    #[ts(type = "number | null")]
    pub last_sync_at: Option<i64>,
    #[ts(type = "number")]
    pub pending_changes: i64,
    /// Outstanding entries the remote keeps refusing.
    #[ts(type = "number")]
    pub stalled_changes: i64,
    pub error: Option<AppError>,
    pub is_authenticated: bool,
}

/// Shared owner of the current [`SyncState`]. Clones observe and update the
/// same value.
#[derive(Clone)]
pub struct SyncStateHandle {
    tx: Arc<watch::Sender<SyncState>>,
}

impl Default for SyncStateHandle {
    fn default() -> Self {
        Self::new(SyncState::default())
    }
}

impl SyncStateHandle {
    pub fn new(initial: SyncState) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> SyncState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.tx.subscribe()
    }

    pub fn update(&self, f: impl FnOnce(&mut SyncState)) {
        self.tx.send_modify(f);
    }

    pub(crate) fn begin(&self) {
        self.update(|s| s.is_syncing = true);
    }

    pub(crate) fn succeed(&self, finished_at: i64, pending: i64) {
        self.update(|s| {
            s.is_syncing = false;
            s.last_sync_at = Some(finished_at);
            s.pending_changes = pending;
            s.error = None;
            s.is_authenticated = true;
        });
    }

    pub(crate) fn fail(&self, err: &AppError, pending: Option<i64>) {
        self.update(|s| {
            s.is_syncing = false;
            if let Some(pending) = pending {
                s.pending_changes = pending;
            }
            if err.code() == SYNC_UNAUTHORIZED {
                s.is_authenticated = false;
            }
            s.error = Some(err.clone());
        });
    }

    /// Re-read the outstanding and stalled ledger counts.
    pub async fn refresh_pending(&self, pool: &SqlitePool) {
        match ledger::pending_count(pool).await {
            Ok(count) => self.update(|s| s.pending_changes = count),
            Err(err) => {
                warn!(target: "hearthkeep", event = "pending_count_failed", error = %err);
            }
        }
        match ledger::stalled_count(pool).await {
            Ok(count) => self.update(|s| s.stalled_changes = count),
            Err(err) => {
                warn!(target: "hearthkeep", event = "stalled_count_failed", error = %err);
            }
        }
    }
}
