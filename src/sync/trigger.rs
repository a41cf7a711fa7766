//! Debounced entry point for UI-driven syncs and the keep-fresh timer.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::{coordinator::SyncCoordinator, progress::SyncProgress, SyncOutcome};
use crate::AppError;

/// User-facing sync events for toasts and loading screens. Silent runs
/// publish none of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SyncNotice {
    Started,
    Progress { progress: SyncProgress },
    Finished { outcome: SyncOutcome },
    Failed { error: AppError },
}

struct Pending {
    force: bool,
    silent: bool,
    done: watch::Receiver<Option<SyncOutcome>>,
}

/// Resolves when the run a request was folded into has finished.
pub struct SyncTicket {
    rx: watch::Receiver<Option<SyncOutcome>>,
}

impl SyncTicket {
    /// `None` if the run was aborted before it reported.
    pub async fn outcome(mut self) -> Option<SyncOutcome> {
        let value = self.rx.wait_for(Option::is_some).await.ok()?;
        (*value).clone()
    }
}

#[derive(Clone)]
pub struct SyncTrigger {
    coordinator: Arc<SyncCoordinator>,
    delay: Duration,
    pending: Arc<Mutex<Option<Pending>>>,
    notices: broadcast::Sender<SyncNotice>,
}

impl SyncTrigger {
    pub fn new(coordinator: Arc<SyncCoordinator>) -> Self {
        let delay = Duration::from_millis(coordinator.config().trigger_delay_ms);
        let (notices, _) = broadcast::channel(64);
        Self {
            coordinator,
            delay,
            pending: Arc::new(Mutex::new(None)),
            notices,
        }
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<SyncNotice> {
        self.notices.subscribe()
    }

    fn lock_pending(&self) -> MutexGuard<'_, Option<Pending>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Request a sync. Requests that arrive before the delay elapses are
    /// folded into one run: `force` if any asked for it, silent only if all
    /// asked for silence.
    pub fn trigger_sync(&self, force: bool, silent: bool) -> SyncTicket {
        let mut slot = self.lock_pending();
        if let Some(pending) = slot.as_mut() {
            pending.force |= force;
            pending.silent &= silent;
            debug!(target: "hearthkeep", event = "sync_trigger_coalesced", force = pending.force, silent = pending.silent);
            return SyncTicket {
                rx: pending.done.clone(),
            };
        }

        let (done_tx, done_rx) = watch::channel(None);
        *slot = Some(Pending {
            force,
            silent,
            done: done_rx.clone(),
        });
        drop(slot);

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.delay).await;
            let request = this.lock_pending().take();
            let Some(request) = request else {
                return;
            };
            let outcome = this.run(request.force, request.silent).await;
            let _ = done_tx.send(Some(outcome));
        });

        SyncTicket { rx: done_rx }
    }

    async fn run(&self, force: bool, silent: bool) -> SyncOutcome {
        if silent {
            return self.coordinator.perform_sync(force, |_| {}).await;
        }

        let _ = self.notices.send(SyncNotice::Started);
        let notices = self.notices.clone();
        let outcome = self
            .coordinator
            .perform_sync(force, move |progress| {
                let _ = notices.send(SyncNotice::Progress { progress });
            })
            .await;
        let notice = match &outcome.error {
            Some(error) => SyncNotice::Failed {
                error: error.clone(),
            },
            None => SyncNotice::Finished {
                outcome: outcome.clone(),
            },
        };
        let _ = self.notices.send(notice);
        outcome
    }

    /// Silent keep-fresh syncs every `period` until the handle is aborted.
    pub fn spawn_interval(&self, period: Duration) -> JoinHandle<()> {
        let trigger = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                debug!(target: "hearthkeep", event = "sync_interval_tick");
                trigger.trigger_sync(false, true).outcome().await;
            }
        })
    }
}
