//! Reactive query layer.
//!
//! Writers publish the tables they touched after their transaction commits.
//! [`ChangeBus::publish`] bumps the store revision, broadcasts a
//! [`TableChange`], then re-evaluates every live query watching one of those
//! tables, in registration order, before returning. A caller that awaited a
//! mutation therefore never observes a live query older than its own write.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use sqlx::SqlitePool;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableChange {
    pub tables: Vec<String>,
    pub revision: u64,
}

/// Latest evaluation of a live query.
#[derive(Debug, Clone)]
pub struct Snapshot<T> {
    /// `None` until the first evaluation succeeds.
    pub value: Option<T>,
    /// Error from the most recent evaluation, cleared by the next success.
    pub error: Option<AppError>,
    /// Store revision the value was read at.
    pub revision: u64,
}

type QueryFn<T> = Box<dyn Fn(SqlitePool) -> BoxFuture<'static, AppResult<T>> + Send + Sync>;

struct Subscription<T> {
    tables: Vec<String>,
    query: QueryFn<T>,
    running: tokio::sync::Mutex<()>,
    tx: watch::Sender<Snapshot<T>>,
}

#[async_trait]
trait Refresh: Send + Sync {
    fn watches(&self, tables: &[String]) -> bool;
    fn is_orphaned(&self) -> bool;
    async fn refresh(&self, pool: &SqlitePool, revision: u64);
}

#[async_trait]
impl<T> Refresh for Subscription<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn watches(&self, tables: &[String]) -> bool {
        self.tables.iter().any(|t| tables.contains(t))
    }

    fn is_orphaned(&self) -> bool {
        self.tx.receiver_count() == 0
    }

    async fn refresh(&self, pool: &SqlitePool, revision: u64) {
        let _running = self.running.lock().await;
        let result = (self.query)(pool.clone()).await;
        self.tx.send_modify(|snap| {
            if revision < snap.revision {
                return;
            }
            snap.revision = revision;
            match result {
                Ok(value) => {
                    snap.value = Some(value);
                    snap.error = None;
                }
                Err(err) => {
                    warn!(
                        target: "hearthkeep",
                        event = "live_query_failed",
                        tables = ?self.tables,
                        code = %err.code(),
                        error = %err
                    );
                    snap.error = Some(err);
                }
            }
        });
    }
}

struct BusInner {
    pool: SqlitePool,
    revision: AtomicU64,
    changes: broadcast::Sender<TableChange>,
    subscriptions: Mutex<Vec<Arc<dyn Refresh>>>,
}

#[derive(Clone)]
pub struct ChangeBus {
    inner: Arc<BusInner>,
}

impl ChangeBus {
    pub fn new(pool: SqlitePool) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(BusInner {
                pool,
                revision: AtomicU64::new(0),
                changes,
                subscriptions: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn revision(&self) -> u64 {
        self.inner.revision.load(Ordering::SeqCst)
    }

    /// Raw change feed for listeners that are not live queries.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<TableChange> {
        self.inner.changes.subscribe()
    }

    /// Register a query over `tables`. The first evaluation runs in the
    /// background; until it lands [`LiveQuery::current`] is `None`.
    pub fn live_query<T, F, Fut>(&self, tables: &[&str], query: F) -> LiveQuery<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(SqlitePool) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AppResult<T>> + Send + 'static,
    {
        let (tx, rx) = watch::channel(Snapshot {
            value: None,
            error: None,
            revision: 0,
        });
        let sub = Arc::new(Subscription {
            tables: tables.iter().map(|t| t.to_string()).collect(),
            query: Box::new(move |pool| query(pool).boxed()),
            running: tokio::sync::Mutex::new(()),
            tx,
        });
        self.lock_subscriptions().push(sub.clone());

        let pool = self.inner.pool.clone();
        let revision = self.revision();
        tokio::spawn(async move {
            sub.refresh(&pool, revision).await;
        });

        LiveQuery { rx }
    }

    /// Announce a committed write and re-evaluate affected live queries.
    pub async fn publish(&self, tables: &[&str]) -> u64 {
        let tables: Vec<String> = tables.iter().map(|t| t.to_string()).collect();
        let revision = self.inner.revision.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(target: "hearthkeep", event = "tables_changed", tables = ?tables, revision);
        let _ = self.inner.changes.send(TableChange {
            tables: tables.clone(),
            revision,
        });

        let affected: Vec<Arc<dyn Refresh>> = {
            let mut subs = self.lock_subscriptions();
            subs.retain(|sub| !sub.is_orphaned());
            subs.iter()
                .filter(|sub| sub.watches(&tables))
                .cloned()
                .collect()
        };
        for sub in affected {
            sub.refresh(&self.inner.pool, revision).await;
        }
        revision
    }

    pub fn live_query_count(&self) -> usize {
        let mut subs = self.lock_subscriptions();
        subs.retain(|sub| !sub.is_orphaned());
        subs.len()
    }

    fn lock_subscriptions(&self) -> std::sync::MutexGuard<'_, Vec<Arc<dyn Refresh>>> {
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

/// Handle to a registered query. Dropping every clone unregisters it.
#[derive(Clone)]
pub struct LiveQuery<T> {
    rx: watch::Receiver<Snapshot<T>>,
}

impl<T: Clone> LiveQuery<T> {
    pub fn current(&self) -> Option<T> {
        self.rx.borrow().value.clone()
    }

    pub fn snapshot(&self) -> Snapshot<T> {
        self.rx.borrow().clone()
    }

    /// Wait for the next evaluation and return its value.
    pub async fn changed(&mut self) -> Option<T> {
        self.rx.changed().await.ok()?;
        self.rx.borrow_and_update().value.clone()
    }

    /// Wait until the first evaluation has produced a value.
    pub async fn ready(&mut self) -> Option<T> {
        loop {
            if let Some(value) = self.rx.borrow_and_update().value.clone() {
                return Some(value);
            }
            self.rx.changed().await.ok()?;
        }
    }
}
