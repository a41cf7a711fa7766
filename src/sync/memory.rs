//! In-process remote authority. Pushes are applied in arrival order, so the
//! last accepted write for a record wins. Cloning shares the same state,
//! which lets several local stores act as separate devices.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::remote::{PullResponse, PushAck, PushItem, RemoteChange, RemoteEndpoint, TransportError};
use crate::{ledger::Operation, time::now_ms};

type Key = (String, String);

#[derive(Default)]
struct Inner {
    seq: u64,
    records: BTreeMap<Key, Value>,
    /// Latest change per record with the sequence it was accepted at.
    feed: BTreeMap<Key, (u64, RemoteChange)>,
    accepted: Vec<PushItem>,
    offline: bool,
    unauthorized: bool,
    ack_budget: Option<usize>,
    rejected: HashSet<Key>,
}

impl Inner {
    fn apply(&mut self, table: &str, id: &str, operation: Operation, data: Value) {
        self.seq += 1;
        let key = (table.to_string(), id.to_string());
        let updated_at = data
            .get("updated_at")
            .and_then(Value::as_i64)
            .unwrap_or_else(now_ms);
        match operation {
            Operation::Delete => {
                self.records.remove(&key);
            }
            Operation::Create | Operation::Update => {
                self.records.insert(key.clone(), data.clone());
            }
        }
        let change = RemoteChange {
            table_name: table.to_string(),
            record_id: id.to_string(),
            operation,
            data,
            updated_at,
        };
        self.feed.insert(key, (self.seq, change));
    }
}

#[derive(Clone, Default)]
pub struct MemoryRemote {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current authoritative snapshot of a record.
    pub fn record(&self, table: &str, id: &str) -> Option<Value> {
        self.lock()
            .records
            .get(&(table.to_string(), id.to_string()))
            .cloned()
    }

    pub fn record_count(&self) -> usize {
        self.lock().records.len()
    }

    /// Every item accepted so far, in arrival order.
    pub fn accepted(&self) -> Vec<PushItem> {
        self.lock().accepted.clone()
    }

    /// Write directly at the remote, as another client would.
    pub fn put(&self, table: &str, id: &str, data: Value) {
        self.lock().apply(table, id, Operation::Update, data);
    }

    pub fn remove(&self, table: &str, id: &str) {
        let mut inner = self.lock();
        let last = inner
            .records
            .get(&(table.to_string(), id.to_string()))
            .cloned()
            .unwrap_or(Value::Null);
        inner.apply(table, id, Operation::Delete, last);
    }

    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    pub fn set_unauthorized(&self, unauthorized: bool) {
        self.lock().unauthorized = unauthorized;
    }

    /// Accept `acks` more items, then fail every push that would exceed them.
    pub fn fail_after(&self, acks: usize) {
        self.lock().ack_budget = Some(acks);
    }

    /// Clear `fail_after` and offline simulation.
    pub fn heal(&self) {
        let mut inner = self.lock();
        inner.ack_budget = None;
        inner.offline = false;
    }

    /// Reject pushes for one record until [`MemoryRemote::allow`] is called.
    pub fn reject(&self, table: &str, id: &str) {
        self.lock()
            .rejected
            .insert((table.to_string(), id.to_string()));
    }

    pub fn allow(&self, table: &str, id: &str) {
        self.lock()
            .rejected
            .remove(&(table.to_string(), id.to_string()));
    }

    fn check_reachable(inner: &Inner) -> Result<(), TransportError> {
        if inner.offline {
            return Err(TransportError::Network("connection refused".into()));
        }
        if inner.unauthorized {
            return Err(TransportError::Unauthorized("session expired".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteEndpoint for MemoryRemote {
    async fn push(&self, items: Vec<PushItem>) -> Result<Vec<PushAck>, TransportError> {
        let mut inner = self.lock();
        Self::check_reachable(&inner)?;
        if let Some(budget) = inner.ack_budget {
            if items.len() > budget {
                return Err(TransportError::Network("connection reset".into()));
            }
            inner.ack_budget = Some(budget - items.len());
        }

        let mut acks = Vec::with_capacity(items.len());
        for item in items {
            let key = (item.table_name.clone(), item.record_id.clone());
            if inner.rejected.contains(&key) {
                acks.push(PushAck::rejected(&item, "rejected by remote"));
                continue;
            }
            inner.apply(&item.table_name, &item.record_id, item.operation, item.data.clone());
            acks.push(PushAck::accepted(&item));
            inner.accepted.push(item);
        }
        debug!(target: "hearthkeep", event = "memory_remote_push", acks = acks.len(), seq = inner.seq);
        Ok(acks)
    }

    async fn pull(&self, watermark: Option<String>) -> Result<PullResponse, TransportError> {
        let inner = self.lock();
        Self::check_reachable(&inner)?;
        let since = match watermark.as_deref() {
            None => 0,
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|_| TransportError::Protocol(format!("bad watermark {raw}")))?,
        };
        let mut changes: Vec<(u64, RemoteChange)> = inner
            .feed
            .values()
            .filter(|(seq, _)| *seq > since)
            .cloned()
            .collect();
        changes.sort_by_key(|(seq, _)| *seq);
        Ok(PullResponse {
            changes: changes.into_iter().map(|(_, change)| change).collect(),
            watermark: Some(inner.seq.to_string()),
        })
    }
}
