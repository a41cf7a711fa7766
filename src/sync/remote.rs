//! Contract with the remote authority.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{
    error::{SYNC_NETWORK, SYNC_PROTOCOL, SYNC_UNAUTHORIZED},
    ledger::{LedgerEntry, Operation},
    AppError,
};

/// One outstanding ledger entry on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushItem {
    pub table_name: String,
    pub record_id: String,
    pub operation: Operation,
    pub data: Value,
}

impl From<&LedgerEntry> for PushItem {
    fn from(entry: &LedgerEntry) -> Self {
        Self {
            table_name: entry.table_name.clone(),
            record_id: entry.record_id.clone(),
            operation: entry.operation,
            data: entry.data.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushAck {
    pub table_name: String,
    pub record_id: String,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PushAck {
    pub fn accepted(item: &PushItem) -> Self {
        Self {
            table_name: item.table_name.clone(),
            record_id: item.record_id.clone(),
            accepted: true,
            error: None,
        }
    }

    pub fn rejected(item: &PushItem, reason: impl Into<String>) -> Self {
        Self {
            table_name: item.table_name.clone(),
            record_id: item.record_id.clone(),
            accepted: false,
            error: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteChange {
    pub table_name: String,
    pub record_id: String,
    pub operation: Operation,
    /// Full snapshot; the last known snapshot for deletes.
    #[serde(default)]
    pub data: Value,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    pub changes: Vec<RemoteChange>,
    /// Cursor to send on the next pull; `None` keeps the current one.
    #[serde(default)]
    pub watermark: Option<String>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("remote unreachable: {0}")]
    Network(String),
    #[error("remote rejected the session: {0}")]
    Unauthorized(String),
    #[error("unexpected remote response: {0}")]
    Protocol(String),
}

impl From<TransportError> for AppError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Network(detail) => {
                AppError::new(SYNC_NETWORK, "Could not reach the sync server")
                    .with_context("detail", detail)
            }
            TransportError::Unauthorized(detail) => {
                AppError::new(SYNC_UNAUTHORIZED, "Sign in again to resume syncing")
                    .with_context("detail", detail)
            }
            TransportError::Protocol(detail) => {
                AppError::new(SYNC_PROTOCOL, "The sync server sent an unexpected response")
                    .with_context("detail", detail)
            }
        }
    }
}

#[async_trait]
pub trait RemoteEndpoint: Send + Sync {
    /// Returns one acknowledgment per accepted or rejected item. A transport
    /// failure means nothing in the batch was acknowledged.
    async fn push(&self, items: Vec<PushItem>) -> Result<Vec<PushAck>, TransportError>;

    async fn pull(&self, watermark: Option<String>) -> Result<PullResponse, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn push_item_wire_shape() {
        let item = PushItem {
            table_name: "tasks".into(),
            record_id: "t1".into(),
            operation: Operation::Delete,
            data: json!({"id": "t1"}),
        };
        assert_eq!(
            serde_json::to_value(&item).unwrap(),
            json!({"tableName": "tasks", "recordId": "t1", "operation": "delete", "data": {"id": "t1"}})
        );
    }

    #[test]
    fn transport_errors_map_to_sync_codes() {
        let err: AppError = TransportError::Unauthorized("401".into()).into();
        assert_eq!(err.code(), SYNC_UNAUTHORIZED);
        let err: AppError = TransportError::Network("refused".into()).into();
        assert!(err.is_retryable());
    }
}
