use std::collections::HashMap;
use std::time::Instant;

use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use crate::AppError;

fn context_to_json(context: &HashMap<String, String>) -> Option<Value> {
    if context.is_empty() {
        None
    } else {
        let mut map = Map::with_capacity(context.len());
        for (key, value) in context {
            map.insert(key.clone(), Value::String(value.clone()));
        }
        Some(Value::Object(map))
    }
}

/// Caller mistakes rather than faults; logged at warn.
fn is_caller_error(code: &str) -> bool {
    code.starts_with("MUTATION/")
}

fn wrap_details(value: Value) -> Value {
    if value.is_object() {
        value
    } else {
        json!({ "value": value })
    }
}

/// Structured enter/exit logging for one store or sync operation.
pub struct LogScope {
    op: &'static str,
    table: Option<String>,
    record_id: Option<String>,
    start: Instant,
}

impl LogScope {
    pub fn new(op: &'static str, table: Option<&str>, record_id: Option<&str>) -> Self {
        let scope = Self {
            op,
            table: table.map(str::to_owned),
            record_id: record_id.map(str::to_owned),
            start: Instant::now(),
        };
        debug!(
            target: "hearthkeep",
            op = scope.op,
            table = scope.table.as_deref(),
            record_id = scope.record_id.as_deref(),
            details = %json!({ "stage": "enter" })
        );
        scope
    }

    fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn success(&self, details: Value) {
        info!(
            target: "hearthkeep",
            op = self.op,
            table = self.table.as_deref(),
            record_id = self.record_id.as_deref(),
            duration_ms = self.elapsed_ms(),
            details = %wrap_details(details)
        );
    }

    pub fn warn(&self, details: Value) {
        warn!(
            target: "hearthkeep",
            op = self.op,
            table = self.table.as_deref(),
            record_id = self.record_id.as_deref(),
            duration_ms = self.elapsed_ms(),
            details = %wrap_details(details)
        );
    }

    pub fn fail(&self, err: &AppError) {
        let mut map = Map::new();
        map.insert("code".into(), Value::String(err.code().to_string()));
        map.insert("message".into(), Value::String(err.message().to_string()));
        if let Some(context) = context_to_json(err.context()) {
            map.insert("context".into(), context);
        }

        if is_caller_error(err.code()) {
            self.warn(Value::Object(map));
            return;
        }

        if let Some(cause) = err.cause() {
            map.insert("cause".into(), Value::String(cause.to_string()));
        }
        let details = Value::Object(map);
        error!(
            target: "hearthkeep",
            op = self.op,
            table = self.table.as_deref(),
            record_id = self.record_id.as_deref(),
            duration_ms = self.elapsed_ms(),
            details = %details
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_details_are_wrapped() {
        assert_eq!(wrap_details(json!(3)), json!({ "value": 3 }));
        assert_eq!(wrap_details(json!({ "a": 1 })), json!({ "a": 1 }));
    }

    #[test]
    fn mutation_codes_are_caller_errors() {
        assert!(is_caller_error("MUTATION/NOT_FOUND"));
        assert!(!is_caller_error("STORAGE/TRANSACTION"));
    }

    #[test]
    fn storage_failure_logs_at_error_with_cause() {
        let subscriber = tracing_subscriber::fmt().with_test_writer().finish();
        tracing::subscriber::with_default(subscriber, || {
            let scope = LogScope::new("update_with_sync", Some("tasks"), Some("t1"));
            let err = AppError::new("STORAGE/TRANSACTION", "database is locked")
                .with_context("table", "tasks")
                .with_cause(AppError::new("Sqlite/5", "busy"));
            scope.fail(&err);
        });
    }
}
