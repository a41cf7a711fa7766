use uuid::Uuid;

pub fn new_uuid_v7() -> String {
    Uuid::now_v7().to_string()
}

/// Record ids carry their entity prefix, e.g. `task-0190f0c2-…`.
pub fn new_record_id(prefix: &str) -> String {
    format!("{prefix}-{}", new_uuid_v7())
}
