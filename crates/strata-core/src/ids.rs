//! ID generation helpers.
//!
//! Trace ids are UUIDv7 so they sort chronologically — useful for log
//! correlation and debugging production incidents. Event ids are plain v4.

use uuid::Uuid;

/// Time-ordered trace correlation id.
pub fn new_trace_id() -> String {
    Uuid::now_v7().to_string()
}

/// Random event id for audit records.
pub fn new_event_id() -> String {
    Uuid::new_v4().to_string()
}
