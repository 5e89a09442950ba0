// ABOUTME: Log store for trigger-based capture - append-only change log plus sync bookkeeping
// ABOUTME: Provides entry types, schema bootstrap, status markers and per-table cursors

pub mod entry;
pub mod schema;
pub mod store;

pub use entry::{progress_key, status_table_name, validate_follower_id, Direction, NewLogEntry, OperationType, ReplicationLogEntry};
pub use schema::{ensure_audit_schema, ensure_log_schema, ensure_status_table};
pub use store::{supersede_entries, LogStore, SyncProgress, SUPERSEDED_NOTE};
