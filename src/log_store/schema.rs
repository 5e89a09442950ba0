// ABOUTME: Idempotent bootstrap of the replication bookkeeping tables
// ABOUTME: Log, status and progress tables live on the side whose triggers write the log

use anyhow::{Context, Result};
use tokio_postgres::Client;

use super::entry::{status_table_name, validate_follower_id, Direction};
use crate::utils::quote_ident;

const LOG_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS replication_logs (
    id              BIGSERIAL PRIMARY KEY,
    table_name      TEXT NOT NULL,
    operation_type  TEXT NOT NULL,
    record_id       TEXT NOT NULL,
    data            JSONB,
    timestamp       TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp(),
    processed       BOOLEAN NOT NULL DEFAULT FALSE,
    direction       SMALLINT NOT NULL,
    source_server   TEXT,
    operation_id    TEXT
);

CREATE INDEX IF NOT EXISTS idx_replication_logs_pull
    ON replication_logs (table_name, direction, id);

CREATE INDEX IF NOT EXISTS idx_replication_logs_record
    ON replication_logs (table_name, record_id, timestamp);

CREATE TABLE IF NOT EXISTS sync_progress (
    id                  BIGSERIAL PRIMARY KEY,
    table_name          TEXT NOT NULL,
    follower_server_id  TEXT NOT NULL,
    last_synced_id      BIGINT NOT NULL DEFAULT 0,
    last_sync_time      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (table_name, follower_server_id)
);
"#;

const AUDIT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS replication_failure_logs (
    id                  BIGSERIAL PRIMARY KEY,
    log_entry_id        BIGINT NOT NULL,
    direction           SMALLINT NOT NULL,
    table_name          TEXT NOT NULL,
    operation_type      TEXT NOT NULL,
    record_id           TEXT NOT NULL,
    data                JSONB,
    error_message       TEXT NOT NULL,
    retry_count         INTEGER NOT NULL DEFAULT 0,
    failure_time        TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    follower_server_id  TEXT NOT NULL,
    UNIQUE (log_entry_id, follower_server_id, direction)
);

CREATE INDEX IF NOT EXISTS idx_replication_failure_logs_table
    ON replication_failure_logs (table_name, log_entry_id);

CREATE TABLE IF NOT EXISTS conflict_logs (
    id                   BIGSERIAL PRIMARY KEY,
    table_name           TEXT NOT NULL,
    record_id            TEXT NOT NULL,
    conflict_type        TEXT NOT NULL,
    detected_at          TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    resolution           TEXT NOT NULL,
    resolution_strategy  TEXT NOT NULL,
    details              JSONB,
    resolved_by          TEXT,
    resolved_at          TIMESTAMPTZ
);
"#;

/// Create `replication_logs` and `sync_progress` if missing.
pub async fn ensure_log_schema(client: &Client) -> Result<()> {
    client
        .batch_execute(LOG_SCHEMA)
        .await
        .context("Failed to create replication log schema")
}

/// Create the failure ledger and conflict audit tables if missing.
pub async fn ensure_audit_schema(client: &Client) -> Result<()> {
    client
        .batch_execute(AUDIT_SCHEMA)
        .await
        .context("Failed to create replication audit schema")
}

/// Create the status marker table for one follower and direction if missing.
///
/// Status rows reference `replication_logs` with `ON DELETE CASCADE` so that
/// retention cleanup and recovery only need to delete log rows.
pub async fn ensure_status_table(
    client: &Client,
    follower_id: &str,
    direction: Direction,
) -> Result<()> {
    validate_follower_id(follower_id)?;
    let sql = build_status_table_ddl(&status_table_name(follower_id, direction));
    client
        .batch_execute(&sql)
        .await
        .with_context(|| format!("Failed to create status table for follower {}", follower_id))
}

fn build_status_table_ddl(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            log_entry_id   BIGINT PRIMARY KEY REFERENCES replication_logs(id) ON DELETE CASCADE,
            is_synced      BOOLEAN NOT NULL DEFAULT FALSE,
            sync_time      TIMESTAMPTZ,
            error_message  TEXT
        )",
        table = quote_ident(table)
    )
}
