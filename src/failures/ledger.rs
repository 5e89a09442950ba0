// ABOUTME: FailureLedger - replication_failure_logs on the leader
// ABOUTME: One row per failed log entry and direction, written after automatic retries are exhausted

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio_postgres::Client;

use crate::error::ReplicationError;
use crate::log_store::{Direction, OperationType, ReplicationLogEntry};

/// A ledgered failure. Log ids are only unique within the database that
/// assigned them, so a row is identified by log id, follower and direction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureRecord {
    pub id: i64,
    pub log_entry_id: i64,
    pub direction: Direction,
    pub table_name: String,
    pub operation_type: OperationType,
    pub record_id: String,
    pub data: Option<serde_json::Value>,
    pub error_message: String,
    pub retry_count: i32,
    pub failure_time: DateTime<Utc>,
    pub follower_server_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FailureStatistics {
    pub total: i64,
    pub by_table: BTreeMap<String, i64>,
    pub oldest_failure: Option<DateTime<Utc>>,
    pub newest_failure: Option<DateTime<Utc>>,
    pub max_retry_count: i32,
}

pub struct FailureLedger<'a> {
    client: &'a Client,
}

impl<'a> FailureLedger<'a> {
    pub fn new(client: &'a Client) -> Self {
        Self { client }
    }

    /// Ledger an entry. Recording the same entry again refreshes the row instead of duplicating it.
    pub async fn record(
        &self,
        entry: &ReplicationLogEntry,
        follower_id: &str,
        failure: &ReplicationError,
    ) -> Result<()> {
        let retry_count = i32::try_from(failure.attempts()).unwrap_or(i32::MAX);
        let error_message = failure.cause_message();
        self.client
            .execute(
                "INSERT INTO replication_failure_logs
                    (log_entry_id, direction, table_name, operation_type, record_id, data,
                     error_message, retry_count, failure_time, follower_server_id)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW(), $9)
                 ON CONFLICT (log_entry_id, follower_server_id, direction) DO UPDATE SET
                    error_message = EXCLUDED.error_message,
                    retry_count = EXCLUDED.retry_count,
                    failure_time = EXCLUDED.failure_time",
                &[
                    &entry.id,
                    &entry.direction.as_i16(),
                    &entry.table_name,
                    &entry.operation_type.as_str(),
                    &entry.record_id,
                    &entry.data,
                    &error_message,
                    &retry_count,
                    &follower_id,
                ],
            )
            .await
            .with_context(|| format!("Failed to ledger failure of log entry {}", entry.id))?;

        tracing::error!(
            "{} ({} {}/{}, {}): {}",
            failure,
            entry.operation_type,
            entry.table_name,
            entry.record_id,
            entry.direction,
            error_message
        );
        Ok(())
    }

    /// Failures of this follower (both directions), optionally for one table, oldest log id first.
    pub async fn list(&self, follower_id: &str, table: Option<&str>) -> Result<Vec<FailureRecord>> {
        let rows = self
            .client
            .query(
                "SELECT id, log_entry_id, direction, table_name, operation_type, record_id, data,
                        error_message, retry_count, failure_time, follower_server_id
                 FROM replication_failure_logs
                 WHERE follower_server_id = $1
                   AND ($2::text IS NULL OR table_name = $2)
                 ORDER BY direction, table_name, log_entry_id",
                &[&follower_id, &table],
            )
            .await
            .context("Failed to list replication failures")?;

        rows.iter()
            .map(|row| {
                let op: String = row.get(4);
                Ok(FailureRecord {
                    id: row.get(0),
                    log_entry_id: row.get(1),
                    direction: Direction::from_i16(row.get(2))?,
                    table_name: row.get(3),
                    operation_type: op.parse()?,
                    record_id: row.get(5),
                    data: row.get(6),
                    error_message: row.get(7),
                    retry_count: row.get(8),
                    failure_time: row.get(9),
                    follower_server_id: row.get(10),
                })
            })
            .collect()
    }

    pub async fn statistics(&self, follower_id: &str) -> Result<FailureStatistics> {
        let rows = self
            .client
            .query(
                "SELECT table_name, COUNT(*), MIN(failure_time), MAX(failure_time), MAX(retry_count)
                 FROM replication_failure_logs
                 WHERE follower_server_id = $1
                 GROUP BY table_name
                 ORDER BY table_name",
                &[&follower_id],
            )
            .await
            .context("Failed to compute failure statistics")?;

        let mut stats = FailureStatistics::default();
        for row in rows {
            let table: String = row.get(0);
            let count: i64 = row.get(1);
            let oldest: Option<DateTime<Utc>> = row.get(2);
            let newest: Option<DateTime<Utc>> = row.get(3);
            let max_retry: Option<i32> = row.get(4);

            stats.total += count;
            stats.by_table.insert(table, count);
            stats.oldest_failure = match (stats.oldest_failure, oldest) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            stats.newest_failure = match (stats.newest_failure, newest) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };
            stats.max_retry_count = stats.max_retry_count.max(max_retry.unwrap_or(0));
        }
        Ok(stats)
    }

    /// Remove ledger rows for the given log ids of one direction.
    pub async fn delete(
        &self,
        follower_id: &str,
        direction: Direction,
        log_entry_ids: &[i64],
    ) -> Result<u64> {
        if log_entry_ids.is_empty() {
            return Ok(0);
        }
        let ids = log_entry_ids.to_vec();
        self.client
            .execute(
                "DELETE FROM replication_failure_logs
                 WHERE follower_server_id = $1 AND direction = $2
                   AND log_entry_id = ANY($3::bigint[])",
                &[&follower_id, &direction.as_i16(), &ids],
            )
            .await
            .context("Failed to delete failure ledger rows")
    }
}
