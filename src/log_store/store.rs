// ABOUTME: LogStore - reads pending log entries and maintains status markers and cursors
// ABOUTME: Scoped to one follower and one direction on the database that owns that log

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_postgres::{Client, GenericClient};

use super::entry::{progress_key, status_table_name, Direction, NewLogEntry, ReplicationLogEntry};
use crate::utils::quote_ident;

/// Status note of entries acknowledged without being applied because they lost a conflict.
pub const SUPERSEDED_NOTE: &str = "superseded by conflict resolution";

/// Durable per-table cursor row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncProgress {
    pub table_name: String,
    pub follower_server_id: String,
    pub last_synced_id: i64,
    pub last_sync_time: DateTime<Utc>,
}

/// Access to `replication_logs` and its bookkeeping for one follower/direction.
///
/// The client must point at the database whose triggers write entries of
/// `direction`: the leader for [`Direction::LeaderToFollower`], the follower
/// for [`Direction::FollowerToLeader`].
pub struct LogStore<'a> {
    client: &'a Client,
    direction: Direction,
    status_table: String,
    progress_key: String,
}

impl<'a> LogStore<'a> {
    pub fn new(client: &'a Client, follower_id: &str, direction: Direction) -> Self {
        Self {
            client,
            direction,
            status_table: quote_ident(&status_table_name(follower_id, direction)),
            progress_key: progress_key(follower_id, direction),
        }
    }

    pub fn client(&self) -> &Client {
        self.client
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn progress_key(&self) -> &str {
        &self.progress_key
    }

    /// Read up to `limit` unsynced entries for a table with id above `after_id`, oldest first.
    pub async fn fetch_pending(
        &self,
        table: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<ReplicationLogEntry>> {
        let query = format!(
            "SELECT {} FROM replication_logs l
             LEFT JOIN {} s ON s.log_entry_id = l.id
             WHERE l.table_name = $1 AND l.direction = $2 AND l.id > $3
               AND COALESCE(s.is_synced, FALSE) = FALSE
             ORDER BY l.id ASC
             LIMIT $4",
            ReplicationLogEntry::SELECT_COLUMNS,
            self.status_table
        );
        let rows = self
            .client
            .query(
                &query,
                &[&table, &self.direction.as_i16(), &after_id, &(limit as i64)],
            )
            .await
            .with_context(|| format!("Failed to fetch pending log entries for {}", table))?;

        rows.iter().map(ReplicationLogEntry::from_row).collect()
    }

    /// Current cursor for a table (0 when the table has never been synced).
    pub async fn cursor(&self, table: &str) -> Result<i64> {
        Ok(self
            .progress(table)
            .await?
            .map(|p| p.last_synced_id)
            .unwrap_or(0))
    }

    pub async fn progress(&self, table: &str) -> Result<Option<SyncProgress>> {
        let row = self
            .client
            .query_opt(
                "SELECT table_name, follower_server_id, last_synced_id, last_sync_time
                 FROM sync_progress WHERE table_name = $1 AND follower_server_id = $2",
                &[&table, &self.progress_key],
            )
            .await
            .with_context(|| format!("Failed to read sync progress for {}", table))?;

        Ok(row.map(|row| SyncProgress {
            table_name: row.get(0),
            follower_server_id: row.get(1),
            last_synced_id: row.get(2),
            last_sync_time: row.get(3),
        }))
    }

    /// Move the cursor forward; a lower value than the stored one is ignored.
    pub async fn advance_cursor(&self, table: &str, last_synced_id: i64) -> Result<()> {
        self.client
            .execute(
                "INSERT INTO sync_progress (table_name, follower_server_id, last_synced_id, last_sync_time)
                 VALUES ($1, $2, $3, NOW())
                 ON CONFLICT (table_name, follower_server_id) DO UPDATE SET
                    last_synced_id = GREATEST(sync_progress.last_synced_id, EXCLUDED.last_synced_id),
                    last_sync_time = NOW()",
                &[&table, &self.progress_key, &last_synced_id],
            )
            .await
            .with_context(|| format!("Failed to advance cursor for {}", table))?;
        Ok(())
    }

    /// Set the cursor unconditionally. Only manual recovery moves it backwards.
    pub async fn rewind_cursor(&self, table: &str, last_synced_id: i64) -> Result<()> {
        self.client
            .execute(
                "INSERT INTO sync_progress (table_name, follower_server_id, last_synced_id, last_sync_time)
                 VALUES ($1, $2, $3, NOW())
                 ON CONFLICT (table_name, follower_server_id) DO UPDATE SET
                    last_synced_id = EXCLUDED.last_synced_id,
                    last_sync_time = NOW()",
                &[&table, &self.progress_key, &last_synced_id],
            )
            .await
            .with_context(|| format!("Failed to rewind cursor for {}", table))?;
        Ok(())
    }

    /// Mark entries as applied for this follower.
    pub async fn mark_synced(&self, ids: &[i64]) -> Result<u64> {
        write_status(self.client, &self.status_table, ids, true, None)
            .await
            .context("Failed to mark log entries as synced")
    }

    /// Acknowledge entries that lost a conflict, so they are neither pulled nor
    /// mistaken for applied changes.
    pub async fn mark_superseded(&self, ids: &[i64]) -> Result<u64> {
        write_status(self.client, &self.status_table, ids, true, Some(SUPERSEDED_NOTE))
            .await
            .context("Failed to mark log entries as superseded")
    }

    /// Record an error against entries without marking them synced.
    pub async fn mark_failed(&self, ids: &[i64], message: &str) -> Result<u64> {
        write_status(self.client, &self.status_table, ids, false, Some(message))
            .await
            .context("Failed to mark log entries as failed")
    }

    /// Unsynced entries for one record whose timestamp lies within `[from, to]`.
    pub async fn pending_for_record(
        &self,
        table: &str,
        record_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ReplicationLogEntry>> {
        let query = format!(
            "SELECT {} FROM replication_logs l
             LEFT JOIN {} s ON s.log_entry_id = l.id
             WHERE l.table_name = $1 AND l.record_id = $2 AND l.direction = $3
               AND l.timestamp BETWEEN $4 AND $5
               AND COALESCE(s.is_synced, FALSE) = FALSE
             ORDER BY l.timestamp DESC, l.id DESC",
            ReplicationLogEntry::SELECT_COLUMNS,
            self.status_table
        );
        let rows = self
            .client
            .query(
                &query,
                &[&table, &record_id, &self.direction.as_i16(), &from, &to],
            )
            .await
            .with_context(|| format!("Failed to query pending changes for {}/{}", table, record_id))?;

        rows.iter().map(ReplicationLogEntry::from_row).collect()
    }

    /// Already-applied entries for one record written after `after`.
    ///
    /// Superseded entries were never written to the other side and are left out.
    pub async fn newer_synced_for_record(
        &self,
        table: &str,
        record_id: &str,
        after: DateTime<Utc>,
    ) -> Result<Vec<ReplicationLogEntry>> {
        let query = format!(
            "SELECT {} FROM replication_logs l
             JOIN {} s ON s.log_entry_id = l.id
             WHERE l.table_name = $1 AND l.record_id = $2 AND l.direction = $3
               AND l.timestamp > $4 AND s.is_synced
               AND s.error_message IS DISTINCT FROM $5
             ORDER BY l.timestamp DESC, l.id DESC",
            ReplicationLogEntry::SELECT_COLUMNS,
            self.status_table
        );
        let rows = self
            .client
            .query(
                &query,
                &[&table, &record_id, &self.direction.as_i16(), &after, &SUPERSEDED_NOTE],
            )
            .await
            .with_context(|| format!("Failed to query applied changes for {}/{}", table, record_id))?;

        rows.iter().map(ReplicationLogEntry::from_row).collect()
    }

    /// Whether this direction logged another change to the record after `after_id`.
    pub async fn has_later_entry(&self, table: &str, record_id: &str, after_id: i64) -> Result<bool> {
        let row = self
            .client
            .query_one(
                "SELECT EXISTS (
                     SELECT 1 FROM replication_logs
                     WHERE table_name = $1 AND record_id = $2 AND direction = $3 AND id > $4
                 )",
                &[&table, &record_id, &self.direction.as_i16(), &after_id],
            )
            .await
            .with_context(|| format!("Failed to look for later changes to {}/{}", table, record_id))?;
        Ok(row.get(0))
    }

    /// Delete synced entries of this direction older than `cutoff`.
    pub async fn purge_synced_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let query = format!(
            "DELETE FROM replication_logs l
             USING {} s
             WHERE s.log_entry_id = l.id AND s.is_synced
               AND l.direction = $1 AND l.timestamp < $2",
            self.status_table
        );
        self.client
            .execute(&query, &[&self.direction.as_i16(), &cutoff])
            .await
            .context("Failed to purge old replication log entries")
    }

    pub async fn delete_entries(&self, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids = ids.to_vec();
        self.client
            .execute(
                "DELETE FROM replication_logs WHERE id = ANY($1::bigint[])",
                &[&ids],
            )
            .await
            .context("Failed to delete replication log entries")
    }

    /// Drop status markers of a table from `from_id` onward so those entries are pulled again.
    pub async fn clear_status_from(&self, table: &str, from_id: i64) -> Result<u64> {
        let query = format!(
            "DELETE FROM {} s
             USING replication_logs l
             WHERE s.log_entry_id = l.id AND l.table_name = $1
               AND l.direction = $2 AND l.id >= $3",
            self.status_table
        );
        self.client
            .execute(&query, &[&table, &self.direction.as_i16(), &from_id])
            .await
            .with_context(|| format!("Failed to clear status markers for {}", table))
    }

    /// Append a log entry written by the engine rather than a trigger.
    pub async fn enqueue(&self, entry: &NewLogEntry) -> Result<i64> {
        let row = self
            .client
            .query_one(
                "INSERT INTO replication_logs
                    (table_name, operation_type, record_id, data, direction, source_server, operation_id)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 RETURNING id",
                &[
                    &entry.table_name,
                    &entry.operation_type.as_str(),
                    &entry.record_id,
                    &entry.data,
                    &entry.direction.as_i16(),
                    &entry.source_server,
                    &uuid::Uuid::new_v4().to_string(),
                ],
            )
            .await
            .with_context(|| format!("Failed to enqueue log entry for {}", entry.table_name))?;
        Ok(row.get(0))
    }

    /// Highest log id recorded for a table in this direction, 0 when there is none.
    pub async fn latest_id(&self, table: &str) -> Result<i64> {
        let row = self
            .client
            .query_one(
                "SELECT COALESCE(MAX(id), 0) FROM replication_logs
                 WHERE table_name = $1 AND direction = $2",
                &[&table, &self.direction.as_i16()],
            )
            .await
            .with_context(|| format!("Failed to read latest log id for {}", table))?;
        Ok(row.get(0))
    }

    /// Count of entries for a table that are still waiting for this follower.
    pub async fn backlog(&self, table: &str) -> Result<i64> {
        let cursor = self.cursor(table).await?;
        let query = format!(
            "SELECT COUNT(*) FROM replication_logs l
             LEFT JOIN {} s ON s.log_entry_id = l.id
             WHERE l.table_name = $1 AND l.direction = $2 AND l.id > $3
               AND COALESCE(s.is_synced, FALSE) = FALSE",
            self.status_table
        );
        let row = self
            .client
            .query_one(&query, &[&table, &self.direction.as_i16(), &cursor])
            .await
            .with_context(|| format!("Failed to count backlog for {}", table))?;
        Ok(row.get(0))
    }
}

/// Mark entries of `direction` superseded through any client, typically the
/// open apply transaction on the database that owns that log.
pub async fn supersede_entries<C: GenericClient + Sync>(
    client: &C,
    follower_id: &str,
    direction: Direction,
    ids: &[i64],
) -> Result<u64> {
    let status_table = quote_ident(&status_table_name(follower_id, direction));
    write_status(client, &status_table, ids, true, Some(SUPERSEDED_NOTE))
        .await
        .context("Failed to mark competing log entries as superseded")
}

async fn write_status<C: GenericClient + Sync>(
    client: &C,
    status_table: &str,
    ids: &[i64],
    synced: bool,
    note: Option<&str>,
) -> Result<u64, tokio_postgres::Error> {
    if ids.is_empty() {
        return Ok(0);
    }
    let query = format!(
        "INSERT INTO {} (log_entry_id, is_synced, sync_time, error_message)
         SELECT id, $2, NOW(), $3 FROM unnest($1::bigint[]) AS id
         ON CONFLICT (log_entry_id) DO UPDATE SET
            is_synced = EXCLUDED.is_synced,
            sync_time = EXCLUDED.sync_time,
            error_message = EXCLUDED.error_message",
        status_table
    );
    let ids = ids.to_vec();
    client.execute(query.as_str(), &[&ids, &synced, &note]).await
}
