// ABOUTME: Manual recovery of ledgered failures by rewinding per-table cursors
// ABOUTME: Failed changes without a later change to the same record are re-enqueued for replay

use anyhow::Result;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tokio_postgres::Client;

use super::ledger::{FailureLedger, FailureRecord};
use crate::log_store::{Direction, LogStore, NewLogEntry};

/// Recovery steps for one table and direction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableRecovery {
    pub table: String,
    pub direction: Direction,
    pub earliest_failed_id: i64,
    pub previous_cursor: i64,
    pub new_cursor: i64,
    pub failures: Vec<FailureRecord>,
}

impl TableRecovery {
    pub fn log_ids(&self) -> Vec<i64> {
        self.failures.iter().map(|f| f.log_entry_id).collect()
    }

    /// The newest failure of each record, oldest log id first.
    ///
    /// An older failure of the same record is covered by the newer one, which
    /// carries the later row state.
    pub fn replay_candidates(&self) -> Vec<&FailureRecord> {
        let mut newest: BTreeMap<&str, &FailureRecord> = BTreeMap::new();
        for failure in &self.failures {
            newest
                .entry(failure.record_id.as_str())
                .and_modify(|kept| {
                    if failure.log_entry_id > kept.log_entry_id {
                        *kept = failure;
                    }
                })
                .or_insert(failure);
        }
        let mut candidates: Vec<&FailureRecord> = newest.into_values().collect();
        candidates.sort_by_key(|f| f.log_entry_id);
        candidates
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub tables: Vec<TableRecovery>,
    pub requeued: usize,
    /// Failures not replayed because a later change to the same record replays instead.
    pub superseded: usize,
}

/// Group failures by table and direction and compute the rewound cursors.
///
/// The cursor goes back to `earliest_failed_id - 1` (never below 0), and never
/// forward: a cursor already below that point stays where it is.
pub fn plan_recovery(
    failures: Vec<FailureRecord>,
    cursors: &HashMap<(String, Direction), i64>,
) -> Vec<TableRecovery> {
    let mut grouped: BTreeMap<(String, i16), Vec<FailureRecord>> = BTreeMap::new();
    for failure in failures {
        grouped
            .entry((failure.table_name.clone(), failure.direction.as_i16()))
            .or_default()
            .push(failure);
    }

    grouped
        .into_values()
        .filter_map(|mut group| {
            group.sort_by_key(|f| f.log_entry_id);
            let first = group.first()?;
            let table = first.table_name.clone();
            let direction = first.direction;
            let earliest = first.log_entry_id;
            let previous = cursors
                .get(&(table.clone(), direction))
                .copied()
                .unwrap_or(0);
            Some(TableRecovery {
                new_cursor: previous.min(earliest - 1).max(0),
                previous_cursor: previous,
                earliest_failed_id: earliest,
                table,
                direction,
                failures: group,
            })
        })
        .collect()
}

/// Both databases plus the identities needed to re-enqueue changes.
pub struct RecoverySides<'a> {
    pub leader: &'a Client,
    pub follower: &'a Client,
    pub follower_id: &'a str,
    pub leader_server_name: &'a str,
    pub follower_server_name: &'a str,
}

impl<'a> RecoverySides<'a> {
    fn log_side(&self, direction: Direction) -> (&'a Client, &'a str) {
        match direction {
            Direction::LeaderToFollower => (self.leader, self.leader_server_name),
            Direction::FollowerToLeader => (self.follower, self.follower_server_name),
        }
    }
}

/// Rewind and replay failed entries, optionally for a single table.
///
/// Each record's newest failure is re-enqueued unless the log already holds a
/// later change to that record; that change replays after the rewind and a
/// stale copy queued behind it would undo it.
pub async fn execute_recovery(sides: &RecoverySides<'_>, table: Option<&str>) -> Result<RecoveryReport> {
    let ledger = FailureLedger::new(sides.leader);
    let failures = ledger.list(sides.follower_id, table).await?;
    if failures.is_empty() {
        tracing::info!("No ledgered failures to recover");
        return Ok(RecoveryReport::default());
    }

    let mut cursors = HashMap::new();
    for failure in &failures {
        let key = (failure.table_name.clone(), failure.direction);
        if cursors.contains_key(&key) {
            continue;
        }
        let (client, _) = sides.log_side(key.1);
        let cursor = LogStore::new(client, sides.follower_id, key.1)
            .cursor(&key.0)
            .await?;
        cursors.insert(key, cursor);
    }

    let plan = plan_recovery(failures, &cursors);
    let mut report = RecoveryReport::default();

    for step in plan {
        let (client, server_name) = sides.log_side(step.direction);
        let log = LogStore::new(client, sides.follower_id, step.direction);

        for failure in step.replay_candidates() {
            if log
                .has_later_entry(&step.table, &failure.record_id, failure.log_entry_id)
                .await?
            {
                tracing::info!(
                    "Not replaying failed log entry {} for {}/{}: a later change to the record replays instead",
                    failure.log_entry_id,
                    step.table,
                    failure.record_id
                );
                report.superseded += 1;
                continue;
            }
            log.enqueue(&NewLogEntry {
                table_name: failure.table_name.clone(),
                operation_type: failure.operation_type,
                record_id: failure.record_id.clone(),
                data: failure.data.clone(),
                direction: step.direction,
                source_server: server_name.to_string(),
            })
            .await?;
            report.requeued += 1;
        }

        let log_ids = step.log_ids();
        log.delete_entries(&log_ids).await?;
        log.clear_status_from(&step.table, step.earliest_failed_id).await?;
        log.rewind_cursor(&step.table, step.new_cursor).await?;
        ledger
            .delete(sides.follower_id, step.direction, &log_ids)
            .await?;

        tracing::info!(
            "Recovered {} failure(s) on {} ({}): cursor {} -> {}",
            step.failures.len(),
            step.table,
            step.direction,
            step.previous_cursor,
            step.new_cursor
        );
        report.tables.push(step);
    }

    Ok(report)
}
