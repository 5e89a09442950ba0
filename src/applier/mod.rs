// ABOUTME: ChangeApplier - pull, screen conflicts, deduplicate, apply and acknowledge one batch
// ABOUTME: Applies inside one target transaction with capture suppressed and a savepoint per entry

pub mod dedup;
pub mod writer;

use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_postgres::{Client, Transaction};

use crate::capture::SUPPRESSION_SETTING;
use crate::config::{SyncMode, TableConfig};
use crate::conflict::{ConflictAudit, ConflictDetector, ConflictResolver, Resolution, ResolvedConflict};
use crate::error::{is_transient, ReplicationError};
use crate::failures::FailureLedger;
use crate::log_store::{supersede_entries, Direction, LogStore, OperationType, ReplicationLogEntry};
use crate::record::{Record, RecordRegistry};
use crate::retry::RetryPolicy;

pub use dedup::{deduplicate, DedupGroup};
pub use writer::{columns_from_image, fetch_row, RowWriter, TableShape};

/// Counters for one pull-apply-acknowledge pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchStats {
    pub fetched: usize,
    pub applied: usize,
    /// Entries intentionally not written: already applied, or lost a conflict.
    pub skipped: usize,
    pub failed: usize,
    pub deferred: usize,
    pub conflicts: usize,
    /// Cursor after acknowledgement, when it moved.
    pub cursor: Option<i64>,
    pub duration_ms: u64,
}

impl BatchStats {
    pub fn is_idle(&self) -> bool {
        self.fetched == 0
    }
}

/// The connections one batch works with.
///
/// `log_side` owns the log for the direction being pulled, `read_side`
/// serves source-row reads (a read replica of it, or the same database) and
/// `target` receives the writes. The conflict audit and the failure ledger
/// live on the leader, which is `target` when `leader_is_target` is set and
/// `log_side` otherwise.
pub struct ApplyLinks<'a> {
    pub log_side: &'a Client,
    pub read_side: &'a Client,
    pub target: &'a mut Client,
    pub leader_is_target: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApplyAction {
    Inserted,
    Updated,
    Deleted,
    Skipped(&'static str),
}

enum EntryOutcome {
    Done(ApplyAction),
    /// Always [`ReplicationError::EntryPermanent`].
    Failed(ReplicationError),
}

#[derive(Default)]
struct Screened {
    apply: Vec<ReplicationLogEntry>,
    /// Source entries that lost or were already reflected on the target.
    handled: Vec<i64>,
    deferred: Vec<i64>,
    /// Pending entries in the target's own log that the source change overrides.
    superseded: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceFate {
    Apply,
    Handled,
    Deferred,
}

/// What a resolved conflict means for both competing sides.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Settlement {
    source: SourceFate,
    superseded: Vec<i64>,
}

impl Settlement {
    fn of(resolved: &ResolvedConflict) -> Self {
        let source = if resolved.applies_source() {
            SourceFate::Apply
        } else if resolved.is_deferred() {
            SourceFate::Deferred
        } else {
            SourceFate::Handled
        };
        // A target change still waiting to flow back would undo the winner.
        let superseded = match (source, resolved.resolution) {
            (SourceFate::Apply, _) | (_, Resolution::Skipped) => {
                resolved.conflict.pending_target_ids.clone()
            }
            _ => Vec::new(),
        };
        Self { source, superseded }
    }

    /// An operator released a deferred conflict in favour of the source.
    fn released(resolved: &ResolvedConflict) -> Self {
        Self {
            source: SourceFate::Apply,
            superseded: resolved.conflict.pending_target_ids.clone(),
        }
    }
}

/// Runs batches for any table and direction of one follower.
#[derive(Clone)]
pub struct ChangeApplier {
    follower_id: String,
    batch_size: usize,
    retry: RetryPolicy,
    conflict_window: Duration,
    registry: Arc<RecordRegistry>,
    resolver: ConflictResolver,
}

impl ChangeApplier {
    pub fn new(
        follower_id: &str,
        batch_size: usize,
        retry: RetryPolicy,
        conflict_window: Duration,
        registry: Arc<RecordRegistry>,
        resolver: ConflictResolver,
    ) -> Self {
        Self {
            follower_id: follower_id.to_string(),
            batch_size: batch_size.max(1),
            retry,
            conflict_window,
            registry,
            resolver,
        }
    }

    /// Pull one batch for `table` in `direction` and apply it.
    ///
    /// A failure outside the per-entry retry boundary rolls the whole batch
    /// back, records the error against every fetched entry and leaves the
    /// cursor where it was.
    pub async fn run_batch(
        &self,
        mut links: ApplyLinks<'_>,
        table: &TableConfig,
        direction: Direction,
    ) -> Result<BatchStats> {
        let started = Instant::now();
        let log = LogStore::new(links.log_side, &self.follower_id, direction);
        let cursor = log.cursor(&table.name).await?;
        let entries = log
            .fetch_pending(&table.name, cursor, self.batch_size)
            .await?;

        if entries.is_empty() {
            return Ok(BatchStats::default());
        }

        let fetched_ids: Vec<i64> = entries.iter().map(|e| e.id).collect();
        tracing::debug!(
            "Pulled {} change(s) for {} ({}) after id {}",
            entries.len(),
            table.name,
            direction,
            cursor
        );

        match self.process(&mut links, &log, table, direction, entries).await {
            Ok(mut stats) => {
                stats.duration_ms = started.elapsed().as_millis() as u64;
                Ok(stats)
            }
            Err(e) => {
                let message = format!("{:#}", e);
                if let Err(mark_err) = log.mark_failed(&fetched_ids, &message).await {
                    tracing::error!(
                        "Failed to record batch failure for {}: {:?}",
                        table.name,
                        mark_err
                    );
                }
                Err(batch_error(&table.name, e).into())
            }
        }
    }

    async fn process(
        &self,
        links: &mut ApplyLinks<'_>,
        log: &LogStore<'_>,
        table: &TableConfig,
        direction: Direction,
        entries: Vec<ReplicationLogEntry>,
    ) -> Result<BatchStats> {
        let mut stats = BatchStats {
            fetched: entries.len(),
            ..Default::default()
        };
        let fetched_ids: Vec<i64> = entries.iter().map(|e| e.id).collect();

        let screened = if table.direction.is_bidirectional() {
            let audit_client: &Client = if links.leader_is_target {
                &*links.target
            } else {
                links.log_side
            };
            self.screen_conflicts(&*links.target, audit_client, table, direction, entries, &mut stats)
                .await?
        } else {
            Screened {
                apply: entries,
                ..Default::default()
            }
        };

        let groups = deduplicate(screened.apply);
        let target_shape = TableShape::load(&*links.target, &table.name, &table.primary_key)
            .await
            .context("Failed to read target table structure")?;
        let source_shape = TableShape::load(links.read_side, &table.name, &table.primary_key)
            .await
            .context("Failed to read source table structure")?;

        let outcomes = {
            let mut tx = links
                .target
                .transaction()
                .await
                .context("Failed to begin apply transaction")?;
            tx.execute("SELECT set_config($1, '1', true)", &[&SUPPRESSION_SETTING])
                .await
                .context("Failed to raise capture suppression")?;

            supersede_entries(&tx, &self.follower_id, direction.opposite(), &screened.superseded)
                .await?;

            let mut outcomes = Vec::with_capacity(groups.len());
            for group in &groups {
                let outcome = self
                    .apply_with_retry(
                        &mut tx,
                        links.read_side,
                        &target_shape,
                        &source_shape,
                        table,
                        &group.entry,
                    )
                    .await?;
                outcomes.push(outcome);
            }

            tx.execute("SELECT set_config($1, '0', true)", &[&SUPPRESSION_SETTING])
                .await
                .context("Failed to clear capture suppression")?;
            tx.commit()
                .await
                .context("Failed to commit apply transaction")?;
            outcomes
        };

        // Acknowledge.
        let mut synced: Vec<i64> = Vec::new();
        log.mark_superseded(&screened.handled).await?;
        stats.skipped += screened.handled.len();
        stats.deferred = screened.deferred.len();

        let ledger_client: &Client = if links.leader_is_target {
            &*links.target
        } else {
            links.log_side
        };
        let ledger = FailureLedger::new(ledger_client);

        for (group, outcome) in groups.iter().zip(outcomes) {
            match outcome {
                EntryOutcome::Done(action) => {
                    synced.extend_from_slice(&group.covered_ids);
                    match action {
                        ApplyAction::Skipped(reason) => {
                            stats.skipped += 1;
                            tracing::debug!(
                                "Skipped {} {}/{}: {}",
                                group.entry.operation_type,
                                table.name,
                                group.entry.record_id,
                                reason
                            );
                        }
                        _ => stats.applied += 1,
                    }
                }
                EntryOutcome::Failed(failure) => {
                    stats.failed += 1;
                    log.mark_failed(&group.covered_ids, &failure.cause_message())
                        .await?;
                    ledger
                        .record(&group.entry, &self.follower_id, &failure)
                        .await?;
                }
            }
        }

        log.mark_synced(&synced).await?;

        if let Some(next) = next_cursor(&fetched_ids, &screened.deferred) {
            log.advance_cursor(&table.name, next).await?;
            stats.cursor = Some(next);
        }

        if stats.applied + stats.failed + stats.deferred > 0 {
            tracing::info!(
                "{} ({}): applied {}, skipped {}, failed {}, deferred {}, conflicts {}",
                table.name,
                direction,
                stats.applied,
                stats.skipped,
                stats.failed,
                stats.deferred,
                stats.conflicts
            );
        }
        Ok(stats)
    }

    async fn screen_conflicts(
        &self,
        target: &Client,
        audit_client: &Client,
        table: &TableConfig,
        direction: Direction,
        entries: Vec<ReplicationLogEntry>,
        stats: &mut BatchStats,
    ) -> Result<Screened> {
        let target_log = LogStore::new(target, &self.follower_id, direction.opposite());
        let detector = ConflictDetector::new(&target_log, self.conflict_window);
        let audit = ConflictAudit::new(audit_client, &self.follower_id);
        let mut screened = Screened::default();

        for entry in entries {
            let Some(conflict) = detector.detect(&entry).await? else {
                screened.apply.push(entry);
                continue;
            };
            stats.conflicts += 1;
            let resolved = self.resolver.resolve(conflict, table);

            let settlement = if resolved.is_deferred() && audit.is_released(&entry).await? {
                tracing::info!(
                    "Conflict on {}/{} released by operator, applying log entry {}",
                    table.name,
                    entry.record_id,
                    entry.id
                );
                Settlement::released(&resolved)
            } else {
                audit.record(&resolved).await?;
                tracing::info!(
                    "{} on {}/{}: {} ({})",
                    resolved.conflict.conflict_type,
                    table.name,
                    entry.record_id,
                    resolved.resolution,
                    resolved.reason
                );
                Settlement::of(&resolved)
            };

            screened.superseded.extend_from_slice(&settlement.superseded);
            match settlement.source {
                SourceFate::Apply => screened.apply.push(entry),
                SourceFate::Handled => screened.handled.push(entry.id),
                SourceFate::Deferred => {
                    let unresolved = ReplicationError::ConflictUnresolvable {
                        table: table.name.clone(),
                        record_id: entry.record_id.clone(),
                        reason: resolved.reason.clone(),
                    };
                    tracing::warn!("Holding log entry {}: {}", entry.id, unresolved);
                    screened.deferred.push(entry.id);
                }
            }
        }
        Ok(screened)
    }

    async fn apply_with_retry(
        &self,
        tx: &mut Transaction<'_>,
        read_side: &Client,
        target_shape: &TableShape,
        source_shape: &TableShape,
        table: &TableConfig,
        entry: &ReplicationLogEntry,
    ) -> Result<EntryOutcome> {
        let mut attempt = 0u32;
        loop {
            let savepoint = tx
                .savepoint("replicate_entry")
                .await
                .context("Failed to open savepoint")?;

            match self
                .apply_entry(&savepoint, read_side, target_shape, source_shape, table, entry)
                .await
            {
                Ok(action) => {
                    savepoint
                        .commit()
                        .await
                        .context("Failed to release savepoint")?;
                    return Ok(EntryOutcome::Done(action));
                }
                Err(e) => {
                    savepoint
                        .rollback()
                        .await
                        .context("Failed to roll back savepoint")?;
                    attempt += 1;
                    if attempt >= self.retry.max_attempts {
                        return Ok(EntryOutcome::Failed(ReplicationError::EntryPermanent {
                            log_id: entry.id,
                            attempts: attempt,
                            source: e,
                        }));
                    }
                    let delay = self.retry.delay_for(attempt - 1);
                    tracing::warn!(
                        "Applying log entry {} to {} failed (attempt {}/{}): {:#}, retrying in {:?}",
                        entry.id,
                        table.name,
                        attempt,
                        self.retry.max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn apply_entry(
        &self,
        client: &Transaction<'_>,
        read_side: &Client,
        target_shape: &TableShape,
        source_shape: &TableShape,
        table: &TableConfig,
        entry: &ReplicationLogEntry,
    ) -> Result<ApplyAction> {
        let pk = entry.record_id.as_str();
        let writer = RowWriter::new(client, target_shape);

        if entry.operation_type == OperationType::Delete {
            if writer.exists(pk).await? {
                writer.delete(pk).await?;
                return Ok(ApplyAction::Deleted);
            }
            return Ok(ApplyAction::Skipped("row already absent"));
        }

        let Some(record) = self
            .load_record(read_side, target_shape, source_shape, table, entry)
            .await?
        else {
            return Ok(ApplyAction::Skipped("source row no longer exists"));
        };

        let exists = writer.exists(pk).await?;
        match (entry.operation_type, exists) {
            (OperationType::Insert, true) => Ok(ApplyAction::Skipped("row already present")),
            (OperationType::Update, true) => {
                let columns = target_shape.restrict(record.update_columns(&table.primary_key));
                writer.update(pk, &columns).await?;
                Ok(ApplyAction::Updated)
            }
            _ => {
                writer
                    .insert(&target_shape.restrict(record.insert_columns()))
                    .await?;
                Ok(ApplyAction::Inserted)
            }
        }
    }

    async fn load_record(
        &self,
        read_side: &Client,
        target_shape: &TableShape,
        source_shape: &TableShape,
        table: &TableConfig,
        entry: &ReplicationLogEntry,
    ) -> Result<Option<Record>> {
        let typed = table.sync_mode == SyncMode::Entity;
        let columns = match (&entry.data, typed) {
            (Some(image), false) => Some(columns_from_image(image, target_shape)?),
            _ => fetch_row(read_side, source_shape, &entry.record_id).await?,
        };
        columns
            .map(|columns| Record::build(&self.registry, &table.name, typed, columns))
            .transpose()
    }
}

/// A failure outside the per-entry boundary, classified by its cause.
fn batch_error(table: &str, err: anyhow::Error) -> ReplicationError {
    if is_transient(&err) {
        ReplicationError::Transient(err.context(format!("batch for {} interrupted", table)))
    } else {
        ReplicationError::BatchFatal {
            table: table.to_string(),
            source: err,
        }
    }
}

/// Cursor position after a batch: past every fetched entry, but below the
/// lowest entry that was deferred for review.
pub(crate) fn next_cursor(fetched_ids: &[i64], deferred_ids: &[i64]) -> Option<i64> {
    let handled_max = fetched_ids
        .iter()
        .filter(|id| !deferred_ids.contains(id))
        .max()
        .copied()?;
    match deferred_ids.iter().min() {
        Some(lowest) => {
            let capped = handled_max.min(lowest - 1);
            // Nothing handled below the deferred entry: leave the cursor alone.
            fetched_ids
                .iter()
                .any(|id| *id <= capped && !deferred_ids.contains(id))
                .then_some(capped)
        }
        None => Some(handled_max),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_moves_to_highest_handled_id() {
        assert_eq!(next_cursor(&[5, 6, 9], &[]), Some(9));
        assert_eq!(next_cursor(&[], &[]), None);
    }

    #[test]
    fn test_cursor_stops_below_deferred_entry() {
        assert_eq!(next_cursor(&[5, 6, 7, 9], &[7]), Some(6));
        assert_eq!(next_cursor(&[5, 9], &[7]), Some(5));
        // Only the deferred entry and later ones: no movement.
        assert_eq!(next_cursor(&[7, 9], &[7]), None);
        assert_eq!(next_cursor(&[7], &[7]), None);
    }

    mod settlement {
        use super::*;
        use crate::config::{ConflictStrategy, ReplicationDirection, TableConfig};
        use crate::conflict::detector::tests::entry;
        use crate::conflict::DataConflict;

        fn resolve(strategy: ConflictStrategy, conflict: DataConflict) -> ResolvedConflict {
            let mut table = TableConfig::new("orders", ReplicationDirection::Bidirectional);
            table.conflict_strategy = strategy;
            ConflictResolver::default().resolve(conflict, &table)
        }

        fn leader_vs_pending_follower() -> DataConflict {
            let mut leader = entry(11, OperationType::Update, Direction::LeaderToFollower, 100);
            leader.data = Some(serde_json::json!({"id": 17, "status": "leader-edit"}));
            let mut follower = entry(4, OperationType::Update, Direction::FollowerToLeader, 101);
            follower.data = Some(serde_json::json!({"id": 17, "status": "follower-edit"}));
            DataConflict::new(leader, follower, true).with_pending_target_ids(vec![4, 3])
        }

        #[test]
        fn test_winning_source_supersedes_pending_target_changes() {
            let settled = Settlement::of(&resolve(
                ConflictStrategy::PreferLeader,
                leader_vs_pending_follower(),
            ));
            assert_eq!(settled.source, SourceFate::Apply);
            assert_eq!(settled.superseded, vec![4, 3]);
        }

        #[test]
        fn test_losing_source_leaves_target_change_to_flow_back() {
            let settled = Settlement::of(&resolve(
                ConflictStrategy::PreferFollower,
                leader_vs_pending_follower(),
            ));
            assert_eq!(settled.source, SourceFate::Handled);
            assert!(settled.superseded.is_empty());
        }

        #[test]
        fn test_manual_review_supersedes_nothing_until_released() {
            let resolved = resolve(ConflictStrategy::ManualReview, leader_vs_pending_follower());
            let held = Settlement::of(&resolved);
            assert_eq!(held.source, SourceFate::Deferred);
            assert!(held.superseded.is_empty());

            let released = Settlement::released(&resolved);
            assert_eq!(released.source, SourceFate::Apply);
            assert_eq!(released.superseded, vec![4, 3]);
        }

        #[test]
        fn test_identical_changes_settle_both_sides() {
            let a = entry(11, OperationType::Update, Direction::LeaderToFollower, 100);
            let b = entry(4, OperationType::Update, Direction::FollowerToLeader, 101);
            let settled = Settlement::of(&resolve(
                ConflictStrategy::PreferFollower,
                DataConflict::new(a, b, true),
            ));
            assert_eq!(settled.source, SourceFate::Handled);
            assert_eq!(settled.superseded, vec![4]);
        }

        #[test]
        fn test_already_applied_target_is_not_superseded() {
            let a = entry(11, OperationType::Update, Direction::LeaderToFollower, 100);
            let b = entry(4, OperationType::Delete, Direction::FollowerToLeader, 101);
            let settled = Settlement::of(&resolve(
                ConflictStrategy::PreferLeader,
                DataConflict::new(a, b, false),
            ));
            assert_eq!(settled.source, SourceFate::Apply);
            assert!(settled.superseded.is_empty());
        }
    }

    #[test]
    fn test_batch_errors_are_classified() {
        use crate::error::{error_kind, ErrorKind};

        let io = anyhow::Error::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        let err = anyhow::Error::from(batch_error("orders", io));
        assert_eq!(error_kind(&err), ErrorKind::Transient);

        let err = anyhow::Error::from(batch_error("orders", anyhow::anyhow!("bad cast")));
        assert_eq!(error_kind(&err), ErrorKind::BatchFatal);
        assert!(err.to_string().contains("orders"));
    }

    #[test]
    fn test_idle_stats() {
        assert!(BatchStats::default().is_idle());
        let stats = BatchStats {
            fetched: 2,
            ..Default::default()
        };
        assert!(!stats.is_idle());
    }
}
