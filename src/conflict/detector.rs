// ABOUTME: Conflict detection against the target side's own change log
// ABOUTME: Looks for pending changes within a time window and for newer already-applied changes

use anyhow::Result;
use chrono::Duration as ChronoDuration;
use std::time::Duration;

use super::{ConflictType, DataConflict};
use crate::log_store::{LogStore, OperationType, ReplicationLogEntry};

/// Classify a conflict by the operation pair (change being applied, competing change).
pub fn classify(source: OperationType, target: OperationType) -> ConflictType {
    use OperationType::*;
    match (source, target) {
        (Update, Update) => ConflictType::ConcurrentUpdate,
        (Delete, Update) => ConflictType::DeleteAfterUpdate,
        (Update, Delete) => ConflictType::UpdateAfterDelete,
        (Insert, Insert) => ConflictType::DuplicateInsert,
        _ => ConflictType::VersionMismatch,
    }
}

/// Finds competing changes for entries flowing into the target database.
///
/// `target_log` must be the store of the opposite direction on the target
/// side, i.e. the changes the target's own triggers captured.
pub struct ConflictDetector<'a> {
    target_log: &'a LogStore<'a>,
    window: ChronoDuration,
}

impl<'a> ConflictDetector<'a> {
    pub fn new(target_log: &'a LogStore<'a>, window: Duration) -> Self {
        let window = ChronoDuration::from_std(window).unwrap_or_else(|_| ChronoDuration::seconds(30));
        Self { target_log, window }
    }

    /// Competing change for `entry`, if any.
    ///
    /// A pending target change inside the window takes precedence over an
    /// already-applied newer one.
    pub async fn detect(&self, entry: &ReplicationLogEntry) -> Result<Option<DataConflict>> {
        let pending = self
            .target_log
            .pending_for_record(
                &entry.table_name,
                &entry.record_id,
                entry.timestamp - self.window,
                entry.timestamp + self.window,
            )
            .await?;
        let pending_ids: Vec<i64> = pending.iter().map(|e| e.id).collect();
        if let Some(target) = pending.into_iter().next() {
            return Ok(Some(
                DataConflict::new(entry.clone(), target, true).with_pending_target_ids(pending_ids),
            ));
        }

        let applied = self
            .target_log
            .newer_synced_for_record(&entry.table_name, &entry.record_id, entry.timestamp)
            .await?;
        Ok(applied
            .into_iter()
            .next()
            .map(|target| DataConflict::new(entry.clone(), target, false)))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::log_store::Direction;
    use chrono::{TimeZone, Utc};

    pub(crate) fn entry(
        id: i64,
        op: OperationType,
        direction: Direction,
        secs: i64,
    ) -> ReplicationLogEntry {
        ReplicationLogEntry {
            id,
            table_name: "orders".to_string(),
            operation_type: op,
            record_id: "17".to_string(),
            data: Some(serde_json::json!({"id": 17, "status": "paid"})),
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            direction,
            source_server: match direction {
                Direction::LeaderToFollower => "leader".to_string(),
                Direction::FollowerToLeader => "branch-1".to_string(),
            },
            operation_id: format!("op-{}", id),
        }
    }

    #[test]
    fn test_classification_table() {
        use OperationType::*;
        assert_eq!(classify(Update, Update), ConflictType::ConcurrentUpdate);
        assert_eq!(classify(Delete, Update), ConflictType::DeleteAfterUpdate);
        assert_eq!(classify(Update, Delete), ConflictType::UpdateAfterDelete);
        assert_eq!(classify(Insert, Insert), ConflictType::DuplicateInsert);
        assert_eq!(classify(Insert, Update), ConflictType::VersionMismatch);
        assert_eq!(classify(Delete, Delete), ConflictType::VersionMismatch);
    }

    #[test]
    fn test_follower_delete_against_applied_leader_update() {
        let follower_delete = entry(3, OperationType::Delete, Direction::FollowerToLeader, 10);
        let leader_update = entry(8, OperationType::Update, Direction::LeaderToFollower, 12);
        let conflict = DataConflict::new(follower_delete, leader_update, false);
        assert_eq!(conflict.conflict_type, ConflictType::DeleteAfterUpdate);
        assert_eq!(conflict.record_id, "17");
        assert!(!conflict.is_convergent());
    }

    #[test]
    fn test_pending_ids_only_for_pending_targets() {
        let a = entry(4, OperationType::Update, Direction::LeaderToFollower, 20);
        let b = entry(9, OperationType::Update, Direction::FollowerToLeader, 21);
        let pending = DataConflict::new(a.clone(), b.clone(), true).with_pending_target_ids(vec![9, 6]);
        assert_eq!(pending.pending_target_ids, vec![9, 6]);

        let applied = DataConflict::new(a, b, false).with_pending_target_ids(vec![9]);
        assert!(applied.pending_target_ids.is_empty());
    }

    #[test]
    fn test_identical_updates_converge() {
        let a = entry(1, OperationType::Update, Direction::LeaderToFollower, 5);
        let b = entry(2, OperationType::Update, Direction::FollowerToLeader, 6);
        assert!(DataConflict::new(a, b, true).is_convergent());
    }
}
