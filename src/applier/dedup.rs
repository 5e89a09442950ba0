// ABOUTME: Per-record deduplication of a pulled batch into one terminal operation each
// ABOUTME: Every collapsed entry id is kept so the whole group is acknowledged together

use std::collections::HashMap;

use crate::log_store::{OperationType, ReplicationLogEntry};

/// The entry chosen for a record plus every log id it stands for.
#[derive(Debug, Clone, PartialEq)]
pub struct DedupGroup {
    pub entry: ReplicationLogEntry,
    /// Ids of all entries of the group, the chosen one included, ascending.
    pub covered_ids: Vec<i64>,
}

impl DedupGroup {
    pub fn max_id(&self) -> i64 {
        self.covered_ids.last().copied().unwrap_or(self.entry.id)
    }

    pub fn min_id(&self) -> i64 {
        self.covered_ids.first().copied().unwrap_or(self.entry.id)
    }
}

/// Collapse entries sharing a record id, then order the survivors by timestamp.
///
/// Within a group, in timestamp order: the latest Delete wins unless an Insert
/// follows it, in which case the latest such Insert wins unless an Update
/// follows that Insert. Without any Delete, the more recent of the latest
/// Insert and the latest Update wins.
pub fn deduplicate(entries: Vec<ReplicationLogEntry>) -> Vec<DedupGroup> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<ReplicationLogEntry>> = HashMap::new();
    for entry in entries {
        if !groups.contains_key(&entry.record_id) {
            order.push(entry.record_id.clone());
        }
        groups.entry(entry.record_id.clone()).or_default().push(entry);
    }

    let mut result: Vec<DedupGroup> = order
        .into_iter()
        .filter_map(|key| groups.remove(&key))
        .filter_map(collapse)
        .collect();

    result.sort_by(|a, b| {
        a.entry
            .timestamp
            .cmp(&b.entry.timestamp)
            .then(a.entry.id.cmp(&b.entry.id))
    });
    result
}

fn collapse(mut group: Vec<ReplicationLogEntry>) -> Option<DedupGroup> {
    group.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
    let mut covered_ids: Vec<i64> = group.iter().map(|e| e.id).collect();
    covered_ids.sort_unstable();

    let winner = if group.len() == 1 {
        0
    } else {
        pick_terminal(&group)?
    };

    Some(DedupGroup {
        entry: group.swap_remove(winner),
        covered_ids,
    })
}

// Index of the terminal entry in a timestamp-ordered group.
fn pick_terminal(group: &[ReplicationLogEntry]) -> Option<usize> {
    let last_of = |op: OperationType, after: Option<usize>| {
        group
            .iter()
            .enumerate()
            .filter(|(i, e)| e.operation_type == op && after.map_or(true, |a| *i > a))
            .map(|(i, _)| i)
            .last()
    };

    match last_of(OperationType::Delete, None) {
        Some(delete) => match last_of(OperationType::Insert, Some(delete)) {
            Some(insert) => Some(last_of(OperationType::Update, Some(insert)).unwrap_or(insert)),
            None => Some(delete),
        },
        None => {
            match (
                last_of(OperationType::Insert, None),
                last_of(OperationType::Update, None),
            ) {
                (Some(i), Some(u)) => Some(i.max(u)),
                (Some(i), None) => Some(i),
                (None, Some(u)) => Some(u),
                (None, None) => None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_store::Direction;
    use chrono::{TimeZone, Utc};

    fn change(id: i64, record: &str, op: OperationType, secs: i64) -> ReplicationLogEntry {
        ReplicationLogEntry {
            id,
            table_name: "orders".to_string(),
            operation_type: op,
            record_id: record.to_string(),
            data: None,
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            direction: Direction::LeaderToFollower,
            source_server: "leader".to_string(),
            operation_id: format!("op-{}", id),
        }
    }

    #[test]
    fn test_recreate_after_delete_yields_final_insert() {
        use OperationType::*;
        let batch = vec![
            change(1, "7", Insert, 1),
            change(2, "7", Update, 2),
            change(3, "7", Delete, 3),
            change(4, "7", Insert, 4),
        ];
        let groups = deduplicate(batch);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].entry.operation_type, Insert);
        assert_eq!(groups[0].entry.id, 4);
        assert_eq!(groups[0].covered_ids, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_update_after_recreate_wins() {
        use OperationType::*;
        let batch = vec![
            change(1, "7", Delete, 1),
            change(2, "7", Insert, 2),
            change(3, "7", Update, 3),
        ];
        let groups = deduplicate(batch);
        assert_eq!(groups[0].entry.id, 3);
        assert_eq!(groups[0].entry.operation_type, Update);
    }

    #[test]
    fn test_delete_is_terminal_without_recreate() {
        use OperationType::*;
        let batch = vec![
            change(1, "7", Insert, 1),
            change(2, "7", Delete, 2),
            change(3, "7", Update, 3),
        ];
        let groups = deduplicate(batch);
        assert_eq!(groups[0].entry.operation_type, Delete);
        assert_eq!(groups[0].max_id(), 3);
    }

    #[test]
    fn test_latest_of_insert_and_update() {
        use OperationType::*;
        let groups = deduplicate(vec![change(1, "7", Update, 1), change(2, "7", Insert, 5)]);
        assert_eq!(groups[0].entry.id, 2);
        let groups = deduplicate(vec![change(1, "7", Insert, 1), change(2, "7", Update, 2)]);
        assert_eq!(groups[0].entry.id, 2);
        assert_eq!(groups[0].min_id(), 1);
    }

    #[test]
    fn test_singletons_pass_through_in_timestamp_order() {
        use OperationType::*;
        let batch = vec![
            change(5, "a", Insert, 1),
            change(6, "b", Update, 2),
            change(7, "a", Update, 3),
            change(9, "c", Delete, 2),
        ];
        let groups = deduplicate(batch);
        let ids: Vec<i64> = groups.iter().map(|g| g.entry.id).collect();
        assert_eq!(ids, vec![6, 9, 7]);
        assert_eq!(groups[2].covered_ids, vec![5, 7]);
    }
}
