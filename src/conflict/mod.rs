// ABOUTME: Conflict detection, resolution and auditing for bidirectional tables
// ABOUTME: A conflict pairs a change about to be applied with a competing change on the target side

pub mod audit;
pub mod compare;
pub mod detector;
pub mod resolver;

use serde::Serialize;
use std::fmt;

use crate::log_store::{OperationType, ReplicationLogEntry};

pub use audit::{ConflictAudit, ConflictRecord};
pub use compare::compare_values;
pub use detector::{classify, ConflictDetector};
pub use resolver::{ConflictResolver, CustomResolver, PreferLeaderResolver, ResolvedConflict};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConflictType {
    ConcurrentUpdate,
    DeleteAfterUpdate,
    UpdateAfterDelete,
    DuplicateInsert,
    VersionMismatch,
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConflictType::ConcurrentUpdate => "ConcurrentUpdate",
            ConflictType::DeleteAfterUpdate => "DeleteAfterUpdate",
            ConflictType::UpdateAfterDelete => "UpdateAfterDelete",
            ConflictType::DuplicateInsert => "DuplicateInsert",
            ConflictType::VersionMismatch => "VersionMismatch",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Resolution {
    ResolvedAutomatically,
    RequiresManualReview,
    Failed,
    /// Both sides already agree; nothing to apply.
    Skipped,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Resolution::ResolvedAutomatically => "ResolvedAutomatically",
            Resolution::RequiresManualReview => "RequiresManualReview",
            Resolution::Failed => "Failed",
            Resolution::Skipped => "Skipped",
        };
        f.write_str(name)
    }
}

/// Which of the two competing entries prevails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Winner {
    /// The change being applied.
    Source,
    /// The change already present or pending on the target side.
    Target,
}

/// A detected conflict, before resolution.
#[derive(Debug, Clone, Serialize)]
pub struct DataConflict {
    pub table_name: String,
    pub record_id: String,
    pub source_entry: ReplicationLogEntry,
    pub target_entry: ReplicationLogEntry,
    pub conflict_type: ConflictType,
    /// Whether the target entry is still waiting to be applied (vs. already applied).
    pub target_pending: bool,
    /// Every pending target-side entry for the record inside the window, newest first.
    pub pending_target_ids: Vec<i64>,
}

impl DataConflict {
    pub fn new(
        source_entry: ReplicationLogEntry,
        target_entry: ReplicationLogEntry,
        target_pending: bool,
    ) -> Self {
        Self {
            table_name: source_entry.table_name.clone(),
            record_id: source_entry.record_id.clone(),
            conflict_type: classify(source_entry.operation_type, target_entry.operation_type),
            pending_target_ids: if target_pending {
                vec![target_entry.id]
            } else {
                Vec::new()
            },
            source_entry,
            target_entry,
            target_pending,
        }
    }

    /// Replace the pending target ids with the full set found by the detector.
    pub fn with_pending_target_ids(mut self, ids: Vec<i64>) -> Self {
        if self.target_pending {
            self.pending_target_ids = ids;
        }
        self
    }

    /// True when both entries would leave the row in the same state.
    pub fn is_convergent(&self) -> bool {
        let (s, t) = (&self.source_entry, &self.target_entry);
        match (s.operation_type, t.operation_type) {
            (OperationType::Delete, OperationType::Delete) => true,
            (OperationType::Delete, _) | (_, OperationType::Delete) => false,
            _ => s.data.is_some() && s.data == t.data,
        }
    }
}
