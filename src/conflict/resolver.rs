// ABOUTME: Conflict resolution strategies configured per table
// ABOUTME: Picks a winning entry or defers the conflict for manual review

use anyhow::Result;
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::Arc;

use super::compare::compare_values;
use super::{DataConflict, Resolution, Winner};
use crate::config::{ConflictStrategy, TableConfig};
use crate::log_store::{Direction, ReplicationLogEntry};

/// Pluggable decision for tables configured with the `custom` strategy.
pub trait CustomResolver: Send + Sync {
    fn resolve(&self, conflict: &DataConflict) -> Result<Winner>;
}

/// Default custom hook: behaves like the `prefer_leader` strategy.
#[derive(Debug, Default)]
pub struct PreferLeaderResolver;

impl CustomResolver for PreferLeaderResolver {
    fn resolve(&self, conflict: &DataConflict) -> Result<Winner> {
        Ok(prefer_origin(conflict, Direction::LeaderToFollower))
    }
}

/// Outcome of resolving one conflict.
#[derive(Debug, Clone)]
pub struct ResolvedConflict {
    pub conflict: DataConflict,
    pub resolution: Resolution,
    pub winner: Option<Winner>,
    pub strategy: ConflictStrategy,
    pub reason: String,
}

impl ResolvedConflict {
    /// Source entry should be written to the target.
    pub fn applies_source(&self) -> bool {
        self.resolution == Resolution::ResolvedAutomatically && self.winner == Some(Winner::Source)
    }

    /// Source entry must stay pending and hold the cursor back.
    pub fn is_deferred(&self) -> bool {
        matches!(
            self.resolution,
            Resolution::RequiresManualReview | Resolution::Failed
        )
    }

    pub fn winning_entry(&self) -> Option<&ReplicationLogEntry> {
        match self.winner? {
            Winner::Source => Some(&self.conflict.source_entry),
            Winner::Target => Some(&self.conflict.target_entry),
        }
    }
}

#[derive(Clone)]
pub struct ConflictResolver {
    custom: Arc<dyn CustomResolver>,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(Arc::new(PreferLeaderResolver))
    }
}

impl ConflictResolver {
    pub fn new(custom: Arc<dyn CustomResolver>) -> Self {
        Self { custom }
    }

    pub fn resolve(&self, conflict: DataConflict, table: &TableConfig) -> ResolvedConflict {
        let strategy = table.conflict_strategy;

        if conflict.is_convergent() {
            return ResolvedConflict {
                conflict,
                resolution: Resolution::Skipped,
                winner: None,
                strategy,
                reason: "both sides already hold the same row state".to_string(),
            };
        }

        let decision: Result<(Winner, String)> = match strategy {
            ConflictStrategy::PreferLeader => Ok((
                prefer_origin(&conflict, Direction::LeaderToFollower),
                "leader change preferred".to_string(),
            )),
            ConflictStrategy::PreferFollower => Ok((
                prefer_origin(&conflict, Direction::FollowerToLeader),
                "follower change preferred".to_string(),
            )),
            ConflictStrategy::LastWriteWins => Ok(last_write_wins(&conflict, table)),
            ConflictStrategy::FieldPriority => {
                Ok(by_fields(&conflict, &table.effective_priority_fields())
                    .unwrap_or((Winner::Source, "priority fields equal, source kept".to_string())))
            }
            ConflictStrategy::Custom => self
                .custom
                .resolve(&conflict)
                .map(|winner| (winner, "custom resolver".to_string())),
            ConflictStrategy::ManualReview => {
                return ResolvedConflict {
                    conflict,
                    resolution: Resolution::RequiresManualReview,
                    winner: None,
                    strategy,
                    reason: "table requires manual review of conflicts".to_string(),
                };
            }
        };

        match decision {
            Ok((winner, reason)) => ResolvedConflict {
                conflict,
                resolution: Resolution::ResolvedAutomatically,
                winner: Some(winner),
                strategy,
                reason,
            },
            Err(e) => ResolvedConflict {
                conflict,
                resolution: Resolution::Failed,
                winner: None,
                strategy,
                reason: format!("resolver failed: {:#}", e),
            },
        }
    }
}

fn prefer_origin(conflict: &DataConflict, preferred: Direction) -> Winner {
    if conflict.source_entry.direction == preferred {
        Winner::Source
    } else {
        Winner::Target
    }
}

fn last_write_wins(conflict: &DataConflict, table: &TableConfig) -> (Winner, String) {
    let (s, t) = (&conflict.source_entry, &conflict.target_entry);
    match s.timestamp.cmp(&t.timestamp) {
        Ordering::Greater => (Winner::Source, "source change is newer".to_string()),
        Ordering::Less => (Winner::Target, "target change is newer".to_string()),
        Ordering::Equal => by_fields(conflict, &table.effective_priority_fields())
            .unwrap_or((Winner::Source, "timestamps and priority fields equal, source kept".to_string())),
    }
}

// First priority field whose values differ decides; the greater value wins.
fn by_fields(conflict: &DataConflict, fields: &[String]) -> Option<(Winner, String)> {
    let source = conflict.source_entry.data.as_ref();
    let target = conflict.target_entry.data.as_ref();

    for field in fields {
        let a = source.and_then(|d| d.get(field)).unwrap_or(&Value::Null);
        let b = target.and_then(|d| d.get(field)).unwrap_or(&Value::Null);
        if a.is_null() && b.is_null() {
            continue;
        }
        match compare_values(a, b) {
            Some(Ordering::Greater) => {
                return Some((Winner::Source, format!("higher {} on source", field)))
            }
            Some(Ordering::Less) => {
                return Some((Winner::Target, format!("higher {} on target", field)))
            }
            _ => continue,
        }
    }
    None
}
