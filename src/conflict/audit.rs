// ABOUTME: Persistence of resolved and deferred conflicts in conflict_logs on the leader
// ABOUTME: Deferred conflicts are recorded once per source entry and released by an operator

// Log ids are only unique within the database holding the log, so a source
// entry is identified by table, log id, direction and follower together.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio_postgres::Client;

use super::{Resolution, ResolvedConflict};
use crate::log_store::ReplicationLogEntry;

/// One stored conflict row.
#[derive(Debug, Clone, Serialize)]
pub struct ConflictRecord {
    pub id: i64,
    pub table_name: String,
    pub record_id: String,
    pub conflict_type: String,
    pub detected_at: DateTime<Utc>,
    pub resolution: String,
    pub resolution_strategy: String,
    pub details: Option<serde_json::Value>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

pub struct ConflictAudit<'a> {
    client: &'a Client,
    follower_id: &'a str,
}

impl<'a> ConflictAudit<'a> {
    pub fn new(client: &'a Client, follower_id: &'a str) -> Self {
        Self {
            client,
            follower_id,
        }
    }

    /// Store a conflict outcome. Deferred conflicts already on record are not duplicated.
    pub async fn record(&self, resolved: &ResolvedConflict) -> Result<Option<i64>> {
        let source = &resolved.conflict.source_entry;
        if resolved.is_deferred() && self.open_review(source).await?.is_some() {
            return Ok(None);
        }

        let details = conflict_details(resolved, self.follower_id);
        let resolved_at: Option<DateTime<Utc>> =
            (resolved.resolution == Resolution::ResolvedAutomatically
                || resolved.resolution == Resolution::Skipped)
                .then(Utc::now);
        let resolved_by: Option<&str> = resolved_at.map(|_| "engine");

        let row = self
            .client
            .query_one(
                "INSERT INTO conflict_logs
                    (table_name, record_id, conflict_type, resolution, resolution_strategy,
                     details, resolved_by, resolved_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 RETURNING id",
                &[
                    &resolved.conflict.table_name,
                    &resolved.conflict.record_id,
                    &resolved.conflict.conflict_type.to_string(),
                    &resolved.resolution.to_string(),
                    &resolved.strategy.to_string(),
                    &details,
                    &resolved_by,
                    &resolved_at,
                ],
            )
            .await
            .with_context(|| {
                format!(
                    "Failed to record conflict for {}/{}",
                    resolved.conflict.table_name, resolved.conflict.record_id
                )
            })?;
        Ok(Some(row.get(0)))
    }

    /// Unreleased review row for a deferred source entry.
    pub async fn open_review(&self, source: &ReplicationLogEntry) -> Result<Option<i64>> {
        let row = self
            .client
            .query_opt(
                "SELECT id FROM conflict_logs
                 WHERE table_name = $1
                   AND details ->> 'source_log_id' = $2
                   AND details ->> 'source_direction' = $3
                   AND details ->> 'follower_id' = $4
                   AND resolution IN ('RequiresManualReview', 'Failed')
                   AND resolved_at IS NULL
                 ORDER BY id DESC LIMIT 1",
                &[
                    &source.table_name,
                    &source.id.to_string(),
                    &source.direction.to_string(),
                    &self.follower_id,
                ],
            )
            .await
            .context("Failed to look up open conflict review")?;
        Ok(row.map(|r| r.get(0)))
    }

    /// Whether an operator released the deferred source entry for application.
    pub async fn is_released(&self, source: &ReplicationLogEntry) -> Result<bool> {
        let row = self
            .client
            .query_one(
                "SELECT EXISTS (
                    SELECT 1 FROM conflict_logs
                    WHERE table_name = $1
                      AND details ->> 'source_log_id' = $2
                      AND details ->> 'source_direction' = $3
                      AND details ->> 'follower_id' = $4
                      AND resolution IN ('RequiresManualReview', 'Failed')
                      AND resolved_at IS NOT NULL
                 )",
                &[
                    &source.table_name,
                    &source.id.to_string(),
                    &source.direction.to_string(),
                    &self.follower_id,
                ],
            )
            .await
            .context("Failed to check conflict release")?;
        Ok(row.get(0))
    }

    /// Release a deferred conflict so its source entry is applied on the next pass.
    pub async fn release(&self, conflict_id: i64, resolved_by: &str) -> Result<bool> {
        let updated = self
            .client
            .execute(
                "UPDATE conflict_logs SET resolved_by = $2, resolved_at = NOW()
                 WHERE id = $1 AND resolved_at IS NULL",
                &[&conflict_id, &resolved_by],
            )
            .await
            .with_context(|| format!("Failed to release conflict {}", conflict_id))?;
        Ok(updated > 0)
    }

    /// Conflicts of this follower still waiting for a human decision.
    pub async fn pending_reviews(&self, table: Option<&str>) -> Result<Vec<ConflictRecord>> {
        let rows = self
            .client
            .query(
                "SELECT id, table_name, record_id, conflict_type, detected_at, resolution,
                        resolution_strategy, details, resolved_by, resolved_at
                 FROM conflict_logs
                 WHERE resolved_at IS NULL AND ($1::text IS NULL OR table_name = $1)
                   AND details ->> 'follower_id' = $2
                 ORDER BY detected_at, id",
                &[&table, &self.follower_id],
            )
            .await
            .context("Failed to list pending conflict reviews")?;

        Ok(rows
            .iter()
            .map(|row| ConflictRecord {
                id: row.get(0),
                table_name: row.get(1),
                record_id: row.get(2),
                conflict_type: row.get(3),
                detected_at: row.get(4),
                resolution: row.get(5),
                resolution_strategy: row.get(6),
                details: row.get(7),
                resolved_by: row.get(8),
                resolved_at: row.get(9),
            })
            .collect())
    }
}

fn conflict_details(resolved: &ResolvedConflict, follower_id: &str) -> serde_json::Value {
    let c = &resolved.conflict;
    json!({
        "follower_id": follower_id,
        "source_log_id": c.source_entry.id.to_string(),
        "target_log_id": c.target_entry.id.to_string(),
        "source_direction": c.source_entry.direction.to_string(),
        "source_operation": c.source_entry.operation_type.to_string(),
        "target_operation": c.target_entry.operation_type.to_string(),
        "source_timestamp": c.source_entry.timestamp,
        "target_timestamp": c.target_entry.timestamp,
        "source_server": c.source_entry.source_server,
        "target_server": c.target_entry.source_server,
        "target_pending": c.target_pending,
        "winner": resolved.winner,
        "reason": resolved.reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConflictStrategy, ReplicationDirection, TableConfig};
    use crate::conflict::detector::tests::entry;
    use crate::conflict::{ConflictResolver, DataConflict};
    use crate::log_store::{Direction, OperationType};

    #[test]
    fn test_details_carry_both_entries() {
        let mut table = TableConfig::new("orders", ReplicationDirection::Bidirectional);
        table.conflict_strategy = ConflictStrategy::PreferLeader;
        let conflict = DataConflict::new(
            entry(3, OperationType::Delete, Direction::FollowerToLeader, 10),
            entry(8, OperationType::Update, Direction::LeaderToFollower, 12),
            false,
        );
        let resolved = ConflictResolver::default().resolve(conflict, &table);
        let details = conflict_details(&resolved, "branch01");
        assert_eq!(details["source_log_id"], "3");
        assert_eq!(details["target_log_id"], "8");
        assert_eq!(details["source_operation"], "Delete");
        assert_eq!(details["winner"], "Target");
        assert_eq!(details["target_pending"], false);
    }

    #[test]
    fn test_details_identify_source_direction_and_follower() {
        let table = TableConfig::new("orders", ReplicationDirection::Bidirectional);
        let source = entry(3, OperationType::Update, Direction::LeaderToFollower, 10);
        let mirrored = entry(3, OperationType::Update, Direction::FollowerToLeader, 10);

        let down = conflict_details(
            &ConflictResolver::default().resolve(
                DataConflict::new(source, mirrored.clone(), true),
                &table,
            ),
            "branch01",
        );
        let up = conflict_details(
            &ConflictResolver::default().resolve(
                DataConflict::new(mirrored.clone(), mirrored, true),
                &table,
            ),
            "branch02",
        );

        // Same log id and table on both sides; direction and follower tell them apart.
        assert_eq!(down["source_log_id"], up["source_log_id"]);
        assert_eq!(down["source_direction"], Direction::LeaderToFollower.to_string());
        assert_eq!(up["source_direction"], Direction::FollowerToLeader.to_string());
        assert_eq!(down["follower_id"], "branch01");
        assert_eq!(up["follower_id"], "branch02");
    }
}
