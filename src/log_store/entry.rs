// ABOUTME: Replication log entry types - the sole unit of change propagation
// ABOUTME: Operation and direction enums with their database encodings

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio_postgres::Row;

use crate::utils::{validate_identifier, MAX_IDENTIFIER_LEN};

/// Row-level operation recorded by a capture trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    Insert,
    Update,
    Delete,
}

impl OperationType {
    /// Encoding used in `replication_logs.operation_type` (matches `TG_OP`).
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "INSERT",
            OperationType::Update => "UPDATE",
            OperationType::Delete => "DELETE",
        }
    }
}

impl FromStr for OperationType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "INSERT" => Ok(OperationType::Insert),
            "UPDATE" => Ok(OperationType::Update),
            "DELETE" => Ok(OperationType::Delete),
            other => bail!("unknown operation type '{}'", other),
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationType::Insert => "Insert",
            OperationType::Update => "Update",
            OperationType::Delete => "Delete",
        };
        f.write_str(name)
    }
}

/// Origin of a change: which side wrote it and therefore which side it flows to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    LeaderToFollower,
    FollowerToLeader,
}

impl Direction {
    pub fn as_i16(&self) -> i16 {
        match self {
            Direction::LeaderToFollower => 0,
            Direction::FollowerToLeader => 1,
        }
    }

    pub fn from_i16(value: i16) -> Result<Self> {
        match value {
            0 => Ok(Direction::LeaderToFollower),
            1 => Ok(Direction::FollowerToLeader),
            other => bail!("unknown replication direction code {}", other),
        }
    }

    pub fn opposite(&self) -> Direction {
        match self {
            Direction::LeaderToFollower => Direction::FollowerToLeader,
            Direction::FollowerToLeader => Direction::LeaderToFollower,
        }
    }

    /// Stable scheduler key for a table pulled in this direction.
    pub fn task_key(&self, table: &str) -> String {
        format!("{}_{}", self, table)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::LeaderToFollower => f.write_str("LeaderToFollower"),
            Direction::FollowerToLeader => f.write_str("FollowerToLeader"),
        }
    }
}

/// Name of the per-follower status marker table for a direction.
///
/// Leader-originated entries are tracked in `replication_status_<follower>` on
/// the leader; follower-originated entries in
/// `replication_status_<follower>_to_leader` on the follower.
pub fn status_table_name(follower_id: &str, direction: Direction) -> String {
    match direction {
        Direction::LeaderToFollower => format!("replication_status_{}", follower_id),
        Direction::FollowerToLeader => format!("replication_status_{}_to_leader", follower_id),
    }
}

/// Check that a follower id is usable in every generated name.
///
/// The longest name built from it is the follower-to-leader status table, which
/// must fit PostgreSQL's 63-byte identifier limit or it would be truncated.
pub fn validate_follower_id(follower_id: &str) -> Result<()> {
    validate_identifier(follower_id)?;
    let longest = status_table_name(follower_id, Direction::FollowerToLeader);
    if longest.len() > MAX_IDENTIFIER_LEN {
        bail!(
            "follower id '{}' is too long: status table {} would exceed {} bytes (at most {} characters allowed)",
            follower_id,
            longest,
            MAX_IDENTIFIER_LEN,
            MAX_IDENTIFIER_LEN - (longest.len() - follower_id.len())
        );
    }
    Ok(())
}

/// Key used in `sync_progress.follower_server_id` for a direction.
pub fn progress_key(follower_id: &str, direction: Direction) -> String {
    match direction {
        Direction::LeaderToFollower => follower_id.to_string(),
        Direction::FollowerToLeader => format!("{}_to_leader", follower_id),
    }
}

/// One captured row-level change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationLogEntry {
    pub id: i64,
    pub table_name: String,
    pub operation_type: OperationType,
    /// Primary-key value, stringified.
    pub record_id: String,
    /// Row image captured by the trigger (NEW, or OLD for deletes).
    pub data: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub source_server: String,
    /// Opaque dedup token assigned by the trigger.
    pub operation_id: String,
}

impl ReplicationLogEntry {
    /// Column list matching [`ReplicationLogEntry::from_row`].
    pub const SELECT_COLUMNS: &'static str = "l.id, l.table_name, l.operation_type, l.record_id, \
         l.data, l.timestamp, l.direction, l.source_server, l.operation_id";

    pub fn from_row(row: &Row) -> Result<Self> {
        let op: String = row.try_get(2).context("operation_type")?;
        let direction: i16 = row.try_get(6).context("direction")?;
        Ok(Self {
            id: row.try_get(0).context("id")?,
            table_name: row.try_get(1).context("table_name")?,
            operation_type: op.parse()?,
            record_id: row.try_get(3).context("record_id")?,
            data: row.try_get(4).context("data")?,
            timestamp: row.try_get(5).context("timestamp")?,
            direction: Direction::from_i16(direction)?,
            source_server: row
                .try_get::<_, Option<String>>(7)
                .context("source_server")?
                .unwrap_or_default(),
            operation_id: row
                .try_get::<_, Option<String>>(8)
                .context("operation_id")?
                .unwrap_or_default(),
        })
    }
}

/// A log row written by the engine itself (recovery re-derivation).
#[derive(Debug, Clone, PartialEq)]
pub struct NewLogEntry {
    pub table_name: String,
    pub operation_type: OperationType,
    pub record_id: String,
    pub data: Option<serde_json::Value>,
    pub direction: Direction,
    pub source_server: String,
}
