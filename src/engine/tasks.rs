// ABOUTME: Tick bodies for scheduled work - table replication, periodic schema sync and retention cleanup
// ABOUTME: Replication ticks keep their connections between runs and reopen them once closed

use anyhow::{Context, Result};
use chrono::Utc;
use futures::FutureExt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_postgres::Client;
use tracing::Instrument;

use crate::applier::{ApplyLinks, BatchStats, ChangeApplier};
use crate::capture::{TriggerInstaller, TriggerReport};
use crate::config::TableConfig;
use crate::error::{error_kind, ErrorKind};
use crate::log_store::{ensure_log_schema, Direction, LogStore};
use crate::orchestrator::TickFn;
use crate::postgres::connect_with_retry;
use crate::retry::RetryPolicy;
use crate::schema::{SchemaSyncOutcome, SchemaSynchronizer};

/// Connection targets of one engine instance.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub leader: String,
    pub follower: String,
    /// Read replica of the leader, used for source reads when set.
    pub leader_read: Option<String>,
}

impl Endpoints {
    pub fn leader_read_url(&self) -> &str {
        self.leader_read.as_deref().unwrap_or(&self.leader)
    }
}

/// Long-lived clients owned by one replication task.
pub struct TaskConnections {
    leader: Client,
    follower: Client,
    leader_read: Option<Client>,
}

impl TaskConnections {
    pub async fn open(endpoints: &Endpoints) -> Result<Self> {
        let leader = connect_with_retry(&endpoints.leader)
            .await
            .context("Failed to connect to leader database")?;
        let follower = connect_with_retry(&endpoints.follower)
            .await
            .context("Failed to connect to follower database")?;
        let leader_read = match &endpoints.leader_read {
            Some(url) => Some(
                connect_with_retry(url)
                    .await
                    .context("Failed to connect to leader read replica")?,
            ),
            None => None,
        };
        Ok(Self {
            leader,
            follower,
            leader_read,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.leader.is_closed()
            || self.follower.is_closed()
            || self.leader_read.as_ref().map(Client::is_closed).unwrap_or(false)
    }

    /// Split the clients into log, read and write roles for a direction.
    pub fn links(&mut self, direction: Direction) -> ApplyLinks<'_> {
        let TaskConnections {
            leader,
            follower,
            leader_read,
        } = self;
        match direction {
            Direction::LeaderToFollower => {
                let leader: &Client = leader;
                ApplyLinks {
                    log_side: leader,
                    read_side: leader_read.as_ref().unwrap_or(leader),
                    target: follower,
                    leader_is_target: false,
                }
            }
            Direction::FollowerToLeader => {
                let follower: &Client = follower;
                ApplyLinks {
                    log_side: follower,
                    read_side: follower,
                    target: leader,
                    leader_is_target: true,
                }
            }
        }
    }
}

/// Pull-apply work for one table in one direction.
pub struct ReplicationTask {
    applier: ChangeApplier,
    table: TableConfig,
    direction: Direction,
    endpoints: Endpoints,
    connections: Mutex<Option<TaskConnections>>,
}

impl ReplicationTask {
    pub fn new(
        applier: ChangeApplier,
        table: TableConfig,
        direction: Direction,
        endpoints: Endpoints,
    ) -> Self {
        Self {
            applier,
            table,
            direction,
            endpoints,
            connections: Mutex::new(None),
        }
    }

    pub fn key(&self) -> String {
        self.direction.task_key(&self.table.name)
    }

    /// Run one batch, reconnecting first when a previous connection dropped.
    pub async fn run_once(&self) -> Result<BatchStats> {
        let span = tracing::info_span!(
            "replicate",
            table = %self.table.name,
            direction = %self.direction
        );
        async {
            let mut connections = self.connections.lock().await;
            if connections.as_ref().map(TaskConnections::is_closed).unwrap_or(true) {
                *connections = Some(TaskConnections::open(&self.endpoints).await?);
            }
            let Some(open) = connections.as_mut() else {
                anyhow::bail!("no database connections for {}", self.key());
            };

            let result = self
                .applier
                .run_batch(open.links(self.direction), &self.table, self.direction)
                .await;
            if let Err(e) = &result {
                if error_kind(e) == ErrorKind::Transient {
                    tracing::warn!("Dropping connections after transient failure");
                    *connections = None;
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    pub fn into_tick(self: Arc<Self>) -> TickFn {
        Arc::new(move || {
            let task = Arc::clone(&self);
            async move { task.run_once().await.map(|_| ()) }.boxed()
        })
    }
}

/// Install follower capture triggers on a table that schema sync just created.
///
/// Returns `None` when the table already existed or its changes are not
/// captured on the follower.
pub async fn capture_created_table(
    follower: &Client,
    table: &TableConfig,
    outcome: &SchemaSyncOutcome,
    follower_server_name: &str,
) -> Result<Option<TriggerReport>> {
    if !outcome.created || outcome.dry_run || !table.direction.captures_on_follower() {
        return Ok(None);
    }
    ensure_log_schema(follower).await?;
    let installer = TriggerInstaller::new(follower, Direction::FollowerToLeader, follower_server_name);
    installer.ensure_capture_function().await?;
    let report = installer
        .install(&table.name, &table.primary_key)
        .await
        .with_context(|| format!("Failed to install capture triggers on new table {}", table.name))?;
    tracing::info!("Capture triggers installed on new follower table {}", table.name);
    Ok(Some(report))
}

/// Periodic schema sync for one table.
pub fn schema_sync_tick(
    endpoints: Endpoints,
    table: TableConfig,
    retry: RetryPolicy,
    follower_server_name: String,
) -> TickFn {
    let endpoints = Arc::new(endpoints);
    let table = Arc::new(table);
    let follower_server_name = Arc::new(follower_server_name);
    Arc::new(move || {
        let endpoints = Arc::clone(&endpoints);
        let table = Arc::clone(&table);
        let follower_server_name = Arc::clone(&follower_server_name);
        async move {
            let leader = connect_with_retry(&endpoints.leader).await?;
            let follower = connect_with_retry(&endpoints.follower).await?;
            let outcome = SchemaSynchronizer::new(&leader, &follower, retry)
                .sync_table(&table)
                .await?;
            capture_created_table(&follower, &table, &outcome, &follower_server_name).await?;
            if !outcome.is_in_sync() {
                tracing::info!(
                    "Schema sync for {}: {} statement(s) run, {} withheld",
                    table.name,
                    outcome.statements.len(),
                    outcome.withheld.len()
                );
            }
            Ok(())
        }
        .boxed()
    })
}

/// Delete synced log rows older than the retention period on both sides.
pub async fn purge_expired(endpoints: &Endpoints, follower_id: &str, retention_days: u32) -> Result<u64> {
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
    let leader = connect_with_retry(&endpoints.leader).await?;
    let follower = connect_with_retry(&endpoints.follower).await?;

    let down = LogStore::new(&leader, follower_id, Direction::LeaderToFollower)
        .purge_synced_before(cutoff)
        .await?;
    let up = LogStore::new(&follower, follower_id, Direction::FollowerToLeader)
        .purge_synced_before(cutoff)
        .await?;

    if down + up > 0 {
        tracing::info!(
            "Retention cleanup removed {} leader and {} follower log row(s) older than {}",
            down,
            up,
            cutoff
        );
    }
    Ok(down + up)
}

pub fn cleanup_tick(endpoints: Endpoints, follower_id: String, retention_days: u32) -> TickFn {
    let endpoints = Arc::new(endpoints);
    let follower_id = Arc::new(follower_id);
    Arc::new(move || {
        let endpoints = Arc::clone(&endpoints);
        let follower_id = Arc::clone(&follower_id);
        async move {
            purge_expired(&endpoints, &follower_id, retention_days)
                .await
                .map(|_| ())
        }
        .boxed()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_url_falls_back_to_leader() {
        let mut endpoints = Endpoints {
            leader: "postgresql://leader/db".to_string(),
            follower: "postgresql://follower/db".to_string(),
            leader_read: None,
        };
        assert_eq!(endpoints.leader_read_url(), "postgresql://leader/db");
        endpoints.leader_read = Some("postgresql://replica/db".to_string());
        assert_eq!(endpoints.leader_read_url(), "postgresql://replica/db");
    }
}
