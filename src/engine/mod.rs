// ABOUTME: ReplicationEngine - service-level operations for one leader/follower pair
// ABOUTME: Bootstraps bookkeeping and triggers, schedules tasks, and runs manual resync, recovery and schema sync

pub mod tasks;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::applier::{BatchStats, ChangeApplier};
use crate::bulk::{BulkLoader, LoadReport};
use crate::capture::{TriggerInstaller, TriggerReport};
use crate::config::{EngineConfig, TableConfig};
use crate::conflict::{ConflictAudit, ConflictRecord, ConflictResolver, CustomResolver};
use crate::failures::{
    execute_recovery, FailureLedger, FailureRecord, FailureStatistics, RecoveryReport,
    RecoverySides,
};
use crate::log_store::{ensure_audit_schema, ensure_log_schema, ensure_status_table, Direction, LogStore};
use crate::orchestrator::{FlightGuard, Supervisor, TaskStatus, CLEANUP_TASK_KEY};
use crate::postgres::{check_privileges, check_trigger_permissions, connect_with_retry};
use crate::record::RecordRegistry;
use crate::retry::RetryPolicy;
use crate::schema::{SchemaSyncOutcome, SchemaSynchronizer};

pub use tasks::{purge_expired, Endpoints, ReplicationTask, TaskConnections};
use tasks::{capture_created_table, cleanup_tick, schema_sync_tick};

/// Scheduler key of a table's periodic schema sync.
pub fn schema_task_key(table: &str) -> String {
    format!("SchemaSync_{}", table)
}

/// Outcome of loading several tables.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InitializationReport {
    pub loaded: Vec<LoadReport>,
    pub failed: Vec<(String, String)>,
}

impl InitializationReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub tables: Vec<String>,
    pub tasks: Vec<TaskStatus>,
    pub paused_tables: Vec<String>,
    pub busy: Vec<String>,
}

pub struct ReplicationEngine {
    config: EngineConfig,
    endpoints: Endpoints,
    tables: Vec<TableConfig>,
    registry: Arc<RecordRegistry>,
    resolver: ConflictResolver,
    supervisor: Supervisor,
    running: AtomicBool,
}

impl ReplicationEngine {
    /// Validate the configuration and keep every table whose policy parses.
    ///
    /// Invalid tables are logged and excluded; invalid global settings fail.
    pub fn new(config: EngineConfig, registry: RecordRegistry) -> Result<Self> {
        config.validate()?;
        let (tables, errors) = config.table_configs(&registry);
        for error in &errors {
            tracing::error!("Excluding table from replication: {}", error);
        }
        if tables.is_empty() {
            tracing::warn!("No valid tables configured for replication");
        }

        let endpoints = Endpoints {
            leader: config.leader_url.clone(),
            follower: config.follower_url.clone(),
            leader_read: config.leader_read_url.clone(),
        };

        Ok(Self {
            config,
            endpoints,
            tables,
            registry: Arc::new(registry),
            resolver: ConflictResolver::default(),
            supervisor: Supervisor::new(),
            running: AtomicBool::new(false),
        })
    }

    /// Decide `custom`-strategy conflicts with the given hook.
    pub fn with_custom_resolver(mut self, custom: Arc<dyn CustomResolver>) -> Self {
        self.resolver = ConflictResolver::new(custom);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tables(&self) -> &[TableConfig] {
        &self.tables
    }

    pub fn table(&self, name: &str) -> Result<&TableConfig> {
        match self.tables.iter().find(|t| t.name == name) {
            Some(table) => Ok(table),
            None => bail!("table '{}' is not configured for replication", name),
        }
    }

    fn enabled_tables(&self) -> impl Iterator<Item = &TableConfig> {
        self.tables.iter().filter(|t| t.enabled)
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(3, self.config.retry_base_delay())
    }

    fn applier(&self) -> ChangeApplier {
        ChangeApplier::new(
            &self.config.follower_id,
            self.config.batch_size,
            self.retry_policy(),
            self.config.conflict_window(),
            Arc::clone(&self.registry),
            self.resolver.clone(),
        )
    }

    fn loader(&self) -> BulkLoader {
        BulkLoader::new(
            self.endpoints.leader_read_url(),
            &self.endpoints.follower,
            self.config.bulk_window_size,
            self.config.bulk_concurrency,
            self.config.retry_base_delay(),
        )
    }

    async fn connect_pair(&self) -> Result<(tokio_postgres::Client, tokio_postgres::Client)> {
        let leader = connect_with_retry(&self.endpoints.leader)
            .await
            .context("Failed to connect to leader database")?;
        let follower = connect_with_retry(&self.endpoints.follower)
            .await
            .context("Failed to connect to follower database")?;
        Ok((leader, follower))
    }

    // Claim the replication keys of the given tables so no tick overlaps a manual operation.
    fn claim_tables<'t>(&self, tables: impl IntoIterator<Item = &'t TableConfig>) -> Result<Vec<FlightGuard>> {
        let mut guards = Vec::new();
        for table in tables {
            for direction in table.direction.flows() {
                let key = direction.task_key(&table.name);
                match self.supervisor.busy_flags().try_acquire(&key) {
                    Some(guard) => guards.push(guard),
                    None => bail!("{} is running, try again shortly", key),
                }
            }
        }
        Ok(guards)
    }

    /// Create bookkeeping tables and capture triggers on both databases.
    ///
    /// Safe to repeat: existing tables and triggers are left as they are.
    pub async fn prepare_databases(&self) -> Result<Vec<TriggerReport>> {
        let (leader, follower) = self.connect_pair().await?;

        for (side, client) in [("leader", &leader), ("follower", &follower)] {
            let privileges = check_privileges(client).await?;
            if !privileges.is_superuser && !privileges.can_create_in_schema {
                bail!(
                    "role '{}' cannot create objects in the current schema of the {} database",
                    privileges.role,
                    side
                );
            }
        }

        ensure_log_schema(&leader).await?;
        ensure_log_schema(&follower).await?;
        ensure_audit_schema(&leader).await?;
        ensure_status_table(&leader, &self.config.follower_id, Direction::LeaderToFollower).await?;
        ensure_status_table(&follower, &self.config.follower_id, Direction::FollowerToLeader).await?;

        let follower_tables: Vec<&TableConfig> = self
            .enabled_tables()
            .filter(|t| t.direction.captures_on_follower())
            .collect();
        let leader_tables: Vec<&TableConfig> = if self.config.install_leader_triggers {
            self.enabled_tables()
                .filter(|t| t.direction.captures_on_leader())
                .collect()
        } else {
            Vec::new()
        };

        let mut reports = self
            .install_triggers(
                &follower,
                Direction::FollowerToLeader,
                &self.config.follower_server_name(),
                &follower_tables,
            )
            .await?;
        reports.extend(
            self.install_triggers(
                &leader,
                Direction::LeaderToFollower,
                &self.config.leader_server_name,
                &leader_tables,
            )
            .await?,
        );
        Ok(reports)
    }

    async fn install_triggers(
        &self,
        client: &tokio_postgres::Client,
        direction: Direction,
        server_name: &str,
        tables: &[&TableConfig],
    ) -> Result<Vec<TriggerReport>> {
        if tables.is_empty() {
            return Ok(Vec::new());
        }
        let names: Vec<String> = tables.iter().map(|t| t.name.clone()).collect();
        let permissions = check_trigger_permissions(client, &names).await?;
        for table in &permissions.inaccessible_tables {
            tracing::error!(
                "Cannot install capture triggers on {}: missing TRIGGER or write privileges",
                table
            );
        }

        let installer = TriggerInstaller::new(client, direction, server_name);
        installer.ensure_capture_function().await?;

        let mut reports = Vec::new();
        for table in tables {
            if permissions.inaccessible_tables.contains(&table.name) {
                continue;
            }
            match installer.install(&table.name, &table.primary_key).await {
                Ok(report) => reports.push(report),
                Err(e) => tracing::error!("Failed to install triggers on {}: {:?}", table.name, e),
            }
        }
        Ok(reports)
    }

    /// Bootstrap, converge schemas, run requested initial loads and start all periodic tasks.
    pub async fn start_replication(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            bail!("replication is already running");
        }
        if let Err(e) = self.start_inner().await {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    async fn start_inner(&self) -> Result<()> {
        // Tables created by startup schema sync must exist before triggers are installed.
        let startup: Vec<TableConfig> = self
            .enabled_tables()
            .filter(|t| t.schema_sync.on_startup())
            .cloned()
            .collect();
        if !startup.is_empty() {
            let (leader, follower) = self.connect_pair().await?;
            let synchronizer = SchemaSynchronizer::new(&leader, &follower, self.retry_policy());
            for (table, result) in synchronizer.sync_all(&startup).await {
                if let Err(e) = result {
                    tracing::error!("Startup schema sync failed for {}: {:?}", table, e);
                }
            }
        }

        self.prepare_databases().await?;

        let initial: Vec<&TableConfig> = self
            .enabled_tables()
            .filter(|t| t.initialize_on_start && t.direction.captures_on_leader())
            .collect();
        if !initial.is_empty() {
            let report = self
                .load_tables(&initial, true, self.config.table_init_concurrency)
                .await;
            for (table, error) in &report.failed {
                tracing::error!("Initial load failed for {}: {}", table, error);
            }
        }

        for table in self.enabled_tables() {
            self.schedule_table(table);
        }
        self.supervisor.schedule(
            CLEANUP_TASK_KEY,
            None,
            self.config.cleanup_interval(),
            cleanup_tick(
                self.endpoints.clone(),
                self.config.follower_id.clone(),
                self.config.data_retention_days,
            ),
        );

        tracing::info!(
            "Replication started for {} table(s), {} task(s) scheduled",
            self.enabled_tables().count(),
            self.supervisor.task_count()
        );
        Ok(())
    }

    fn schedule_table(&self, table: &TableConfig) {
        for direction in table.direction.flows() {
            let task = Arc::new(ReplicationTask::new(
                self.applier(),
                table.clone(),
                direction,
                self.endpoints.clone(),
            ));
            let key = task.key();
            self.supervisor
                .schedule(&key, Some(&table.name), table.interval, task.into_tick());
        }
        if table.schema_sync.periodic() {
            self.supervisor.schedule(
                &schema_task_key(&table.name),
                Some(&table.name),
                table.schema_sync_interval,
                schema_sync_tick(
                    self.endpoints.clone(),
                    table.clone(),
                    self.retry_policy(),
                    self.config.follower_server_name(),
                ),
            );
        }
    }

    /// Stop all tasks; ticks already running finish first.
    pub async fn stop_replication(&self) {
        self.supervisor.shutdown().await;
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Dispose of a table's tasks until it is resumed.
    pub fn pause_table_replication(&self, name: &str) -> Result<()> {
        self.table(name)?;
        if !self.supervisor.pause_table(name) {
            tracing::info!("{} is already paused", name);
            return Ok(());
        }
        for key in self.supervisor.keys_for_table(name) {
            self.supervisor.unschedule(&key);
        }
        tracing::info!("Paused replication of {}", name);
        Ok(())
    }

    /// Recreate a paused table's tasks with fresh state.
    pub fn resume_table_replication(&self, name: &str) -> Result<()> {
        let table = self.table(name)?;
        if !self.supervisor.resume_table(name) {
            tracing::info!("{} is not paused", name);
            return Ok(());
        }
        if self.is_running() && table.enabled {
            self.schedule_table(table);
        }
        tracing::info!("Resumed replication of {}", name);
        Ok(())
    }

    /// Load every enabled table that receives leader changes.
    pub async fn initialize_existing_data(&self, parallel: bool, concurrency: usize) -> InitializationReport {
        let tables: Vec<&TableConfig> = self
            .enabled_tables()
            .filter(|t| t.direction.captures_on_leader())
            .collect();
        self.load_tables(&tables, parallel, concurrency).await
    }

    async fn load_tables(&self, tables: &[&TableConfig], parallel: bool, concurrency: usize) -> InitializationReport {
        let limit = if parallel { concurrency.max(1) } else { 1 };
        let semaphore = Arc::new(Semaphore::new(limit));
        tracing::info!(
            "Initial load of {} table(s), {} at a time",
            tables.len(),
            limit
        );

        let loads = tables.iter().map(|table| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .context("initial load limiter closed")?;
                self.sync_table_from_leader_to_follower(&table.name).await
            }
        });
        let results = futures::future::join_all(loads).await;

        let mut report = InitializationReport::default();
        for (table, result) in tables.iter().zip(results) {
            match result {
                Ok(load) => report.loaded.push(load),
                Err(e) => report.failed.push((table.name.clone(), format!("{:#}", e))),
            }
        }
        report
    }

    /// Replace the follower's copy of a table with the leader's.
    ///
    /// Leader log entries recorded before the copy started are reflected in
    /// the copied rows, so the table's cursor moves past them afterwards.
    pub async fn sync_table_from_leader_to_follower(&self, name: &str) -> Result<LoadReport> {
        let table = self.table(name)?;
        if !table.direction.captures_on_leader() {
            bail!(
                "{} replicates from follower to leader only, refusing to overwrite the follower",
                name
            );
        }
        let _guards = self.claim_tables([table])?;

        let leader = connect_with_retry(&self.endpoints.leader)
            .await
            .context("Failed to connect to leader database")?;
        let log = LogStore::new(&leader, &self.config.follower_id, Direction::LeaderToFollower);
        let watermark = log.latest_id(name).await?;

        let report = self.loader().load_table(table).await?;
        if watermark > 0 {
            log.advance_cursor(name, watermark).await?;
        }
        Ok(report)
    }

    /// Run one batch per direction for a table right away.
    pub async fn replicate_once(&self, name: &str) -> Result<Vec<(Direction, BatchStats)>> {
        let table = self.table(name)?;
        let _guards = self.claim_tables([table])?;
        let mut results = Vec::new();
        for direction in table.direction.flows() {
            let task = ReplicationTask::new(
                self.applier(),
                table.clone(),
                direction,
                self.endpoints.clone(),
            );
            results.push((direction, task.run_once().await?));
        }
        Ok(results)
    }

    /// Rewind and replay ledgered failures, for one table or all of them.
    pub async fn manual_retry_failed_data(&self, table: Option<&str>) -> Result<RecoveryReport> {
        let _guards = match table {
            Some(name) => match self.table(name) {
                Ok(config) => self.claim_tables([config])?,
                // Failures may outlive the table's configuration.
                Err(_) => Vec::new(),
            },
            None => self.claim_tables(self.enabled_tables())?,
        };

        let (leader, follower) = self.connect_pair().await?;
        let follower_server_name = self.config.follower_server_name();
        let sides = RecoverySides {
            leader: &leader,
            follower: &follower,
            follower_id: &self.config.follower_id,
            leader_server_name: &self.config.leader_server_name,
            follower_server_name: &follower_server_name,
        };
        execute_recovery(&sides, table).await
    }

    pub async fn get_failed_data_statistics(&self) -> Result<FailureStatistics> {
        let leader = connect_with_retry(&self.endpoints.leader).await?;
        FailureLedger::new(&leader)
            .statistics(&self.config.follower_id)
            .await
    }

    pub async fn list_failed_data(&self, table: Option<&str>) -> Result<Vec<FailureRecord>> {
        let leader = connect_with_retry(&self.endpoints.leader).await?;
        FailureLedger::new(&leader)
            .list(&self.config.follower_id, table)
            .await
    }

    pub async fn sync_table_schema(&self, name: &str) -> Result<SchemaSyncOutcome> {
        self.manual_sync_table_schema(name, false).await
    }

    /// Synchronize every enabled table; one table's failure does not stop the rest.
    pub async fn sync_all_table_schemas(&self) -> Result<Vec<(String, Result<SchemaSyncOutcome>)>> {
        let (leader, follower) = self.connect_pair().await?;
        let tables: Vec<TableConfig> = self.enabled_tables().cloned().collect();
        let mut results = SchemaSynchronizer::new(&leader, &follower, self.retry_policy())
            .sync_all(&tables)
            .await;
        for ((_, result), table) in results.iter_mut().zip(&tables) {
            let failure = match result {
                Ok(outcome) => self.capture_created(&follower, table, outcome).await.err(),
                Err(_) => None,
            };
            if let Some(e) = failure {
                *result = Err(e);
            }
        }
        Ok(results)
    }

    async fn capture_created(
        &self,
        follower: &tokio_postgres::Client,
        table: &TableConfig,
        outcome: &SchemaSyncOutcome,
    ) -> Result<()> {
        capture_created_table(follower, table, outcome, &self.config.follower_server_name()).await?;
        Ok(())
    }

    /// Synchronize one table's schema, or only report the plan when `dry_run` is set.
    pub async fn manual_sync_table_schema(&self, name: &str, dry_run: bool) -> Result<SchemaSyncOutcome> {
        let table = self.table(name)?;
        let (leader, follower) = self.connect_pair().await?;
        let synchronizer = SchemaSynchronizer::new(&leader, &follower, self.retry_policy());
        if dry_run {
            return synchronizer.plan_table(table).await;
        }
        let outcome = synchronizer.sync_table(table).await?;
        self.capture_created(&follower, table, &outcome).await?;
        Ok(outcome)
    }

    pub async fn cleanup_expired_logs(&self) -> Result<u64> {
        purge_expired(
            &self.endpoints,
            &self.config.follower_id,
            self.config.data_retention_days,
        )
        .await
    }

    pub async fn pending_conflicts(&self, table: Option<&str>) -> Result<Vec<ConflictRecord>> {
        let leader = connect_with_retry(&self.endpoints.leader).await?;
        ConflictAudit::new(&leader, &self.config.follower_id)
            .pending_reviews(table)
            .await
    }

    /// Let the source change of a deferred conflict be applied on the next pass.
    pub async fn release_conflict(&self, conflict_id: i64, resolved_by: &str) -> Result<bool> {
        let leader = connect_with_retry(&self.endpoints.leader).await?;
        let released = ConflictAudit::new(&leader, &self.config.follower_id)
            .release(conflict_id, resolved_by)
            .await?;
        if released {
            tracing::info!("Conflict {} released by {}", conflict_id, resolved_by);
        }
        Ok(released)
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            running: self.is_running(),
            tables: self.tables.iter().map(|t| t.name.clone()).collect(),
            tasks: self.supervisor.status(),
            paused_tables: self.supervisor.paused_tables(),
            busy: self.supervisor.busy_flags().busy_keys(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::tests::ProductBinding;

    const CONFIG: &str = r#"
follower_id = "store_12"
leader_url = "postgresql://repl@leader:5432/shop"
follower_url = "postgresql://repl@follower:5432/shop"

[[tables]]
name = "orders"
direction = "bidirectional"
conflict_strategy = "last_write_wins"

[[tables]]
name = "price_list"
direction = "leader_to_follower"

[[tables]]
name = "audit"
direction = "sideways"

[[tables]]
name = "products"
sync_mode = "entity"
"#;

    fn engine(registry: RecordRegistry) -> ReplicationEngine {
        ReplicationEngine::new(EngineConfig::from_toml(CONFIG).unwrap(), registry).unwrap()
    }

    #[test]
    fn test_invalid_tables_are_excluded() {
        let engine = engine(RecordRegistry::new());
        let names: Vec<&str> = engine.tables().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["orders", "price_list"]);
        assert!(engine.table("audit").is_err());
    }

    #[test]
    fn test_entity_table_kept_with_binding() {
        let mut registry = RecordRegistry::new();
        registry.register(Arc::new(ProductBinding));
        let engine = engine(registry);
        assert!(engine.table("products").is_ok());
    }

    #[tokio::test]
    async fn test_pause_and_resume_before_start() {
        let engine = engine(RecordRegistry::new());
        engine.pause_table_replication("orders").unwrap();
        assert_eq!(engine.status().paused_tables, vec!["orders"]);
        engine.resume_table_replication("orders").unwrap();
        assert!(engine.status().paused_tables.is_empty());
        // Not running, so nothing gets scheduled.
        assert!(engine.status().tasks.is_empty());
        assert!(engine.pause_table_replication("missing").is_err());
    }

    #[tokio::test]
    async fn test_manual_operation_refused_while_tick_runs() {
        let engine = engine(RecordRegistry::new());
        let _held = engine
            .supervisor
            .busy_flags()
            .try_acquire("FollowerToLeader_orders")
            .unwrap();
        let err = engine.replicate_once("orders").await.unwrap_err();
        assert!(err.to_string().contains("FollowerToLeader_orders"));
        // Claims taken before the refusal are released again.
        assert!(!engine.supervisor.busy_flags().is_busy("LeaderToFollower_orders"));
    }

    #[tokio::test]
    async fn test_resync_refused_for_follower_only_table() {
        let config = EngineConfig::from_toml(
            r#"
follower_id = "f1"
leader_url = "postgresql://leader/db"
follower_url = "postgresql://follower/db"

[[tables]]
name = "field_notes"
direction = "follower_to_leader"
"#,
        )
        .unwrap();
        let engine = ReplicationEngine::new(config, RecordRegistry::new()).unwrap();
        let err = engine
            .sync_table_from_leader_to_follower("field_notes")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("refusing"));
    }

    #[test]
    fn test_schema_task_key() {
        assert_eq!(schema_task_key("orders"), "SchemaSync_orders");
    }
}
