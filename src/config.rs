// ABOUTME: Engine and per-table replication configuration loaded from TOML
// ABOUTME: Parses policy strings into typed enums and excludes invalid tables

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::ReplicationError;
use crate::log_store::{validate_follower_id, Direction};
use crate::record::RecordRegistry;
use crate::utils::{validate_connection_string, validate_identifier};

/// Fields consulted for tie-breaking when a table configures none.
pub const DEFAULT_PRIORITY_FIELDS: &[&str] = &[
    "version",
    "row_version",
    "updated_at",
    "modified_at",
    "last_modified",
];

/// Which way(s) changes flow for a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReplicationDirection {
    LeaderToFollower,
    FollowerToLeader,
    Bidirectional,
}

impl ReplicationDirection {
    /// Log directions that must be pulled for this policy.
    pub fn flows(&self) -> Vec<Direction> {
        match self {
            ReplicationDirection::LeaderToFollower => vec![Direction::LeaderToFollower],
            ReplicationDirection::FollowerToLeader => vec![Direction::FollowerToLeader],
            ReplicationDirection::Bidirectional => {
                vec![Direction::LeaderToFollower, Direction::FollowerToLeader]
            }
        }
    }

    pub fn is_bidirectional(&self) -> bool {
        matches!(self, ReplicationDirection::Bidirectional)
    }

    /// Whether the follower's writes must be captured by triggers.
    pub fn captures_on_follower(&self) -> bool {
        !matches!(self, ReplicationDirection::LeaderToFollower)
    }

    /// Whether the leader's writes must be captured by triggers.
    pub fn captures_on_leader(&self) -> bool {
        !matches!(self, ReplicationDirection::FollowerToLeader)
    }
}

impl FromStr for ReplicationDirection {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match normalize_token(value).as_str() {
            "leadertofollower" | "leader" | "down" => Ok(ReplicationDirection::LeaderToFollower),
            "followertoleader" | "follower" | "up" => Ok(ReplicationDirection::FollowerToLeader),
            "bidirectional" | "both" => Ok(ReplicationDirection::Bidirectional),
            _ => bail!("unknown replication direction '{}'", value),
        }
    }
}

/// How a detected write-write conflict is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConflictStrategy {
    PreferLeader,
    PreferFollower,
    LastWriteWins,
    FieldPriority,
    Custom,
    ManualReview,
}

impl FromStr for ConflictStrategy {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match normalize_token(value).as_str() {
            "preferleader" | "leaderwins" => Ok(ConflictStrategy::PreferLeader),
            "preferfollower" | "followerwins" => Ok(ConflictStrategy::PreferFollower),
            "lastwritewins" | "lww" => Ok(ConflictStrategy::LastWriteWins),
            "fieldpriority" => Ok(ConflictStrategy::FieldPriority),
            "custom" => Ok(ConflictStrategy::Custom),
            "manualreview" | "manual" => Ok(ConflictStrategy::ManualReview),
            _ => bail!("unknown conflict strategy '{}'", value),
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConflictStrategy::PreferLeader => "PreferLeader",
            ConflictStrategy::PreferFollower => "PreferFollower",
            ConflictStrategy::LastWriteWins => "LastWriteWins",
            ConflictStrategy::FieldPriority => "FieldPriority",
            ConflictStrategy::Custom => "Custom",
            ConflictStrategy::ManualReview => "ManualReview",
        };
        f.write_str(name)
    }
}

/// Whether rows go through a registered typed binding or a column map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncMode {
    Entity,
    Generic,
}

impl FromStr for SyncMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match normalize_token(value).as_str() {
            "entity" | "typed" => Ok(SyncMode::Entity),
            "generic" | "dynamic" | "columns" => Ok(SyncMode::Generic),
            _ => bail!("unknown sync mode '{}'", value),
        }
    }
}

/// When schema drift is reconciled for a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SchemaSyncStrategy {
    None,
    Startup,
    Periodic,
    StartupAndPeriodic,
}

impl SchemaSyncStrategy {
    pub fn on_startup(&self) -> bool {
        matches!(
            self,
            SchemaSyncStrategy::Startup | SchemaSyncStrategy::StartupAndPeriodic
        )
    }

    pub fn periodic(&self) -> bool {
        matches!(
            self,
            SchemaSyncStrategy::Periodic | SchemaSyncStrategy::StartupAndPeriodic
        )
    }
}

impl FromStr for SchemaSyncStrategy {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match normalize_token(value).as_str() {
            "none" | "disabled" | "off" => Ok(SchemaSyncStrategy::None),
            "startup" | "onstartup" => Ok(SchemaSyncStrategy::Startup),
            "periodic" => Ok(SchemaSyncStrategy::Periodic),
            "startupandperiodic" | "both" => Ok(SchemaSyncStrategy::StartupAndPeriodic),
            _ => bail!("unknown schema sync strategy '{}'", value),
        }
    }
}

fn normalize_token(value: &str) -> String {
    value
        .chars()
        .filter(|c| *c != '_' && *c != '-' && !c.is_whitespace())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Table entry exactly as written in the configuration file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawTableConfig {
    pub name: String,
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_direction")]
    pub direction: String,
    #[serde(default = "default_conflict_strategy")]
    pub conflict_strategy: String,
    #[serde(default)]
    pub priority_fields: Vec<String>,
    #[serde(default = "default_sync_mode")]
    pub sync_mode: String,
    #[serde(default = "default_schema_sync")]
    pub schema_sync: String,
    #[serde(default = "default_schema_sync_interval_secs")]
    pub schema_sync_interval_secs: u64,
    #[serde(default)]
    pub allow_schema_changes: bool,
    #[serde(default)]
    pub initialize_on_start: bool,
}

/// Validated per-table replication policy, read-only for the duration of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableConfig {
    pub name: String,
    pub primary_key: String,
    pub interval: Duration,
    pub enabled: bool,
    pub direction: ReplicationDirection,
    pub conflict_strategy: ConflictStrategy,
    pub priority_fields: Vec<String>,
    pub sync_mode: SyncMode,
    pub schema_sync: SchemaSyncStrategy,
    pub schema_sync_interval: Duration,
    pub allow_schema_changes: bool,
    pub initialize_on_start: bool,
}

impl TableConfig {
    /// Build a generic-mode table with default policy, mostly for tests and tools.
    pub fn new(name: &str, direction: ReplicationDirection) -> Self {
        Self {
            name: name.to_string(),
            primary_key: default_primary_key(),
            interval: Duration::from_secs(default_interval_secs()),
            enabled: true,
            direction,
            conflict_strategy: ConflictStrategy::PreferLeader,
            priority_fields: Vec::new(),
            sync_mode: SyncMode::Generic,
            schema_sync: SchemaSyncStrategy::None,
            schema_sync_interval: Duration::from_secs(default_schema_sync_interval_secs()),
            allow_schema_changes: false,
            initialize_on_start: false,
        }
    }

    /// Configured priority fields, or the defaults when none are set.
    pub fn effective_priority_fields(&self) -> Vec<String> {
        if self.priority_fields.is_empty() {
            DEFAULT_PRIORITY_FIELDS.iter().map(|s| s.to_string()).collect()
        } else {
            self.priority_fields.clone()
        }
    }
}

impl TryFrom<&RawTableConfig> for TableConfig {
    type Error = ReplicationError;

    fn try_from(raw: &RawTableConfig) -> std::result::Result<Self, Self::Error> {
        let bad = |message: String| ReplicationError::configuration(&raw.name, message);

        validate_identifier(&raw.name).map_err(|e| bad(e.to_string()))?;
        validate_identifier(&raw.primary_key)
            .map_err(|e| bad(format!("primary key: {}", e)))?;
        for field in &raw.priority_fields {
            validate_identifier(field).map_err(|e| bad(format!("priority field: {}", e)))?;
        }
        if raw.interval_secs == 0 {
            return Err(bad("interval_secs must be greater than zero".to_string()));
        }

        let direction = raw
            .direction
            .parse::<ReplicationDirection>()
            .map_err(|e| bad(e.to_string()))?;
        let conflict_strategy = raw
            .conflict_strategy
            .parse::<ConflictStrategy>()
            .map_err(|e| bad(e.to_string()))?;
        let sync_mode = raw
            .sync_mode
            .parse::<SyncMode>()
            .map_err(|e| bad(e.to_string()))?;
        let schema_sync = raw
            .schema_sync
            .parse::<SchemaSyncStrategy>()
            .map_err(|e| bad(e.to_string()))?;
        if schema_sync.periodic() && raw.schema_sync_interval_secs == 0 {
            return Err(bad(
                "schema_sync_interval_secs must be greater than zero".to_string(),
            ));
        }

        Ok(TableConfig {
            name: raw.name.trim().to_string(),
            primary_key: raw.primary_key.trim().to_string(),
            interval: Duration::from_secs(raw.interval_secs),
            enabled: raw.enabled,
            direction,
            conflict_strategy,
            priority_fields: raw.priority_fields.clone(),
            sync_mode,
            schema_sync,
            schema_sync_interval: Duration::from_secs(raw.schema_sync_interval_secs),
            allow_schema_changes: raw.allow_schema_changes,
            initialize_on_start: raw.initialize_on_start,
        })
    }
}

/// Global engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Identifier of the follower this engine instance serves.
    pub follower_id: String,
    #[serde(default = "default_leader_name")]
    pub leader_server_name: String,
    #[serde(default)]
    pub follower_server_name: Option<String>,
    #[serde(default)]
    pub leader_url: String,
    #[serde(default)]
    pub follower_url: String,
    /// Optional read replica of the leader used for source-row and bulk reads.
    #[serde(default)]
    pub leader_read_url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_retention_days")]
    pub data_retention_days: u32,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_conflict_window_secs")]
    pub conflict_window_secs: u64,
    #[serde(default = "default_bulk_window_size")]
    pub bulk_window_size: u64,
    #[serde(default = "default_bulk_concurrency")]
    pub bulk_concurrency: usize,
    #[serde(default = "default_table_init_concurrency")]
    pub table_init_concurrency: usize,
    #[serde(default = "default_true")]
    pub install_leader_triggers: bool,
    #[serde(default)]
    pub tables: Vec<RawTableConfig>,
}

impl EngineConfig {
    /// Minimal configuration with defaults for every optional key.
    pub fn new(follower_id: &str, leader_url: &str, follower_url: &str) -> Self {
        Self {
            follower_id: follower_id.to_string(),
            leader_server_name: default_leader_name(),
            follower_server_name: None,
            leader_url: leader_url.to_string(),
            follower_url: follower_url.to_string(),
            leader_read_url: None,
            batch_size: default_batch_size(),
            data_retention_days: default_retention_days(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            conflict_window_secs: default_conflict_window_secs(),
            bulk_window_size: default_bulk_window_size(),
            bulk_concurrency: default_bulk_concurrency(),
            table_init_concurrency: default_table_init_concurrency(),
            install_leader_triggers: true,
            tables: Vec::new(),
        }
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(contents).context("Failed to parse replication configuration")?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration from {:?}", path))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid configuration in {:?}", path))
    }

    pub fn default_path() -> PathBuf {
        PathBuf::from("replicator.toml")
    }

    /// Check the global settings; failures here halt startup.
    pub fn validate(&self) -> Result<()> {
        validate_follower_id(&self.follower_id).context("Invalid follower_id")?;
        validate_connection_string(&self.leader_url).context("Invalid leader_url")?;
        validate_connection_string(&self.follower_url).context("Invalid follower_url")?;
        if let Some(read_url) = &self.leader_read_url {
            validate_connection_string(read_url).context("Invalid leader_read_url")?;
        }
        if self.batch_size == 0 {
            bail!("batch_size must be greater than zero");
        }
        if self.bulk_window_size == 0 {
            bail!("bulk_window_size must be greater than zero");
        }
        if self.bulk_concurrency == 0 || self.table_init_concurrency == 0 {
            bail!("concurrency limits must be greater than zero");
        }
        Ok(())
    }

    /// Convert raw table entries into validated policies.
    ///
    /// Invalid tables are returned as errors alongside the valid ones so the
    /// caller can log them and carry on with the rest.
    pub fn table_configs(
        &self,
        registry: &RecordRegistry,
    ) -> (Vec<TableConfig>, Vec<ReplicationError>) {
        let mut seen = HashSet::new();
        let mut tables = Vec::new();
        let mut errors = Vec::new();

        for raw in &self.tables {
            let table = match TableConfig::try_from(raw) {
                Ok(table) => table,
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            };
            if !seen.insert(table.name.clone()) {
                errors.push(ReplicationError::configuration(
                    &table.name,
                    "table configured more than once",
                ));
                continue;
            }
            if table.sync_mode == SyncMode::Entity && !registry.contains(&table.name) {
                errors.push(ReplicationError::configuration(
                    &table.name,
                    "entity sync mode requires a registered record binding",
                ));
                continue;
            }
            tables.push(table);
        }

        (tables, errors)
    }

    pub fn follower_server_name(&self) -> String {
        self.follower_server_name
            .clone()
            .unwrap_or_else(|| self.follower_id.clone())
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn conflict_window(&self) -> Duration {
        Duration::from_secs(self.conflict_window_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

fn default_primary_key() -> String {
    "id".to_string()
}
fn default_interval_secs() -> u64 {
    5
}
fn default_true() -> bool {
    true
}
fn default_direction() -> String {
    "leader_to_follower".to_string()
}
fn default_conflict_strategy() -> String {
    "prefer_leader".to_string()
}
fn default_sync_mode() -> String {
    "generic".to_string()
}
fn default_schema_sync() -> String {
    "none".to_string()
}
fn default_schema_sync_interval_secs() -> u64 {
    3600
}
fn default_leader_name() -> String {
    "leader".to_string()
}
fn default_batch_size() -> usize {
    100
}
fn default_retention_days() -> u32 {
    7
}
fn default_cleanup_interval_secs() -> u64 {
    3600
}
fn default_retry_base_delay_ms() -> u64 {
    1000
}
fn default_conflict_window_secs() -> u64 {
    30
}
fn default_bulk_window_size() -> u64 {
    10_000
}
fn default_bulk_concurrency() -> usize {
    4
}
fn default_table_init_concurrency() -> usize {
    4
}
