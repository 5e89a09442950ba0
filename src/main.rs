// ABOUTME: CLI entry point for trigger-replicator
// ABOUTME: Parses commands and routes them to the replication engine's service operations

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use trigger_replicator::config::EngineConfig;
use trigger_replicator::record::RecordRegistry;
use trigger_replicator::ReplicationEngine;

#[derive(Parser)]
#[command(name = "trigger-replicator")]
#[command(about = "Trigger-based leader/follower PostgreSQL table replication", long_about = None)]
#[command(version)]
struct Cli {
    /// Allow self-signed TLS certificates (insecure - use only for testing)
    #[arg(
        long = "allow-self-signed-certs",
        global = true,
        default_value_t = false
    )]
    allow_self_signed_certs: bool,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Path to the replication configuration file
    #[arg(long, global = true, env = "REPLICATOR_CONFIG")]
    config: Option<PathBuf>,
    /// Leader connection string (overrides leader_url)
    #[arg(long, global = true, env = "LEADER_URL", hide_env_values = true)]
    leader_url: Option<String>,
    /// Follower connection string (overrides follower_url)
    #[arg(long, global = true, env = "FOLLOWER_URL", hide_env_values = true)]
    follower_url: Option<String>,
    /// Leader read replica connection string (overrides leader_read_url)
    #[arg(long, global = true, env = "LEADER_READ_URL", hide_env_values = true)]
    leader_read_url: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and list the tables that will replicate
    CheckConfig,
    /// Create bookkeeping tables and capture triggers on both databases
    InstallTriggers,
    /// Start continuous replication until Ctrl+C
    Start,
    /// Run one replication batch for a table in each of its directions
    RunOnce {
        #[arg(long)]
        table: String,
    },
    /// Copy every leader-fed table from the leader into the follower
    InitData {
        /// Load tables one at a time
        #[arg(long)]
        sequential: bool,
        /// Number of tables loaded at once
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Replace the follower's copy of one table with the leader's
    Resync {
        #[arg(long)]
        table: String,
    },
    /// Rewind and replay permanently failed changes
    RetryFailed {
        /// Only recover this table
        #[arg(long)]
        table: Option<String>,
    },
    /// Show failure ledger statistics
    FailedStats {
        /// Also list the individual failures
        #[arg(long)]
        list: bool,
        #[arg(long)]
        table: Option<String>,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Bring follower table structure in line with the leader
    SchemaSync {
        /// Only this table (default: every enabled table)
        #[arg(long)]
        table: Option<String>,
        /// Report the statements without running them
        #[arg(long)]
        dry_run: bool,
    },
    /// List conflicts waiting for manual review
    Conflicts {
        #[arg(long)]
        table: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Release a deferred conflict so its change is applied on the next pass
    ReleaseConflict {
        id: i64,
        /// Name recorded as the resolver
        #[arg(long, default_value = "operator")]
        by: String,
    },
    /// Delete synced log rows older than the retention period
    Cleanup,
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let path = cli.config.clone().unwrap_or_else(EngineConfig::default_path);
    let mut config = EngineConfig::load(&path)?;
    if let Some(url) = &cli.leader_url {
        config.leader_url = url.clone();
    }
    if let Some(url) = &cli.follower_url {
        config.follower_url = url.clone();
    }
    if let Some(url) = &cli.leader_read_url {
        config.leader_read_url = Some(url.clone());
    }
    Ok(config)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to serialize output")?
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --log, which defaults to "info"
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    trigger_replicator::postgres::init_tls_policy(cli.allow_self_signed_certs);

    let config = load_config(&cli)?;
    // Typed bindings are registered by embedding applications; the CLI runs generic tables.
    let engine = ReplicationEngine::new(config, RecordRegistry::new())?;

    match cli.command {
        Commands::CheckConfig => {
            println!("Follower: {}", engine.config().follower_id);
            for table in engine.tables() {
                println!(
                    "  {:<30} {:?} every {}s, conflicts: {}, mode: {:?}{}",
                    table.name,
                    table.direction,
                    table.interval.as_secs(),
                    table.conflict_strategy,
                    table.sync_mode,
                    if table.enabled { "" } else { " (disabled)" }
                );
            }
        }
        Commands::InstallTriggers => {
            let reports = engine.prepare_databases().await?;
            for report in reports {
                match &report.skipped_reason {
                    Some(reason) => println!("  {}: skipped ({})", report.table, reason),
                    None => println!(
                        "  {}: {} created, {} already present",
                        report.table,
                        report.created.len(),
                        report.existing.len()
                    ),
                }
            }
        }
        Commands::Start => {
            engine.start_replication().await?;
            println!();
            println!("========================================");
            println!("Replication running");
            println!("========================================");
            println!("  Tasks: {}", engine.status().tasks.len());
            println!("  Press Ctrl+C to stop");
            println!();

            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl+C")?;
            tracing::info!("Received shutdown signal");
            engine.stop_replication().await;
        }
        Commands::RunOnce { table } => {
            for (direction, stats) in engine.replicate_once(&table).await? {
                println!(
                    "  {} ({}): fetched {}, applied {}, skipped {}, failed {}, deferred {}, conflicts {}",
                    table,
                    direction,
                    stats.fetched,
                    stats.applied,
                    stats.skipped,
                    stats.failed,
                    stats.deferred,
                    stats.conflicts
                );
            }
        }
        Commands::InitData {
            sequential,
            concurrency,
        } => {
            let concurrency = concurrency.unwrap_or(engine.config().table_init_concurrency);
            let report = engine
                .initialize_existing_data(!sequential, concurrency)
                .await;
            for load in &report.loaded {
                println!("  {}: {} row(s) copied", load.table, load.rows_copied);
            }
            for (table, error) in &report.failed {
                println!("  {}: FAILED - {}", table, error);
            }
            if !report.is_success() {
                anyhow::bail!("{} table(s) failed to load", report.failed.len());
            }
        }
        Commands::Resync { table } => {
            let load = engine.sync_table_from_leader_to_follower(&table).await?;
            println!(
                "Resynced {}: {} of {} row(s) copied in {} ms",
                load.table, load.rows_copied, load.source_rows, load.duration_ms
            );
        }
        Commands::RetryFailed { table } => {
            let report = engine.manual_retry_failed_data(table.as_deref()).await?;
            if report.tables.is_empty() {
                println!("No failed changes to recover");
            }
            for step in &report.tables {
                println!(
                    "  {} ({}): {} failure(s), cursor {} -> {}",
                    step.table,
                    step.direction,
                    step.failures.len(),
                    step.previous_cursor,
                    step.new_cursor
                );
            }
            if !report.tables.is_empty() {
                println!(
                    "{} change(s) re-enqueued, {} covered by a later change",
                    report.requeued, report.superseded
                );
            }
        }
        Commands::FailedStats { list, table, json } => {
            let stats = engine.get_failed_data_statistics().await?;
            let failures = if list {
                engine.list_failed_data(table.as_deref()).await?
            } else {
                Vec::new()
            };
            if json {
                print_json(&serde_json::json!({ "statistics": stats, "failures": failures }))?;
            } else {
                println!("Failed changes: {}", stats.total);
                for (name, count) in &stats.by_table {
                    println!("  {:<30} {}", name, count);
                }
                if let (Some(oldest), Some(newest)) = (stats.oldest_failure, stats.newest_failure) {
                    println!("  Oldest: {}  Newest: {}", oldest, newest);
                }
                for failure in &failures {
                    println!(
                        "  #{} {} {} {}: {}",
                        failure.log_entry_id,
                        failure.table_name,
                        failure.operation_type,
                        failure.record_id,
                        failure.error_message
                    );
                }
            }
        }
        Commands::SchemaSync { table, dry_run } => {
            let outcomes = match table {
                Some(name) => vec![(
                    name.clone(),
                    engine.manual_sync_table_schema(&name, dry_run).await,
                )],
                None if dry_run => {
                    let mut outcomes = Vec::new();
                    for table in engine.tables().iter().filter(|t| t.enabled) {
                        outcomes.push((
                            table.name.clone(),
                            engine.manual_sync_table_schema(&table.name, true).await,
                        ));
                    }
                    outcomes
                }
                None => engine.sync_all_table_schemas().await?,
            };

            let mut failed = 0;
            for (name, outcome) in outcomes {
                match outcome {
                    Ok(outcome) if outcome.is_in_sync() => println!("  {}: in sync", name),
                    Ok(outcome) => {
                        let verb = if outcome.dry_run { "would run" } else { "ran" };
                        println!("  {}: {} {} statement(s)", name, verb, outcome.statements.len());
                        for statement in &outcome.statements {
                            println!("    {};", statement);
                        }
                        for statement in &outcome.withheld {
                            println!("    -- withheld: {};", statement);
                        }
                    }
                    Err(e) => {
                        failed += 1;
                        println!("  {}: FAILED - {:#}", name, e);
                    }
                }
            }
            if failed > 0 {
                anyhow::bail!("schema sync failed for {} table(s)", failed);
            }
        }
        Commands::Conflicts { table, json } => {
            let conflicts = engine.pending_conflicts(table.as_deref()).await?;
            if json {
                print_json(&conflicts)?;
            } else if conflicts.is_empty() {
                println!("No conflicts waiting for review");
            } else {
                for conflict in &conflicts {
                    println!(
                        "  #{} {} {} {} ({}, {}) detected {}",
                        conflict.id,
                        conflict.table_name,
                        conflict.record_id,
                        conflict.conflict_type,
                        conflict.resolution,
                        conflict.resolution_strategy,
                        conflict.detected_at
                    );
                }
            }
        }
        Commands::ReleaseConflict { id, by } => {
            if engine.release_conflict(id, &by).await? {
                println!("Conflict {} released", id);
            } else {
                anyhow::bail!("conflict {} does not exist or was already resolved", id);
            }
        }
        Commands::Cleanup => {
            let removed = engine.cleanup_expired_logs().await?;
            println!("Removed {} expired log row(s)", removed);
        }
    }

    Ok(())
}
