// ABOUTME: SchemaSynchronizer - brings follower table structure in line with the leader
// ABOUTME: Executes generated DDL one statement at a time with retry; destructive changes are opt-in

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use tokio_postgres::Client;

use super::ddl::{build_create_table, build_statements};
use super::diff::{diff_schemas, TableSchemaDifference};
use super::introspect::SchemaIntrospector;
use crate::config::TableConfig;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::utils::validate_identifier;

/// Result of synchronizing (or planning) one table.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchemaSyncOutcome {
    pub table: String,
    /// The table did not exist on the target and was (or would be) created.
    pub created: bool,
    pub difference: Option<TableSchemaDifference>,
    /// Statements executed, or planned when `dry_run` is set.
    pub statements: Vec<String>,
    /// Destructive statements held back because the table disallows them.
    pub withheld: Vec<String>,
    pub dry_run: bool,
}

impl SchemaSyncOutcome {
    pub fn is_in_sync(&self) -> bool {
        self.statements.is_empty() && self.withheld.is_empty()
    }
}

pub struct SchemaSynchronizer<'a> {
    source: &'a Client,
    target: &'a Client,
    retry: RetryPolicy,
}

impl<'a> SchemaSynchronizer<'a> {
    /// `source` is the authoritative side (the leader), `target` the side to fix.
    pub fn new(source: &'a Client, target: &'a Client, retry: RetryPolicy) -> Self {
        Self {
            source,
            target,
            retry,
        }
    }

    /// Compute the statements for a table without running them.
    pub async fn plan_table(&self, table: &TableConfig) -> Result<SchemaSyncOutcome> {
        validate_identifier(&table.name)?;

        let source = SchemaIntrospector::new(self.source)
            .table_schema(&table.name)
            .await?
            .ok_or_else(|| anyhow!("table '{}' does not exist on the leader", table.name))?;

        let target = SchemaIntrospector::new(self.target)
            .table_schema(&table.name)
            .await?;

        let mut outcome = SchemaSyncOutcome {
            table: table.name.clone(),
            dry_run: true,
            ..Default::default()
        };

        match target {
            None => {
                outcome.created = true;
                outcome.statements = build_create_table(&source);
            }
            Some(target) => {
                let diff = diff_schemas(&source, &target);
                if diff.has_differences() {
                    let full = build_statements(&diff);
                    if table.allow_schema_changes {
                        outcome.statements = full;
                    } else {
                        let additive = build_statements(&diff.additive_only());
                        outcome.withheld = full
                            .into_iter()
                            .filter(|stmt| !additive.contains(stmt))
                            .collect();
                        outcome.statements = additive;
                    }
                    outcome.difference = Some(diff);
                }
            }
        }

        Ok(outcome)
    }

    /// Synchronize one table. Any failing statement aborts the rest for this table.
    pub async fn sync_table(&self, table: &TableConfig) -> Result<SchemaSyncOutcome> {
        let mut outcome = self.plan_table(table).await?;
        outcome.dry_run = false;

        if outcome.is_in_sync() {
            tracing::debug!("Schema of {} already matches the leader", table.name);
            return Ok(outcome);
        }
        if let Some(diff) = &outcome.difference {
            tracing::info!("Schema drift on {}: {}", table.name, diff.summary());
        }
        for stmt in &outcome.withheld {
            tracing::warn!(
                "Schema changes disabled for {}, not executing: {}",
                table.name,
                stmt
            );
        }

        for stmt in &outcome.statements {
            self.execute(&table.name, stmt).await?;
        }

        if outcome.created {
            tracing::info!("Created table {} on follower", table.name);
        } else if !outcome.statements.is_empty() {
            tracing::info!(
                "Applied {} schema statement(s) to {}",
                outcome.statements.len(),
                table.name
            );
        }
        Ok(outcome)
    }

    /// Synchronize every table; one table failing does not stop the others.
    pub async fn sync_all(&self, tables: &[TableConfig]) -> Vec<(String, Result<SchemaSyncOutcome>)> {
        let mut results = Vec::with_capacity(tables.len());
        for table in tables {
            let result = self.sync_table(table).await;
            if let Err(e) = &result {
                tracing::error!("Schema sync failed for {}: {:#}", table.name, e);
            }
            results.push((table.name.clone(), result));
        }
        results
    }

    async fn execute(&self, table: &str, stmt: &str) -> Result<()> {
        tracing::debug!("Executing schema statement on {}: {}", table, stmt);
        retry_with_backoff(&format!("schema statement on {}", table), self.retry, || async {
            self.target.batch_execute(stmt).await
        })
        .await
        .map_err(|e| anyhow::Error::new(e.last_error))
        .with_context(|| format!("Schema statement failed on {}: {}", table, stmt))
    }
}
