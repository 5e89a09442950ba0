// ABOUTME: BulkLoader - full-table copy from the leader into the follower
// ABOUTME: Clears the target, then streams offset windows through COPY with bounded concurrency

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::{pin_mut, SinkExt, StreamExt, TryStreamExt};
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, CopyInSink};

use super::encode::{encode_row, ColumnKind};
use crate::applier::TableShape;
use crate::capture::SUPPRESSION_SETTING;
use crate::config::TableConfig;
use crate::postgres::{connect, connect_with_retry};
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::utils::{quote_ident, quote_ident_list};

// Send buffered CSV to the server once it grows past this size.
const FLUSH_BYTES: usize = 256 * 1024;

/// One offset range of the source table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub index: usize,
    pub offset: u64,
    pub limit: u64,
}

/// Split `row_count` rows into consecutive windows of `window_size`.
pub fn plan_windows(row_count: u64, window_size: u64) -> Vec<Window> {
    let window_size = window_size.max(1);
    let mut windows = Vec::new();
    let mut offset = 0;
    while offset < row_count {
        windows.push(Window {
            index: windows.len(),
            offset,
            limit: window_size.min(row_count - offset),
        });
        offset += window_size;
    }
    windows
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub table: String,
    pub source_rows: u64,
    pub rows_copied: u64,
    pub windows: usize,
    pub duration_ms: u64,
}

/// Columns copied for one table, with their CSV encodings.
struct CopyPlan {
    columns: Vec<String>,
    kinds: Vec<ColumnKind>,
    select_sql: String,
    copy_sql: String,
}

impl CopyPlan {
    fn new(table: &TableConfig, source: &TableShape, target: &TableShape) -> Self {
        // Only columns present on both sides take part.
        let columns: Vec<String> = source
            .column_names()
            .into_iter()
            .filter(|name| target.column_type(name).is_some())
            .collect();
        let kinds = columns
            .iter()
            .map(|name| ColumnKind::from_type(target.column_type(name).unwrap_or("text")))
            .collect();
        Self {
            select_sql: build_window_query(&table.name, &table.primary_key, &columns),
            copy_sql: build_copy_statement(&table.name, &columns),
            columns,
            kinds,
        }
    }
}

pub(crate) fn build_window_query(table: &str, primary_key: &str, columns: &[String]) -> String {
    let selected: Vec<String> = columns
        .iter()
        .map(|c| format!("{}::text", quote_ident(c)))
        .collect();
    format!(
        "SELECT {} FROM {} ORDER BY {} LIMIT $1 OFFSET $2",
        selected.join(", "),
        quote_ident(table),
        quote_ident(primary_key)
    )
}

pub(crate) fn build_copy_statement(table: &str, columns: &[String]) -> String {
    format!(
        "COPY {} ({}) FROM STDIN WITH (FORMAT csv)",
        quote_ident(table),
        quote_ident_list(columns)
    )
}

/// Copies whole tables from a source URL to a target URL.
pub struct BulkLoader {
    source_url: String,
    target_url: String,
    window_size: u64,
    concurrency: usize,
    window_retry: RetryPolicy,
    load_retry: RetryPolicy,
}

impl BulkLoader {
    /// `base_delay` drives window retries; whole-load retries back off five times longer.
    pub fn new(
        source_url: &str,
        target_url: &str,
        window_size: u64,
        concurrency: usize,
        base_delay: Duration,
    ) -> Self {
        Self {
            source_url: source_url.to_string(),
            target_url: target_url.to_string(),
            window_size: window_size.max(1),
            concurrency: concurrency.max(1),
            window_retry: RetryPolicy::new(3, base_delay),
            load_retry: RetryPolicy::new(3, base_delay.saturating_mul(5)),
        }
    }

    /// Replace the target table's contents with the source's.
    pub async fn load_table(&self, table: &TableConfig) -> Result<LoadReport> {
        let label = format!("initial load of {}", table.name);
        let report = retry_with_backoff(&label, self.load_retry, || self.load_once(table))
            .await
            .map_err(|e| {
                let attempts = e.attempts;
                e.into_inner()
                    .context(format!("Initial load of {} failed after {} attempts", table.name, attempts))
            })?;

        tracing::info!(
            "Loaded {} row(s) into {} in {} window(s) ({} ms)",
            report.rows_copied,
            table.name,
            report.windows,
            report.duration_ms
        );
        Ok(report)
    }

    async fn load_once(&self, table: &TableConfig) -> Result<LoadReport> {
        let started = Instant::now();
        let source = connect_with_retry(&self.source_url).await?;
        let mut target = connect_with_retry(&self.target_url).await?;

        let source_shape = TableShape::load(&source, &table.name, &table.primary_key).await?;
        let target_shape = TableShape::load(&target, &table.name, &table.primary_key).await?;
        let plan = CopyPlan::new(table, &source_shape, &target_shape);

        let count_sql = format!("SELECT COUNT(*) FROM {}", quote_ident(&table.name));
        let row: i64 = source
            .query_one(&count_sql, &[])
            .await
            .with_context(|| format!("Failed to count rows in {}", table.name))?
            .get(0);
        let source_rows = u64::try_from(row).unwrap_or(0);

        clear_target(&mut target, &table.name).await?;

        let windows = plan_windows(source_rows, self.window_size);
        tracing::info!(
            "Copying {} row(s) of {} in {} window(s), {} at a time",
            source_rows,
            table.name,
            windows.len(),
            self.concurrency
        );

        let window_count = windows.len();
        let copied: Vec<u64> = futures::stream::iter(windows)
            .map(|window| self.load_window_with_retry(table, &plan, window))
            .buffer_unordered(self.concurrency)
            .try_collect()
            .await?;

        Ok(LoadReport {
            table: table.name.clone(),
            source_rows,
            rows_copied: copied.iter().sum(),
            windows: window_count,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn load_window_with_retry(
        &self,
        table: &TableConfig,
        plan: &CopyPlan,
        window: Window,
    ) -> Result<u64> {
        let label = format!("window {} of {}", window.index, table.name);
        retry_with_backoff(&label, self.window_retry, || self.load_window(table, plan, window))
            .await
            .map_err(|e| e.into_inner())
    }

    async fn load_window(&self, table: &TableConfig, plan: &CopyPlan, window: Window) -> Result<u64> {
        let source = connect(&self.source_url).await?;
        let mut target = connect(&self.target_url).await?;

        let limit = i64::try_from(window.limit).context("window too large")?;
        let offset = i64::try_from(window.offset).context("window offset too large")?;
        let params: [&(dyn ToSql + Sync); 2] = [&limit, &offset];
        let rows = source
            .query_raw(&plan.select_sql, params)
            .await
            .with_context(|| format!("Failed to read window {} of {}", window.index, table.name))?;
        pin_mut!(rows);

        let tx = target
            .transaction()
            .await
            .context("Failed to begin copy transaction")?;
        tx.execute("SELECT set_config($1, '1', true)", &[&SUPPRESSION_SETTING])
            .await
            .context("Failed to raise capture suppression")?;
        let sink: CopyInSink<Bytes> = tx
            .copy_in(&plan.copy_sql)
            .await
            .with_context(|| format!("Failed to start COPY into {}", table.name))?;
        pin_mut!(sink);

        let width = plan.columns.len();
        let mut buffer = String::with_capacity(FLUSH_BYTES);
        while let Some(row) = rows.try_next().await? {
            let values = (0..width)
                .map(|i| row.try_get::<_, Option<String>>(i))
                .collect::<Result<Vec<_>, _>>()?;
            encode_row(&values, &plan.kinds, &mut buffer);
            if buffer.len() >= FLUSH_BYTES {
                sink.send(Bytes::from(std::mem::take(&mut buffer))).await?;
            }
        }
        if !buffer.is_empty() {
            sink.send(Bytes::from(buffer)).await?;
        }

        let copied = sink
            .as_mut()
            .finish()
            .await
            .with_context(|| format!("COPY into {} failed", table.name))?;
        tx.commit()
            .await
            .context("Failed to commit copy transaction")?;

        tracing::debug!(
            "Window {} of {}: {} row(s) at offset {}",
            window.index,
            table.name,
            copied,
            window.offset
        );
        Ok(copied)
    }
}

/// Empty the target table with foreign-key enforcement relaxed where permitted.
///
/// `TRUNCATE` is refused for tables referenced by a foreign key; those fall
/// back to `DELETE`.
async fn clear_target(client: &mut Client, table: &str) -> Result<()> {
    let quoted = quote_ident(table);
    let mut tx = client
        .transaction()
        .await
        .context("Failed to begin truncate transaction")?;
    tx.execute("SELECT set_config($1, '1', true)", &[&SUPPRESSION_SETTING])
        .await
        .context("Failed to raise capture suppression")?;

    let relax = tx.savepoint("relax_fk").await?;
    match relax
        .batch_execute("SET LOCAL session_replication_role = replica")
        .await
    {
        Ok(()) => relax.commit().await?,
        Err(e) => {
            tracing::warn!(
                "Could not disable foreign key enforcement for {} ({}), clearing with checks on",
                table,
                e
            );
            relax.rollback().await?;
        }
    }

    let truncate = tx.savepoint("truncate").await?;
    match truncate
        .batch_execute(&format!("TRUNCATE TABLE {}", quoted))
        .await
    {
        Ok(()) => truncate.commit().await?,
        Err(e) if e.code() == Some(&SqlState::FEATURE_NOT_SUPPORTED) => {
            truncate.rollback().await?;
            tracing::info!("TRUNCATE refused for {}, deleting rows instead", table);
            tx.batch_execute(&format!("DELETE FROM {}", quoted))
                .await
                .with_context(|| format!("Failed to clear {}", table))?;
        }
        Err(e) => {
            return Err(anyhow::Error::new(e).context(format!("Failed to truncate {}", table)));
        }
    }

    tx.commit()
        .await
        .with_context(|| format!("Failed to commit clearing of {}", table))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_windows() {
        let windows = plan_windows(25_000, 10_000);
        assert_eq!(windows.len(), 3);
        assert_eq!(
            windows[2],
            Window {
                index: 2,
                offset: 20_000,
                limit: 5_000
            }
        );
        assert!(plan_windows(0, 10_000).is_empty());
        assert_eq!(plan_windows(10_000, 10_000).len(), 1);
        // Zero window size is treated as one row per window.
        assert_eq!(plan_windows(3, 0).len(), 3);
    }

    #[test]
    fn test_window_query_and_copy_statement() {
        let columns = vec!["id".to_string(), "is_active".to_string()];
        assert_eq!(
            build_window_query("users", "id", &columns),
            "SELECT \"id\"::text, \"is_active\"::text FROM \"users\" ORDER BY \"id\" LIMIT $1 OFFSET $2"
        );
        assert_eq!(
            build_copy_statement("users", &columns),
            "COPY \"users\" (\"id\", \"is_active\") FROM STDIN WITH (FORMAT csv)"
        );
    }

    #[test]
    fn test_copy_plan_uses_shared_columns() {
        let table = TableConfig::new("users", crate::config::ReplicationDirection::LeaderToFollower);
        let source = TableShape {
            name: "users".to_string(),
            primary_key: "id".to_string(),
            columns: vec![
                ("id".to_string(), "integer".to_string()),
                ("active".to_string(), "boolean".to_string()),
                ("leader_only".to_string(), "text".to_string()),
            ],
        };
        let target = TableShape {
            columns: vec![
                ("id".to_string(), "integer".to_string()),
                ("active".to_string(), "boolean".to_string()),
            ],
            ..source.clone()
        };
        let plan = CopyPlan::new(&table, &source, &target);
        assert_eq!(plan.columns, vec!["id", "active"]);
        assert_eq!(plan.kinds, vec![ColumnKind::Other, ColumnKind::Boolean]);
        assert!(!plan.copy_sql.contains("leader_only"));
    }
}
