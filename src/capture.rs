// ABOUTME: Change capture - installs and verifies row-level triggers that append to replication_logs
// ABOUTME: Triggers skip capture while the writer session has replication.is_replicating set

use anyhow::{Context, Result};
use tokio_postgres::Client;

use crate::log_store::{Direction, OperationType};
use crate::utils::{quote_ident, quote_literal, validate_identifier};

/// Session setting the apply transaction raises to suppress re-capture.
///
/// Protocol: the writer sets it to `'1'` on its connection before replaying
/// changes and back to `'0'` before committing, on the same physical
/// connection. The capture function ignores every row change made while it is
/// `'1'`, which stops a replayed change from bouncing back to its origin.
pub const SUPPRESSION_SETTING: &str = "replication.is_replicating";

const CAPTURE_FUNCTION: &str = r#"
CREATE OR REPLACE FUNCTION replication_capture() RETURNS trigger
LANGUAGE plpgsql AS $$
DECLARE
    pk_column     TEXT := TG_ARGV[0];
    log_direction SMALLINT := TG_ARGV[1]::smallint;
    server_name   TEXT := TG_ARGV[2];
    row_image     JSONB;
BEGIN
    IF COALESCE(current_setting('replication.is_replicating', true), '') = '1' THEN
        RETURN NULL;
    END IF;

    IF TG_OP = 'DELETE' THEN
        row_image := to_jsonb(OLD);
    ELSE
        row_image := to_jsonb(NEW);
    END IF;

    INSERT INTO replication_logs
        (table_name, operation_type, record_id, data, timestamp, direction, source_server, operation_id)
    VALUES
        (TG_TABLE_NAME, TG_OP, row_image ->> pk_column, row_image, clock_timestamp(),
         log_direction, server_name, md5(random()::text || clock_timestamp()::text || txid_current()::text));

    RETURN NULL;
END;
$$;
"#;

/// Outcome of installing capture triggers for one table on one side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerReport {
    pub table: String,
    pub created: Vec<String>,
    pub existing: Vec<String>,
    pub skipped_reason: Option<String>,
}

impl TriggerReport {
    pub fn is_complete(&self) -> bool {
        self.skipped_reason.is_none() && self.created.len() + self.existing.len() == 3
    }
}

/// Installs the capture function and per-table triggers on one database.
///
/// `direction` is the log direction the captured changes will carry: the
/// leader's triggers write [`Direction::LeaderToFollower`] entries and the
/// follower's write [`Direction::FollowerToLeader`] entries.
pub struct TriggerInstaller<'a> {
    client: &'a Client,
    direction: Direction,
    server_name: String,
}

impl<'a> TriggerInstaller<'a> {
    pub fn new(client: &'a Client, direction: Direction, server_name: &str) -> Self {
        Self {
            client,
            direction,
            server_name: server_name.to_string(),
        }
    }

    /// Create or replace the shared `replication_capture()` trigger function.
    pub async fn ensure_capture_function(&self) -> Result<()> {
        self.client
            .batch_execute(CAPTURE_FUNCTION)
            .await
            .context("Failed to install replication_capture() function")
    }

    /// Make sure insert/update/delete triggers exist for a table.
    ///
    /// Existing triggers are left untouched, so calling this on every startup
    /// is safe. A table that does not exist on this side is reported as
    /// skipped rather than failing.
    pub async fn install(&self, table: &str, primary_key: &str) -> Result<TriggerReport> {
        validate_identifier(table)?;
        validate_identifier(primary_key)?;

        let mut report = TriggerReport {
            table: table.to_string(),
            ..Default::default()
        };

        if !self.table_exists(table).await? {
            tracing::warn!(
                "Skipping capture triggers for {}: table does not exist on {} side",
                table,
                self.side_name()
            );
            report.skipped_reason = Some("table does not exist".to_string());
            return Ok(report);
        }

        let present = self.existing_triggers(table).await?;
        for op in [
            OperationType::Insert,
            OperationType::Update,
            OperationType::Delete,
        ] {
            let name = trigger_name(table, op);
            if present.contains(&name) {
                report.existing.push(name);
                continue;
            }
            let sql = build_trigger_ddl(
                table,
                &name,
                op,
                primary_key,
                self.direction,
                &self.server_name,
            );
            self.client
                .batch_execute(&sql)
                .await
                .with_context(|| format!("Failed to create trigger {} on {}", name, table))?;
            tracing::info!(
                "Created capture trigger {} on {} ({} side)",
                name,
                table,
                self.side_name()
            );
            report.created.push(name);
        }

        Ok(report)
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let row = self
            .client
            .query_one(
                "SELECT EXISTS (
                    SELECT 1 FROM information_schema.tables
                    WHERE table_schema = current_schema() AND table_name = $1
                 )",
                &[&table],
            )
            .await
            .context("Failed to check if table exists")?;
        Ok(row.get(0))
    }

    async fn existing_triggers(&self, table: &str) -> Result<Vec<String>> {
        let rows = self
            .client
            .query(
                "SELECT t.tgname::text
                 FROM pg_trigger t
                 JOIN pg_class c ON c.oid = t.tgrelid
                 JOIN pg_namespace n ON n.oid = c.relnamespace
                 WHERE c.relname = $1 AND n.nspname = current_schema() AND NOT t.tgisinternal",
                &[&table],
            )
            .await
            .with_context(|| format!("Failed to list triggers on {}", table))?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    fn side_name(&self) -> &'static str {
        match self.direction {
            Direction::LeaderToFollower => "leader",
            Direction::FollowerToLeader => "follower",
        }
    }
}

/// Trigger name for a table/operation, clipped to PostgreSQL's 63-byte limit.
pub fn trigger_name(table: &str, op: OperationType) -> String {
    let suffix = match op {
        OperationType::Insert => "ins",
        OperationType::Update => "upd",
        OperationType::Delete => "del",
    };
    let mut name = format!("repl_{}_{}", suffix, table);
    name.truncate(63);
    name
}

fn build_trigger_ddl(
    table: &str,
    trigger: &str,
    op: OperationType,
    primary_key: &str,
    direction: Direction,
    server_name: &str,
) -> String {
    format!(
        "CREATE TRIGGER {} AFTER {} ON {} FOR EACH ROW EXECUTE FUNCTION replication_capture({}, {}, {})",
        quote_ident(trigger),
        op.as_str(),
        quote_ident(table),
        quote_literal(primary_key),
        quote_literal(&direction.as_i16().to_string()),
        quote_literal(server_name)
    )
}
