// ABOUTME: Table structure introspection from the PostgreSQL catalogs
// ABOUTME: Produces TableSchema snapshots of columns, indexes and primary key

use anyhow::{Context, Result};
use serde::Serialize;
use tokio_postgres::Client;

/// One column as seen in the catalogs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    /// `format_type()` output, e.g. `character varying(255)` or `numeric(10,2)`.
    pub data_type: String,
    pub is_nullable: bool,
    /// Default expression, excluding sequence defaults of auto-increment columns.
    pub default: Option<String>,
    /// Identity column or `nextval(...)` default.
    pub is_auto_increment: bool,
}

impl ColumnInfo {
    pub fn new(name: &str, data_type: &str) -> Self {
        Self {
            name: name.to_string(),
            data_type: data_type.to_string(),
            is_nullable: true,
            default: None,
            is_auto_increment: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.is_nullable = false;
        self
    }

    pub fn with_default(mut self, default: &str) -> Self {
        self.default = Some(default.to_string());
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.is_auto_increment = true;
        self.is_nullable = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexInfo {
    pub name: String,
    pub columns: Vec<String>,
    pub is_unique: bool,
    pub is_primary: bool,
}

/// Structural snapshot of a table; computed on demand, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSchema {
    pub table_name: String,
    pub columns: Vec<ColumnInfo>,
    pub indexes: Vec<IndexInfo>,
    pub primary_key: Vec<String>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn secondary_indexes(&self) -> impl Iterator<Item = &IndexInfo> {
        self.indexes.iter().filter(|i| !i.is_primary)
    }
}

/// Reads table structure from one database.
pub struct SchemaIntrospector<'a> {
    client: &'a Client,
}

impl<'a> SchemaIntrospector<'a> {
    pub fn new(client: &'a Client) -> Self {
        Self { client }
    }

    pub async fn table_exists(&self, table: &str) -> Result<bool> {
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

    /// Snapshot a table, or `None` if it does not exist.
    pub async fn table_schema(&self, table: &str) -> Result<Option<TableSchema>> {
        if !self.table_exists(table).await? {
            return Ok(None);
        }
        let columns = self.columns(table).await?;
        let indexes = self.indexes(table).await?;
        let primary_key = indexes
            .iter()
            .find(|i| i.is_primary)
            .map(|i| i.columns.clone())
            .unwrap_or_default();

        Ok(Some(TableSchema {
            table_name: table.to_string(),
            columns,
            indexes,
            primary_key,
        }))
    }

    pub async fn columns(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        let rows = self
            .client
            .query(
                "SELECT a.attname::text,
                        format_type(a.atttypid, a.atttypmod),
                        NOT a.attnotnull,
                        pg_get_expr(d.adbin, d.adrelid),
                        a.attidentity::text <> ''
                 FROM pg_attribute a
                 JOIN pg_class c ON c.oid = a.attrelid
                 JOIN pg_namespace n ON n.oid = c.relnamespace
                 LEFT JOIN pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
                 WHERE c.relname = $1 AND n.nspname = current_schema()
                   AND a.attnum > 0 AND NOT a.attisdropped
                 ORDER BY a.attnum",
                &[&table],
            )
            .await
            .with_context(|| format!("Failed to get columns for {}", table))?;

        Ok(rows
            .iter()
            .map(|row| {
                let default: Option<String> = row.get(3);
                let is_identity: bool = row.get(4);
                let is_sequence = default
                    .as_deref()
                    .map(|d| d.starts_with("nextval("))
                    .unwrap_or(false);
                ColumnInfo {
                    name: row.get(0),
                    data_type: row.get(1),
                    is_nullable: row.get(2),
                    default: if is_sequence { None } else { default },
                    is_auto_increment: is_identity || is_sequence,
                }
            })
            .collect())
    }

    pub async fn indexes(&self, table: &str) -> Result<Vec<IndexInfo>> {
        let rows = self
            .client
            .query(
                "SELECT i.relname::text,
                        ix.indisunique,
                        ix.indisprimary,
                        ARRAY(
                            SELECT a.attname::text
                            FROM unnest(ix.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord)
                            JOIN pg_attribute a ON a.attrelid = ix.indrelid AND a.attnum = k.attnum
                            ORDER BY k.ord
                        )
                 FROM pg_index ix
                 JOIN pg_class t ON t.oid = ix.indrelid
                 JOIN pg_class i ON i.oid = ix.indexrelid
                 JOIN pg_namespace n ON n.oid = t.relnamespace
                 WHERE t.relname = $1 AND n.nspname = current_schema()
                 ORDER BY i.relname",
                &[&table],
            )
            .await
            .with_context(|| format!("Failed to get indexes for {}", table))?;

        Ok(rows
            .iter()
            .map(|row| IndexInfo {
                name: row.get(0),
                is_unique: row.get(1),
                is_primary: row.get(2),
                columns: row.get(3),
            })
            .collect())
    }
}
