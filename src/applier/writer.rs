// ABOUTME: RowWriter - single-row insert/update/delete against the target inside the apply transaction
// ABOUTME: Values travel as text and are cast to each target column's type in SQL

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, GenericClient};

use crate::record::{ColumnMap, ColumnValue};
use crate::schema::SchemaIntrospector;
use crate::utils::quote_ident;

/// Column names and types of one table, as `format_type()` reports them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableShape {
    pub name: String,
    pub primary_key: String,
    pub columns: Vec<(String, String)>,
}

impl TableShape {
    pub async fn load(client: &Client, table: &str, primary_key: &str) -> Result<Self> {
        let columns: Vec<(String, String)> = SchemaIntrospector::new(client)
            .columns(table)
            .await?
            .into_iter()
            .map(|c| (c.name, c.data_type))
            .collect();
        if columns.is_empty() {
            bail!("table '{}' does not exist or has no columns", table);
        }
        let shape = Self {
            name: table.to_string(),
            primary_key: primary_key.to_string(),
            columns,
        };
        if shape.column_type(primary_key).is_none() {
            bail!("table '{}' has no primary key column '{}'", table, primary_key);
        }
        Ok(shape)
    }

    pub fn column_type(&self, name: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t.as_str())
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|(n, _)| n.clone()).collect()
    }

    fn pk_type(&self) -> &str {
        self.column_type(&self.primary_key).unwrap_or("text")
    }

    /// Drop columns this table does not have, keeping the map's order.
    pub fn restrict(&self, mut columns: ColumnMap) -> ColumnMap {
        columns.retain(|name| self.column_type(name).is_some());
        columns
    }
}

/// Convert a captured `to_jsonb` row image into text column values for `shape`.
pub fn columns_from_image(image: &Value, shape: &TableShape) -> Result<ColumnMap> {
    let Some(object) = image.as_object() else {
        bail!("row image for {} is not a JSON object", shape.name);
    };
    let mut columns = ColumnMap::new();
    for (name, ty) in &shape.columns {
        if let Some(value) = object.get(name) {
            columns.insert(name.clone(), json_to_text(value, ty));
        }
    }
    Ok(columns)
}

fn json_to_text(value: &Value, column_type: &str) -> ColumnValue {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Array(items) if column_type.ends_with("[]") => Some(array_literal(items)),
        other => Some(other.to_string()),
    }
}

// PostgreSQL array input syntax for a JSON array.
fn array_literal(items: &[Value]) -> String {
    let parts: Vec<String> = items
        .iter()
        .map(|item| match item {
            Value::Null => "NULL".to_string(),
            Value::Array(inner) => array_literal(inner),
            Value::String(s) => quote_array_element(s),
            Value::Object(_) => quote_array_element(&item.to_string()),
            other => other.to_string(),
        })
        .collect();
    format!("{{{}}}", parts.join(","))
}

fn quote_array_element(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

fn placeholder(index: usize, column_type: &str) -> String {
    format!("${}::text::{}", index, column_type)
}

pub(crate) fn build_exists_query(shape: &TableShape) -> String {
    format!(
        "SELECT 1 FROM {} WHERE {} = {} LIMIT 1",
        quote_ident(&shape.name),
        quote_ident(&shape.primary_key),
        placeholder(1, shape.pk_type())
    )
}

pub(crate) fn build_select_query(shape: &TableShape) -> String {
    let columns: Vec<String> = shape
        .columns
        .iter()
        .map(|(name, _)| format!("{}::text", quote_ident(name)))
        .collect();
    format!(
        "SELECT {} FROM {} WHERE {} = {}",
        columns.join(", "),
        quote_ident(&shape.name),
        quote_ident(&shape.primary_key),
        placeholder(1, shape.pk_type())
    )
}

pub(crate) fn build_insert_query(shape: &TableShape, columns: &ColumnMap) -> String {
    let names: Vec<String> = columns.names().map(quote_ident).collect();
    let values: Vec<String> = columns
        .names()
        .enumerate()
        .map(|(i, name)| placeholder(i + 1, shape.column_type(name).unwrap_or("text")))
        .collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(&shape.name),
        names.join(", "),
        values.join(", ")
    )
}

pub(crate) fn build_update_query(shape: &TableShape, columns: &ColumnMap) -> String {
    let assignments: Vec<String> = columns
        .names()
        .enumerate()
        .map(|(i, name)| {
            format!(
                "{} = {}",
                quote_ident(name),
                placeholder(i + 1, shape.column_type(name).unwrap_or("text"))
            )
        })
        .collect();
    format!(
        "UPDATE {} SET {} WHERE {} = {}",
        quote_ident(&shape.name),
        assignments.join(", "),
        quote_ident(&shape.primary_key),
        placeholder(columns.len() + 1, shape.pk_type())
    )
}

pub(crate) fn build_delete_query(shape: &TableShape) -> String {
    format!(
        "DELETE FROM {} WHERE {} = {}",
        quote_ident(&shape.name),
        quote_ident(&shape.primary_key),
        placeholder(1, shape.pk_type())
    )
}

/// Read the current row for a primary key from the source side, all columns as text.
pub async fn fetch_row(client: &Client, shape: &TableShape, pk: &str) -> Result<Option<ColumnMap>> {
    let row = client
        .query_opt(&build_select_query(shape), &[&pk])
        .await
        .with_context(|| format!("Failed to read {}/{} from source", shape.name, pk))?;
    row.map(|row| ColumnMap::from_text_row(&row, &shape.column_names()))
        .transpose()
}

/// Writes single rows to the target through any client or transaction.
pub struct RowWriter<'a, C: GenericClient> {
    client: &'a C,
    shape: &'a TableShape,
}

impl<'a, C: GenericClient> RowWriter<'a, C> {
    pub fn new(client: &'a C, shape: &'a TableShape) -> Self {
        Self { client, shape }
    }

    pub async fn exists(&self, pk: &str) -> Result<bool> {
        let row = self
            .client
            .query_opt(&build_exists_query(self.shape), &[&pk])
            .await
            .with_context(|| format!("Failed to look up {}/{}", self.shape.name, pk))?;
        Ok(row.is_some())
    }

    pub async fn insert(&self, columns: &ColumnMap) -> Result<u64> {
        if columns.is_empty() {
            bail!("no columns to insert into {}", self.shape.name);
        }
        let query = build_insert_query(self.shape, columns);
        let values: Vec<&ColumnValue> = columns.iter().map(|(_, v)| v).collect();
        self.client
            .execute(&query, &as_params(&values))
            .await
            .with_context(|| format!("Failed to insert into {}", self.shape.name))
    }

    /// Overwrite every given column; an empty column set is a no-op.
    pub async fn update(&self, pk: &str, columns: &ColumnMap) -> Result<u64> {
        if columns.is_empty() {
            return Ok(0);
        }
        let query = build_update_query(self.shape, columns);
        let pk_value: ColumnValue = Some(pk.to_string());
        let mut values: Vec<&ColumnValue> = columns.iter().map(|(_, v)| v).collect();
        values.push(&pk_value);
        self.client
            .execute(&query, &as_params(&values))
            .await
            .with_context(|| format!("Failed to update {}/{}", self.shape.name, pk))
    }

    pub async fn delete(&self, pk: &str) -> Result<u64> {
        self.client
            .execute(&build_delete_query(self.shape), &[&pk])
            .await
            .with_context(|| format!("Failed to delete {}/{}", self.shape.name, pk))
    }
}

fn as_params<'v>(values: &'v [&'v ColumnValue]) -> Vec<&'v (dyn ToSql + Sync)> {
    values.iter().map(|v| *v as &(dyn ToSql + Sync)).collect()
}
