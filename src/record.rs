// ABOUTME: Record representations used by the applier - typed bindings or generic column maps
// ABOUTME: A registry keyed by table name replaces runtime type inspection for typed tables

use anyhow::{bail, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_postgres::Row;

/// Text form of a column value; `None` is SQL NULL.
pub type ColumnValue = Option<String>;

/// Ordered column-name/value map describing one row.
///
/// Values travel as their PostgreSQL text representation and are cast back to
/// the target column type when written, so any column type with text I/O can
/// be replicated without a compiled binding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnMap {
    columns: Vec<(String, ColumnValue)>,
}

impl ColumnMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a row selected with every column cast to `text`.
    pub fn from_text_row(row: &Row, names: &[String]) -> Result<Self> {
        let mut columns = Vec::with_capacity(names.len());
        for (idx, name) in names.iter().enumerate() {
            let value: Option<String> = row.try_get(idx)?;
            columns.push((name.clone(), value));
        }
        Ok(Self { columns })
    }

    pub fn insert(&mut self, name: impl Into<String>, value: ColumnValue) {
        let name = name.into();
        match self.columns.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.columns.push((name, value)),
        }
    }

    pub fn with(mut self, name: &str, value: Option<&str>) -> Self {
        self.insert(name, value.map(str::to_string));
        self
    }

    /// Value of a column; `None` when the column is absent, `Some(None)` for NULL.
    pub fn get(&self, name: &str) -> Option<&ColumnValue> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ColumnValue)> {
        self.columns.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Copy without the given column (used to keep primary keys out of updates).
    pub fn without(&self, name: &str) -> ColumnMap {
        ColumnMap {
            columns: self
                .columns
                .iter()
                .filter(|(n, _)| n != name)
                .cloned()
                .collect(),
        }
    }

    /// Keep only columns accepted by the predicate, preserving order.
    pub fn retain<F: FnMut(&str) -> bool>(&mut self, mut keep: F) {
        self.columns.retain(|(n, _)| keep(n));
    }
}

/// Capability interface a typed, compiled table binding exposes.
pub trait Replicable: Send + Sync + fmt::Debug {
    /// Stringified primary-key value.
    fn primary_key(&self) -> String;

    /// Every scalar field as a column map, primary key included.
    fn to_columns(&self) -> ColumnMap;

    /// Fields to write over an existing row: everything except the primary key.
    fn apply_to(&self, primary_key_column: &str) -> ColumnMap {
        self.to_columns().without(primary_key_column)
    }
}

/// Factory turning column maps into typed records for one table.
pub trait RecordBinding: Send + Sync {
    fn table_name(&self) -> &str;

    fn from_columns(&self, columns: &ColumnMap) -> Result<Box<dyn Replicable>>;
}

/// Bindings for tables replicated in entity mode, built once at startup.
#[derive(Clone, Default)]
pub struct RecordRegistry {
    bindings: HashMap<String, Arc<dyn RecordBinding>>,
}

impl RecordRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, binding: Arc<dyn RecordBinding>) {
        self.bindings
            .insert(binding.table_name().to_string(), binding);
    }

    pub fn contains(&self, table: &str) -> bool {
        self.bindings.contains_key(table)
    }

    pub fn get(&self, table: &str) -> Option<Arc<dyn RecordBinding>> {
        self.bindings.get(table).cloned()
    }

    pub fn tables(&self) -> Vec<&str> {
        self.bindings.keys().map(|s| s.as_str()).collect()
    }
}

impl fmt::Debug for RecordRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordRegistry")
            .field("tables", &self.tables())
            .finish()
    }
}

/// A source row ready to be written: typed binding or generic column map.
#[derive(Debug)]
pub enum Record {
    Typed(Box<dyn Replicable>),
    Generic(ColumnMap),
}

impl Record {
    /// Build a record for a table, through its binding when one is required.
    pub fn build(
        registry: &RecordRegistry,
        table: &str,
        typed: bool,
        columns: ColumnMap,
    ) -> Result<Record> {
        if !typed {
            return Ok(Record::Generic(columns));
        }
        match registry.get(table) {
            Some(binding) => Ok(Record::Typed(binding.from_columns(&columns)?)),
            None => bail!("no record binding registered for table '{}'", table),
        }
    }

    /// Full column set for an insert.
    pub fn insert_columns(&self) -> ColumnMap {
        match self {
            Record::Typed(record) => record.to_columns(),
            Record::Generic(columns) => columns.clone(),
        }
    }

    /// Column set for an update; the primary key is never overwritten.
    pub fn update_columns(&self, primary_key_column: &str) -> ColumnMap {
        match self {
            Record::Typed(record) => record.apply_to(primary_key_column),
            Record::Generic(columns) => columns.without(primary_key_column),
        }
    }

    pub fn primary_key(&self, primary_key_column: &str) -> Option<String> {
        match self {
            Record::Typed(record) => Some(record.primary_key()),
            Record::Generic(columns) => columns.get(primary_key_column).cloned().flatten(),
        }
    }
}
