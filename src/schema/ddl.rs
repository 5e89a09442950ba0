// ABOUTME: DDL generation for schema sync - CREATE TABLE and ordered ALTER statements
// ABOUTME: Order is drop indexes, add columns, modify columns, drop columns, add indexes

use super::diff::{ColumnChange, TableSchemaDifference};
use super::introspect::{ColumnInfo, IndexInfo, TableSchema};
use crate::utils::{quote_ident, quote_ident_list};

/// Statements creating `schema` from scratch, secondary indexes included.
pub fn build_create_table(schema: &TableSchema) -> Vec<String> {
    let mut defs: Vec<String> = schema.columns.iter().map(column_definition).collect();
    if !schema.primary_key.is_empty() {
        defs.push(format!("PRIMARY KEY ({})", quote_ident_list(&schema.primary_key)));
    }

    let mut statements = vec![format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        quote_ident(&schema.table_name),
        defs.join(",\n    ")
    )];
    statements.extend(
        schema
            .secondary_indexes()
            .map(|idx| create_index(&schema.table_name, idx)),
    );
    statements
}

/// Statements turning the target table into the source shape, in execution order.
pub fn build_statements(diff: &TableSchemaDifference) -> Vec<String> {
    let table = quote_ident(&diff.table_name);
    let mut statements = Vec::new();

    for idx in &diff.indexes_to_drop {
        statements.push(format!("DROP INDEX IF EXISTS {}", quote_ident(&idx.name)));
    }

    for column in &diff.columns_to_add {
        statements.push(format!(
            "ALTER TABLE {} ADD COLUMN {}",
            table,
            column_definition(column)
        ));
    }

    for change in &diff.columns_to_modify {
        statements.extend(modify_statements(&table, change));
    }

    for column in &diff.columns_to_drop {
        statements.push(format!(
            "ALTER TABLE {} DROP COLUMN IF EXISTS {}",
            table,
            quote_ident(column)
        ));
    }

    for idx in &diff.indexes_to_add {
        statements.push(create_index(&diff.table_name, idx));
    }

    statements
}

fn column_definition(column: &ColumnInfo) -> String {
    let mut def = format!("{} {}", quote_ident(&column.name), column.data_type);
    if column.is_auto_increment {
        def.push_str(" GENERATED BY DEFAULT AS IDENTITY");
    } else if let Some(default) = &column.default {
        def.push_str(" DEFAULT ");
        def.push_str(default);
    }
    if !column.is_nullable {
        def.push_str(" NOT NULL");
    }
    def
}

fn modify_statements(table: &str, change: &ColumnChange) -> Vec<String> {
    let col = quote_ident(&change.name);
    let source = &change.source;
    let mut statements = Vec::new();
    let mut actions = Vec::new();

    // Losing auto-increment covers identity columns and serial defaults. DROP
    // DEFAULT fails on an identity column inside the same ALTER TABLE, so the
    // identity goes first in its own statement.
    let drops_auto_increment = change.auto_increment_changed() && !source.is_auto_increment;
    if drops_auto_increment {
        statements.push(format!(
            "ALTER TABLE {} ALTER COLUMN {} DROP IDENTITY IF EXISTS",
            table, col
        ));
    }
    if change.type_changed() {
        actions.push(format!(
            "ALTER COLUMN {col} TYPE {ty} USING {col}::{ty}",
            col = col,
            ty = source.data_type
        ));
    }
    if change.auto_increment_changed() && source.is_auto_increment {
        // Identity needs the column to have no default.
        actions.push(format!("ALTER COLUMN {} DROP DEFAULT", col));
        actions.push(format!(
            "ALTER COLUMN {} ADD GENERATED BY DEFAULT AS IDENTITY",
            col
        ));
    } else if drops_auto_increment || (change.default_changed() && !source.is_auto_increment) {
        match &source.default {
            Some(default) => actions.push(format!("ALTER COLUMN {} SET DEFAULT {}", col, default)),
            None => actions.push(format!("ALTER COLUMN {} DROP DEFAULT", col)),
        }
    }
    if change.nullability_changed() {
        let verb = if source.is_nullable { "DROP" } else { "SET" };
        actions.push(format!("ALTER COLUMN {} {} NOT NULL", col, verb));
    }

    if !actions.is_empty() {
        statements.push(format!("ALTER TABLE {} {}", table, actions.join(", ")));
    }
    statements
}

fn create_index(table: &str, idx: &IndexInfo) -> String {
    format!(
        "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
        if idx.is_unique { "UNIQUE " } else { "" },
        quote_ident(&idx.name),
        quote_ident(table),
        quote_ident_list(&idx.columns)
    )
}
