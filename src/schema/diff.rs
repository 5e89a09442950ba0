// ABOUTME: Structural diff of two table snapshots with type and default normalization
// ABOUTME: Cosmetic differences (aliases, display widths, casts) never count as drift

use serde::Serialize;

use super::introspect::{ColumnInfo, IndexInfo, TableSchema};

/// A column whose definition differs between source and target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnChange {
    pub name: String,
    pub source: ColumnInfo,
    pub target: ColumnInfo,
}

impl ColumnChange {
    pub fn type_changed(&self) -> bool {
        normalize_type(&self.source.data_type) != normalize_type(&self.target.data_type)
    }

    pub fn nullability_changed(&self) -> bool {
        self.source.is_nullable != self.target.is_nullable
    }

    pub fn default_changed(&self) -> bool {
        normalize_default(self.source.default.as_deref())
            != normalize_default(self.target.default.as_deref())
    }

    pub fn auto_increment_changed(&self) -> bool {
        self.source.is_auto_increment != self.target.is_auto_increment
    }
}

/// What it takes to make the target table match the source table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableSchemaDifference {
    pub table_name: String,
    pub columns_to_add: Vec<ColumnInfo>,
    pub columns_to_modify: Vec<ColumnChange>,
    pub columns_to_drop: Vec<String>,
    pub indexes_to_add: Vec<IndexInfo>,
    pub indexes_to_drop: Vec<IndexInfo>,
}

impl TableSchemaDifference {
    pub fn has_differences(&self) -> bool {
        !(self.columns_to_add.is_empty()
            && self.columns_to_modify.is_empty()
            && self.columns_to_drop.is_empty()
            && self.indexes_to_add.is_empty()
            && self.indexes_to_drop.is_empty())
    }

    /// Changes that cannot lose data: new columns and new indexes.
    pub fn additive_only(&self) -> TableSchemaDifference {
        TableSchemaDifference {
            table_name: self.table_name.clone(),
            columns_to_add: self.columns_to_add.clone(),
            indexes_to_add: self
                .indexes_to_add
                .iter()
                .filter(|idx| !self.indexes_to_drop.iter().any(|d| d.name == idx.name))
                .cloned()
                .collect(),
            ..Default::default()
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "+{} cols, ~{} cols, -{} cols, +{} idx, -{} idx",
            self.columns_to_add.len(),
            self.columns_to_modify.len(),
            self.columns_to_drop.len(),
            self.indexes_to_add.len(),
            self.indexes_to_drop.len()
        )
    }
}

/// Diff `target` against `source`. Primary-key indexes are left alone.
pub fn diff_schemas(source: &TableSchema, target: &TableSchema) -> TableSchemaDifference {
    let mut diff = TableSchemaDifference {
        table_name: source.table_name.clone(),
        ..Default::default()
    };

    for column in &source.columns {
        match target.column(&column.name) {
            None => diff.columns_to_add.push(column.clone()),
            Some(existing) => {
                let change = ColumnChange {
                    name: column.name.clone(),
                    source: column.clone(),
                    target: existing.clone(),
                };
                if change.type_changed()
                    || change.nullability_changed()
                    || change.default_changed()
                    || change.auto_increment_changed()
                {
                    diff.columns_to_modify.push(change);
                }
            }
        }
    }

    diff.columns_to_drop = target
        .columns
        .iter()
        .filter(|c| source.column(&c.name).is_none())
        .map(|c| c.name.clone())
        .collect();

    for index in source.secondary_indexes() {
        match target.secondary_indexes().find(|i| i.name == index.name) {
            None => diff.indexes_to_add.push(index.clone()),
            Some(existing) if !same_index(index, existing) => {
                diff.indexes_to_drop.push(existing.clone());
                diff.indexes_to_add.push(index.clone());
            }
            Some(_) => {}
        }
    }
    for index in target.secondary_indexes() {
        if !source.secondary_indexes().any(|i| i.name == index.name) {
            diff.indexes_to_drop.push(index.clone());
        }
    }

    diff
}

fn same_index(a: &IndexInfo, b: &IndexInfo) -> bool {
    a.is_unique == b.is_unique && a.columns == b.columns
}

/// Canonical spelling of a column type.
///
/// Lower-cases, collapses whitespace, drops integer display widths and maps
/// the common aliases onto the names `format_type()` reports.
pub fn normalize_type(data_type: &str) -> String {
    let lowered = data_type
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_lowercase();

    // `timestamp(3) with time zone` keeps its modifier in the middle.
    let (base, modifier) = match (lowered.find('('), lowered.find(')')) {
        (Some(open), Some(close)) if open < close => {
            let base = format!("{} {}", lowered[..open].trim(), lowered[close + 1..].trim());
            (base.trim().to_string(), Some(lowered[open..=close].to_string()))
        }
        _ => (lowered.clone(), None),
    };

    let canonical = match base.as_str() {
        "int" | "int4" | "integer" | "mediumint" | "serial" | "serial4" => "integer",
        "int8" | "bigint" | "bigserial" | "serial8" => "bigint",
        "int2" | "smallint" | "tinyint" | "smallserial" | "serial2" => "smallint",
        "bool" | "boolean" => "boolean",
        "float8" | "double" | "double precision" => "double precision",
        "float4" | "real" => "real",
        "decimal" | "numeric" => "numeric",
        "varchar" | "character varying" => "character varying",
        "char" | "character" | "bpchar" => "character",
        "timestamptz" | "timestamp with time zone" => "timestamp with time zone",
        "timestamp" | "timestamp without time zone" => "timestamp without time zone",
        "timetz" | "time with time zone" => "time with time zone",
        "time" | "time without time zone" => "time without time zone",
        other => other,
    };

    let integer_family = matches!(canonical, "integer" | "bigint" | "smallint");
    match modifier {
        Some(_) if integer_family => canonical.to_string(),
        Some(m) => format!("{}{}", canonical, m.replace(' ', "")),
        None => canonical.to_string(),
    }
}

/// Canonical form of a default expression; `None` when there is no default.
///
/// Strips trailing `::type` casts so `'abc'::character varying` and `'abc'`
/// compare equal. An explicit `NULL` default is the same as no default.
pub fn normalize_default(default: Option<&str>) -> Option<String> {
    let mut value = default?.trim().to_string();
    while let Some(pos) = last_cast_position(&value) {
        value.truncate(pos);
        value = value.trim().to_string();
    }
    if value.starts_with('(') && value.ends_with(')') && !value[1..].contains('(') {
        value = value[1..value.len() - 1].trim().to_string();
    }
    let lowered = value.to_ascii_lowercase();
    if lowered.is_empty() || lowered == "null" {
        return None;
    }
    match lowered.as_str() {
        "now()" | "current_timestamp" | "transaction_timestamp()" => {
            Some("current_timestamp".to_string())
        }
        "true" | "false" => Some(lowered),
        _ => Some(value),
    }
}

// Position of a trailing `::type` cast outside of quotes.
fn last_cast_position(value: &str) -> Option<usize> {
    let mut in_quote = false;
    let mut last = None;
    let mut chars = value.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match c {
            '\'' => in_quote = !in_quote,
            ':' if !in_quote && matches!(chars.peek(), Some((_, ':'))) => {
                last = Some(i);
                chars.next();
            }
            _ => {}
        }
    }
    let pos = last?;
    let tail = &value[pos + 2..];
    let is_type_name = tail
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, ' ' | '_' | '(' | ')' | ',' | '[' | ']' | '"'));
    let balanced = tail.matches('(').count() == tail.matches(')').count();
    if is_type_name && balanced {
        Some(pos)
    } else {
        None
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn schema(name: &str, columns: Vec<ColumnInfo>, indexes: Vec<IndexInfo>) -> TableSchema {
        let primary_key = indexes
            .iter()
            .find(|i| i.is_primary)
            .map(|i| i.columns.clone())
            .unwrap_or_default();
        TableSchema {
            table_name: name.to_string(),
            columns,
            indexes,
            primary_key,
        }
    }

    pub(crate) fn pk_index(table: &str) -> IndexInfo {
        IndexInfo {
            name: format!("{}_pkey", table),
            columns: vec!["id".to_string()],
            is_unique: true,
            is_primary: true,
        }
    }

    #[test]
    fn test_missing_column_is_added() {
        let leader = schema(
            "products",
            vec![
                ColumnInfo::new("id", "bigint").auto_increment(),
                ColumnInfo::new("name", "text"),
                ColumnInfo::new("price", "numeric(10,2)"),
            ],
            vec![pk_index("products")],
        );
        let follower = schema(
            "products",
            vec![
                ColumnInfo::new("id", "bigint").auto_increment(),
                ColumnInfo::new("name", "text"),
            ],
            vec![pk_index("products")],
        );

        let diff = diff_schemas(&leader, &follower);
        assert!(diff.has_differences());
        assert_eq!(diff.columns_to_add.len(), 1);
        assert_eq!(diff.columns_to_add[0].name, "price");
        assert!(diff.columns_to_modify.is_empty());
        assert!(diff.columns_to_drop.is_empty());
        assert!(diff.indexes_to_add.is_empty());
    }

    #[test]
    fn test_identical_schemas_have_no_diff() {
        let table = schema(
            "t",
            vec![ColumnInfo::new("id", "integer").auto_increment()],
            vec![pk_index("t")],
        );
        assert!(!diff_schemas(&table, &table.clone()).has_differences());
    }

    #[test]
    fn test_cosmetic_differences_ignored() {
        let source = schema(
            "t",
            vec![
                ColumnInfo::new("a", "int(11)"),
                ColumnInfo::new("b", "varchar(20)").with_default("'x'::character varying"),
                ColumnInfo::new("c", "timestamptz").with_default("now()"),
            ],
            vec![],
        );
        let target = schema(
            "t",
            vec![
                ColumnInfo::new("a", "integer"),
                ColumnInfo::new("b", "character varying(20)").with_default("'x'"),
                ColumnInfo::new("c", "timestamp with time zone").with_default("CURRENT_TIMESTAMP"),
            ],
            vec![],
        );
        let diff = diff_schemas(&source, &target);
        assert!(!diff.has_differences(), "unexpected diff: {:?}", diff);
    }

    #[test]
    fn test_modified_and_dropped_columns() {
        let source = schema(
            "t",
            vec![ColumnInfo::new("a", "bigint").not_null()],
            vec![],
        );
        let target = schema(
            "t",
            vec![ColumnInfo::new("a", "integer"), ColumnInfo::new("legacy", "text")],
            vec![],
        );
        let diff = diff_schemas(&source, &target);
        assert_eq!(diff.columns_to_modify.len(), 1);
        let change = &diff.columns_to_modify[0];
        assert!(change.type_changed());
        assert!(change.nullability_changed());
        assert!(!change.default_changed());
        assert_eq!(diff.columns_to_drop, vec!["legacy".to_string()]);
    }

    #[test]
    fn test_changed_index_is_dropped_and_recreated() {
        let idx = |unique: bool, cols: &[&str]| IndexInfo {
            name: "idx_t_email".to_string(),
            columns: cols.iter().map(|c| c.to_string()).collect(),
            is_unique: unique,
            is_primary: false,
        };
        let source = schema("t", vec![], vec![idx(true, &["email"])]);
        let target = schema("t", vec![], vec![idx(false, &["email"])]);
        let diff = diff_schemas(&source, &target);
        assert_eq!(diff.indexes_to_drop.len(), 1);
        assert_eq!(diff.indexes_to_add.len(), 1);
        assert!(diff.indexes_to_add[0].is_unique);

        let additive = diff.additive_only();
        assert!(additive.indexes_to_add.is_empty());
        assert!(additive.indexes_to_drop.is_empty());
    }

    #[test]
    fn test_normalize_type() {
        assert_eq!(normalize_type("INT4"), "integer");
        assert_eq!(normalize_type("bigint(20)"), "bigint");
        assert_eq!(normalize_type("VARCHAR(255)"), "character varying(255)");
        assert_eq!(normalize_type("numeric(10, 2)"), "numeric(10,2)");
        assert_eq!(normalize_type("timestamp  with time zone"), "timestamp with time zone");
        assert_eq!(normalize_type("jsonb"), "jsonb");
        assert_eq!(
            normalize_type("timestamptz(3)"),
            normalize_type("timestamp(3) with time zone")
        );
    }

    #[test]
    fn test_normalize_default() {
        assert_eq!(normalize_default(None), None);
        assert_eq!(normalize_default(Some("NULL")), None);
        assert_eq!(normalize_default(Some("NULL::text")), None);
        assert_eq!(normalize_default(Some("'abc'::text")).as_deref(), Some("'abc'"));
        assert_eq!(normalize_default(Some("'a::b'")).as_deref(), Some("'a::b'"));
        assert_eq!(normalize_default(Some("(0)::numeric")).as_deref(), Some("0"));
        assert_eq!(normalize_default(Some("FALSE")).as_deref(), Some("false"));
        assert_eq!(normalize_default(Some("gen_random_uuid()")).as_deref(), Some("gen_random_uuid()"));
    }
}
