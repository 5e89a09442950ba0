// ABOUTME: Schema drift detection and synchronization between leader and follower tables
// ABOUTME: Introspects structure, diffs it, and emits ordered CREATE/ALTER statements

pub mod ddl;
pub mod diff;
pub mod introspect;
pub mod sync;

pub use ddl::{build_create_table, build_statements};
pub use diff::{diff_schemas, normalize_default, normalize_type, ColumnChange, TableSchemaDifference};
pub use introspect::{ColumnInfo, IndexInfo, SchemaIntrospector, TableSchema};
pub use sync::{SchemaSyncOutcome, SchemaSynchronizer};
