// ABOUTME: Bulk initial load - full-table copies used for first population and manual resyncs
// ABOUTME: Re-exports the CSV encoder and the windowed COPY loader

pub mod encode;
pub mod loader;

pub use encode::{encode_field, encode_row, ColumnKind};
pub use loader::{plan_windows, BulkLoader, LoadReport, Window};
