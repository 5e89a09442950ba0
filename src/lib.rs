// ABOUTME: Library root for trigger-replicator
// ABOUTME: Exports the modules behind the replication engine and its CLI

pub mod applier;
pub mod bulk;
pub mod capture;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod error;
pub mod failures;
pub mod log_store;
pub mod orchestrator;
pub mod postgres;
pub mod record;
pub mod retry;
pub mod schema;
pub mod utils;

pub use config::{EngineConfig, TableConfig};
pub use engine::ReplicationEngine;
pub use error::{ErrorKind, ReplicationError};
pub use record::{RecordBinding, RecordRegistry, Replicable};
