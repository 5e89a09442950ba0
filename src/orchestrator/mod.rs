// ABOUTME: Scheduling of per-table replication ticks and the global cleanup task
// ABOUTME: Single-flight per task key, independent across tables and directions

pub mod flight;
pub mod supervisor;

pub use flight::{BusyFlags, FlightGuard};
pub use supervisor::{Supervisor, TaskStatus, TickFn};

/// Task key of the retention cleanup job.
pub const CLEANUP_TASK_KEY: &str = "cleanup";
