// ABOUTME: Failure ledger for permanently failed log entries and operator-driven recovery
// ABOUTME: Recovery rewinds cursors to just before the earliest failure and replays from there

pub mod ledger;
pub mod recovery;

pub use ledger::{FailureLedger, FailureRecord, FailureStatistics};
pub use recovery::{execute_recovery, plan_recovery, RecoveryReport, RecoverySides, TableRecovery};
