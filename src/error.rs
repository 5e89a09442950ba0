// ABOUTME: Error taxonomy for the replication engine
// ABOUTME: Classifies failures as transient, entry-permanent, batch-fatal, configuration or conflict

use thiserror::Error;

/// Coarse class of a replication failure, used to decide how far it propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connectivity, lock or timeout problem local to one unit of work; retried.
    Transient,
    /// A single log entry that still fails after its retries; ledgered and skipped.
    EntryPermanent,
    /// Failure outside the per-entry boundary; the whole batch rolls back.
    BatchFatal,
    /// Invalid table configuration; the table is excluded from the run.
    Configuration,
    /// Conflict left for manual review or whose resolver failed.
    ConflictUnresolvable,
}

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("transient failure: {0}")]
    Transient(#[source] anyhow::Error),

    #[error("log entry {log_id} failed after {attempts} attempts: {source}")]
    EntryPermanent {
        log_id: i64,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("batch for {table} failed: {source}")]
    BatchFatal {
        table: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("configuration error for table '{table}': {message}")]
    Configuration { table: String, message: String },

    #[error("unresolved conflict on {table}/{record_id}: {reason}")]
    ConflictUnresolvable {
        table: String,
        record_id: String,
        reason: String,
    },
}

impl ReplicationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReplicationError::Transient(_) => ErrorKind::Transient,
            ReplicationError::EntryPermanent { .. } => ErrorKind::EntryPermanent,
            ReplicationError::BatchFatal { .. } => ErrorKind::BatchFatal,
            ReplicationError::Configuration { .. } => ErrorKind::Configuration,
            ReplicationError::ConflictUnresolvable { .. } => ErrorKind::ConflictUnresolvable,
        }
    }

    /// Attempts made before giving up; 1 for failures that were not retried.
    pub fn attempts(&self) -> u32 {
        match self {
            ReplicationError::EntryPermanent { attempts, .. } => *attempts,
            _ => 1,
        }
    }

    /// The underlying cause with its full context chain, for status rows and the ledger.
    pub fn cause_message(&self) -> String {
        match self {
            ReplicationError::Transient(source)
            | ReplicationError::EntryPermanent { source, .. }
            | ReplicationError::BatchFatal { source, .. } => format!("{:#}", source),
            ReplicationError::Configuration { message, .. } => message.clone(),
            ReplicationError::ConflictUnresolvable { reason, .. } => reason.clone(),
        }
    }

    pub fn configuration(table: impl Into<String>, message: impl Into<String>) -> Self {
        ReplicationError::Configuration {
            table: table.into(),
            message: message.into(),
        }
    }
}

/// Class of an arbitrary error chain.
///
/// The outermost [`ReplicationError`] in the chain decides. Errors that never
/// went through one are transient when they look like a dropped connection and
/// batch-fatal otherwise.
pub fn error_kind(err: &anyhow::Error) -> ErrorKind {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<ReplicationError>())
        .map(ReplicationError::kind)
        .unwrap_or_else(|| {
            if is_transient(err) {
                ErrorKind::Transient
            } else {
                ErrorKind::BatchFatal
            }
        })
}

/// Check whether an error chain looks like a transient database failure.
///
/// Walks the `anyhow` chain looking for a `tokio_postgres::Error`. Closed
/// connections and the SQLSTATE classes for connection exceptions (`08`),
/// transaction rollbacks such as deadlocks and serialization failures (`40`),
/// insufficient resources (`53`), operator intervention (`57P`) and
/// `lock_not_available` (`55P03`) are considered transient.
pub fn is_transient(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if let Some(pg) = cause.downcast_ref::<tokio_postgres::Error>() {
            if pg.is_closed() {
                return true;
            }
            if let Some(state) = pg.code() {
                return is_transient_sqlstate(state.code());
            }
            // No SQLSTATE means the failure happened in the protocol/IO layer
            return true;
        }
        if cause.downcast_ref::<std::io::Error>().is_some() {
            return true;
        }
        if cause.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
            return true;
        }
    }
    false
}

pub(crate) fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08")
        || code.starts_with("40")
        || code.starts_with("53")
        || code.starts_with("57P")
        || code == "55P03"
}
