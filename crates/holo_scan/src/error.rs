//! Error taxonomy for scan configuration, execution, and token handling.
//!
//! Configuration errors are raised synchronously by the builder surface and
//! never during execution. Execution errors move a scanner into its terminal
//! failed state.

use std::time::Duration;

use thiserror::Error;

/// Result alias used across the scan engine.
pub type Result<T, E = ScanError> = std::result::Result<T, E>;

/// Errors surfaced to scan callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScanError {
    /// A literal does not fit the declared type of its column.
    #[error("type mismatch for column '{column}': expected {expected}, got {got}")]
    TypeMismatch {
        column: String,
        expected: String,
        got: String,
    },
    /// A predicate, bound, or projection references a column the table lacks.
    #[error("unknown column '{column}' in table '{table}'")]
    UnknownColumn { table: String, column: String },
    /// A bound sets a non-key column or inverts the key range.
    #[error("invalid bound: {reason}")]
    InvalidBound { reason: String },
    /// A projection is empty, duplicated, or out of range.
    #[error("invalid projection: {reason}")]
    InvalidProjection { reason: String },
    /// Any other option value that cannot be accepted.
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },
    /// The call is not legal in the scanner's current state.
    #[error("illegal state: {reason}")]
    InvalidState { reason: String },
    /// The requested snapshot could not be served within the retry budget.
    #[error("snapshot timestamp {timestamp} is not yet safe to read on partition {partition} after {attempts} attempts")]
    Consistency {
        partition: String,
        timestamp: u64,
        attempts: usize,
    },
    /// No replica of a partition could serve the scan.
    #[error("partition {partition} unavailable: {reason}")]
    PartitionUnavailable { partition: String, reason: String },
    /// The scan hit a fatal failure and cannot continue.
    #[error("scan of table '{table}' failed on partition {partition}: {reason}")]
    ScanFailed {
        table: String,
        partition: String,
        reason: String,
    },
    /// A serialized token cannot be executed against the current table.
    #[error("incompatible scan token: {reason}")]
    IncompatibleToken { reason: String },
    /// Non-recoverable backend failure outside of a partition scan.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

impl ScanError {
    /// Returns `true` for errors raised by the configuration surface.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::TypeMismatch { .. }
                | Self::UnknownColumn { .. }
                | Self::InvalidBound { .. }
                | Self::InvalidProjection { .. }
                | Self::InvalidArgument { .. }
        )
    }

    pub(crate) fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_bound(reason: impl Into<String>) -> Self {
        Self::InvalidBound {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_projection(reason: impl Into<String>) -> Self {
        Self::InvalidProjection {
            reason: reason.into(),
        }
    }

    pub(crate) fn incompatible_token(reason: impl Into<String>) -> Self {
        Self::IncompatibleToken {
            reason: reason.into(),
        }
    }
}

/// Errors reported by a [`crate::backend::PartitionBackend`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The RPC did not complete within its deadline.
    #[error("rpc to server {server} timed out after {elapsed:?}")]
    Timeout { server: u64, elapsed: Duration },
    /// Partition resolution did not complete within its deadline.
    #[error("partition lookup timed out after {elapsed:?}")]
    ResolveTimeout { elapsed: Duration },
    /// The server hosting the replica cannot be reached.
    #[error("server {server} unreachable")]
    Unreachable { server: u64 },
    /// The contacted replica is not the leader the selection policy requires.
    #[error("server {server} is not the leader of partition {partition}")]
    NotLeader { server: u64, partition: u64 },
    /// The replica cannot yet read at the requested timestamp.
    #[error("snapshot {requested} unavailable on partition {partition} (safe time {safe_time})")]
    SnapshotUnavailable {
        partition: u64,
        requested: u64,
        safe_time: u64,
    },
    /// The server no longer knows the scan handle.
    #[error("scanner {handle} expired or unknown")]
    ScannerExpired { handle: u64 },
    /// The partition was split or moved since it was resolved.
    #[error("partition {partition} no longer serves the requested range")]
    PartitionMoved { partition: u64 },
    /// The table does not exist.
    #[error("table '{table}' not found")]
    TableNotFound { table: String },
    /// Anything else; never retried.
    #[error("{0}")]
    Internal(String),
}

impl BackendError {
    /// Returns whether a scan may recover by re-resolving and resuming.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::ResolveTimeout { .. }
                | Self::Unreachable { .. }
                | Self::NotLeader { .. }
                | Self::SnapshotUnavailable { .. }
                | Self::ScannerExpired { .. }
                | Self::PartitionMoved { .. }
        )
    }

    /// Server that produced the failure, when one is known.
    pub fn server(&self) -> Option<u64> {
        match self {
            Self::Timeout { server, .. }
            | Self::Unreachable { server }
            | Self::NotLeader { server, .. } => Some(*server),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_are_classified() {
        assert!(ScanError::invalid_bound("lower > upper").is_configuration_error());
        assert!(ScanError::TypeMismatch {
            column: "string_val".to_string(),
            expected: "STRING".to_string(),
            got: "INT64".to_string(),
        }
        .is_configuration_error());
        assert!(!ScanError::invalid_state("scanner already open").is_configuration_error());
        assert!(!ScanError::incompatible_token("bad magic").is_configuration_error());
    }

    #[test]
    fn recoverable_backend_errors_match_partition_failures() {
        assert!(BackendError::Unreachable { server: 2 }.is_recoverable());
        assert!(BackendError::SnapshotUnavailable {
            partition: 1,
            requested: 10,
            safe_time: 5,
        }
        .is_recoverable());
        assert!(!BackendError::Internal("corrupt block".to_string()).is_recoverable());
        assert!(!BackendError::TableNotFound {
            table: "t".to_string()
        }
        .is_recoverable());
        assert_eq!(BackendError::NotLeader { server: 3, partition: 1 }.server(), Some(3));
        let lookup = BackendError::ResolveTimeout {
            elapsed: Duration::from_millis(5),
        };
        assert!(lookup.is_recoverable());
        assert_eq!(lookup.server(), None);
    }
}
