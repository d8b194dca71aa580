//! Error types for the sync engine.

use resync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while queueing, scheduling or reconciling.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Malformed enqueue input. Never retried.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Snapshots could not be diffed.
    #[error("conflict detection failed for {collection}/{entity_id}: {reason}")]
    ConflictDetectionFailure {
        /// Collection name.
        collection: String,
        /// Entity id.
        entity_id: String,
        /// Why the inputs were not diffable.
        reason: String,
    },

    /// No resolver could resolve the conflict.
    #[error("no resolver could resolve conflict {conflict_id}")]
    ResolutionFailure {
        /// Conflict id.
        conflict_id: String,
    },

    /// Backend call failed.
    #[error("backend error: {message}")]
    Backend {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Retries exhausted; the operation was dropped.
    #[error("operation {operation_id} failed permanently after {attempts} attempts: {reason}")]
    FatalOperationFailure {
        /// Operation id.
        operation_id: String,
        /// Number of attempts made.
        attempts: u32,
        /// Last error message.
        reason: String,
    },

    /// Invalid interval, retry or strategy settings.
    #[error("scheduler misconfiguration: {0}")]
    SchedulerMisconfiguration(String),

    /// Invalid state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// Backend call exceeded the operation timeout.
    #[error("operation timed out")]
    Timeout,

    /// The auth context reports no signed-in user.
    #[error("not authenticated")]
    NotAuthenticated,

    /// No pending conflict has the given id.
    #[error("no pending conflict with id {0}")]
    ConflictNotFound(String),

    /// Protocol validation or snapshot codec error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl SyncError {
    /// Creates a retryable backend error.
    pub fn backend_retryable(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable backend error.
    pub fn backend_fatal(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Backend { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            _ => false,
        }
    }
}
