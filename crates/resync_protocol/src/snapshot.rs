//! Queue snapshots for external persistence.
//!
//! The engine never writes to disk. A persistence layer takes a
//! [`QueueSnapshot`], stores the JSON verbatim, and hands it back on restart.

use crate::error::{ProtocolError, ProtocolResult};
use crate::operation::SyncOperation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot format version written by this build.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Point-in-time copy of every pending operation, in dequeue order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Format version.
    pub version: u32,
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
    /// Pending operations.
    pub operations: Vec<SyncOperation>,
}

impl QueueSnapshot {
    /// Creates a snapshot of the given operations.
    pub fn new(operations: Vec<SyncOperation>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            taken_at: Utc::now(),
            operations,
        }
    }

    /// Number of operations in the snapshot.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Returns true if the snapshot holds no operations.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Encodes to JSON bytes.
    pub fn to_json(&self) -> ProtocolResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes from JSON bytes, rejecting unknown versions.
    pub fn from_json(bytes: &[u8]) -> ProtocolResult<Self> {
        let snapshot: Self = serde_json::from_slice(bytes)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(ProtocolError::UnsupportedVersion {
                found: snapshot.version,
                supported: SNAPSHOT_VERSION,
            });
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationPriority;

    #[test]
    fn json_preserves_order() {
        let ops = vec![
            SyncOperation::delete("notes", "a").with_priority(OperationPriority::High),
            SyncOperation::delete("notes", "b"),
        ];
        let snapshot = QueueSnapshot::new(ops.clone());

        let bytes = snapshot.to_json().unwrap();
        let decoded = QueueSnapshot::from_json(&bytes).unwrap();

        assert_eq!(decoded.operations, ops);
        assert_eq!(decoded.len(), 2);
    }

    #[test]
    fn rejects_future_version() {
        let mut snapshot = QueueSnapshot::new(vec![]);
        snapshot.version = 2;
        let bytes = serde_json::to_vec(&snapshot).unwrap();

        let err = QueueSnapshot::from_json(&bytes).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::UnsupportedVersion { found: 2, .. }
        ));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            QueueSnapshot::from_json(b"not json"),
            Err(ProtocolError::Json(_))
        ));
    }
}
