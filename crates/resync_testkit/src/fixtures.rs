//! Test fixtures and snapshot helpers.
//!
//! Provides ready-made operations, entity snapshots and a temporary
//! directory for exercising queue persistence through real files.

use resync_protocol::{OperationPriority, QueueSnapshot, Record, SyncOperation};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Converts a JSON object literal into a record.
///
/// # Panics
///
/// Panics if `value` is not an object.
pub fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

/// Creates an update operation for `entity_id` with the given priority.
pub fn make_operation(collection: &str, entity_id: &str, priority: OperationPriority) -> SyncOperation {
    SyncOperation::update(collection, record(json!({"id": entity_id})))
        .with_id(format!("{collection}-{entity_id}"))
        .with_priority(priority)
}

/// Creates one operation per priority, in the given order.
pub fn make_operations(priorities: &[OperationPriority]) -> Vec<SyncOperation> {
    priorities
        .iter()
        .enumerate()
        .map(|(i, p)| make_operation("tasks", &format!("t{i}"), *p))
        .collect()
}

/// The local side of the status/count scenario.
pub fn status_count_local() -> Record {
    record(json!({"status": "active", "count": 5}))
}

/// The remote side of the status/count scenario.
pub fn status_count_remote() -> Record {
    record(json!({"status": "inactive", "count": 7}))
}

/// A note edited on both sides.
pub fn edited_note(body: &str, updated_at: &str) -> Record {
    record(json!({
        "id": "note-1",
        "title": "Groceries",
        "body": body,
        "tags": ["home"],
        "updatedAt": updated_at,
    }))
}

/// A temporary directory for snapshot files, removed on drop.
pub struct SnapshotDir {
    dir: TempDir,
}

impl SnapshotDir {
    /// Creates a new empty directory.
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    /// Returns the directory path.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Returns the path of the default snapshot file.
    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.path().join("queue.json")
    }

    /// Writes a snapshot to the default file.
    pub fn save(&self, snapshot: &QueueSnapshot) -> PathBuf {
        let path = self.snapshot_path();
        let bytes = snapshot.to_json().expect("Failed to encode snapshot");
        std::fs::write(&path, bytes).expect("Failed to write snapshot");
        path
    }

    /// Reads the snapshot from the default file.
    pub fn load(&self) -> QueueSnapshot {
        let bytes = std::fs::read(self.snapshot_path()).expect("Failed to read snapshot");
        QueueSnapshot::from_json(&bytes).expect("Failed to decode snapshot")
    }
}

impl Default for SnapshotDir {
    fn default() -> Self {
        Self::new()
    }
}
