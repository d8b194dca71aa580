//! # resync Protocol
//!
//! Data model shared by the resync engine and its collaborators.
//!
//! This crate provides:
//! - `SyncOperation` for pending mutations, with priority and retry bookkeeping
//! - `EnhancedSyncConflict` and `FieldConflictInfo` for field-level conflicts
//! - `EnhancedSyncConflictResolution` for the outcome of a resolution
//! - `QueueSnapshot` for saving pending operations across restarts
//!
//! This is a pure data crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod error;
mod operation;
mod snapshot;

pub use conflict::{
    ConflictHistoryEntry, ConflictType, EnhancedSyncConflict, EnhancedSyncConflictResolution,
    FieldChoice, FieldConflictInfo, FieldKind,
};
pub use error::{ProtocolError, ProtocolResult};
pub use operation::{OperationPriority, OperationType, Record, SyncOperation};
pub use snapshot::{QueueSnapshot, SNAPSHOT_VERSION};
