//! # resync Testkit
//!
//! Test utilities for resync.
//!
//! This crate provides:
//! - Fixtures for operations and entity snapshots
//! - Property-based test generators using proptest
//! - Temporary snapshot files for persistence tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use resync_testkit::prelude::*;
//!
//! #[test]
//! fn snapshot_survives_restart() {
//!     let dir = SnapshotDir::new();
//!     dir.save(&queue.snapshot_document());
//!     queue.restore(dir.load().operations).unwrap();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
