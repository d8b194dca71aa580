//! # resync Engine
//!
//! Offline-first synchronization core: decides when pending mutations are
//! sent, in what order, and what happens when two replicas disagree.
//!
//! This crate provides:
//! - A priority operation queue with retry bookkeeping
//! - An interval/trigger scheduler
//! - Field-level conflict detection with confidence scoring
//! - Typed merge strategies and pluggable resolution policies
//! - A conflict history with statistics and strategy suggestion
//! - An orchestrator draining the queue through a backend abstraction
//!
//! ## Architecture
//!
//! Mutations are wrapped as `SyncOperation`s and enqueued. The scheduler
//! emits triggers on its cadence (or on demand); each trigger drains the
//! queue in priority order. When the backend reports a version conflict the
//! two snapshots go to the detector, the resulting conflict to a resolution
//! strategy, and the merged snapshot back to the backend.
//!
//! ## Key Invariants
//!
//! - Dequeue order is priority, then insertion order
//! - Detection and merging are pure functions of their inputs
//! - No trigger fires after the scheduler is stopped
//! - An unresolvable conflict is parked for a person, never dropped
//! - An operation past its retry limit is dropped exactly once

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod auth;
mod backend;
mod config;
mod detector;
mod engine;
mod error;
mod events;
mod fields;
mod history;
mod merge;
mod queue;
mod resolution;
mod scheduler;
mod stats;

pub use auth::{AuthContext, StaticAuth, ORGANIZATION_ID_KEY, USER_ID_KEY};
pub use backend::{BackendResponse, MockBackend, MockCall, SyncBackend};
pub use config::{
    EngineConfig, RetryConfig, ScheduleConfig, ScheduleMode, MAX_RETRIES_LIMIT, MIN_INTERVAL,
};
pub use detector::{
    base_confidence, ConflictDetector, DEFAULT_CONFIDENCE_THRESHOLD, TAG_CONTENT, TAG_CRITICAL,
    TAG_STRUCTURAL, TAG_TYPE_MISMATCH, TAG_VERSION_SKEW,
};
pub use engine::{DrainReport, PendingConflict, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use events::{EventBus, SyncEvent};
pub use fields::{classify, parse_timestamp};
pub use history::{ConflictHistory, ConflictStatistics};
pub use merge::{
    names as merge_names, ArrayMerge, BooleanOrMerge, JsonObjectMerge, LeafPreference,
    MergeContext, MergeRegistry, MergeStrategy, NumericMerge, TextMerge, TimestampMerge,
};
pub use queue::{RequeueOutcome, SyncQueue};
pub use resolution::{
    names as strategy_names, ConflictResolutionStrategy, IntelligentMerge, LocalWins, Manual,
    PriorityBased, RemoteWins, ResolverRegistry, TimestampWins, VersionWins,
};
pub use scheduler::{SchedulerState, SyncScheduler, SyncTrigger, TriggerType};
pub use stats::{EngineStats, StatsSnapshot};

pub use resync_protocol::{
    ConflictHistoryEntry, ConflictType, EnhancedSyncConflict, EnhancedSyncConflictResolution,
    FieldChoice, FieldConflictInfo, FieldKind, OperationPriority, OperationType, QueueSnapshot,
    Record, SyncOperation,
};
