//! Conflict records and resolutions.

use crate::operation::{OperationPriority, Record};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// How a single field differs between the two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Both sides hold a value of the same type, but the values differ.
    ValueDifference,
    /// Both sides hold a value, but of different JSON types.
    TypeMismatch,
    /// Only the local side has the field.
    Addition,
    /// Only the remote side has the field.
    Deletion,
}

impl ConflictType {
    /// Returns the canonical name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictType::ValueDifference => "value_difference",
            ConflictType::TypeMismatch => "type_mismatch",
            ConflictType::Addition => "addition",
            ConflictType::Deletion => "deletion",
        }
    }
}

/// Semantic classification of a field, inferred from its name and value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Creation or modification instant.
    Timestamp,
    /// Version or revision counter.
    Version,
    /// Identifier or foreign key.
    Identifier,
    /// Monotonic counter.
    Count,
    /// Rate, ratio or average.
    Rate,
    /// Boolean flag.
    Boolean,
    /// Short value from a closed set (status, kind, ...).
    Enumeration,
    /// Short free text.
    Text,
    /// Long free-form content.
    Content,
    /// List of values.
    Array,
    /// Nested object.
    Object,
    /// Anything else.
    Other,
}

/// Difference found in one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConflictInfo {
    /// Field name.
    pub field_name: String,
    /// Kind of difference.
    pub conflict_type: ConflictType,
    /// Semantic classification used for scoring.
    pub field_kind: FieldKind,
    /// Local value (`None` if the field is absent locally).
    pub local_value: Option<Value>,
    /// Remote value (`None` if the field is absent remotely).
    pub remote_value: Option<Value>,
    /// How safe an automatic resolution is, in `[0, 1]`.
    pub confidence_score: f64,
    /// Strategy names applicable to this field.
    pub possible_resolutions: Vec<String>,
    /// Human-readable explanation.
    pub semantic_reason: Option<String>,
}

/// A detected divergence between the local and remote snapshot of an entity.
///
/// `field_conflicts` is never empty: identical snapshots produce no conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancedSyncConflict {
    /// Deterministic id derived from the conflict inputs.
    pub id: String,
    /// Entity id.
    pub entity_id: String,
    /// Collection name.
    pub collection: String,
    /// Full local snapshot.
    pub local_data: Record,
    /// Full remote snapshot.
    pub remote_data: Record,
    /// Differences keyed by field name.
    pub field_conflicts: BTreeMap<String, FieldConflictInfo>,
    /// Local version counter.
    pub local_version: u64,
    /// Remote version counter.
    pub remote_version: u64,
    /// Priority of the conflicting entity.
    pub priority: OperationPriority,
    /// True if any field is below the confidence threshold or critical.
    pub requires_manual_intervention: bool,
    /// Labels.
    pub tags: BTreeSet<String>,
}

impl EnhancedSyncConflict {
    /// Lowest field confidence.
    pub fn min_confidence(&self) -> f64 {
        self.field_conflicts
            .values()
            .map(|f| f.confidence_score)
            .fold(1.0, f64::min)
    }

    /// Mean field confidence.
    pub fn average_confidence(&self) -> f64 {
        if self.field_conflicts.is_empty() {
            return 1.0;
        }
        let sum: f64 = self
            .field_conflicts
            .values()
            .map(|f| f.confidence_score)
            .sum();
        sum / self.field_conflicts.len() as f64
    }

    /// The distinct conflict types present, in canonical order.
    pub fn signature(&self) -> BTreeSet<ConflictType> {
        self.field_conflicts
            .values()
            .map(|f| f.conflict_type)
            .collect()
    }

    /// Returns true if the conflict carries the tag.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Returns the field conflict for `name`.
    pub fn field(&self, name: &str) -> Option<&FieldConflictInfo> {
        self.field_conflicts.get(name)
    }
}

/// Outcome of resolving a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancedSyncConflictResolution {
    /// Id of the resolved conflict.
    pub conflict_id: String,
    /// Resulting full snapshot.
    pub merged_data: Record,
    /// Strategy actually applied per field.
    pub field_strategies: BTreeMap<String, String>,
    /// Confidence in the result, in `[0, 1]`.
    pub confidence_score: f64,
    /// Warnings raised while resolving.
    pub warnings: Vec<String>,
    /// Resolver identifier.
    pub resolved_by: String,
    /// True until a person completes the resolution.
    pub requires_manual_intervention: bool,
}

impl EnhancedSyncConflictResolution {
    /// Creates an automatic resolution.
    pub fn new(
        conflict_id: impl Into<String>,
        merged_data: Record,
        resolved_by: impl Into<String>,
        confidence_score: f64,
    ) -> Self {
        Self {
            conflict_id: conflict_id.into(),
            merged_data,
            field_strategies: BTreeMap::new(),
            confidence_score: confidence_score.clamp(0.0, 1.0),
            warnings: Vec::new(),
            resolved_by: resolved_by.into(),
            requires_manual_intervention: false,
        }
    }

    /// Records the strategy used for a field.
    pub fn with_field_strategy(
        mut self,
        field: impl Into<String>,
        strategy: impl Into<String>,
    ) -> Self {
        self.field_strategies.insert(field.into(), strategy.into());
        self
    }

    /// Adds a warning.
    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    /// Marks the resolution as awaiting a person.
    pub fn pending_manual(mut self) -> Self {
        self.requires_manual_intervention = true;
        self
    }
}

/// A person's choice for one field of a manually resolved conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "choice", content = "value")]
pub enum FieldChoice {
    /// Keep the local value.
    Local,
    /// Take the remote value.
    Remote,
    /// Use a value supplied by the person.
    Custom(Value),
}

/// One resolved conflict in the history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictHistoryEntry {
    /// The conflict.
    pub conflict: EnhancedSyncConflict,
    /// How it was resolved.
    pub resolution: EnhancedSyncConflictResolution,
    /// Name of the strategy that produced the resolution.
    pub strategy_used: String,
    /// When the resolution was applied.
    pub resolved_at: DateTime<Utc>,
    /// Time a person spent on a manual resolution.
    pub interaction_time: Option<Duration>,
}
