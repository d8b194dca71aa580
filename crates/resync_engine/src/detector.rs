//! Field-level conflict detection.

use crate::config::EngineConfig;
use crate::error::{SyncError, SyncResult};
use crate::fields::{classify, json_type, values_equal};
use crate::merge::names as merge_names;
use resync_protocol::{
    ConflictType, EnhancedSyncConflict, FieldConflictInfo, FieldKind, OperationPriority, Record,
};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

/// Default manual-review threshold.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.5;

const TYPE_MISMATCH_CONFIDENCE: f64 = 0.2;
const STRUCTURAL_PENALTY: f64 = 0.8;

/// Tag applied when a critical field diverges.
pub const TAG_CRITICAL: &str = "critical";
/// Tag applied when field types differ.
pub const TAG_TYPE_MISMATCH: &str = "type_mismatch";
/// Tag applied when fields were added or deleted.
pub const TAG_STRUCTURAL: &str = "structural";
/// Tag applied when free-form content diverges.
pub const TAG_CONTENT: &str = "content";
/// Tag applied when version counters differ.
pub const TAG_VERSION_SKEW: &str = "version_skew";

/// Base confidence for a value difference in a field of this kind.
pub fn base_confidence(kind: FieldKind) -> f64 {
    match kind {
        FieldKind::Version | FieldKind::Timestamp => 0.95,
        FieldKind::Identifier => 0.9,
        FieldKind::Count => 0.85,
        FieldKind::Rate | FieldKind::Boolean => 0.8,
        FieldKind::Array => 0.75,
        FieldKind::Enumeration => 0.7,
        FieldKind::Object => 0.65,
        FieldKind::Text => 0.6,
        FieldKind::Other => 0.5,
        FieldKind::Content => 0.3,
    }
}

fn semantic_reason(kind: FieldKind, conflict_type: ConflictType) -> String {
    match conflict_type {
        ConflictType::TypeMismatch => "values have different types".into(),
        ConflictType::Addition => "field exists only locally".into(),
        ConflictType::Deletion => "field exists only remotely".into(),
        ConflictType::ValueDifference => match kind {
            FieldKind::Version | FieldKind::Timestamp => {
                "ordered value, resolvable by comparison".into()
            }
            FieldKind::Identifier => "reference changed on both sides".into(),
            FieldKind::Count => "counter, resolvable by maximum".into(),
            FieldKind::Rate => "rate, resolvable by mean".into(),
            FieldKind::Boolean => "flag, resolvable by logical or".into(),
            FieldKind::Array => "list, resolvable by union".into(),
            FieldKind::Enumeration => "state changed on both sides".into(),
            FieldKind::Object => "nested object, resolvable key by key".into(),
            FieldKind::Text => "short text edited on both sides".into(),
            FieldKind::Content => "content edited on both sides, merge may lose intent".into(),
            FieldKind::Other => "values differ".into(),
        },
    }
}

fn possible_resolutions(kind: FieldKind) -> Vec<String> {
    let merge = match kind {
        FieldKind::Timestamp => Some(merge_names::TIMESTAMP),
        FieldKind::Count | FieldKind::Rate => Some(merge_names::NUMERIC),
        FieldKind::Boolean => Some(merge_names::BOOLEAN_OR),
        FieldKind::Array => Some(merge_names::ARRAY_UNION),
        FieldKind::Object => Some(merge_names::JSON_OBJECT),
        FieldKind::Text | FieldKind::Content => Some(merge_names::TEXT),
        _ => None,
    };
    merge
        .into_iter()
        .chain(["local_wins", "remote_wins", "manual"])
        .map(String::from)
        .collect()
}

/// Diffs two snapshots of the same entity field by field.
///
/// Detection is a pure function of its inputs: the same inputs always yield
/// the same conflict, including its id, so retried reconciliations are
/// idempotent.
#[derive(Debug, Clone)]
pub struct ConflictDetector {
    confidence_threshold: f64,
    critical_fields: BTreeSet<String>,
}

impl ConflictDetector {
    /// Creates a detector with the default threshold and no critical fields.
    pub fn new() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            critical_fields: BTreeSet::new(),
        }
    }

    /// Creates a detector from engine settings.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            confidence_threshold: config.confidence_threshold,
            critical_fields: config.critical_fields.clone(),
        }
    }

    /// Sets the manual-review threshold.
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    /// Marks a field as critical.
    pub fn with_critical_field(mut self, field: impl Into<String>) -> Self {
        self.critical_fields.insert(field.into());
        self
    }

    /// Returns the manual-review threshold.
    pub fn threshold(&self) -> f64 {
        self.confidence_threshold
    }

    /// Compares two snapshots.
    ///
    /// Returns `None` when no field differs.
    pub fn detect(
        &self,
        entity_id: &str,
        collection: &str,
        local: &Record,
        remote: &Record,
        local_version: u64,
        remote_version: u64,
    ) -> Option<EnhancedSyncConflict> {
        let mut field_conflicts = BTreeMap::new();

        let remote_only = remote.keys().filter(|k| !local.contains_key(*k));
        for name in local.keys().chain(remote_only) {
            if let Some(info) = self.diff_field(name, local.get(name), remote.get(name)) {
                field_conflicts.insert(name.clone(), info);
            }
        }

        if field_conflicts.is_empty() {
            return None;
        }

        let critical = field_conflicts
            .keys()
            .any(|name| self.critical_fields.contains(name));
        let min_confidence = field_conflicts
            .values()
            .map(|f: &FieldConflictInfo| f.confidence_score)
            .fold(1.0, f64::min);
        let requires_manual_intervention = critical || min_confidence < self.confidence_threshold;

        let mut tags = BTreeSet::new();
        for info in field_conflicts.values() {
            match info.conflict_type {
                ConflictType::TypeMismatch => {
                    tags.insert(TAG_TYPE_MISMATCH.to_string());
                }
                ConflictType::Addition | ConflictType::Deletion => {
                    tags.insert(TAG_STRUCTURAL.to_string());
                }
                ConflictType::ValueDifference => {}
            }
            if info.field_kind == FieldKind::Content {
                tags.insert(TAG_CONTENT.to_string());
            }
        }
        if critical {
            tags.insert(TAG_CRITICAL.to_string());
        }
        if local_version != remote_version {
            tags.insert(TAG_VERSION_SKEW.to_string());
        }

        let priority = if critical {
            OperationPriority::Critical
        } else if requires_manual_intervention {
            OperationPriority::High
        } else {
            OperationPriority::Normal
        };

        Some(EnhancedSyncConflict {
            id: conflict_id(
                entity_id,
                collection,
                local,
                remote,
                local_version,
                remote_version,
            ),
            entity_id: entity_id.to_string(),
            collection: collection.to_string(),
            local_data: local.clone(),
            remote_data: remote.clone(),
            field_conflicts,
            local_version,
            remote_version,
            priority,
            requires_manual_intervention,
            tags,
        })
    }

    /// Like [`detect`](Self::detect), for raw JSON values.
    ///
    /// Fails with `ConflictDetectionFailure` if either side is not an object.
    pub fn detect_values(
        &self,
        entity_id: &str,
        collection: &str,
        local: &Value,
        remote: &Value,
        local_version: u64,
        remote_version: u64,
    ) -> SyncResult<Option<EnhancedSyncConflict>> {
        fn as_record<'a>(
            value: &'a Value,
            side: &str,
            collection: &str,
            entity_id: &str,
        ) -> SyncResult<&'a Record> {
            value
                .as_object()
                .ok_or_else(|| SyncError::ConflictDetectionFailure {
                    collection: collection.to_string(),
                    entity_id: entity_id.to_string(),
                    reason: format!("{side} snapshot is a {}, not an object", json_type(value)),
                })
        }

        let local = as_record(local, "local", collection, entity_id)?;
        let remote = as_record(remote, "remote", collection, entity_id)?;
        Ok(self.detect(
            entity_id,
            collection,
            local,
            remote,
            local_version,
            remote_version,
        ))
    }

    fn diff_field(
        &self,
        name: &str,
        local: Option<&Value>,
        remote: Option<&Value>,
    ) -> Option<FieldConflictInfo> {
        let conflict_type = match (local, remote) {
            (Some(l), Some(r)) if values_equal(l, r) => return None,
            (Some(l), Some(r)) if json_type(l) != json_type(r) => ConflictType::TypeMismatch,
            (Some(_), Some(_)) => ConflictType::ValueDifference,
            (Some(_), None) => ConflictType::Addition,
            (None, Some(_)) => ConflictType::Deletion,
            (None, None) => return None,
        };

        let field_kind = classify(name, local, remote);
        let confidence_score = match conflict_type {
            ConflictType::TypeMismatch => TYPE_MISMATCH_CONFIDENCE,
            ConflictType::Addition | ConflictType::Deletion => {
                base_confidence(field_kind) * STRUCTURAL_PENALTY
            }
            ConflictType::ValueDifference => base_confidence(field_kind),
        };

        let mut reason = semantic_reason(field_kind, conflict_type);
        if self.critical_fields.contains(name) {
            reason.push_str("; field is critical");
        }

        Some(FieldConflictInfo {
            field_name: name.to_string(),
            conflict_type,
            field_kind,
            local_value: local.cloned(),
            remote_value: remote.cloned(),
            confidence_score,
            possible_resolutions: possible_resolutions(field_kind),
            semantic_reason: Some(reason),
        })
    }
}

impl Default for ConflictDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Hex SHA-256 over a key-order-independent rendering of the inputs.
fn conflict_id(
    entity_id: &str,
    collection: &str,
    local: &Record,
    remote: &Record,
    local_version: u64,
    remote_version: u64,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(collection.as_bytes());
    hasher.update([0]);
    hasher.update(entity_id.as_bytes());
    hasher.update([0]);
    hasher.update(local_version.to_be_bytes());
    hasher.update(remote_version.to_be_bytes());
    hash_record(&mut hasher, local);
    hash_record(&mut hasher, remote);

    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn hash_record(hasher: &mut Sha256, record: &Record) {
    let mut keys: Vec<&String> = record.keys().collect();
    keys.sort();
    hasher.update(b"{");
    for key in keys {
        hasher.update(key.as_bytes());
        hasher.update(b":");
        hash_value(hasher, &record[key.as_str()]);
        hasher.update(b",");
    }
    hasher.update(b"}");
}

fn hash_value(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Object(map) => hash_record(hasher, map),
        Value::Array(items) => {
            hasher.update(b"[");
            for item in items {
                hash_value(hasher, item);
                hasher.update(b",");
            }
            hasher.update(b"]");
        }
        other => hasher.update(other.to_string().as_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn identical_snapshots_produce_no_conflict() {
        let detector = ConflictDetector::new();
        let x = record(json!({"title": "a", "count": 1}));
        assert!(detector.detect("e1", "notes", &x, &x, 3, 3).is_none());
    }

    #[test]
    fn version_skew_alone_is_not_a_conflict() {
        let detector = ConflictDetector::new();
        let x = record(json!({"title": "a"}));
        assert!(detector.detect("e1", "notes", &x, &x, 1, 2).is_none());
    }

    #[test]
    fn status_and_count_scenario() {
        let detector = ConflictDetector::new();
        let local = record(json!({"status": "active", "count": 5}));
        let remote = record(json!({"status": "inactive", "count": 7}));

        let conflict = detector.detect("e1", "tasks", &local, &remote, 1, 2).unwrap();
        assert_eq!(conflict.field_conflicts.len(), 2);
        for field in conflict.field_conflicts.values() {
            assert_eq!(field.conflict_type, ConflictType::ValueDifference);
        }
        assert_eq!(conflict.field("count").unwrap().field_kind, FieldKind::Count);
        assert_eq!(
            conflict.field("status").unwrap().field_kind,
            FieldKind::Enumeration
        );
        assert!(!conflict.requires_manual_intervention);
        assert!(conflict.has_tag(TAG_VERSION_SKEW));
    }

    #[test]
    fn classifies_additions_deletions_and_mismatches() {
        let detector = ConflictDetector::new();
        let local = record(json!({"a": 1, "b": "x", "only_local": true}));
        let remote = record(json!({"a": "1", "b": "y", "only_remote": [1]}));

        let conflict = detector.detect("e1", "c", &local, &remote, 1, 1).unwrap();
        let kind = |f: &str| conflict.field(f).unwrap().conflict_type;

        assert_eq!(kind("a"), ConflictType::TypeMismatch);
        assert_eq!(kind("b"), ConflictType::ValueDifference);
        assert_eq!(kind("only_local"), ConflictType::Addition);
        assert_eq!(kind("only_remote"), ConflictType::Deletion);
        assert_eq!(conflict.field("only_remote").unwrap().local_value, None);

        assert!(conflict.requires_manual_intervention);
        assert!(conflict.has_tag(TAG_TYPE_MISMATCH));
        assert!(conflict.has_tag(TAG_STRUCTURAL));
        assert_eq!(conflict.priority, OperationPriority::High);
    }

    #[test]
    fn content_scores_below_timestamps() {
        let detector = ConflictDetector::new();
        let local = record(json!({"body": "first draft", "updatedAt": "2024-01-01T00:00:00Z"}));
        let remote = record(json!({"body": "second draft", "updatedAt": "2024-01-02T00:00:00Z"}));

        let conflict = detector.detect("e1", "notes", &local, &remote, 1, 1).unwrap();
        let body = conflict.field("body").unwrap().confidence_score;
        let updated = conflict.field("updatedAt").unwrap().confidence_score;

        assert!(updated > 0.9);
        assert!(body < DEFAULT_CONFIDENCE_THRESHOLD);
        assert!(conflict.requires_manual_intervention);
        assert!(conflict.has_tag(TAG_CONTENT));
    }

    #[test]
    fn critical_fields_force_manual() {
        let detector = ConflictDetector::new().with_critical_field("balance");
        let local = record(json!({"balance": 10}));
        let remote = record(json!({"balance": 12}));

        let conflict = detector.detect("e1", "accounts", &local, &remote, 1, 1).unwrap();
        assert!(conflict.requires_manual_intervention);
        assert!(conflict.has_tag(TAG_CRITICAL));
        assert_eq!(conflict.priority, OperationPriority::Critical);
    }

    #[test]
    fn detection_is_idempotent_and_order_independent() {
        let detector = ConflictDetector::new();
        let local = record(json!({"a": 1, "b": {"x": 1, "y": 2}}));
        let reordered = record(json!({"b": {"y": 2, "x": 1}, "a": 1}));
        let remote = record(json!({"a": 2}));

        let first = detector.detect("e1", "c", &local, &remote, 1, 2).unwrap();
        let second = detector.detect("e1", "c", &local, &remote, 1, 2).unwrap();
        let third = detector.detect("e1", "c", &reordered, &remote, 1, 2).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.id, third.id);
        assert_eq!(first.id.len(), 64);
    }

    #[test]
    fn non_objects_are_not_diffable() {
        let detector = ConflictDetector::new();
        let err = detector
            .detect_values("e1", "c", &json!([1]), &json!({}), 1, 1)
            .unwrap_err();
        assert!(matches!(err, SyncError::ConflictDetectionFailure { .. }));

        let ok = detector
            .detect_values("e1", "c", &json!({"a": 1}), &json!({"a": 1}), 1, 1)
            .unwrap();
        assert!(ok.is_none());
    }
}
