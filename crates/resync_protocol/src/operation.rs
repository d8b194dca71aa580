//! Pending sync operations.

use crate::error::{ProtocolError, ProtocolResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::Duration;

/// An entity snapshot: field name to value, in insertion order.
pub type Record = serde_json::Map<String, Value>;

/// Type of sync operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Entity is created.
    Create,
    /// Entity is read back from the backend.
    Read,
    /// Entity is updated.
    Update,
    /// Entity is deleted.
    Delete,
    /// Collection is queried with a filter.
    Query,
    /// Several records are written together.
    Batch,
}

impl OperationType {
    /// Returns the canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "create",
            OperationType::Read => "read",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
            OperationType::Query => "query",
            OperationType::Batch => "batch",
        }
    }

    /// Returns true if the operation mutates remote state.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            OperationType::Create
                | OperationType::Update
                | OperationType::Delete
                | OperationType::Batch
        )
    }

    /// Returns true if the operation addresses a single entity by id.
    pub fn requires_entity_id(&self) -> bool {
        matches!(
            self,
            OperationType::Read | OperationType::Update | OperationType::Delete
        )
    }
}

/// Scheduling priority of an operation.
///
/// Ordering follows urgency: `Critical > High > Normal > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationPriority {
    /// Must be sent before anything else.
    Critical,
    /// Sent ahead of routine work.
    High,
    /// Routine work.
    #[default]
    Normal,
    /// Background work.
    Low,
}

impl OperationPriority {
    /// All priorities, most urgent first.
    pub const ALL: [OperationPriority; 4] = [
        OperationPriority::Critical,
        OperationPriority::High,
        OperationPriority::Normal,
        OperationPriority::Low,
    ];

    /// Numeric urgency (higher is more urgent).
    pub fn rank(&self) -> u8 {
        match self {
            OperationPriority::Critical => 3,
            OperationPriority::High => 2,
            OperationPriority::Normal => 1,
            OperationPriority::Low => 0,
        }
    }

    /// Position in [`OperationPriority::ALL`].
    pub fn index(&self) -> usize {
        3 - self.rank() as usize
    }

    /// Returns the canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationPriority::Critical => "critical",
            OperationPriority::High => "high",
            OperationPriority::Normal => "normal",
            OperationPriority::Low => "low",
        }
    }
}

impl PartialOrd for OperationPriority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OperationPriority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

/// A single pending mutation waiting to reach the backend.
///
/// Operations are created by the application, owned by the queue while
/// pending, and only the drain loop touches the retry fields.
///
/// # Invariants
///
/// - `retry_count` never decreases
/// - `id` and `collection` are non-empty for any queued operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    /// Opaque unique token.
    pub id: String,
    /// Logical table name.
    pub collection: String,
    /// Kind of mutation.
    pub op_type: OperationType,
    /// Scheduling priority.
    #[serde(default)]
    pub priority: OperationPriority,
    /// Field values carried by the operation.
    #[serde(default)]
    pub payload: Record,
    /// When the caller created the operation.
    pub created_at: DateTime<Utc>,
    /// Number of failed attempts so far.
    #[serde(default)]
    pub retry_count: u32,
    /// Backoff delay requested by the last failure.
    #[serde(default)]
    pub retry_delay: Option<Duration>,
    /// Earliest instant the next attempt may start.
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Opaque key/value annotations.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl SyncOperation {
    /// Creates a normal-priority operation with a fresh id.
    pub fn new(collection: impl Into<String>, op_type: OperationType, payload: Record) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            collection: collection.into(),
            op_type,
            priority: OperationPriority::Normal,
            payload,
            created_at: Utc::now(),
            retry_count: 0,
            retry_delay: None,
            next_attempt_at: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Creates a create operation.
    pub fn create(collection: impl Into<String>, payload: Record) -> Self {
        Self::new(collection, OperationType::Create, payload)
    }

    /// Creates an update operation.
    pub fn update(collection: impl Into<String>, payload: Record) -> Self {
        Self::new(collection, OperationType::Update, payload)
    }

    /// Creates a delete operation for the given entity.
    pub fn delete(collection: impl Into<String>, entity_id: impl Into<String>) -> Self {
        let mut payload = Record::new();
        payload.insert("id".into(), Value::String(entity_id.into()));
        Self::new(collection, OperationType::Delete, payload)
    }

    /// Overrides the generated id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: OperationPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Adds a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Returns the id of the entity the payload addresses, if any.
    ///
    /// Reads the payload `id` field; numeric ids are rendered as text.
    pub fn entity_id(&self) -> Option<String> {
        match self.payload.get("id")? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Checks the structural requirements for enqueueing.
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.id.trim().is_empty() {
            return Err(ProtocolError::invalid_operation("operation id is empty"));
        }
        if self.collection.trim().is_empty() {
            return Err(ProtocolError::invalid_operation(format!(
                "operation {} has no collection",
                self.id
            )));
        }
        if self.op_type.requires_entity_id() && self.entity_id().is_none() {
            return Err(ProtocolError::invalid_operation(format!(
                "{} operation {} has no entity id",
                self.op_type.as_str(),
                self.id
            )));
        }
        Ok(())
    }

    /// Records a failed attempt.
    ///
    /// The retry count is raised to `new_retry_count` but never lowered, and
    /// the next attempt is pushed `delay` past `now`.
    pub fn record_retry(&mut self, new_retry_count: u32, delay: Duration, now: DateTime<Utc>) {
        self.retry_count = self.retry_count.max(new_retry_count);
        self.retry_delay = Some(delay);
        self.next_attempt_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .or(Some(now));
    }

    /// Returns true if the operation may be attempted at `now`.
    pub fn is_ready_at(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
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
    fn priority_ordering() {
        assert!(OperationPriority::Critical > OperationPriority::High);
        assert!(OperationPriority::High > OperationPriority::Normal);
        assert!(OperationPriority::Normal > OperationPriority::Low);

        for (i, p) in OperationPriority::ALL.iter().enumerate() {
            assert_eq!(p.index(), i);
        }
    }

    #[test]
    fn entity_id_from_payload() {
        let op = SyncOperation::update("notes", record(json!({"id": "n-1", "title": "x"})));
        assert_eq!(op.entity_id().as_deref(), Some("n-1"));

        let op = SyncOperation::update("notes", record(json!({"id": 42})));
        assert_eq!(op.entity_id().as_deref(), Some("42"));

        let op = SyncOperation::create("notes", record(json!({"title": "x"})));
        assert_eq!(op.entity_id(), None);
    }

    #[test]
    fn validation_rejects_malformed() {
        let op = SyncOperation::create("notes", Record::new()).with_id("");
        assert!(op.validate().is_err());

        let op = SyncOperation::create("", Record::new());
        assert!(op.validate().is_err());

        let op = SyncOperation::new("notes", OperationType::Update, Record::new());
        assert!(op.validate().is_err());

        let op = SyncOperation::delete("notes", "n-1");
        assert!(op.validate().is_ok());
    }

    #[test]
    fn retry_count_never_decreases() {
        let now = Utc::now();
        let mut op = SyncOperation::delete("notes", "n-1");

        op.record_retry(3, Duration::from_secs(4), now);
        assert_eq!(op.retry_count, 3);
        assert!(!op.is_ready_at(now));
        assert!(op.is_ready_at(now + chrono::Duration::seconds(4)));

        op.record_retry(1, Duration::from_secs(1), now);
        assert_eq!(op.retry_count, 3);
    }

    proptest::proptest! {
        #[test]
        fn retry_count_is_monotonic(counts in proptest::collection::vec(0u32..50, 1..20)) {
            let now = Utc::now();
            let mut op = SyncOperation::delete("notes", "n-1");
            let mut previous = 0;
            for count in counts {
                op.record_retry(count, Duration::from_millis(10), now);
                proptest::prop_assert!(op.retry_count >= previous);
                previous = op.retry_count;
            }
        }
    }

    #[test]
    fn serde_shape() {
        let op = SyncOperation::delete("notes", "n-1")
            .with_id("op-1")
            .with_priority(OperationPriority::High);
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["op_type"], "delete");
        assert_eq!(json["priority"], "high");

        let back: SyncOperation = serde_json::from_value(json).unwrap();
        assert_eq!(back, op);
    }
}
