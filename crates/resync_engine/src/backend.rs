//! Backend abstraction for sync operations.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use resync_protocol::{OperationType, Record, SyncOperation};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::time::Duration;

/// Outcome of a backend call that reached the remote store.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendResponse {
    /// The mutation or read was applied. Carries the returned document, if any.
    Applied(Option<Value>),
    /// The remote copy diverged from the one the operation was based on.
    Conflict {
        /// Snapshot the operation tried to write.
        local: Record,
        /// Snapshot currently held by the backend.
        remote: Record,
        /// Version the local snapshot was based on.
        local_version: u64,
        /// Version currently held by the backend.
        remote_version: u64,
    },
}

/// A remote store the engine pushes operations to.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (HTTP, SDK clients, mock for testing). Transient failures
/// are reported as retryable [`SyncError::Backend`] errors.
pub trait SyncBackend: Send + Sync + 'static {
    /// Creates a record.
    fn create(
        &self,
        collection: &str,
        data: &Record,
    ) -> impl Future<Output = SyncResult<BackendResponse>> + Send;

    /// Reads a record.
    fn read(
        &self,
        collection: &str,
        id: &str,
    ) -> impl Future<Output = SyncResult<BackendResponse>> + Send;

    /// Updates a record.
    fn update(
        &self,
        collection: &str,
        id: &str,
        data: &Record,
    ) -> impl Future<Output = SyncResult<BackendResponse>> + Send;

    /// Deletes a record.
    fn delete(
        &self,
        collection: &str,
        id: &str,
    ) -> impl Future<Output = SyncResult<BackendResponse>> + Send;

    /// Runs a query.
    fn query(
        &self,
        collection: &str,
        filter: &Record,
    ) -> impl Future<Output = SyncResult<BackendResponse>> + Send;

    /// Applies a batch described by `payload`.
    fn batch(
        &self,
        collection: &str,
        payload: &Record,
    ) -> impl Future<Output = SyncResult<BackendResponse>> + Send;

    /// Dispatches an operation to the matching call.
    fn execute(
        &self,
        op: &SyncOperation,
    ) -> impl Future<Output = SyncResult<BackendResponse>> + Send {
        async move {
            let collection = op.collection.as_str();
            let entity_id = op.entity_id();
            match (op.op_type, entity_id) {
                (OperationType::Create, _) => self.create(collection, &op.payload).await,
                (OperationType::Query, _) => self.query(collection, &op.payload).await,
                (OperationType::Batch, _) => self.batch(collection, &op.payload).await,
                (OperationType::Read, Some(id)) => self.read(collection, &id).await,
                (OperationType::Update, Some(id)) => {
                    self.update(collection, &id, &op.payload).await
                }
                (OperationType::Delete, Some(id)) => self.delete(collection, &id).await,
                (op_type, None) => Err(SyncError::InvalidOperation(format!(
                    "{} operation {} has no entity id",
                    op_type.as_str(),
                    op.id
                ))),
            }
        }
    }
}

/// One call received by a [`MockBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    /// Call kind.
    pub op_type: OperationType,
    /// Target collection.
    pub collection: String,
    /// Target entity, for keyed calls.
    pub entity_id: Option<String>,
}

/// A scripted backend for testing.
///
/// Responses are queued per entity id, with a shared fallback queue. A call
/// with nothing scripted succeeds with `Applied(None)`.
#[derive(Debug, Default)]
pub struct MockBackend {
    by_entity: Mutex<HashMap<String, VecDeque<SyncResult<BackendResponse>>>>,
    fallback: Mutex<VecDeque<SyncResult<BackendResponse>>>,
    calls: Mutex<Vec<MockCall>>,
    delay: Mutex<Option<Duration>>,
}

impl MockBackend {
    /// Creates a backend that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a response for calls targeting `entity_id`.
    pub fn push_response(&self, entity_id: impl Into<String>, response: SyncResult<BackendResponse>) {
        self.by_entity
            .lock()
            .entry(entity_id.into())
            .or_default()
            .push_back(response);
    }

    /// Queues a response for any call without an entity-specific script.
    pub fn push_fallback(&self, response: SyncResult<BackendResponse>) {
        self.fallback.lock().push_back(response);
    }

    /// Makes every call wait this long before answering.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// Returns every call received so far.
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    /// Returns the number of calls received so far.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    fn next_response(&self, entity_id: Option<&str>) -> SyncResult<BackendResponse> {
        let scripted = entity_id.and_then(|id| {
            self.by_entity
                .lock()
                .get_mut(id)
                .and_then(VecDeque::pop_front)
        });
        scripted
            .or_else(|| self.fallback.lock().pop_front())
            .unwrap_or(Ok(BackendResponse::Applied(None)))
    }

    async fn respond(
        &self,
        op_type: OperationType,
        collection: &str,
        entity_id: Option<String>,
    ) -> SyncResult<BackendResponse> {
        self.calls.lock().push(MockCall {
            op_type,
            collection: collection.to_string(),
            entity_id: entity_id.clone(),
        });
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.next_response(entity_id.as_deref())
    }
}

fn record_id(record: &Record) -> Option<String> {
    match record.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl SyncBackend for MockBackend {
    fn create(
        &self,
        collection: &str,
        data: &Record,
    ) -> impl Future<Output = SyncResult<BackendResponse>> + Send {
        self.respond(OperationType::Create, collection, record_id(data))
    }

    fn read(
        &self,
        collection: &str,
        id: &str,
    ) -> impl Future<Output = SyncResult<BackendResponse>> + Send {
        self.respond(OperationType::Read, collection, Some(id.to_string()))
    }

    fn update(
        &self,
        collection: &str,
        id: &str,
        _data: &Record,
    ) -> impl Future<Output = SyncResult<BackendResponse>> + Send {
        self.respond(OperationType::Update, collection, Some(id.to_string()))
    }

    fn delete(
        &self,
        collection: &str,
        id: &str,
    ) -> impl Future<Output = SyncResult<BackendResponse>> + Send {
        self.respond(OperationType::Delete, collection, Some(id.to_string()))
    }

    fn query(
        &self,
        collection: &str,
        _filter: &Record,
    ) -> impl Future<Output = SyncResult<BackendResponse>> + Send {
        self.respond(OperationType::Query, collection, None)
    }

    fn batch(
        &self,
        collection: &str,
        _payload: &Record,
    ) -> impl Future<Output = SyncResult<BackendResponse>> + Send {
        self.respond(OperationType::Batch, collection, None)
    }
}
