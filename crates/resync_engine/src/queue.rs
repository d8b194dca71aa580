//! Priority queue of pending operations.

use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use resync_protocol::{OperationPriority, ProtocolError, QueueSnapshot, SyncOperation};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// What happened to an operation handed back after a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequeueOutcome {
    /// The operation is back in the queue.
    Requeued {
        /// Retry count now recorded on the operation.
        retry_count: u32,
        /// Earliest instant it may be attempted again.
        next_attempt_at: Option<DateTime<Utc>>,
    },
    /// Retries are exhausted; the operation was dropped.
    Dropped {
        /// Retry count that exceeded the limit.
        attempts: u32,
    },
}

#[derive(Default)]
struct QueueState {
    /// One FIFO bucket per priority, most urgent first.
    buckets: [VecDeque<SyncOperation>; 4],
    ids: HashSet<String>,
}

impl QueueState {
    fn len(&self) -> usize {
        self.buckets.iter().map(VecDeque::len).sum()
    }

    fn push(&mut self, operation: SyncOperation) {
        self.ids.insert(operation.id.clone());
        self.buckets[operation.priority.index()].push_back(operation);
    }

    fn take(&mut self, id: &str) -> Option<SyncOperation> {
        if !self.ids.remove(id) {
            return None;
        }
        for bucket in &mut self.buckets {
            if let Some(pos) = bucket.iter().position(|op| op.id == id) {
                return bucket.remove(pos);
            }
        }
        None
    }

    fn pop_where(&mut self, ready: impl Fn(&SyncOperation) -> bool) -> Option<SyncOperation> {
        for bucket in &mut self.buckets {
            if let Some(pos) = bucket.iter().position(&ready) {
                let operation = bucket.remove(pos)?;
                self.ids.remove(&operation.id);
                return Some(operation);
            }
        }
        None
    }
}

/// Pending-operation store ordered by priority, then insertion.
///
/// The queue is the single source of truth for operations that have not yet
/// reached the backend.
///
/// # Invariants
///
/// - Dequeue order is `Critical > High > Normal > Low`, FIFO within a priority
/// - Operation ids are unique within the queue
/// - An operation whose retry count exceeds `max_retries` is never re-inserted
///
/// All mutations are serialized by one lock; `size` and `snapshot` always
/// reflect a single point in time.
pub struct SyncQueue {
    state: Mutex<QueueState>,
    max_retries: AtomicU32,
    events: Arc<EventBus>,
}

impl SyncQueue {
    /// Creates an empty queue.
    pub fn new(max_retries: u32, events: Arc<EventBus>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            max_retries: AtomicU32::new(max_retries),
            events,
        }
    }

    /// Returns the retry limit.
    pub fn max_retries(&self) -> u32 {
        self.max_retries.load(Ordering::SeqCst)
    }

    /// Updates the retry limit for future requeues.
    pub fn set_max_retries(&self, max_retries: u32) {
        self.max_retries.store(max_retries, Ordering::SeqCst);
    }

    /// Inserts an operation.
    ///
    /// Rejects operations that are malformed, already queued, or already past
    /// the retry limit.
    pub fn enqueue(&self, operation: SyncOperation) -> SyncResult<()> {
        operation.validate().map_err(|e| match e {
            ProtocolError::InvalidOperation(message) => SyncError::InvalidOperation(message),
            other => SyncError::Protocol(other),
        })?;

        if operation.retry_count > self.max_retries() {
            return Err(SyncError::InvalidOperation(format!(
                "operation {} already exhausted its retries",
                operation.id
            )));
        }

        let id = operation.id.clone();
        let priority = operation.priority;
        let mut state = self.state.lock();
        if state.ids.contains(&id) {
            return Err(SyncError::InvalidOperation(format!(
                "operation {id} is already queued"
            )));
        }
        state.push(operation);
        let size = state.len();

        debug!(operation_id = %id, priority = priority.as_str(), size, "operation enqueued");
        // Size events go out under the lock so subscribers see them in lock order.
        self.events.emit_all([
            SyncEvent::OperationAdded {
                operation_id: id,
                priority,
            },
            SyncEvent::QueueSizeChanged { size },
        ]);
        Ok(())
    }

    /// Removes and returns the most urgent, oldest operation.
    pub fn dequeue(&self) -> Option<SyncOperation> {
        self.pop(|_| true)
    }

    /// Like [`dequeue`](Self::dequeue), skipping operations still in backoff.
    pub fn dequeue_ready(&self, now: DateTime<Utc>) -> Option<SyncOperation> {
        self.pop(|op| op.is_ready_at(now))
    }

    fn pop(&self, ready: impl Fn(&SyncOperation) -> bool) -> Option<SyncOperation> {
        let mut state = self.state.lock();
        let operation = state.pop_where(ready)?;
        let size = state.len();

        self.events.emit_all([
            SyncEvent::OperationRemoved {
                operation_id: operation.id.clone(),
            },
            SyncEvent::QueueSizeChanged { size },
        ]);
        Some(operation)
    }

    /// Re-inserts an operation that failed.
    ///
    /// The delay is stored on the operation; the queue never sleeps. Once
    /// the larger of `new_retry_count` and the operation's own count exceeds
    /// the retry limit the operation is dropped and a fatal `OperationFailed`
    /// event is emitted.
    pub fn requeue_with_backoff(
        &self,
        mut operation: SyncOperation,
        new_retry_count: u32,
        delay: Duration,
    ) -> RequeueOutcome {
        let max_retries = self.max_retries();
        let attempts = operation.retry_count.max(new_retry_count);
        if attempts > max_retries {
            warn!(
                operation_id = %operation.id,
                attempts,
                max_retries,
                "retries exhausted, dropping operation"
            );
            self.events.emit(SyncEvent::OperationFailed {
                operation_id: operation.id,
                error: format!("retries exhausted after {attempts} attempts"),
                fatal: true,
            });
            return RequeueOutcome::Dropped { attempts };
        }

        operation.record_retry(new_retry_count, delay, Utc::now());
        let outcome = RequeueOutcome::Requeued {
            retry_count: operation.retry_count,
            next_attempt_at: operation.next_attempt_at,
        };
        let id = operation.id.clone();
        let priority = operation.priority;

        let mut state = self.state.lock();
        state.take(&id);
        state.push(operation);
        let size = state.len();

        debug!(operation_id = %id, ?delay, size, "operation requeued with backoff");
        self.events.emit_all([
            SyncEvent::OperationAdded {
                operation_id: id,
                priority,
            },
            SyncEvent::QueueSizeChanged { size },
        ]);
        outcome
    }

    /// Removes a specific operation.
    pub fn remove(&self, id: &str) -> Option<SyncOperation> {
        let mut state = self.state.lock();
        let operation = state.take(id)?;
        let size = state.len();

        self.events.emit_all([
            SyncEvent::OperationRemoved {
                operation_id: operation.id.clone(),
            },
            SyncEvent::QueueSizeChanged { size },
        ]);
        Some(operation)
    }

    /// Removes every operation, returning how many were dropped.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let removed = state.len();
        *state = QueueState::default();
        if removed > 0 {
            self.events.emit(SyncEvent::QueueSizeChanged { size: 0 });
        }
        removed
    }

    /// Number of queued operations.
    pub fn size(&self) -> usize {
        self.state.lock().len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Returns true if an operation with this id is queued.
    pub fn contains(&self, id: &str) -> bool {
        self.state.lock().ids.contains(id)
    }

    /// Queue length per priority, most urgent first.
    pub fn len_by_priority(&self) -> Vec<(OperationPriority, usize)> {
        let state = self.state.lock();
        OperationPriority::ALL
            .iter()
            .map(|p| (*p, state.buckets[p.index()].len()))
            .collect()
    }

    /// Earliest `next_attempt_at` among operations in backoff.
    pub fn next_ready_at(&self) -> Option<DateTime<Utc>> {
        let state = self.state.lock();
        state
            .buckets
            .iter()
            .flatten()
            .filter_map(|op| op.next_attempt_at)
            .min()
    }

    /// Copies every operation in dequeue order without mutating the queue.
    pub fn snapshot(&self) -> Vec<SyncOperation> {
        let state = self.state.lock();
        state.buckets.iter().flatten().cloned().collect()
    }

    /// Wraps [`snapshot`](Self::snapshot) in a versioned document.
    pub fn snapshot_document(&self) -> QueueSnapshot {
        QueueSnapshot::new(self.snapshot())
    }

    /// Replaces the queue contents with previously saved operations.
    ///
    /// Every operation is validated before anything changes. Duplicate ids
    /// keep their first occurrence and operations past the retry limit are
    /// skipped. Returns the number of restored operations.
    pub fn restore(&self, operations: Vec<SyncOperation>) -> SyncResult<usize> {
        for operation in &operations {
            operation
                .validate()
                .map_err(|e| SyncError::InvalidOperation(e.to_string()))?;
        }

        let max_retries = self.max_retries();
        let mut state = self.state.lock();
        *state = QueueState::default();
        for operation in operations {
            if state.ids.contains(&operation.id) {
                warn!(operation_id = %operation.id, "skipping duplicate operation in snapshot");
                continue;
            }
            if operation.retry_count > max_retries {
                warn!(
                    operation_id = %operation.id,
                    attempts = operation.retry_count,
                    max_retries,
                    "skipping exhausted operation in snapshot"
                );
                continue;
            }
            state.push(operation);
        }
        let size = state.len();

        debug!(size, "queue restored from snapshot");
        self.events.emit(SyncEvent::QueueSizeChanged { size });
        Ok(size)
    }
}
