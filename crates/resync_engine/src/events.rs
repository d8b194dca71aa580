//! Event bus for observing the engine.
//!
//! Every component that reports progress is handed an `Arc<EventBus>` by
//! whoever builds the engine; there is no process-wide instance.
//!
//! # Usage
//!
//! ```rust,ignore
//! let events = Arc::new(EventBus::new());
//! let receiver = events.subscribe();
//!
//! std::thread::spawn(move || {
//!     while let Ok(event) = receiver.recv() {
//!         println!("{event:?}");
//!     }
//! });
//! ```

use crate::scheduler::{SchedulerState, TriggerType};
use parking_lot::RwLock;
use resync_protocol::OperationPriority;
use std::sync::mpsc::{self, Receiver, Sender};

/// Something observable happened inside the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// An operation entered the queue.
    OperationAdded {
        /// Operation id.
        operation_id: String,
        /// Operation priority.
        priority: OperationPriority,
    },
    /// An operation left the queue.
    OperationRemoved {
        /// Operation id.
        operation_id: String,
    },
    /// An operation reached the backend successfully.
    OperationProcessed {
        /// Operation id.
        operation_id: String,
    },
    /// An operation failed.
    OperationFailed {
        /// Operation id.
        operation_id: String,
        /// Error message.
        error: String,
        /// True if the operation was dropped for good.
        fatal: bool,
    },
    /// The queue length changed.
    QueueSizeChanged {
        /// New queue length.
        size: usize,
    },
    /// A conflict was detected.
    ConflictDetected {
        /// Conflict id.
        conflict_id: String,
        /// Collection name.
        collection: String,
        /// Entity id.
        entity_id: String,
    },
    /// A conflict was resolved and applied.
    ConflictResolved {
        /// Conflict id.
        conflict_id: String,
        /// Strategy that resolved it.
        strategy: String,
    },
    /// A conflict is waiting for a person.
    ConflictPendingManual {
        /// Conflict id.
        conflict_id: String,
    },
    /// The scheduler fired a trigger.
    SchedulerTriggerFired {
        /// Trigger kind.
        trigger: TriggerType,
        /// Trigger sequence number.
        sequence: u64,
    },
    /// The scheduler changed state.
    SchedulerStateChanged {
        /// Previous state.
        from: SchedulerState,
        /// New state.
        to: SchedulerState,
    },
}

/// Distributes engine events to subscribers.
///
/// The bus:
/// - Preserves emission order per subscriber
/// - Supports multiple subscribers
/// - Drops subscribers whose receiver is gone
/// - Keeps a bounded window of recent events for polling
pub struct EventBus {
    subscribers: RwLock<Vec<Sender<SyncEvent>>>,
    history: RwLock<Vec<SyncEvent>>,
    max_history: usize,
}

impl EventBus {
    /// Creates a new event bus.
    pub fn new() -> Self {
        Self::with_max_history(1024)
    }

    /// Creates an event bus with a specific history limit.
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            history: RwLock::new(Vec::new()),
            max_history,
        }
    }

    /// Subscribes to all future events.
    pub fn subscribe(&self) -> Receiver<SyncEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Emits an event to every live subscriber.
    pub fn emit(&self, event: SyncEvent) {
        {
            let mut history = self.history.write();
            history.push(event.clone());
            if history.len() > self.max_history {
                let to_remove = history.len() - self.max_history;
                history.drain(0..to_remove);
            }
        }

        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Emits several events in order.
    pub fn emit_all(&self, events: impl IntoIterator<Item = SyncEvent>) {
        for event in events {
            self.emit(event);
        }
    }

    /// Returns the retained recent events, oldest first.
    pub fn recent(&self) -> Vec<SyncEvent> {
        self.history.read().clone()
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Clears the retained history.
    pub fn clear_history(&self) {
        self.history.write().clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
