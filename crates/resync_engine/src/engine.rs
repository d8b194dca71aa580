//! The orchestrator tying queue, scheduler and conflict handling together.
//!
//! Each drain pulls ready operations in priority order and hands them to at
//! most `max_concurrent_operations` workers. A worker sends its operation to
//! the backend under `operation_timeout`; a reported conflict goes through
//! detection and resolution, and the resolved snapshot is written back.
//! Failures are requeued with backoff until the retry limit drops them.

use crate::auth::{AuthContext, ORGANIZATION_ID_KEY, USER_ID_KEY};
use crate::backend::{BackendResponse, SyncBackend};
use crate::config::EngineConfig;
use crate::detector::ConflictDetector;
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent};
use crate::history::ConflictHistory;
use crate::queue::{RequeueOutcome, SyncQueue};
use crate::resolution::{names::MANUAL, ResolverRegistry};
use crate::scheduler::SyncScheduler;
use crate::stats::{EngineStats, StatsSnapshot};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use resync_protocol::{
    ConflictHistoryEntry, EnhancedSyncConflict, EnhancedSyncConflictResolution, FieldChoice,
    QueueSnapshot, Record, SyncOperation,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

fn snapshot_entity_id(record: &Record) -> Option<String> {
    match record.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A conflict waiting for a person.
#[derive(Debug, Clone)]
pub struct PendingConflict {
    /// The detected conflict.
    pub conflict: EnhancedSyncConflict,
    /// The operation that ran into it. It is not requeued.
    pub operation: SyncOperation,
    /// When the conflict was parked.
    pub detected_at: DateTime<Utc>,
    /// Strategy used most often for similar past conflicts.
    pub suggested_strategy: Option<String>,
    /// Why it could not be resolved automatically.
    pub reason: String,
    parked_at: Instant,
}

/// Summary of one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Operations taken from the queue.
    pub attempted: usize,
    /// Operations accepted without a conflict.
    pub processed: usize,
    /// Operations whose conflict was resolved and applied.
    pub conflicts_resolved: usize,
    /// Operations parked behind a manual conflict.
    pub pending_manual: usize,
    /// Operations put back for another attempt.
    pub retried: usize,
    /// Operations dropped after exhausting retries.
    pub dropped: usize,
    /// Operations rejected with a non-retryable error.
    pub failed: usize,
    /// True if the drain did nothing because nobody was signed in.
    pub skipped_unauthenticated: bool,
}

impl DrainReport {
    fn record(&mut self, outcome: Outcome) {
        self.attempted += 1;
        match outcome {
            Outcome::Processed => self.processed += 1,
            Outcome::Resolved => self.conflicts_resolved += 1,
            Outcome::PendingManual => self.pending_manual += 1,
            Outcome::Retried => self.retried += 1,
            Outcome::Dropped => self.dropped += 1,
            Outcome::Failed => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Processed,
    Resolved,
    PendingManual,
    Retried,
    Dropped,
    Failed,
}

struct Inner<B, A> {
    config: RwLock<EngineConfig>,
    backend: B,
    auth: A,
    events: Arc<EventBus>,
    queue: SyncQueue,
    scheduler: SyncScheduler,
    detector: RwLock<ConflictDetector>,
    resolvers: RwLock<ResolverRegistry>,
    history: ConflictHistory,
    pending: Mutex<Vec<PendingConflict>>,
    stats: EngineStats,
}

impl<B: SyncBackend, A: AuthContext> Inner<B, A> {
    fn stamp_identity(&self, operation: &mut SyncOperation) {
        if let Some(user) = self.auth.user_id() {
            operation
                .metadata
                .entry(USER_ID_KEY.to_string())
                .or_insert(user);
        }
        if let Some(organization) = self.auth.organization_id() {
            operation
                .metadata
                .entry(ORGANIZATION_ID_KEY.to_string())
                .or_insert(organization);
        }
    }

    async fn call(
        &self,
        call: impl Future<Output = SyncResult<BackendResponse>>,
    ) -> SyncResult<BackendResponse> {
        let timeout = self.config.read().operation_timeout;
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                self.stats.record_timeout();
                Err(SyncError::Timeout)
            }
        }
    }

    async fn process(&self, operation: SyncOperation) -> Outcome {
        let response = self.call(self.backend.execute(&operation)).await;
        match response {
            Ok(BackendResponse::Applied(_)) => {
                self.complete(&operation);
                Outcome::Processed
            }
            Ok(BackendResponse::Conflict {
                local,
                remote,
                local_version,
                remote_version,
            }) => {
                self.reconcile(operation, local, remote, local_version, remote_version)
                    .await
            }
            Err(err) => self.fail(operation, err),
        }
    }

    fn complete(&self, operation: &SyncOperation) {
        debug!(operation_id = %operation.id, "operation processed");
        self.stats.record_processed();
        self.events.emit(SyncEvent::OperationProcessed {
            operation_id: operation.id.clone(),
        });
    }

    fn fail(&self, operation: SyncOperation, err: SyncError) -> Outcome {
        let id = operation.id.clone();

        if !err.is_retryable() {
            warn!(operation_id = %id, error = %err, "operation rejected");
            self.stats.record_failed();
            self.events.emit(SyncEvent::OperationFailed {
                operation_id: id,
                error: err.to_string(),
                fatal: true,
            });
            return Outcome::Failed;
        }

        let (base, retry) = {
            let config = self.config.read();
            (config.schedule.retry_delay, config.retry.clone())
        };
        let delay = retry.delay_for_attempt(base, operation.retry_count);
        let attempts = operation.retry_count.saturating_add(1);

        match self.queue.requeue_with_backoff(operation, attempts, delay) {
            RequeueOutcome::Requeued { retry_count, .. } => {
                debug!(operation_id = %id, retry_count, ?delay, error = %err, "operation will be retried");
                self.stats.record_retry();
                self.events.emit(SyncEvent::OperationFailed {
                    operation_id: id,
                    error: err.to_string(),
                    fatal: false,
                });
                self.scheduler.schedule_retry(delay);
                Outcome::Retried
            }
            RequeueOutcome::Dropped { attempts } => {
                let fatal = SyncError::FatalOperationFailure {
                    operation_id: id,
                    attempts,
                    reason: err.to_string(),
                };
                error!(error = %fatal, "operation dropped");
                self.stats.record_dropped();
                Outcome::Dropped
            }
        }
    }

    async fn reconcile(
        &self,
        operation: SyncOperation,
        local: Record,
        remote: Record,
        local_version: u64,
        remote_version: u64,
    ) -> Outcome {
        let entity_id = operation
            .entity_id()
            .or_else(|| snapshot_entity_id(&remote))
            .or_else(|| snapshot_entity_id(&local));
        let Some(entity_id) = entity_id else {
            let err = SyncError::ConflictDetectionFailure {
                collection: operation.collection.clone(),
                entity_id: operation.id.clone(),
                reason: "no entity id in the operation or either snapshot".into(),
            };
            return self.fail(operation, err);
        };
        let detected = self.detector.read().detect(
            &entity_id,
            &operation.collection,
            &local,
            &remote,
            local_version,
            remote_version,
        );
        let Some(mut conflict) = detected else {
            debug!(operation_id = %operation.id, "backend conflict over identical snapshots");
            self.complete(&operation);
            return Outcome::Processed;
        };

        conflict.priority = conflict.priority.max(operation.priority);
        if let Some(user) = self.auth.user_id() {
            conflict.tags.insert(format!("user:{user}"));
        }
        if let Some(organization) = self.auth.organization_id() {
            conflict.tags.insert(format!("organization:{organization}"));
        }

        info!(
            conflict_id = %conflict.id,
            collection = %conflict.collection,
            entity_id = %conflict.entity_id,
            fields = conflict.field_conflicts.len(),
            manual = conflict.requires_manual_intervention,
            "conflict detected"
        );
        self.stats.record_conflict();
        self.events.emit(SyncEvent::ConflictDetected {
            conflict_id: conflict.id.clone(),
            collection: conflict.collection.clone(),
            entity_id: conflict.entity_id.clone(),
        });

        let resolved = self.resolvers.read().resolve(&conflict);
        let resolution = match resolved {
            Ok(resolution) if !resolution.requires_manual_intervention => resolution,
            Ok(_) => return self.park(operation, conflict, "requires manual review".into()),
            Err(err) => return self.park(operation, conflict, err.to_string()),
        };

        let applied = self
            .call(self.backend.update(
                &conflict.collection,
                &conflict.entity_id,
                &resolution.merged_data,
            ))
            .await;
        match applied {
            Ok(BackendResponse::Applied(_)) => {
                let strategy = resolution.resolved_by.clone();
                self.record_resolution(conflict, resolution, strategy, None);
                self.complete(&operation);
                Outcome::Resolved
            }
            Ok(BackendResponse::Conflict { .. }) => self.fail(
                operation,
                SyncError::backend_retryable("remote changed while applying resolution"),
            ),
            Err(err) => self.fail(operation, err),
        }
    }

    fn park(
        &self,
        operation: SyncOperation,
        conflict: EnhancedSyncConflict,
        reason: String,
    ) -> Outcome {
        let suggested_strategy = self.history.suggest_strategy(&conflict);
        let conflict_id = conflict.id.clone();
        warn!(
            conflict_id = %conflict_id,
            reason = %reason,
            suggested = ?suggested_strategy,
            "conflict needs manual resolution"
        );

        {
            let mut pending = self.pending.lock();
            pending.retain(|p| p.conflict.id != conflict_id);
            pending.push(PendingConflict {
                conflict,
                operation,
                detected_at: Utc::now(),
                suggested_strategy,
                reason,
                parked_at: Instant::now(),
            });
        }

        self.stats.record_manual();
        self.events
            .emit(SyncEvent::ConflictPendingManual { conflict_id });
        Outcome::PendingManual
    }

    fn record_resolution(
        &self,
        conflict: EnhancedSyncConflict,
        resolution: EnhancedSyncConflictResolution,
        strategy: String,
        interaction_time: Option<Duration>,
    ) {
        info!(
            conflict_id = %conflict.id,
            strategy = %strategy,
            confidence = resolution.confidence_score,
            "conflict resolved"
        );
        for warning in &resolution.warnings {
            debug!(conflict_id = %conflict.id, %warning, "resolution warning");
        }

        self.stats.record_resolved();
        self.events.emit(SyncEvent::ConflictResolved {
            conflict_id: conflict.id.clone(),
            strategy: strategy.clone(),
        });
        self.history.record(ConflictHistoryEntry {
            conflict,
            resolution,
            strategy_used: strategy,
            resolved_at: Utc::now(),
            interaction_time,
        });
    }
}

/// The sync engine pushes queued operations to a backend and reconciles
/// the conflicts it reports.
pub struct SyncEngine<B: SyncBackend, A: AuthContext> {
    inner: Arc<Inner<B, A>>,
    drain_lock: tokio::sync::Mutex<()>,
}

impl<B: SyncBackend, A: AuthContext> SyncEngine<B, A> {
    /// Creates a new engine with its own event bus.
    pub fn new(config: EngineConfig, backend: B, auth: A) -> SyncResult<Self> {
        Self::with_event_bus(config, backend, auth, Arc::new(EventBus::new()))
    }

    /// Creates a new engine reporting to `events`.
    pub fn with_event_bus(
        config: EngineConfig,
        backend: B,
        auth: A,
        events: Arc<EventBus>,
    ) -> SyncResult<Self> {
        config.validate()?;
        let resolvers =
            ResolverRegistry::default().with_default_strategy(&config.default_strategy)?;
        let queue = SyncQueue::new(config.schedule.max_retries, Arc::clone(&events));
        let scheduler = SyncScheduler::new(config.schedule.clone(), Arc::clone(&events))?;
        let detector = ConflictDetector::from_config(&config);

        Ok(Self {
            inner: Arc::new(Inner {
                config: RwLock::new(config),
                backend,
                auth,
                events,
                queue,
                scheduler,
                detector: RwLock::new(detector),
                resolvers: RwLock::new(resolvers),
                history: ConflictHistory::new(),
                pending: Mutex::new(Vec::new()),
                stats: EngineStats::new(),
            }),
            drain_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Gets the current configuration.
    pub fn config(&self) -> EngineConfig {
        self.inner.config.read().clone()
    }

    /// Replaces the configuration.
    ///
    /// An invalid configuration is rejected and the previous one kept.
    pub fn update_config(&self, config: EngineConfig) -> SyncResult<()> {
        config.validate()?;
        if self
            .inner
            .resolvers
            .read()
            .strategy_by_name(&config.default_strategy)
            .is_none()
        {
            return Err(SyncError::SchedulerMisconfiguration(format!(
                "unknown resolution strategy {}",
                config.default_strategy
            )));
        }
        self.inner.scheduler.update_config(config.schedule.clone())?;

        self.inner
            .resolvers
            .write()
            .set_default_strategy(&config.default_strategy)?;
        self.inner.queue.set_max_retries(config.schedule.max_retries);
        *self.inner.detector.write() = ConflictDetector::from_config(&config);
        *self.inner.config.write() = config;
        Ok(())
    }

    /// Adjusts the resolver registry, e.g. to add overrides.
    pub fn configure_resolvers(&self, configure: impl FnOnce(&mut ResolverRegistry)) {
        configure(&mut self.inner.resolvers.write());
    }

    /// Returns the backend.
    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    /// Returns the auth context.
    pub fn auth(&self) -> &A {
        &self.inner.auth
    }

    /// Returns the event bus.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    /// Returns the queue.
    pub fn queue(&self) -> &SyncQueue {
        &self.inner.queue
    }

    /// Returns the scheduler.
    pub fn scheduler(&self) -> &SyncScheduler {
        &self.inner.scheduler
    }

    /// Returns the conflict history.
    pub fn history(&self) -> &ConflictHistory {
        &self.inner.history
    }

    /// Queues an operation, stamping the signed-in identity onto it.
    pub fn enqueue(&self, mut operation: SyncOperation) -> SyncResult<()> {
        self.inner.stamp_identity(&mut operation);
        self.inner.queue.enqueue(operation)?;
        self.inner.scheduler.notify_change();
        Ok(())
    }

    /// Sends every ready operation to the backend.
    ///
    /// Does nothing while signed out. Only one drain runs at a time; a second
    /// call waits for the first to finish.
    pub async fn drain(&self) -> DrainReport {
        let _guard = self.drain_lock.lock().await;
        let inner = &self.inner;

        if !inner.auth.is_authenticated() {
            info!(queued = inner.queue.size(), "not authenticated, skipping drain");
            return DrainReport {
                skipped_unauthenticated: true,
                ..Default::default()
            };
        }
        inner.stats.record_drain();

        let max_workers = inner.config.read().max_concurrent_operations;
        let permits = Arc::new(Semaphore::new(max_workers));
        let mut workers = JoinSet::new();
        let mut report = DrainReport::default();

        loop {
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            let Some(operation) = inner.queue.dequeue_ready(Utc::now()) else {
                break;
            };
            let worker = Arc::clone(inner);
            workers.spawn(async move {
                let outcome = worker.process(operation).await;
                drop(permit);
                outcome
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(outcome) => report.record(outcome),
                Err(err) => error!(error = %err, "drain worker failed"),
            }
        }

        info!(
            attempted = report.attempted,
            processed = report.processed,
            resolved = report.conflicts_resolved,
            manual = report.pending_manual,
            retried = report.retried,
            dropped = report.dropped,
            failed = report.failed,
            "drain finished"
        );
        report
    }

    /// Drains on every scheduler trigger until the scheduler stops.
    pub async fn run(&self) {
        info!("sync loop started");
        while let Some(trigger) = self.inner.scheduler.next_trigger().await {
            debug!(
                trigger = ?trigger.trigger_type,
                sequence = trigger.sequence,
                "drain triggered"
            );
            self.drain().await;
        }
        info!("sync loop finished");
    }

    /// Returns the conflicts waiting for a person, oldest first.
    pub fn pending_conflicts(&self) -> Vec<PendingConflict> {
        self.inner.pending.lock().clone()
    }

    /// Completes a parked conflict with per-field choices and writes the
    /// result to the backend.
    ///
    /// On failure the conflict stays parked.
    pub async fn resolve_pending(
        &self,
        conflict_id: &str,
        choices: &BTreeMap<String, FieldChoice>,
    ) -> SyncResult<EnhancedSyncConflictResolution> {
        let inner = &self.inner;
        if !inner.auth.is_authenticated() {
            return Err(SyncError::NotAuthenticated);
        }

        let pending = inner
            .pending
            .lock()
            .iter()
            .find(|p| p.conflict.id == conflict_id)
            .cloned()
            .ok_or_else(|| SyncError::ConflictNotFound(conflict_id.to_string()))?;

        let resolved_by = inner.auth.user_id().unwrap_or_else(|| MANUAL.to_string());
        let resolution =
            inner
                .resolvers
                .read()
                .complete_manual(&pending.conflict, choices, &resolved_by)?;

        let applied = inner
            .call(inner.backend.update(
                &pending.conflict.collection,
                &pending.conflict.entity_id,
                &resolution.merged_data,
            ))
            .await?;
        if let BackendResponse::Conflict { .. } = applied {
            return Err(SyncError::backend_retryable(
                "remote changed while applying resolution",
            ));
        }

        inner.pending.lock().retain(|p| p.conflict.id != conflict_id);
        let interaction_time = pending.parked_at.elapsed();
        inner.record_resolution(
            pending.conflict,
            resolution.clone(),
            MANUAL.to_string(),
            Some(interaction_time),
        );
        inner.complete(&pending.operation);
        Ok(resolution)
    }

    /// Returns engine statistics.
    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            queue_size: self.inner.queue.size(),
            pending_conflicts: self.inner.pending.lock().len(),
            ..self.inner.stats.snapshot()
        }
    }

    /// Captures the queued operations for persistence.
    pub fn snapshot(&self) -> QueueSnapshot {
        self.inner.queue.snapshot_document()
    }

    /// Replaces the queue with a saved snapshot.
    pub fn restore(&self, snapshot: QueueSnapshot) -> SyncResult<usize> {
        let restored = self.inner.queue.restore(snapshot.operations)?;
        info!(restored, "queue restored from snapshot");
        Ok(restored)
    }
}
