//! Engine counters.
//!
//! All counters are atomic and can be read while a drain is in progress.

use std::sync::atomic::{AtomicU64, Ordering};

/// Running totals kept by the engine.
#[derive(Debug, Default)]
pub struct EngineStats {
    drains: AtomicU64,
    processed: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
    timeouts: AtomicU64,
    conflicts_detected: AtomicU64,
    conflicts_resolved: AtomicU64,
    conflicts_manual: AtomicU64,
}

impl EngineStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_drain(&self) {
        self.drains.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_conflict(&self) {
        self.conflicts_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_resolved(&self) {
        self.conflicts_resolved.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_manual(&self) {
        self.conflicts_manual.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time copy of the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            drains: self.drains.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            conflicts_detected: self.conflicts_detected.load(Ordering::Relaxed),
            conflicts_resolved: self.conflicts_resolved.load(Ordering::Relaxed),
            conflicts_manual: self.conflicts_manual.load(Ordering::Relaxed),
            queue_size: 0,
            pending_conflicts: 0,
        }
    }
}

/// A point-in-time snapshot of engine statistics.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Drains that ran while authenticated.
    pub drains: u64,
    /// Operations the backend accepted, including resolved conflicts.
    pub processed: u64,
    /// Failed attempts put back in the queue.
    pub retried: u64,
    /// Operations dropped after exhausting retries.
    pub dropped: u64,
    /// Operations rejected with a non-retryable error.
    pub failed: u64,
    /// Backend calls that exceeded the operation timeout.
    pub timeouts: u64,
    /// Conflicts reported by the backend and confirmed by the detector.
    pub conflicts_detected: u64,
    /// Conflicts resolved and applied, automatically or by a person.
    pub conflicts_resolved: u64,
    /// Conflicts parked for a person.
    pub conflicts_manual: u64,
    /// Operations currently queued.
    pub queue_size: usize,
    /// Conflicts currently waiting for a person.
    pub pending_conflicts: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = EngineStats::new();
        stats.record_drain();
        stats.record_processed();
        stats.record_processed();
        stats.record_retry();
        stats.record_conflict();
        stats.record_manual();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.drains, 1);
        assert_eq!(snapshot.processed, 2);
        assert_eq!(snapshot.retried, 1);
        assert_eq!(snapshot.conflicts_detected, 1);
        assert_eq!(snapshot.conflicts_manual, 1);
        assert_eq!(snapshot.dropped, 0);
    }
}
