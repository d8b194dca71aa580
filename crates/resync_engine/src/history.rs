//! Append-only log of resolved conflicts.
//!
//! The history feeds reporting (`statistics`) and a deterministic strategy
//! suggestion: a new conflict gets the strategy most often used for past
//! conflicts in the same collection with the same set of conflict types.

use crate::resolution::names::MANUAL;
use parking_lot::RwLock;
use resync_protocol::{ConflictHistoryEntry, ConflictType, EnhancedSyncConflict};
use std::collections::BTreeMap;
use std::time::Duration;

/// Aggregates over the whole history.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConflictStatistics {
    /// Number of resolved conflicts.
    pub total: usize,
    /// Resolutions per strategy name.
    pub by_strategy: BTreeMap<String, usize>,
    /// Conflicts per collection.
    pub by_collection: BTreeMap<String, usize>,
    /// Conflicting occurrences per field name.
    pub by_field: BTreeMap<String, usize>,
    /// Field conflicts per conflict type.
    pub by_conflict_type: BTreeMap<ConflictType, usize>,
    /// Resolutions completed by a person.
    pub manual_count: usize,
    /// Mean resolution confidence, 0 when empty.
    pub average_confidence: f64,
    /// Mean time spent on manual resolutions.
    pub average_interaction_time: Option<Duration>,
}

/// Thread-safe, append-only conflict history.
#[derive(Debug, Default)]
pub struct ConflictHistory {
    entries: RwLock<Vec<ConflictHistoryEntry>>,
}

impl ConflictHistory {
    /// Creates an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry.
    pub fn record(&self, entry: ConflictHistoryEntry) {
        self.entries.write().push(entry);
    }

    /// Returns all entries, oldest first.
    pub fn entries(&self) -> Vec<ConflictHistoryEntry> {
        self.entries.read().clone()
    }

    /// Returns entries for one entity, oldest first.
    pub fn entries_for_entity(&self, collection: &str, entity_id: &str) -> Vec<ConflictHistoryEntry> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.conflict.collection == collection && e.conflict.entity_id == entity_id)
            .cloned()
            .collect()
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Computes aggregates over every entry.
    pub fn statistics(&self) -> ConflictStatistics {
        let entries = self.entries.read();
        let mut stats = ConflictStatistics {
            total: entries.len(),
            ..Default::default()
        };

        let mut confidence_sum = 0.0;
        let mut interaction_sum = Duration::ZERO;
        let mut interactions = 0u32;

        for entry in entries.iter() {
            *stats
                .by_strategy
                .entry(entry.strategy_used.clone())
                .or_default() += 1;
            *stats
                .by_collection
                .entry(entry.conflict.collection.clone())
                .or_default() += 1;
            for (field, info) in &entry.conflict.field_conflicts {
                *stats.by_field.entry(field.clone()).or_default() += 1;
                *stats
                    .by_conflict_type
                    .entry(info.conflict_type)
                    .or_default() += 1;
            }
            if entry.strategy_used == MANUAL {
                stats.manual_count += 1;
            }
            if let Some(spent) = entry.interaction_time {
                interaction_sum += spent;
                interactions += 1;
            }
            confidence_sum += entry.resolution.confidence_score;
        }

        if !entries.is_empty() {
            stats.average_confidence = confidence_sum / entries.len() as f64;
        }
        if interactions > 0 {
            stats.average_interaction_time = Some(interaction_sum / interactions);
        }
        stats
    }

    /// Suggests a strategy from similar past conflicts.
    ///
    /// Similar means same collection and same set of conflict types. Manual
    /// resolutions are not suggested. Ties go to the alphabetically first
    /// strategy name.
    pub fn suggest_strategy(&self, conflict: &EnhancedSyncConflict) -> Option<String> {
        let signature = conflict.signature();
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();

        let entries = self.entries.read();
        for entry in entries.iter() {
            if entry.strategy_used == MANUAL
                || entry.conflict.collection != conflict.collection
                || entry.conflict.signature() != signature
            {
                continue;
            }
            *counts.entry(entry.strategy_used.as_str()).or_default() += 1;
        }

        // BTreeMap iterates names in order, so max_by keeps the last of equal
        // counts; reverse to keep the first.
        counts
            .into_iter()
            .rev()
            .max_by_key(|(_, count)| *count)
            .map(|(name, _)| name.to_string())
    }
}
