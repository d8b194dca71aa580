//! Whole-conflict resolution policies and the registry that picks one.

use crate::error::{SyncError, SyncResult};
use crate::fields::{is_modified_name, parse_timestamp};
use crate::merge::{MergeContext, MergeRegistry};
use chrono::{DateTime, Utc};
use resync_protocol::{
    ConflictType, EnhancedSyncConflict, EnhancedSyncConflictResolution, FieldChoice, FieldKind,
    OperationPriority, Record,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// Names of the built-in resolution strategies.
pub mod names {
    /// Keep the local snapshot.
    pub const LOCAL_WINS: &str = "local_wins";
    /// Keep the remote snapshot.
    pub const REMOTE_WINS: &str = "remote_wins";
    /// Keep the snapshot modified last.
    pub const TIMESTAMP_WINS: &str = "timestamp_wins";
    /// Trust local for urgent entities, remote otherwise.
    pub const PRIORITY_BASED: &str = "priority_based";
    /// Keep the snapshot with the higher version.
    pub const NEWEST_VERSION_WINS: &str = "newest_version_wins";
    /// Keep the snapshot with the lower version.
    pub const OLDEST_VERSION_WINS: &str = "oldest_version_wins";
    /// Merge field by field.
    pub const INTELLIGENT_MERGE: &str = "intelligent_merge";
    /// Wait for a person.
    pub const MANUAL: &str = "manual";
}

/// A policy that turns a conflict into a resolution.
pub trait ConflictResolutionStrategy: Send + Sync {
    /// Stable strategy name.
    fn name(&self) -> &str;

    /// Higher priorities win when several custom resolvers apply.
    fn priority(&self) -> i32 {
        0
    }

    /// Returns true if this strategy can resolve the conflict.
    fn can_resolve(&self, conflict: &EnhancedSyncConflict) -> bool;

    /// Expected confidence of resolving this conflict, in `[0, 1]`.
    fn confidence_score(&self, conflict: &EnhancedSyncConflict) -> f64;

    /// Resolves the conflict.
    fn resolve_conflict(&self, conflict: &EnhancedSyncConflict) -> EnhancedSyncConflictResolution;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Local,
    Remote,
}

/// Resolution that takes one full snapshot, naming `strategy` for every field.
fn take_side(
    conflict: &EnhancedSyncConflict,
    side: Side,
    strategy: &str,
    confidence: f64,
) -> EnhancedSyncConflictResolution {
    let data = match side {
        Side::Local => conflict.local_data.clone(),
        Side::Remote => conflict.remote_data.clone(),
    };
    let mut resolution = EnhancedSyncConflictResolution::new(&conflict.id, data, strategy, confidence);
    for field in conflict.field_conflicts.keys() {
        resolution = resolution.with_field_strategy(field, strategy);
    }
    resolution
}

/// Always keeps the local snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalWins;

impl ConflictResolutionStrategy for LocalWins {
    fn name(&self) -> &str {
        names::LOCAL_WINS
    }

    fn can_resolve(&self, _conflict: &EnhancedSyncConflict) -> bool {
        true
    }

    fn confidence_score(&self, _conflict: &EnhancedSyncConflict) -> f64 {
        0.6
    }

    fn resolve_conflict(&self, conflict: &EnhancedSyncConflict) -> EnhancedSyncConflictResolution {
        take_side(conflict, Side::Local, self.name(), self.confidence_score(conflict))
    }
}

/// Always keeps the remote snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteWins;

impl ConflictResolutionStrategy for RemoteWins {
    fn name(&self) -> &str {
        names::REMOTE_WINS
    }

    fn can_resolve(&self, _conflict: &EnhancedSyncConflict) -> bool {
        true
    }

    fn confidence_score(&self, _conflict: &EnhancedSyncConflict) -> f64 {
        0.6
    }

    fn resolve_conflict(&self, conflict: &EnhancedSyncConflict) -> EnhancedSyncConflictResolution {
        take_side(conflict, Side::Remote, self.name(), self.confidence_score(conflict))
    }
}

/// Keeps whichever snapshot carries the later modification time.
///
/// Only applies when both snapshots carry a parseable `updatedAt`-style field.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimestampWins;

impl TimestampWins {
    fn modified_times(conflict: &EnhancedSyncConflict) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let mut keys: Vec<&String> = conflict
            .local_data
            .keys()
            .filter(|k| is_modified_name(k))
            .collect();
        keys.sort();
        keys.into_iter().find_map(|key| {
            let local = parse_timestamp(conflict.local_data.get(key)?)?;
            let remote = parse_timestamp(conflict.remote_data.get(key)?)?;
            Some((local, remote))
        })
    }
}

impl ConflictResolutionStrategy for TimestampWins {
    fn name(&self) -> &str {
        names::TIMESTAMP_WINS
    }

    fn can_resolve(&self, conflict: &EnhancedSyncConflict) -> bool {
        Self::modified_times(conflict).is_some()
    }

    fn confidence_score(&self, conflict: &EnhancedSyncConflict) -> f64 {
        match Self::modified_times(conflict) {
            Some((l, r)) if l != r => 0.9,
            Some(_) => 0.5,
            None => 0.0,
        }
    }

    fn resolve_conflict(&self, conflict: &EnhancedSyncConflict) -> EnhancedSyncConflictResolution {
        let confidence = self.confidence_score(conflict);
        match Self::modified_times(conflict) {
            Some((l, r)) if l > r => take_side(conflict, Side::Local, self.name(), confidence),
            Some((l, r)) if l < r => take_side(conflict, Side::Remote, self.name(), confidence),
            Some(_) => take_side(conflict, Side::Remote, self.name(), confidence)
                .with_warning("modification times are equal; kept remote snapshot"),
            None => take_side(conflict, Side::Remote, self.name(), confidence)
                .with_warning("no modification time on both sides; kept remote snapshot"),
        }
    }
}

/// Trusts the local snapshot for critical and high priority entities.
#[derive(Debug, Clone, Copy, Default)]
pub struct PriorityBased;

impl ConflictResolutionStrategy for PriorityBased {
    fn name(&self) -> &str {
        names::PRIORITY_BASED
    }

    fn can_resolve(&self, _conflict: &EnhancedSyncConflict) -> bool {
        true
    }

    fn confidence_score(&self, _conflict: &EnhancedSyncConflict) -> f64 {
        0.7
    }

    fn resolve_conflict(&self, conflict: &EnhancedSyncConflict) -> EnhancedSyncConflictResolution {
        let side = match conflict.priority {
            OperationPriority::Critical | OperationPriority::High => Side::Local,
            OperationPriority::Normal | OperationPriority::Low => Side::Remote,
        };
        take_side(conflict, side, self.name(), self.confidence_score(conflict))
    }
}

/// Compares version counters.
#[derive(Debug, Clone, Copy)]
pub struct VersionWins {
    newest: bool,
}

impl VersionWins {
    /// Higher version wins.
    pub fn newest() -> Self {
        Self { newest: true }
    }

    /// Lower version wins.
    pub fn oldest() -> Self {
        Self { newest: false }
    }
}

impl ConflictResolutionStrategy for VersionWins {
    fn name(&self) -> &str {
        if self.newest {
            names::NEWEST_VERSION_WINS
        } else {
            names::OLDEST_VERSION_WINS
        }
    }

    fn can_resolve(&self, conflict: &EnhancedSyncConflict) -> bool {
        conflict.local_version != conflict.remote_version
    }

    fn confidence_score(&self, conflict: &EnhancedSyncConflict) -> f64 {
        match (self.can_resolve(conflict), self.newest) {
            (false, _) => 0.0,
            (true, true) => 0.85,
            (true, false) => 0.6,
        }
    }

    fn resolve_conflict(&self, conflict: &EnhancedSyncConflict) -> EnhancedSyncConflictResolution {
        let local_newer = conflict.local_version > conflict.remote_version;
        let side = if self.can_resolve(conflict) && local_newer == self.newest {
            Side::Local
        } else {
            Side::Remote
        };
        let resolution = take_side(conflict, side, self.name(), self.confidence_score(conflict));
        if self.can_resolve(conflict) {
            resolution
        } else {
            resolution.with_warning("versions are equal; kept remote snapshot")
        }
    }
}

/// Merges field by field using a [`MergeRegistry`].
///
/// Fields no merge strategy can combine keep the remote value. Fields that
/// exist only locally are kept.
#[derive(Debug, Clone, Default)]
pub struct IntelligentMerge {
    merges: MergeRegistry,
    context: MergeContext,
}

impl IntelligentMerge {
    /// Penalty applied to fields that fell back to the remote value.
    const FALLBACK_PENALTY: f64 = 0.8;

    /// Creates the strategy over a merge registry.
    pub fn new(merges: MergeRegistry) -> Self {
        Self {
            merges,
            context: MergeContext::default(),
        }
    }

    /// Sets the merge context.
    pub fn with_context(mut self, context: MergeContext) -> Self {
        self.context = context;
        self
    }

    /// Identifiers and versions are never combined, only picked.
    fn is_mergeable(kind: FieldKind) -> bool {
        !matches!(kind, FieldKind::Identifier | FieldKind::Version)
    }
}

impl ConflictResolutionStrategy for IntelligentMerge {
    fn name(&self) -> &str {
        names::INTELLIGENT_MERGE
    }

    fn can_resolve(&self, _conflict: &EnhancedSyncConflict) -> bool {
        true
    }

    fn confidence_score(&self, conflict: &EnhancedSyncConflict) -> f64 {
        conflict.average_confidence()
    }

    fn resolve_conflict(&self, conflict: &EnhancedSyncConflict) -> EnhancedSyncConflictResolution {
        let mut merged = conflict.remote_data.clone();
        let mut strategies = BTreeMap::new();
        let mut warnings = Vec::new();
        let mut scores = Vec::with_capacity(conflict.field_conflicts.len());

        for (field, info) in &conflict.field_conflicts {
            match (&info.local_value, &info.remote_value) {
                (Some(local), Some(remote)) => {
                    let combined = if Self::is_mergeable(info.field_kind) {
                        self.merges.merge(field, local, remote, &self.context)
                    } else {
                        None
                    };
                    match combined {
                        Some((value, strategy)) => {
                            merged.insert(field.clone(), value);
                            strategies.insert(field.clone(), strategy.to_string());
                            scores.push(info.confidence_score);
                        }
                        None => {
                            merged.insert(field.clone(), remote.clone());
                            strategies.insert(field.clone(), names::REMOTE_WINS.to_string());
                            warnings.push(format!(
                                "no merge strategy for field {field}; kept remote value"
                            ));
                            scores.push(info.confidence_score * Self::FALLBACK_PENALTY);
                        }
                    }
                }
                (Some(local), None) => {
                    merged.insert(field.clone(), local.clone());
                    strategies.insert(field.clone(), names::LOCAL_WINS.to_string());
                    scores.push(info.confidence_score);
                }
                (None, _) => {
                    strategies.insert(field.clone(), names::REMOTE_WINS.to_string());
                    scores.push(info.confidence_score);
                }
            }
            if info.conflict_type == ConflictType::TypeMismatch {
                warnings.push(format!("field {field} changed type"));
            }
        }

        let confidence = if scores.is_empty() {
            1.0
        } else {
            scores.iter().sum::<f64>() / scores.len() as f64
        };
        let mut resolution =
            EnhancedSyncConflictResolution::new(&conflict.id, merged, self.name(), confidence);
        resolution.field_strategies = strategies;
        resolution.warnings = warnings;
        resolution
    }
}

/// Defers to a person.
///
/// The returned resolution carries the remote snapshot as a placeholder and
/// is completed with [`ResolverRegistry::complete_manual`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Manual;

impl ConflictResolutionStrategy for Manual {
    fn name(&self) -> &str {
        names::MANUAL
    }

    fn can_resolve(&self, _conflict: &EnhancedSyncConflict) -> bool {
        true
    }

    fn confidence_score(&self, _conflict: &EnhancedSyncConflict) -> f64 {
        0.0
    }

    fn resolve_conflict(&self, conflict: &EnhancedSyncConflict) -> EnhancedSyncConflictResolution {
        take_side(conflict, Side::Remote, self.name(), 0.0).pending_manual()
    }
}

type Strategy = Arc<dyn ConflictResolutionStrategy>;

/// Picks the strategy for each conflict.
///
/// Lookup order: entity override, collection override, manual (for conflicts
/// that require a person), custom resolvers by priority, then the default.
/// Each candidate is skipped if it cannot resolve the conflict.
pub struct ResolverRegistry {
    default_strategy: Strategy,
    custom: Vec<Strategy>,
    collection_overrides: HashMap<String, Strategy>,
    entity_overrides: HashMap<(String, String), Strategy>,
    builtins: BTreeMap<String, Strategy>,
}

impl ResolverRegistry {
    /// Creates a registry whose default is intelligent merge over `merges`.
    pub fn new(merges: MergeRegistry) -> Self {
        let builtins: Vec<Strategy> = vec![
            Arc::new(LocalWins),
            Arc::new(RemoteWins),
            Arc::new(TimestampWins),
            Arc::new(PriorityBased),
            Arc::new(VersionWins::newest()),
            Arc::new(VersionWins::oldest()),
            Arc::new(IntelligentMerge::new(merges)),
            Arc::new(Manual),
        ];
        let builtins: BTreeMap<String, Strategy> = builtins
            .into_iter()
            .map(|s| (s.name().to_string(), s))
            .collect();
        let default_strategy = Arc::clone(&builtins[names::INTELLIGENT_MERGE]);

        Self {
            default_strategy,
            custom: Vec::new(),
            collection_overrides: HashMap::new(),
            entity_overrides: HashMap::new(),
            builtins,
        }
    }

    /// Sets the default strategy by name.
    ///
    /// Fails with `SchedulerMisconfiguration` if no strategy has that name.
    pub fn with_default_strategy(mut self, name: &str) -> SyncResult<Self> {
        self.set_default_strategy(name)?;
        Ok(self)
    }

    /// Replaces the default strategy by name, keeping the old one on error.
    pub fn set_default_strategy(&mut self, name: &str) -> SyncResult<()> {
        self.default_strategy = self.strategy_by_name(name).ok_or_else(|| {
            SyncError::SchedulerMisconfiguration(format!("unknown resolution strategy {name}"))
        })?;
        Ok(())
    }

    /// Returns the default strategy name.
    pub fn default_strategy(&self) -> &str {
        self.default_strategy.name()
    }

    /// Registers a custom resolver.
    ///
    /// Custom resolvers are also reachable through [`strategy_by_name`](Self::strategy_by_name).
    pub fn register(&mut self, strategy: Strategy) {
        let at = self
            .custom
            .iter()
            .position(|s| s.priority() < strategy.priority())
            .unwrap_or(self.custom.len());
        self.custom.insert(at, strategy);
    }

    /// Routes every conflict in a collection to `strategy`.
    pub fn override_collection(&mut self, collection: impl Into<String>, strategy: Strategy) {
        self.collection_overrides.insert(collection.into(), strategy);
    }

    /// Routes conflicts on one entity to `strategy`.
    pub fn override_entity(
        &mut self,
        collection: impl Into<String>,
        entity_id: impl Into<String>,
        strategy: Strategy,
    ) {
        self.entity_overrides
            .insert((collection.into(), entity_id.into()), strategy);
    }

    /// Looks up a built-in or custom strategy by name.
    pub fn strategy_by_name(&self, name: &str) -> Option<Strategy> {
        self.custom
            .iter()
            .find(|s| s.name() == name)
            .or_else(|| self.builtins.get(name))
            .cloned()
    }

    /// Returns the strategy that would resolve the conflict.
    pub fn select(&self, conflict: &EnhancedSyncConflict) -> Option<Strategy> {
        let entity_key = (conflict.collection.clone(), conflict.entity_id.clone());
        let overrides = self
            .entity_overrides
            .get(&entity_key)
            .into_iter()
            .chain(self.collection_overrides.get(&conflict.collection));
        let manual = conflict
            .requires_manual_intervention
            .then(|| self.builtins.get(names::MANUAL))
            .flatten();

        overrides
            .chain(manual)
            .chain(self.custom.iter())
            .chain(std::iter::once(&self.default_strategy))
            .find(|s| s.can_resolve(conflict))
            .cloned()
    }

    /// Resolves a conflict with the selected strategy.
    ///
    /// Fails with `ResolutionFailure` if no strategy can resolve it.
    pub fn resolve(
        &self,
        conflict: &EnhancedSyncConflict,
    ) -> SyncResult<EnhancedSyncConflictResolution> {
        let strategy = self.select(conflict).ok_or_else(|| SyncError::ResolutionFailure {
            conflict_id: conflict.id.clone(),
        })?;
        debug!(
            conflict_id = %conflict.id,
            strategy = strategy.name(),
            "resolving conflict"
        );
        Ok(strategy.resolve_conflict(conflict))
    }

    /// Completes a manual resolution from per-field choices.
    ///
    /// Every conflicting field needs a choice. Choices for fields that did not
    /// conflict are ignored.
    pub fn complete_manual(
        &self,
        conflict: &EnhancedSyncConflict,
        choices: &BTreeMap<String, FieldChoice>,
        resolved_by: &str,
    ) -> SyncResult<EnhancedSyncConflictResolution> {
        let mut merged: Record = conflict.remote_data.clone();
        let mut resolution =
            EnhancedSyncConflictResolution::new(&conflict.id, Record::new(), resolved_by, 1.0);

        for (field, info) in &conflict.field_conflicts {
            let Some(choice) = choices.get(field) else {
                warn!(conflict_id = %conflict.id, field = %field, "manual resolution missing a field choice");
                return Err(SyncError::ResolutionFailure {
                    conflict_id: conflict.id.clone(),
                });
            };
            let (value, strategy) = match choice {
                FieldChoice::Local => (info.local_value.clone(), names::LOCAL_WINS),
                FieldChoice::Remote => (info.remote_value.clone(), names::REMOTE_WINS),
                FieldChoice::Custom(value) => (Some(value.clone()), names::MANUAL),
            };
            match value {
                Some(value) => merged.insert(field.clone(), value),
                None => merged.remove(field),
            };
            resolution = resolution.with_field_strategy(field, strategy);
        }

        for field in choices.keys() {
            if !conflict.field_conflicts.contains_key(field) {
                resolution = resolution.with_warning(format!(
                    "ignored choice for non-conflicting field {field}"
                ));
            }
        }

        resolution.merged_data = merged;
        Ok(resolution)
    }
}

impl Default for ResolverRegistry {
    fn default() -> Self {
        Self::new(MergeRegistry::with_defaults())
    }
}

impl std::fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverRegistry")
            .field("default_strategy", &self.default_strategy.name())
            .field("custom", &self.custom.iter().map(|s| s.name()).collect::<Vec<_>>())
            .field("collection_overrides", &self.collection_overrides.len())
            .field("entity_overrides", &self.entity_overrides.len())
            .finish()
    }
}
