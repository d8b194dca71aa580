//! Type-specific merge functions for conflicting field values.
//!
//! Every strategy is pure: identical arguments always produce identical
//! results. A strategy that cannot combine two values returns `None` and
//! leaves the decision to its caller.

use crate::fields::{classify, is_created_name, is_enum_name, is_modified_name, is_rate_name};
use crate::fields::{parse_timestamp, values_equal};
use resync_protocol::{FieldKind, Record};
use serde_json::{Number, Value};
use std::sync::Arc;

/// Names of the built-in merge strategies.
pub mod names {
    /// Newer modification time wins, older creation time wins.
    pub const TIMESTAMP: &str = "timestamp_merge";
    /// Keyed or set union of lists.
    pub const ARRAY_UNION: &str = "array_union";
    /// Maximum for counts, mean for rates.
    pub const NUMERIC: &str = "numeric_merge";
    /// Logical OR of flags.
    pub const BOOLEAN_OR: &str = "boolean_or";
    /// Superset or concatenation of strings.
    pub const TEXT: &str = "text_merge";
    /// Recursive key-wise merge of objects.
    pub const JSON_OBJECT: &str = "json_object_merge";
}

/// Which side wins when two leaves cannot be combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeafPreference {
    /// Keep the local leaf.
    Local,
    /// Keep the remote leaf.
    #[default]
    Remote,
}

impl LeafPreference {
    fn pick<'a>(self, local: &'a Value, remote: &'a Value) -> &'a Value {
        match self {
            Self::Local => local,
            Self::Remote => remote,
        }
    }
}

/// Caller-supplied knobs for a merge.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeContext {
    /// Winner for irreconcilable leaves.
    pub leaf_preference: LeafPreference,
    /// Separator placed between concatenated strings.
    pub text_separator: String,
}

impl MergeContext {
    /// Creates a context with remote leaf preference and a newline separator.
    pub fn new() -> Self {
        Self {
            leaf_preference: LeafPreference::Remote,
            text_separator: "\n".to_string(),
        }
    }

    /// Sets the leaf preference.
    pub fn with_leaf_preference(mut self, preference: LeafPreference) -> Self {
        self.leaf_preference = preference;
        self
    }

    /// Sets the text separator.
    pub fn with_text_separator(mut self, separator: impl Into<String>) -> Self {
        self.text_separator = separator.into();
        self
    }
}

impl Default for MergeContext {
    fn default() -> Self {
        Self::new()
    }
}

fn is_key_or_version(field: &str, local: &Value, remote: &Value) -> bool {
    matches!(
        classify(field, Some(local), Some(remote)),
        FieldKind::Identifier | FieldKind::Version
    )
}

/// Combines two conflicting values of one field.
pub trait MergeStrategy: Send + Sync {
    /// Stable strategy name, recorded in resolutions.
    fn name(&self) -> &str;

    /// Higher priorities are consulted first.
    fn priority(&self) -> i32 {
        0
    }

    /// Returns true if this strategy applies to the pair.
    fn can_handle(&self, field: &str, local: &Value, remote: &Value) -> bool;

    /// Merges the pair, or returns `None` if it cannot.
    fn merge_values(
        &self,
        field: &str,
        local: &Value,
        remote: &Value,
        ctx: &MergeContext,
    ) -> Option<Value>;
}

/// Newest modification wins; for creation fields the oldest wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimestampMerge;

impl MergeStrategy for TimestampMerge {
    fn name(&self) -> &str {
        names::TIMESTAMP
    }

    fn priority(&self) -> i32 {
        100
    }

    fn can_handle(&self, field: &str, local: &Value, remote: &Value) -> bool {
        classify(field, Some(local), Some(remote)) == FieldKind::Timestamp
    }

    fn merge_values(
        &self,
        field: &str,
        local: &Value,
        remote: &Value,
        _ctx: &MergeContext,
    ) -> Option<Value> {
        let l = parse_timestamp(local)?;
        let r = parse_timestamp(remote)?;
        let prefer_remote = if is_created_name(field) && !is_modified_name(field) {
            r < l
        } else {
            r > l
        };
        Some(if prefer_remote { remote } else { local }.clone())
    }
}

/// Union of two lists.
///
/// Lists of records carrying an `id` are merged per id, the record with the
/// later modification time winning. Other lists are set-unioned, local
/// elements first.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArrayMerge;

impl ArrayMerge {
    fn record_id(value: &Value) -> Option<&Value> {
        value.as_object()?.get("id").filter(|id| !id.is_null())
    }

    fn modified_at(record: &Value) -> Option<chrono::DateTime<chrono::Utc>> {
        let record = record.as_object()?;
        let mut keys: Vec<&String> = record.keys().filter(|k| is_modified_name(k)).collect();
        keys.sort();
        keys.into_iter()
            .find_map(|k| parse_timestamp(&record[k.as_str()]))
    }

    fn keyed_union(local: &[Value], remote: &[Value], ctx: &MergeContext) -> Vec<Value> {
        let mut merged: Vec<Value> = Vec::with_capacity(local.len() + remote.len());

        for item in local {
            let id = Self::record_id(item);
            if merged.iter().any(|m| Self::record_id(m) == id) {
                continue;
            }
            let winner = match remote.iter().find(|r| Self::record_id(r) == id) {
                Some(other) if values_equal(item, other) => item,
                Some(other) => match (Self::modified_at(item), Self::modified_at(other)) {
                    (Some(l), Some(r)) if l > r => item,
                    (Some(l), Some(r)) if r > l => other,
                    _ => ctx.leaf_preference.pick(item, other),
                },
                None => item,
            };
            merged.push(winner.clone());
        }
        for item in remote {
            let id = Self::record_id(item);
            if !merged.iter().any(|m| Self::record_id(m) == id) {
                merged.push(item.clone());
            }
        }
        merged
    }

    fn set_union(local: &[Value], remote: &[Value]) -> Vec<Value> {
        let mut merged: Vec<Value> = local.to_vec();
        for item in remote {
            if !merged.iter().any(|m| values_equal(m, item)) {
                merged.push(item.clone());
            }
        }
        merged
    }
}

impl MergeStrategy for ArrayMerge {
    fn name(&self) -> &str {
        names::ARRAY_UNION
    }

    fn priority(&self) -> i32 {
        80
    }

    fn can_handle(&self, _field: &str, local: &Value, remote: &Value) -> bool {
        local.is_array() && remote.is_array()
    }

    fn merge_values(
        &self,
        _field: &str,
        local: &Value,
        remote: &Value,
        ctx: &MergeContext,
    ) -> Option<Value> {
        let local = local.as_array()?;
        let remote = remote.as_array()?;

        let keyed = local
            .iter()
            .chain(remote)
            .all(|item| Self::record_id(item).is_some());
        let merged = if keyed && !(local.is_empty() && remote.is_empty()) {
            Self::keyed_union(local, remote, ctx)
        } else {
            Self::set_union(local, remote)
        };
        Some(Value::Array(merged))
    }
}

/// Maximum of two counts, mean of two rates.
#[derive(Debug, Clone, Copy, Default)]
pub struct NumericMerge;

impl MergeStrategy for NumericMerge {
    fn name(&self) -> &str {
        names::NUMERIC
    }

    fn priority(&self) -> i32 {
        60
    }

    fn can_handle(&self, field: &str, local: &Value, remote: &Value) -> bool {
        local.is_number() && remote.is_number() && !is_key_or_version(field, local, remote)
    }

    fn merge_values(
        &self,
        field: &str,
        local: &Value,
        remote: &Value,
        _ctx: &MergeContext,
    ) -> Option<Value> {
        let l = local.as_f64()?;
        let r = remote.as_f64()?;

        if is_rate_name(field) {
            return Number::from_f64((l + r) / 2.0).map(Value::Number);
        }
        Some(if r > l { remote } else { local }.clone())
    }
}

/// Logical OR of two flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct BooleanOrMerge;

impl MergeStrategy for BooleanOrMerge {
    fn name(&self) -> &str {
        names::BOOLEAN_OR
    }

    fn priority(&self) -> i32 {
        60
    }

    fn can_handle(&self, _field: &str, local: &Value, remote: &Value) -> bool {
        local.is_boolean() && remote.is_boolean()
    }

    fn merge_values(
        &self,
        _field: &str,
        local: &Value,
        remote: &Value,
        _ctx: &MergeContext,
    ) -> Option<Value> {
        Some(Value::Bool(local.as_bool()? || remote.as_bool()?))
    }
}

/// Keeps both sides of an edited string.
///
/// An empty side yields the other; if one side contains the other the
/// superset is kept; otherwise the two are joined with the context
/// separator, local first. Enumeration-like fields are left alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextMerge;

impl MergeStrategy for TextMerge {
    fn name(&self) -> &str {
        names::TEXT
    }

    fn priority(&self) -> i32 {
        40
    }

    fn can_handle(&self, field: &str, local: &Value, remote: &Value) -> bool {
        local.is_string()
            && remote.is_string()
            && !is_enum_name(field)
            && !is_key_or_version(field, local, remote)
    }

    fn merge_values(
        &self,
        _field: &str,
        local: &Value,
        remote: &Value,
        ctx: &MergeContext,
    ) -> Option<Value> {
        let l = local.as_str()?;
        let r = remote.as_str()?;

        let merged = if r.is_empty() || l == r || l.contains(r) {
            l.to_string()
        } else if l.is_empty() || r.contains(l) {
            r.to_string()
        } else {
            format!("{l}{}{r}", ctx.text_separator)
        };
        Some(Value::String(merged))
    }
}

/// Recursive key-wise merge of two objects.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonObjectMerge;

impl JsonObjectMerge {
    fn merge_records(local: &Record, remote: &Record, ctx: &MergeContext) -> Record {
        let mut merged = Record::new();
        for (key, l) in local {
            let value = match (l, remote.get(key)) {
                (_, None) => l.clone(),
                (_, Some(r)) if values_equal(l, r) => l.clone(),
                (Value::Object(lo), Some(Value::Object(ro))) => {
                    Value::Object(Self::merge_records(lo, ro, ctx))
                }
                (_, Some(r)) => ctx.leaf_preference.pick(l, r).clone(),
            };
            merged.insert(key.clone(), value);
        }
        for (key, r) in remote {
            if !merged.contains_key(key) {
                merged.insert(key.clone(), r.clone());
            }
        }
        merged
    }
}

impl MergeStrategy for JsonObjectMerge {
    fn name(&self) -> &str {
        names::JSON_OBJECT
    }

    fn priority(&self) -> i32 {
        20
    }

    fn can_handle(&self, _field: &str, local: &Value, remote: &Value) -> bool {
        local.is_object() && remote.is_object()
    }

    fn merge_values(
        &self,
        _field: &str,
        local: &Value,
        remote: &Value,
        ctx: &MergeContext,
    ) -> Option<Value> {
        Some(Value::Object(Self::merge_records(
            local.as_object()?,
            remote.as_object()?,
            ctx,
        )))
    }
}

/// Ordered set of merge strategies, consulted highest priority first.
#[derive(Clone)]
pub struct MergeRegistry {
    strategies: Vec<Arc<dyn MergeStrategy>>,
}

impl MergeRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    /// Creates a registry holding every built-in strategy.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(TimestampMerge));
        registry.register(Arc::new(ArrayMerge));
        registry.register(Arc::new(NumericMerge));
        registry.register(Arc::new(BooleanOrMerge));
        registry.register(Arc::new(TextMerge));
        registry.register(Arc::new(JsonObjectMerge));
        registry
    }

    /// Adds a strategy. Equal priorities keep registration order.
    pub fn register(&mut self, strategy: Arc<dyn MergeStrategy>) {
        let at = self
            .strategies
            .iter()
            .position(|s| s.priority() < strategy.priority())
            .unwrap_or(self.strategies.len());
        self.strategies.insert(at, strategy);
    }

    /// Returns strategy names in consultation order.
    pub fn names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Returns the number of registered strategies.
    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    /// Returns true if no strategies are registered.
    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Merges a field with the first strategy that handles it and succeeds.
    ///
    /// Returns the merged value and the name of the strategy that produced it.
    pub fn merge(
        &self,
        field: &str,
        local: &Value,
        remote: &Value,
        ctx: &MergeContext,
    ) -> Option<(Value, &str)> {
        self.strategies
            .iter()
            .filter(|s| s.can_handle(field, local, remote))
            .find_map(|s| {
                s.merge_values(field, local, remote, ctx)
                    .map(|v| (v, s.name()))
            })
    }
}

impl Default for MergeRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for MergeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeRegistry")
            .field("strategies", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn merge(field: &str, local: Value, remote: Value) -> Option<(Value, String)> {
        MergeRegistry::with_defaults()
            .merge(field, &local, &remote, &MergeContext::new())
            .map(|(v, name)| (v, name.to_string()))
    }

    #[test]
    fn registry_orders_by_priority() {
        let registry = MergeRegistry::with_defaults();
        assert_eq!(
            registry.names(),
            vec![
                names::TIMESTAMP,
                names::ARRAY_UNION,
                names::NUMERIC,
                names::BOOLEAN_OR,
                names::TEXT,
                names::JSON_OBJECT,
            ]
        );
    }

    #[test]
    fn timestamps_newer_modified_older_created() {
        let early = json!("2024-01-01T00:00:00Z");
        let late = json!("2024-06-01T00:00:00Z");

        let (v, name) = merge("updatedAt", early.clone(), late.clone()).unwrap();
        assert_eq!(v, late);
        assert_eq!(name, names::TIMESTAMP);

        let (v, _) = merge("created_at", late.clone(), early.clone()).unwrap();
        assert_eq!(v, early);
    }

    #[test]
    fn counts_take_max_and_rates_average() {
        assert_eq!(merge("count", json!(5), json!(7)).unwrap().0, json!(7));
        assert_eq!(merge("count", json!(9), json!(7)).unwrap().0, json!(9));
        assert_eq!(
            merge("successRate", json!(0.5), json!(1.0)).unwrap().0,
            json!(0.75)
        );
    }

    #[test]
    fn booleans_or() {
        assert_eq!(merge("isActive", json!(false), json!(true)).unwrap().0, json!(true));
        assert_eq!(
            merge("isDeleted", json!(false), json!(false)).unwrap().0,
            json!(false)
        );
    }

    #[test]
    fn text_keeps_superset_or_concatenates() {
        assert_eq!(merge("title", json!(""), json!("b")).unwrap().0, json!("b"));
        assert_eq!(
            merge("title", json!("milk"), json!("milk and eggs")).unwrap().0,
            json!("milk and eggs")
        );
        assert_eq!(
            merge("title", json!("milk"), json!("eggs")).unwrap().0,
            json!("milk\neggs")
        );

        let ctx = MergeContext::new().with_text_separator(" | ");
        let (v, _) = MergeRegistry::with_defaults()
            .merge("title", &json!("a"), &json!("b"), &ctx)
            .unwrap();
        assert_eq!(v, json!("a | b"));
    }

    #[test]
    fn enumerations_are_not_merged() {
        assert!(merge("status", json!("active"), json!("inactive")).is_none());
    }

    #[test]
    fn keys_and_versions_are_not_merged() {
        assert!(merge("owner_id", json!("u-1"), json!("u-2")).is_none());
        assert!(merge("parent_id", json!(3), json!(5)).is_none());
        assert!(merge("version", json!("v1"), json!("v2")).is_none());
    }

    #[test]
    fn plain_arrays_union_local_first() {
        let (v, name) = merge("tags", json!(["a", "b"]), json!(["c", "a"])).unwrap();
        assert_eq!(v, json!(["a", "b", "c"]));
        assert_eq!(name, names::ARRAY_UNION);
    }

    #[test]
    fn keyed_arrays_merge_by_id_with_later_timestamp() {
        let local = json!([
            {"id": 1, "name": "old", "updatedAt": "2024-01-01T00:00:00Z"},
            {"id": 2, "name": "mine"}
        ]);
        let remote = json!([
            {"id": 3, "name": "theirs"},
            {"id": 1, "name": "new", "updatedAt": "2024-02-01T00:00:00Z"}
        ]);

        let (v, _) = merge("items", local, remote).unwrap();
        assert_eq!(
            v,
            json!([
                {"id": 1, "name": "new", "updatedAt": "2024-02-01T00:00:00Z"},
                {"id": 2, "name": "mine"},
                {"id": 3, "name": "theirs"}
            ])
        );
    }

    #[test]
    fn objects_merge_recursively() {
        let local = json!({"theme": "dark", "nested": {"a": 1, "b": 1}, "mine": true});
        let remote = json!({"theme": "light", "nested": {"b": 2, "c": 3}});

        let (v, name) = merge("settings", local.clone(), remote.clone()).unwrap();
        assert_eq!(name, names::JSON_OBJECT);
        assert_eq!(
            v,
            json!({"theme": "light", "nested": {"a": 1, "b": 2, "c": 3}, "mine": true})
        );

        let ctx = MergeContext::new().with_leaf_preference(LeafPreference::Local);
        let (v, _) = MergeRegistry::with_defaults()
            .merge("settings", &local, &remote, &ctx)
            .unwrap();
        assert_eq!(v["theme"], json!("dark"));
        assert_eq!(v["nested"]["b"], json!(1));
    }

    #[test]
    fn mismatched_types_cannot_merge() {
        assert!(merge("count", json!(1), json!("1")).is_none());
    }

    #[test]
    fn custom_strategies_slot_in_by_priority() {
        struct Concat;
        impl MergeStrategy for Concat {
            fn name(&self) -> &str {
                "concat"
            }
            fn priority(&self) -> i32 {
                50
            }
            fn can_handle(&self, _: &str, l: &Value, r: &Value) -> bool {
                l.is_number() && r.is_number()
            }
            fn merge_values(&self, _: &str, _: &Value, _: &Value, _: &MergeContext) -> Option<Value> {
                None
            }
        }

        let mut registry = MergeRegistry::with_defaults();
        registry.register(Arc::new(Concat));
        assert_eq!(registry.names()[4], "concat");

        let (v, name) = registry
            .merge("count", &json!(1), &json!(2), &MergeContext::new())
            .unwrap();
        assert_eq!(v, json!(2));
        assert_eq!(name, names::NUMERIC);
    }
}
