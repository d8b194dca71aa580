//! Field-name and value heuristics shared by detection and merging.

use chrono::{DateTime, NaiveDateTime, Utc};
use resync_protocol::FieldKind;
use serde_json::Value;

/// Epoch values at or above this are read as milliseconds.
const MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// Content longer than this is treated as free-form content.
const CONTENT_LENGTH: usize = 120;

const VERSION_TOKENS: &[&str] = &["version", "rev", "revision", "etag"];
const TIMESTAMP_TOKENS: &[&str] = &[
    "updated", "modified", "created", "timestamp", "date", "time", "at",
];
const RATE_TOKENS: &[&str] = &[
    "rate", "ratio", "percent", "percentage", "avg", "average", "mean", "score",
];
const ENUM_TOKENS: &[&str] = &[
    "status", "state", "type", "kind", "role", "category", "mode", "level", "stage", "priority",
];
const CONTENT_TOKENS: &[&str] = &[
    "content", "body", "description", "notes", "text", "markdown", "html",
];

/// Splits a field name into lowercase tokens.
///
/// `updatedAt`, `updated_at` and `updated-at` all become `["updated", "at"]`.
pub fn name_tokens(name: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;

    for c in name.chars() {
        if c == '_' || c == '-' || c == '.' || c.is_whitespace() {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if c.is_uppercase() && prev_lower && !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
        prev_lower = c.is_lowercase() || c.is_ascii_digit();
        current.extend(c.to_lowercase());
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn has_token(tokens: &[String], set: &[&str]) -> bool {
    tokens.iter().any(|t| set.contains(&t.as_str()))
}

/// True for names like `updatedAt`, `modified_at`, `lastModified`.
pub fn is_modified_name(name: &str) -> bool {
    let tokens = name_tokens(name);
    has_token(&tokens, &["updated", "modified"])
}

/// True for names like `createdAt`, `created_at`.
pub fn is_created_name(name: &str) -> bool {
    let tokens = name_tokens(name);
    has_token(&tokens, &["created"])
}

/// True for rate-like numeric fields (averages, ratios, scores).
pub fn is_rate_name(name: &str) -> bool {
    has_token(&name_tokens(name), RATE_TOKENS)
}

/// True for fields holding a value from a closed set.
pub fn is_enum_name(name: &str) -> bool {
    has_token(&name_tokens(name), ENUM_TOKENS)
}

/// Parses RFC 3339 strings, naive ISO datetimes (as UTC) and epoch numbers.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|naive| naive.and_utc())
            }),
        Value::Number(n) => {
            let raw = n.as_i64()?;
            if raw.abs() >= MILLIS_THRESHOLD {
                DateTime::from_timestamp_millis(raw)
            } else {
                DateTime::from_timestamp(raw, 0)
            }
        }
        _ => None,
    }
}

/// JSON type name used for type-mismatch detection.
pub fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Structural equality that treats `5` and `5.0` as equal.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| values_equal(x, y)))
        }
        _ => a == b,
    }
}

/// Infers the semantic kind of a field from its name and values.
pub fn classify(name: &str, local: Option<&Value>, remote: Option<&Value>) -> FieldKind {
    let tokens = name_tokens(name);
    let values: Vec<&Value> = [local, remote]
        .into_iter()
        .flatten()
        .filter(|v| !v.is_null())
        .collect();
    let Some(sample) = values.first().copied() else {
        return FieldKind::Other;
    };

    if values.iter().any(|v| v.is_boolean()) {
        return FieldKind::Boolean;
    }
    if has_token(&tokens, VERSION_TOKENS) && (sample.is_number() || sample.is_string()) {
        return FieldKind::Version;
    }
    if has_token(&tokens, TIMESTAMP_TOKENS) && values.iter().all(|v| parse_timestamp(v).is_some())
    {
        return FieldKind::Timestamp;
    }
    if tokens
        .last()
        .is_some_and(|t| t == "id" || t == "uuid" || t == "key")
        && !sample.is_array()
    {
        return FieldKind::Identifier;
    }

    match sample {
        Value::Number(_) if has_token(&tokens, RATE_TOKENS) => FieldKind::Rate,
        Value::Number(_) => FieldKind::Count,
        Value::Array(_) => FieldKind::Array,
        Value::Object(_) => FieldKind::Object,
        Value::String(_) if has_token(&tokens, ENUM_TOKENS) => FieldKind::Enumeration,
        Value::String(_) => {
            let long = values.iter().any(|v| {
                v.as_str()
                    .is_some_and(|s| s.len() > CONTENT_LENGTH || s.contains('\n'))
            });
            if long || has_token(&tokens, CONTENT_TOKENS) {
                FieldKind::Content
            } else {
                FieldKind::Text
            }
        }
        _ => FieldKind::Other,
    }
}
