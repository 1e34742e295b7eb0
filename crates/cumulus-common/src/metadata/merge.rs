//! Deep-merge policy for partial metadata documents.
//!
//! Objects merge key by key. At a scalar leaf the incoming value replaces the
//! existing one when it is non-null or the existing one is null; an incoming
//! null never erases data. Fields listed in [`MONOTONIC_FIELDS`] additionally
//! never move backwards in time.

use chrono::DateTime;
use serde_json::Value;

/// Timestamp fields that only ever increase.
pub const MONOTONIC_FIELDS: &[&str] = &["last_upload"];

/// Merge `incoming` into `existing` in place.
pub fn coalesce(existing: &mut Value, incoming: Value) {
    merge_at(existing, incoming, None);
}

/// Apply a sequence of partial documents in order.
pub fn apply_all<I>(document: &mut Value, deltas: I)
where
    I: IntoIterator<Item = Value>,
{
    for delta in deltas {
        coalesce(document, delta);
    }
}

fn merge_at(existing: &mut Value, incoming: Value, field: Option<&str>) {
    match (existing, incoming) {
        (Value::Object(current), Value::Object(updates)) => {
            for (key, value) in updates {
                match current.get_mut(&key) {
                    Some(slot) => merge_at(slot, value, Some(&key)),
                    None => {
                        current.insert(key, value);
                    }
                }
            }
        }
        (_, Value::Null) => {}
        (slot, value) => {
            if field.is_some_and(|f| MONOTONIC_FIELDS.contains(&f)) && is_earlier(&value, slot) {
                return;
            }
            *slot = value;
        }
    }
}

/// Whether `candidate` is a timestamp strictly before `current`.
fn is_earlier(candidate: &Value, current: &Value) -> bool {
    let parse = |v: &Value| {
        v.as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
    };
    match (parse(candidate), parse(current)) {
        (Some(candidate), Some(current)) => candidate < current,
        _ => false,
    }
}
