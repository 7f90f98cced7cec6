//! JSON merge patches (RFC 7386), the format status writes are sent in.
//!
//! A merge patch names only what changed: object members that differ are replaced (recursively
//! for nested objects), members that disappeared are set to `null`, and anything that isn't an
//! object (arrays included) is replaced whole.

use serde_json::{Map, Value};

/// Computes the merge patch that turns `old` into `new`.  Returns an empty object when the two
/// are equal.
pub fn diff(old: &Value, new: &Value) -> Value {
    match (old, new) {
        (Value::Object(old), Value::Object(new)) => {
            let mut patch = Map::new();
            for key in old.keys() {
                if !new.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            for (key, new_value) in new {
                match old.get(key) {
                    Some(old_value) if old_value == new_value => {}
                    Some(old_value @ Value::Object(_)) if new_value.is_object() => {
                        patch.insert(key.clone(), diff(old_value, new_value));
                    }
                    _ => {
                        patch.insert(key.clone(), new_value.clone());
                    }
                }
            }
            Value::Object(patch)
        }
        _ => new.clone(),
    }
}

/// Applies a merge patch in place.
pub fn apply(target: &mut Value, patch: &Value) {
    let patch = match patch {
        Value::Object(patch) => patch,
        _ => {
            *target = patch.clone();
            return;
        }
    };

    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                apply(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// Whether the patch changes nothing.
pub fn is_empty(patch: &Value) -> bool {
    matches!(patch, Value::Object(m) if m.is_empty())
}
