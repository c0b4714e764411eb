use serde_json::Value;
use sweep_core::{Result, SweepError};

pub const MAX_MERGE_DEPTH: usize = 64;

/// Merge `overlay` into `base` in place.
///
/// Mappings merge key by key; any other overlay value (lists included)
/// replaces the base value.
pub fn deep_merge(base: &mut Value, overlay: &Value) -> Result<()> {
    merge_at(base, overlay, 0)
}

fn merge_at(base: &mut Value, overlay: &Value, depth: usize) -> Result<()> {
    if depth > MAX_MERGE_DEPTH {
        return Err(SweepError::config(format!(
            "configuration nesting exceeds {} levels",
            MAX_MERGE_DEPTH
        )));
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_at(existing, value, depth + 1)?;
                    }
                    _ => {
                        check_depth(value, depth + 1)?;
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
            Ok(())
        }
        (slot, value) => {
            check_depth(value, depth)?;
            *slot = value.clone();
            Ok(())
        }
    }
}

fn check_depth(value: &Value, depth: usize) -> Result<()> {
    if depth > MAX_MERGE_DEPTH {
        return Err(SweepError::config(format!(
            "configuration nesting exceeds {} levels",
            MAX_MERGE_DEPTH
        )));
    }
    match value {
        Value::Object(map) => map.values().try_for_each(|v| check_depth(v, depth + 1)),
        Value::Array(items) => items.iter().try_for_each(|v| check_depth(v, depth + 1)),
        _ => Ok(()),
    }
}

/// Non-mutating form of [`deep_merge`].
pub fn merged(base: &Value, overlay: &Value) -> Result<Value> {
    let mut out = base.clone();
    deep_merge(&mut out, overlay)?;
    Ok(out)
}
