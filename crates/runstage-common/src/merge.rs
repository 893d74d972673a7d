//! Recursive merge of structured values

use serde_json::Value;

/// Merge `overlay` into `base`.
///
/// Objects present on both sides are merged key by key; any other conflict
/// is resolved in favour of `overlay`, including arrays, which are replaced
/// rather than concatenated.
pub fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    },
                }
            }
        },
        (slot, value) => *slot = value,
    }
}

/// Owned variant of [`merge`]
pub fn merged(mut base: Value, overlay: Value) -> Value {
    merge(&mut base, overlay);
    base
}
