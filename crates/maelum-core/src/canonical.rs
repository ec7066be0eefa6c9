//! Canonical JSON bytes used for every detached signature.
//!
//! The canonical form is pinned by the wire specification rather than
//! delegated to a library: UTF-8, object keys sorted lexicographically, no
//! insignificant whitespace, integers as plain decimal, and null members
//! omitted from objects. `serde_json` maps are ordered (`BTreeMap`), which
//! gives the key ordering; null stripping is done explicitly before
//! serialisation.

use serde::Serialize;
use serde_json::Value;

/// Serialises `value` into its canonical JSON byte form.
pub fn to_canonical_vec<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let json = canonicalize(serde_json::to_value(value)?);
    serde_json::to_vec(&json)
}

/// Rebuilds every object with null members dropped and keys inserted in
/// sorted order, so the output ordering does not depend on the map
/// implementation behind `serde_json::Value`.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map
                .into_iter()
                .filter(|(_, entry)| !entry.is_null())
                .collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut out = serde_json::Map::new();
            for (key, entry) in entries {
                out.insert(key, canonicalize(entry));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted_and_compact() {
        let value = json!({"zeta": 1, "alpha": {"b": 2, "a": 3}});
        let bytes = to_canonical_vec(&value).unwrap();
        assert_eq!(bytes, br#"{"alpha":{"a":3,"b":2},"zeta":1}"#);
    }

    #[test]
    fn nulls_are_omitted_from_objects() {
        let value = json!({"keep": "x", "drop": null, "nested": {"also": null, "n": 1}});
        let bytes = to_canonical_vec(&value).unwrap();
        assert_eq!(bytes, br#"{"keep":"x","nested":{"n":1}}"#);
    }

    #[test]
    fn nulls_survive_inside_arrays() {
        let value = json!({"list": [1, null, 2]});
        let bytes = to_canonical_vec(&value).unwrap();
        assert_eq!(bytes, br#"{"list":[1,null,2]}"#);
    }

    #[test]
    fn integers_render_as_plain_decimal() {
        let value = json!({"n": 1234567890u64});
        let bytes = to_canonical_vec(&value).unwrap();
        assert_eq!(bytes, br#"{"n":1234567890}"#);
    }
}
