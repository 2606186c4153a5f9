//! Deterministic encoding rules — spec §4.E "Deterministic encoding".
//!
//! `serde_json::Map` is BTreeMap-backed unless the `preserve_order` feature
//! is enabled (it is not, anywhere in this workspace), so object keys are
//! already sorted by construction. This module only has to handle the rules
//! serde's default `Value` representation does not give us for free:
//! `undefined` elision, buffer encoding, and timestamp formatting — the
//! in-memory types already use `Option` (mapping to JSON `null`, which spec
//! §4.E treats distinctly for object fields vs array slots) and
//! `chrono::DateTime` (already RFC3339 via serde).

use serde_json::{Map, Value};

/// Recursively canonicalize a `Value` per spec §4.E:
/// - object keys sorted (free, via `BTreeMap`-backed `Map`)
/// - `null` object values are omitted entirely (spec: "undefined object values are omitted")
/// - `null` array slots are kept as `null` (spec: "undefined array slots become nulls")
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                if v.is_null() {
                    continue;
                }
                out.insert(k.clone(), canonicalize(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Encode raw bytes as a tagged buffer value: `{__type:"Buffer", hex:<lowercase>}`.
pub fn encode_buffer(bytes: &[u8]) -> Value {
    serde_json::json!({
        "__type": "Buffer",
        "hex": hex::encode(bytes),
    })
}

/// Canonical, byte-stable JSON serialization of any `Serialize` value.
/// Two calls with equal input always produce equal bytes (spec §8 property 2).
pub fn to_canonical_bytes<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let v = serde_json::to_value(value)?;
    let canon = canonicalize(&v);
    serde_json::to_vec(&canon)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_keys_sorted_and_nulls_omitted() {
        let v = serde_json::json!({"b": 1, "a": null, "c": 2});
        let canon = canonicalize(&v);
        assert_eq!(canon, serde_json::json!({"b": 1, "c": 2}));
        let s = serde_json::to_string(&canon).unwrap();
        assert_eq!(s, r#"{"b":1,"c":2}"#);
    }

    #[test]
    fn array_nulls_preserved() {
        let v = serde_json::json!([1, null, 3]);
        let canon = canonicalize(&v);
        assert_eq!(canon, serde_json::json!([1, null, 3]));
    }

    #[test]
    fn repeated_encoding_is_byte_stable() {
        #[derive(serde::Serialize)]
        struct S {
            z: u32,
            a: u32,
        }
        let s = S { z: 1, a: 2 };
        let b1 = to_canonical_bytes(&s).unwrap();
        let b2 = to_canonical_bytes(&s).unwrap();
        assert_eq!(b1, b2);
    }
}
