//! Canonical JSON encoding and hashing.
//!
//! Every fingerprint and chain hash in the system is computed over this
//! encoding, so it is a wire contract:
//!
//! - objects: keys sorted by their UTF-8 bytes, rendered `{"k":v,...}`
//! - arrays: elements in order, rendered `[a,b,...]`
//! - strings: JSON string escaping as produced by `serde_json`
//! - numbers: `serde_json` number formatting (integers without a fraction)
//! - `true`, `false`, `null` literally
//! - no whitespace anywhere
//!
//! Hashes are lowercase hex SHA-256 digests of the encoded bytes.

use crate::SwarmResult;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Encode a JSON value canonically.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (index, key) in keys.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(child) = map.get(key) {
                    write_canonical(child, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// SHA-256 over the canonical encoding of `value`.
pub fn hash_value(value: &Value) -> String {
    sha256_hex(canonical_json(value).as_bytes())
}

/// Serialize `value` to JSON and hash its canonical encoding.
pub fn fingerprint<T: Serialize>(value: &T) -> SwarmResult<String> {
    Ok(hash_value(&serde_json::to_value(value)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keys_sorted_recursively() {
        let value = json!({"b": 1, "a": {"z": true, "y": null}, "c": [3, {"k": "v", "j": 1.5}]});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"y":null,"z":true},"b":1,"c":[3,{"j":1.5,"k":"v"}]}"#
        );
    }

    #[test]
    fn test_string_escaping() {
        let value = json!({"quote": "say \"hi\"\n"});
        assert_eq!(canonical_json(&value), r#"{"quote":"say \"hi\"\n"}"#);
    }

    #[test]
    fn test_key_order_does_not_change_hash() {
        let a = json!({"x": 1, "y": [1, 2]});
        let b = json!({"y": [1, 2], "x": 1});
        assert_eq!(hash_value(&a), hash_value(&b));
    }

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_array_order_matters() {
        assert_ne!(hash_value(&json!([1, 2])), hash_value(&json!([2, 1])));
    }
}
