//! Canonical JSON + versioned SHA-256 hashing.
//!
//! Callers control canonicalization by passing an ordered list of string
//! "parts" into [`hash_parts_v1`] rather than handing the kernel an arbitrary
//! value graph to traverse; this prevents silent hash drift when a caller's
//! value shape evolves; only the caller's chosen parts move the hash.

use std::collections::BTreeMap;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::HashError;

/// Current hash kernel version. Stored alongside every hash so future
/// canonicalization changes can coexist with hashes computed under this one.
pub const HASH_VERSION_V1: i32 = 1;

/// Serialize `value` to a canonical string: object keys sorted
/// lexicographically, `null`-valued optional fields kept (absent fields are
/// simply not present in the map), arrays preserve order, numbers/strings/
/// booleans pass through unchanged.
///
/// Big integers that cannot round-trip through `f64`/`i64`/`u64` are
/// rejected — callers must render those as decimal strings before calling.
pub fn canonical_json_stringify(value: &Value) -> Result<String, HashError> {
    let canonical = sort_and_validate(value)?;
    // serde_json's Value -> String serialization of an already-sorted
    // BTreeMap-backed structure is deterministic.
    Ok(serde_json::to_string(&canonical).expect("canonicalized value always serializes"))
}

fn sort_and_validate(value: &Value) -> Result<Value, HashError> {
    match value {
        Value::Object(map) => {
            let mut sorted: BTreeMap<String, Value> = BTreeMap::new();
            for (k, v) in map {
                sorted.insert(k.clone(), sort_and_validate(v)?);
            }
            Ok(Value::Object(sorted.into_iter().collect()))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(sort_and_validate(item)?);
            }
            Ok(Value::Array(out))
        }
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() || n.is_f64() {
                Ok(Value::Number(n.clone()))
            } else {
                Err(HashError::NonCanonicalNumber(n.clone()))
            }
        }
        other => Ok(other.clone()),
    }
}

/// Concatenate `parts` with a single `\n` separator and return the SHA-256
/// hex digest together with the kernel version tag.
///
/// The version is returned alongside the hash (rather than folded into it)
/// so a future `hashPartsV2` can coexist with rows written under v1.
pub fn hash_parts_v1<I, S>(parts: I) -> (String, i32)
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    let mut first = true;
    for part in parts {
        if !first {
            hasher.update(b"\n");
        }
        first = false;
        hasher.update(part.as_ref().as_bytes());
    }
    let digest = hasher.finalize();
    (format!("{digest:x}"), HASH_VERSION_V1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys() {
        let a = canonical_json_stringify(&json!({"b": 1, "a": 2})).unwrap();
        let b = canonical_json_stringify(&json!({"a": 2, "b": 1})).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn canonical_json_preserves_array_order() {
        let s = canonical_json_stringify(&json!({"xs": [3, 1, 2]})).unwrap();
        assert_eq!(s, r#"{"xs":[3,1,2]}"#);
    }

    #[test]
    fn hash_parts_is_order_sensitive() {
        let (h1, v1) = hash_parts_v1(["a", "b"]);
        let (h2, v2) = hash_parts_v1(["b", "a"]);
        assert_eq!(v1, HASH_VERSION_V1);
        assert_eq!(v2, HASH_VERSION_V1);
        assert_ne!(h1, h2);
    }

    #[test]
    fn hash_parts_is_deterministic() {
        let (h1, _) = hash_parts_v1(["kind=params_hash:v1", "asset_slug=segment_followers"]);
        let (h2, _) = hash_parts_v1(["kind=params_hash:v1", "asset_slug=segment_followers"]);
        assert_eq!(h1, h2);
    }

    #[test]
    fn hash_parts_distinguishes_separator_collisions() {
        // "a\nb" vs "ab" joined differently must not collide.
        let (h1, _) = hash_parts_v1(["a", "b"]);
        let (h2, _) = hash_parts_v1(["ab"]);
        assert_ne!(h1, h2);
    }
}
