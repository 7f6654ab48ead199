//! # Query keys and canonical hashing.
//!
//! A [`QueryKey`] is an ordered sequence of JSON values identifying one
//! cached entry. Keys are canonicalized into a stable string by recursive,
//! key-sorted serialization, so two keys that are equal by value hash
//! identically regardless of object key ordering.
//!
//! # Example
//! ```
//! use serde_json::json;
//! use queryvisor::key::hash_query_key;
//!
//! let a = vec![json!("todos"), json!({"page": 1, "done": false})];
//! let b = vec![json!("todos"), json!({"done": false, "page": 1})];
//! assert_eq!(hash_query_key(&a), hash_query_key(&b));
//! ```

use std::sync::Arc;

use serde_json::Value;

/// Ordered sequence of values identifying one cached query.
pub type QueryKey = Vec<Value>;

/// Per-query override for the canonical hash.
pub type QueryKeyHashFn = Arc<dyn Fn(&QueryKey) -> String + Send + Sync>;

/// Hashes a key into its canonical form.
///
/// The canonical form is compact JSON with object keys emitted in sorted
/// order at every nesting level. This is the default cache key; callers may
/// override it per query via `query_key_hash_fn`.
pub fn hash_query_key(key: &QueryKey) -> String {
    let mut out = String::new();
    out.push('[');
    for (i, value) in key.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_canonical(value, &mut out);
    }
    out.push(']');
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, k) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Reuse serde_json's string escaping for the key itself.
                out.push_str(&Value::String((*k).clone()).to_string());
                out.push(':');
                write_canonical(&map[k.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Checks whether `key` matches the (possibly shorter) `filter` key.
///
/// The filter is a prefix match: every filter element must partially match
/// the corresponding key element. Objects match when every filter field is
/// present and partially matches; arrays and scalars match by equality.
pub fn partial_match_key(key: &QueryKey, filter: &QueryKey) -> bool {
    if filter.len() > key.len() {
        return false;
    }
    filter
        .iter()
        .zip(key.iter())
        .all(|(f, k)| partial_match_value(k, f))
}

fn partial_match_value(value: &Value, filter: &Value) -> bool {
    match (value, filter) {
        (Value::Object(v), Value::Object(f)) => f
            .iter()
            .all(|(name, fv)| v.get(name).is_some_and(|vv| partial_match_value(vv, fv))),
        (v, f) => v == f,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hash_is_insensitive_to_object_key_order() {
        let a = vec![json!("users"), json!({"id": 1, "tab": "posts"})];
        let b = vec![json!("users"), json!({"tab": "posts", "id": 1})];
        assert_eq!(hash_query_key(&a), hash_query_key(&b));
    }

    #[test]
    fn hash_sorts_nested_objects() {
        let a = vec![json!({"outer": {"b": 2, "a": 1}})];
        let b = vec![json!({"outer": {"a": 1, "b": 2}})];
        assert_eq!(hash_query_key(&a), hash_query_key(&b));
        assert_eq!(hash_query_key(&a), r#"[{"outer":{"a":1,"b":2}}]"#);
    }

    #[test]
    fn different_keys_hash_differently() {
        let a = vec![json!("users"), json!(1)];
        let b = vec![json!("users"), json!(2)];
        assert_ne!(hash_query_key(&a), hash_query_key(&b));
    }

    #[test]
    fn partial_match_is_prefix_based() {
        let key = vec![json!("todos"), json!({"page": 1, "done": false})];
        assert!(partial_match_key(&key, &vec![json!("todos")]));
        assert!(partial_match_key(
            &key,
            &vec![json!("todos"), json!({"page": 1})]
        ));
        assert!(!partial_match_key(
            &key,
            &vec![json!("todos"), json!({"page": 2})]
        ));
        assert!(!partial_match_key(
            &key,
            &vec![json!("todos"), json!({}), json!("extra")]
        ));
    }

    #[test]
    fn exact_match_uses_full_hash() {
        let key = vec![json!("a"), json!("b")];
        let filter = vec![json!("a")];
        assert_ne!(hash_query_key(&key), hash_query_key(&filter));
        assert!(partial_match_key(&key, &filter));
    }
}
