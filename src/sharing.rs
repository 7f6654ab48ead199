//! # Structural sharing for cached payloads.
//!
//! Cached data is stored as `Arc<serde_json::Value>`. When a fetch resolves
//! with a payload deep-equal to the one already cached, the previous `Arc` is
//! kept untouched, so downstream consumers that memoize on pointer identity
//! do not re-render.

use std::sync::Arc;

use serde_json::Value;

/// Custom replacement strategy for successful fetch payloads.
pub type SharingFn = Arc<dyn Fn(Option<&Arc<Value>>, Arc<Value>) -> Arc<Value> + Send + Sync>;

/// How to merge a freshly fetched payload with the cached one.
#[derive(Clone, Default)]
pub enum StructuralSharing {
    /// Keep the previous `Arc` when the new payload is deep-equal (default).
    #[default]
    Auto,
    /// Always take the new payload as-is.
    Off,
    /// Caller-supplied replacement function.
    Custom(SharingFn),
}

impl StructuralSharing {
    pub(crate) fn apply(&self, prev: Option<&Arc<Value>>, next: Arc<Value>) -> Arc<Value> {
        match self {
            StructuralSharing::Auto => replace_data(prev, next),
            StructuralSharing::Off => next,
            StructuralSharing::Custom(f) => f(prev, next),
        }
    }
}

impl std::fmt::Debug for StructuralSharing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StructuralSharing::Auto => f.write_str("StructuralSharing::Auto"),
            StructuralSharing::Off => f.write_str("StructuralSharing::Off"),
            StructuralSharing::Custom(_) => f.write_str("StructuralSharing::Custom(..)"),
        }
    }
}

/// Returns `prev` when `next` is deep-equal to it, otherwise `next`.
pub fn replace_data(prev: Option<&Arc<Value>>, next: Arc<Value>) -> Arc<Value> {
    match prev {
        Some(p) if **p == *next => Arc::clone(p),
        _ => next,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn equal_payload_keeps_previous_identity() {
        let prev = Arc::new(json!({"id": 1, "items": [1, 2, 3]}));
        let next = Arc::new(json!({"id": 1, "items": [1, 2, 3]}));
        let merged = replace_data(Some(&prev), next);
        assert!(Arc::ptr_eq(&merged, &prev));
    }

    #[test]
    fn changed_payload_is_replaced() {
        let prev = Arc::new(json!({"id": 1}));
        let next = Arc::new(json!({"id": 2}));
        let merged = replace_data(Some(&prev), Arc::clone(&next));
        assert!(Arc::ptr_eq(&merged, &next));
    }

    #[test]
    fn sharing_off_always_replaces() {
        let prev = Arc::new(json!(1));
        let next = Arc::new(json!(1));
        let merged = StructuralSharing::Off.apply(Some(&prev), Arc::clone(&next));
        assert!(Arc::ptr_eq(&merged, &next));
    }
}
