//! Conformance test suite for [`TrustMap`] implementations.
//!
//! Each function checks one aspect of the trait contract against a started,
//! empty map. Every backend (in-memory, replicated, or third-party) runs the
//! same suite so that the ticket factory can treat them interchangeably.
//!
//! # Usage
//!
//! Enable the `testutil` feature and call each conformance function with
//! a fresh map:
//!
//! ```no_run
//! use trustgate_storage::{MemoryTrustMap, conformance};
//!
//! #[tokio::test]
//! async fn crud_get_returns_none_for_missing_key() {
//!     conformance::crud_get_returns_none_for_missing_key(&MemoryTrustMap::new()).await;
//! }
//! ```
//!
//! # Test Categories
//!
//! | Category | Functions | Contract aspect |
//! |----------|-----------|-----------------|
//! | CRUD | 7 tests | Basic get/put/remove semantics |
//! | Scan | 4 tests | `entries` / `scan_prefix` ordering and boundaries |
//! | Concurrent | 2 tests | Thread-safety under parallel access |
//! | Lifecycle | 2 tests | Health check and idempotent removal |

use std::sync::Arc;

use bytes::Bytes;

use crate::backend::TrustMap;

// ============================================================================
// CRUD
// ============================================================================

/// `get` on a nonexistent key returns `Ok(None)`.
pub async fn crud_get_returns_none_for_missing_key<M: TrustMap>(map: &M) {
    let result = map.get("nonexistent").await;
    assert!(result.is_ok(), "get should not error on missing key: {result:?}");
    assert_eq!(result.expect("checked above"), None, "missing key should return None");
}

/// `put` then `get` round-trips the value.
pub async fn crud_put_then_get_returns_value<M: TrustMap>(map: &M) {
    map.put("k1", Bytes::from("v1")).await.expect("put should succeed");
    let val = map.get("k1").await.expect("get should succeed");
    assert_eq!(val, Some(Bytes::from("v1")));
    assert!(map.contains_key("k1").await.expect("contains_key"));
}

/// `put` on an existing key overwrites the value without growing the map.
pub async fn crud_put_overwrites_existing<M: TrustMap>(map: &M) {
    map.put("ow", Bytes::from("original")).await.expect("put");
    let before = map.size().await.expect("size");
    map.put("ow", Bytes::from("updated")).await.expect("overwrite");
    assert_eq!(map.get("ow").await.expect("get"), Some(Bytes::from("updated")));
    assert_eq!(map.size().await.expect("size"), before, "overwrite must not add an entry");
}

/// `remove` on a nonexistent key is a silent no-op.
pub async fn crud_remove_nonexistent_is_noop<M: TrustMap>(map: &M) {
    let result = map.remove("ghost").await;
    assert!(result.is_ok(), "remove of nonexistent key should not error: {result:?}");
    assert_eq!(result.expect("checked above"), None);
}

/// `remove` returns the previous value and the key is gone afterwards.
pub async fn crud_remove_returns_previous<M: TrustMap>(map: &M) {
    map.put("rm", Bytes::from("val")).await.expect("put");
    let prev = map.remove("rm").await.expect("remove");
    assert_eq!(prev, Some(Bytes::from("val")));
    assert_eq!(map.get("rm").await.expect("get after remove"), None);
    assert!(!map.contains_key("rm").await.expect("contains_key"));
}

/// A removed key can be written again.
pub async fn crud_put_after_remove<M: TrustMap>(map: &M) {
    map.put("again", Bytes::from("1")).await.expect("put");
    map.remove("again").await.expect("remove");
    map.put("again", Bytes::from("2")).await.expect("put after remove");
    assert_eq!(map.get("again").await.expect("get"), Some(Bytes::from("2")));
}

/// Empty values are valid and distinct from absence.
pub async fn crud_empty_value<M: TrustMap>(map: &M) {
    map.put("empty", Bytes::new()).await.expect("put empty value");
    assert_eq!(map.get("empty").await.expect("get"), Some(Bytes::new()));
}

// ============================================================================
// Scan
// ============================================================================

/// `size` and `entries` agree and only count live keys.
pub async fn scan_size_matches_entries<M: TrustMap>(map: &M) {
    for key in ["s:a", "s:b", "s:c"] {
        map.put(key, Bytes::from_static(b"v")).await.expect("put");
    }
    map.remove("s:b").await.expect("remove");

    let entries = map.entries().await.expect("entries");
    assert_eq!(entries.len(), map.size().await.expect("size"));
    assert!(entries.iter().all(|e| e.key != "s:b"), "removed key must not be listed");
}

/// `scan_prefix` returns results in key order.
pub async fn scan_prefix_results_are_ordered<M: TrustMap>(map: &M) {
    for key in ["p:c", "p:a", "p:b"] {
        map.put(key, Bytes::from_static(b"v")).await.expect("put");
    }
    let keys: Vec<String> =
        map.scan_prefix("p:").await.expect("scan").into_iter().map(|e| e.key).collect();
    assert_eq!(keys, vec!["p:a", "p:b", "p:c"], "scan results must be sorted");
}

/// `scan_prefix` does not leak keys that merely sort next to the prefix.
pub async fn scan_prefix_respects_boundary<M: TrustMap>(map: &M) {
    for key in ["b:x", "b:y", "b;", "bb:x", "a:x"] {
        map.put(key, Bytes::from_static(b"v")).await.expect("put");
    }
    let keys: Vec<String> =
        map.scan_prefix("b:").await.expect("scan").into_iter().map(|e| e.key).collect();
    assert_eq!(keys, vec!["b:x", "b:y"]);
}

/// `scan_prefix` with an unmatched prefix returns an empty list.
pub async fn scan_prefix_unmatched_is_empty<M: TrustMap>(map: &M) {
    map.put("present", Bytes::from_static(b"v")).await.expect("put");
    assert!(map.scan_prefix("absent:").await.expect("scan").is_empty());
}

// ============================================================================
// Concurrent
// ============================================================================

/// Concurrent puts to distinct keys all land.
pub async fn concurrent_puts_to_different_keys<M: TrustMap + 'static>(map: Arc<M>) {
    let mut handles = Vec::new();
    for i in 0..50u32 {
        let map = Arc::clone(&map);
        handles.push(tokio::spawn(async move {
            map.put(&format!("cput:{i:03}"), Bytes::from(i.to_string())).await
        }));
    }
    for handle in handles {
        handle.await.expect("task join").expect("concurrent put");
    }

    let found = map.scan_prefix("cput:").await.expect("scan");
    assert_eq!(found.len(), 50, "every concurrent put must be visible");
}

/// Concurrent reads of a stable key return the same value.
pub async fn concurrent_reads_return_consistent_value<M: TrustMap + 'static>(map: Arc<M>) {
    map.put("cread:k", Bytes::from("stable")).await.expect("put");

    let mut handles = Vec::new();
    for _ in 0..50 {
        let map = Arc::clone(&map);
        handles.push(tokio::spawn(async move {
            map.get("cread:k").await.expect("concurrent get")
        }));
    }

    for handle in handles {
        let val = handle.await.expect("task join");
        assert_eq!(val, Some(Bytes::from("stable")));
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// `health_check` succeeds on a started map.
pub async fn health_check_succeeds<M: TrustMap>(map: &M) {
    let result = map.health_check().await;
    assert!(result.is_ok(), "started map should be healthy: {result:?}");
}

/// Double remove is idempotent.
pub async fn idempotent_remove<M: TrustMap>(map: &M) {
    map.put("idem", Bytes::from_static(b"v")).await.expect("put");
    map.remove("idem").await.expect("first remove");
    assert_eq!(map.remove("idem").await.expect("second remove should be a no-op"), None);
    assert_eq!(map.get("idem").await.expect("get"), None);
}

// ============================================================================
// Convenience runner
// ============================================================================

/// Run the full conformance suite against the given map.
///
/// The map must already be started. Keys used by different checks do not
/// overlap, so one map instance can serve the whole run.
pub async fn run_all<M: TrustMap + 'static>(map: Arc<M>) {
    // CRUD
    crud_get_returns_none_for_missing_key(map.as_ref()).await;
    crud_put_then_get_returns_value(map.as_ref()).await;
    crud_put_overwrites_existing(map.as_ref()).await;
    crud_remove_nonexistent_is_noop(map.as_ref()).await;
    crud_remove_returns_previous(map.as_ref()).await;
    crud_put_after_remove(map.as_ref()).await;
    crud_empty_value(map.as_ref()).await;

    // Scan
    scan_size_matches_entries(map.as_ref()).await;
    scan_prefix_results_are_ordered(map.as_ref()).await;
    scan_prefix_respects_boundary(map.as_ref()).await;
    scan_prefix_unmatched_is_empty(map.as_ref()).await;

    // Concurrent
    concurrent_puts_to_different_keys(Arc::clone(&map)).await;
    concurrent_reads_return_consistent_value(Arc::clone(&map)).await;

    // Lifecycle
    health_check_succeeds(map.as_ref()).await;
    idempotent_remove(map.as_ref()).await;
}
