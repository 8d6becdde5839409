//! Conformance test suite for `MemoryTrustMap` and `ReplicatedTrustMap`.
//!
//! Each check runs against a fresh map of each backend. The replicated
//! variant runs on a two-member group so that every write also crosses the
//! in-process cluster hub.

#![allow(clippy::expect_used, clippy::panic)]

use std::sync::Arc;

use trustgate_storage::{
    LocalCluster, MemoryTrustMap, ReplicatedTrustMap, conformance, testutil::replicated_group,
};

async fn replicated() -> (Arc<ReplicatedTrustMap>, Vec<Arc<ReplicatedTrustMap>>) {
    let cluster = LocalCluster::new();
    let mut group = replicated_group(&cluster, "conformance", &["node-a", "node-b"]).await;
    let first = group.remove(0);
    (first, group)
}

macro_rules! conformance_tests {
    ($($name:ident),* $(,)?) => {
        mod memory {
            use super::*;
            $(
                #[tokio::test]
                async fn $name() {
                    conformance::$name(&MemoryTrustMap::new()).await;
                }
            )*
        }

        mod replicated {
            use super::*;
            $(
                #[tokio::test]
                async fn $name() {
                    let (map, _peers) = replicated().await;
                    conformance::$name(map.as_ref()).await;
                }
            )*
        }
    };
}

conformance_tests!(
    crud_get_returns_none_for_missing_key,
    crud_put_then_get_returns_value,
    crud_put_overwrites_existing,
    crud_remove_nonexistent_is_noop,
    crud_remove_returns_previous,
    crud_put_after_remove,
    crud_empty_value,
    scan_size_matches_entries,
    scan_prefix_results_are_ordered,
    scan_prefix_respects_boundary,
    scan_prefix_unmatched_is_empty,
    health_check_succeeds,
    idempotent_remove,
);

// ============================================================================
// Concurrent
// ============================================================================

#[tokio::test]
async fn memory_concurrent_puts_to_different_keys() {
    conformance::concurrent_puts_to_different_keys(Arc::new(MemoryTrustMap::new())).await;
}

#[tokio::test]
async fn memory_concurrent_reads_return_consistent_value() {
    conformance::concurrent_reads_return_consistent_value(Arc::new(MemoryTrustMap::new())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replicated_concurrent_puts_to_different_keys() {
    let (map, _peers) = replicated().await;
    conformance::concurrent_puts_to_different_keys(map).await;
}

// ============================================================================
// Full suite
// ============================================================================

#[tokio::test]
async fn run_all_memory() {
    conformance::run_all(Arc::new(MemoryTrustMap::new())).await;
}

#[tokio::test]
async fn run_all_replicated() {
    let (map, _peers) = replicated().await;
    conformance::run_all(map).await;
}
