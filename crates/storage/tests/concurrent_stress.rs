//! Concurrent access stress tests for trust maps.
//!
//! These tests exercise the maps under multi-threaded workloads to detect
//! data races, deadlocks, and replicas that fail to converge. They are
//! ignored by default:
//!
//! ```bash
//! cargo test -p trustgate-storage --test concurrent_stress -- --ignored
//! ```

#![allow(clippy::expect_used, clippy::panic)]

use std::{sync::Arc, time::Duration};

use trustgate_storage::{
    LocalCluster, MemoryTrustMap, TrustMap,
    testutil::{eventually, make_key, make_tagged_value, replicated_group},
};
use tokio::task::JoinSet;

/// Number of concurrent tasks for most tests.
const CONCURRENCY: usize = 16;

/// Number of operations each task performs.
const OPS_PER_TASK: usize = 100;

// ---------------------------------------------------------------------------
// Test: Parallel writers to the same key (last writer wins)
// ---------------------------------------------------------------------------

/// After all writers finish, the key must hold a well-formed value written by
/// one of the tasks.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn parallel_writers_same_key() {
    let map = MemoryTrustMap::new();

    let mut set = JoinSet::new();
    for task_id in 0..CONCURRENCY {
        let map = map.clone();
        set.spawn(async move {
            for i in 0..OPS_PER_TASK {
                map.put("shared-key", make_tagged_value(task_id, i)).await.expect("put");
            }
        });
    }
    while let Some(result) = set.join_next().await {
        result.expect("task should not panic");
    }

    let value = map.get("shared-key").await.expect("get").expect("key should exist");
    let s = String::from_utf8(value.to_vec()).expect("value should be valid utf-8");
    assert!(s.starts_with("task"), "value should be from one of the writer tasks, got: {s}");
}

// ---------------------------------------------------------------------------
// Test: Mixed workload across a replicated group
// ---------------------------------------------------------------------------

/// Every member writes and removes its own keys while scanning shared ones.
/// Once traffic stops all replicas must hold the same entries.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn replicated_mixed_workload_converges() {
    let cluster = LocalCluster::new();
    let nodes = replicated_group(&cluster, "stress", &["a", "b", "c", "d"]).await;

    let mut set = JoinSet::new();
    for (task_id, node) in nodes.iter().cycle().take(CONCURRENCY).enumerate() {
        let node = Arc::clone(node);
        set.spawn(async move {
            for i in 0..OPS_PER_TASK {
                let key = make_key(&format!("t{task_id}"), i);
                match i % 4 {
                    0 | 1 => node.put(&key, make_tagged_value(task_id, i)).await.map(|_| ()),
                    2 => node.remove(&make_key(&format!("t{task_id}"), i - 1)).await.map(|_| ()),
                    _ => node.scan_prefix("t").await.map(|_| ()),
                }
                .expect("operation should succeed");
            }
        });
    }
    while let Some(result) = set.join_next().await {
        result.expect("task should not panic");
    }

    let nodes = &nodes;
    let converged = eventually(Duration::from_secs(5), move || async move {
        let reference = nodes[0].entries().await.expect("entries");
        for node in &nodes[1..] {
            if node.entries().await.expect("entries") != reference {
                return false;
            }
        }
        true
    })
    .await;
    assert!(converged, "replicas did not converge after the workload");
}
