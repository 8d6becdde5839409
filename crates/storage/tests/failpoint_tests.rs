#![allow(clippy::expect_used, clippy::panic)]
//! Integration tests for fail-point injection.
//!
//! These tests require the `failpoints` feature:
//! ```bash
//! cargo test -p trustgate-storage --features failpoints --test failpoint_tests
//! ```

#![cfg(feature = "failpoints")]

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use trustgate_storage::{
    LocalCluster, ReplicatedMapConfig, ReplicatedTrustMap, TrustMap,
    testutil::{fast_replication, replicated_group, wait_for_value},
};

#[tokio::test]
async fn suppressed_broadcast_keeps_write_local() {
    let scenario = fail::FailScenario::setup();
    let cluster = LocalCluster::new();
    // Anti-entropy far beyond the test's horizon.
    let config =
        ReplicatedMapConfig { sync_interval: Duration::from_secs(20), ..fast_replication() };
    let a = ReplicatedTrustMap::new("fp", Arc::new(cluster.member("a")), config.clone());
    let b = ReplicatedTrustMap::new("fp", Arc::new(cluster.member("b")), config);
    a.start().await.expect("start a");
    b.start().await.expect("start b");

    fail::cfg("replicated-before-broadcast", "return").expect("failed to configure fail point");
    a.put("k", Bytes::from("v")).await.expect("local write must still succeed");

    assert_eq!(a.get("k").await.expect("get"), Some(Bytes::from("v")));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(b.get("k").await.expect("get"), None, "broadcast should have been dropped");

    scenario.teardown();
}

#[tokio::test]
async fn suppressed_broadcast_is_repaired_by_anti_entropy() {
    let scenario = fail::FailScenario::setup();
    let cluster = LocalCluster::new();
    let nodes = replicated_group(&cluster, "fp-sync", &["a", "b"]).await;

    fail::cfg("replicated-before-broadcast", "return").expect("failed to configure fail point");
    nodes[0].put("k", Bytes::from("v")).await.expect("put");
    nodes[0].remove("k").await.expect("remove");
    nodes[0].put("other", Bytes::from("w")).await.expect("put");

    assert!(wait_for_value(nodes[1].as_ref(), "other", Some(Bytes::from("w"))).await);
    assert_eq!(nodes[1].get("k").await.expect("get"), None);
    assert_eq!(nodes[1].tombstone_count(), 1, "removal arrives as a tombstone");

    scenario.teardown();
}

#[tokio::test]
async fn broadcast_without_failpoint_replicates() {
    let scenario = fail::FailScenario::setup();
    // No fail point configured; the write should reach the peer.

    let cluster = LocalCluster::new();
    let nodes = replicated_group(&cluster, "fp-ok", &["a", "b"]).await;
    nodes[0].put("k", Bytes::from("v")).await.expect("put");
    assert!(wait_for_value(nodes[1].as_ref(), "k", Some(Bytes::from("v"))).await);

    scenario.teardown();
}
