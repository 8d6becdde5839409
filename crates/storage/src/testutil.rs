//! Shared test utilities for trust map testing.
//!
//! This module provides helpers for generating test data, starting
//! replicated maps on an in-process [`LocalCluster`], and waiting for
//! replication to converge. It is feature-gated behind `testutil` to keep it
//! out of production builds.
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! trustgate-storage = { path = "../storage", features = ["testutil"] }
//! ```
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use trustgate_storage::testutil::{make_key, replicated_group};
//! ```

use std::{sync::Arc, time::Duration};

use bytes::Bytes;

use crate::{
    backend::TrustMap,
    cluster::LocalCluster,
    replicated::{ReplicatedMapConfig, ReplicatedTrustMap},
};

/// Create a deterministic test key from a prefix and index.
///
/// Produces keys like `"prefix:000042"`. The zero-padding keeps
/// lexicographic order equal to numeric order.
#[must_use]
pub fn make_key(prefix: &str, idx: usize) -> String {
    format!("{prefix}:{idx:06}")
}

/// Create a test value tagged with a task ID and sequence number.
///
/// Produces values like `"task3-val042"`, which lets concurrent tests tell
/// which task wrote which value.
#[must_use]
pub fn make_tagged_value(task: usize, seq: usize) -> Bytes {
    Bytes::from(format!("task{task}-val{seq}"))
}

/// Replication settings tuned for tests: short join timeout, short tombstone
/// TTL, anti-entropy every 50ms.
#[must_use]
pub fn fast_replication() -> ReplicatedMapConfig {
    ReplicatedMapConfig {
        join_timeout: Duration::from_secs(2),
        tombstone_ttl: Duration::from_secs(30),
        sync_interval: Duration::from_millis(50),
    }
}

/// Starts one replicated map per member id, in order, on `group`.
///
/// Each map joins after the previous one finished its state transfer.
///
/// # Panics
///
/// Panics if any member fails to start.
pub async fn replicated_group(
    cluster: &LocalCluster,
    group: &str,
    members: &[&str],
) -> Vec<Arc<ReplicatedTrustMap>> {
    let mut maps = Vec::with_capacity(members.len());
    for id in members {
        let map = Arc::new(ReplicatedTrustMap::new(
            group,
            Arc::new(cluster.member(*id)),
            fast_replication(),
        ));
        map.start().await.expect("replicated map failed to start");
        maps.push(map);
    }
    maps
}

/// Polls `check` until it returns `true` or `within` elapses.
///
/// Returns whether the condition was observed.
pub async fn eventually<F, Fut>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Waits until `key` has `expected` on `map`.
pub async fn wait_for_value<M: TrustMap + ?Sized>(
    map: &M,
    key: &str,
    expected: Option<Bytes>,
) -> bool {
    eventually(Duration::from_secs(2), move || {
        let expected = expected.clone();
        async move { map.get(key).await.ok() == Some(expected) }
    })
    .await
}
