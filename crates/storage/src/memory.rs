//! In-memory trust map implementation.
//!
//! This module provides [`MemoryTrustMap`], a single-node implementation of
//! [`TrustMap`] suitable for unit tests, development, and single-instance
//! deployments.
//!
//! # Features
//!
//! - **Thread-safe**: Uses [`parking_lot::RwLock`] for concurrent access
//! - **Ordered storage**: Keys are stored in a [`BTreeMap`] for cheap prefix scans
//! - **Shared clones**: Clones share the same underlying data
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use trustgate_storage::{MemoryTrustMap, TrustMap};
//!
//! #[tokio::main]
//! async fn main() {
//!     let map = MemoryTrustMap::new();
//!
//!     map.put("greeting", Bytes::from("hello")).await.unwrap();
//!     let value = map.get("greeting").await.unwrap();
//!
//!     assert_eq!(value.unwrap().as_ref(), b"hello");
//! }
//! ```
//!
//! # Limitations
//!
//! - Data is not persisted; all data is lost when the process exits
//! - No replication; use [`ReplicatedTrustMap`](crate::ReplicatedTrustMap) for clusters

use std::{collections::BTreeMap, ops::Bound, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use crate::{backend::TrustMap, error::StorageResult, types::Entry};

/// In-memory trust map using [`BTreeMap`].
///
/// # Cloning
///
/// `MemoryTrustMap` is cheaply cloneable via [`Arc`]. All clones share the
/// same underlying data, which lets tests hand one map to several
/// simulated components.
#[derive(Clone, Default)]
pub struct MemoryTrustMap {
    data: Arc<RwLock<BTreeMap<String, Bytes>>>,
}

impl MemoryTrustMap {
    /// Creates a new, empty in-memory trust map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for MemoryTrustMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTrustMap").field("len", &self.data.read().len()).finish()
    }
}

/// Returns the entries of `data` whose keys start with `prefix`.
pub(crate) fn prefix_range<'a, V>(
    data: &'a BTreeMap<String, V>,
    prefix: &'a str,
) -> impl Iterator<Item = (&'a String, &'a V)> + 'a {
    data.range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
        .take_while(move |(k, _)| k.starts_with(prefix))
}

#[async_trait]
impl TrustMap for MemoryTrustMap {
    #[tracing::instrument(level = "trace", skip(self))]
    async fn get(&self, key: &str) -> StorageResult<Option<Bytes>> {
        Ok(self.data.read().get(key).cloned())
    }

    #[tracing::instrument(level = "trace", skip(self, value), fields(value_len = value.len()))]
    async fn put(&self, key: &str, value: Bytes) -> StorageResult<()> {
        self.data.write().insert(key.to_owned(), value);
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn remove(&self, key: &str) -> StorageResult<Option<Bytes>> {
        Ok(self.data.write().remove(key))
    }

    async fn contains_key(&self, key: &str) -> StorageResult<bool> {
        Ok(self.data.read().contains_key(key))
    }

    async fn size(&self) -> StorageResult<usize> {
        Ok(self.data.read().len())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn entries(&self) -> StorageResult<Vec<Entry>> {
        let data = self.data.read();
        Ok(data.iter().map(|(k, v)| Entry::new(k.clone(), v.clone())).collect())
    }

    async fn scan_prefix(&self, prefix: &str) -> StorageResult<Vec<Entry>> {
        let data = self.data.read();
        Ok(prefix_range(&data, prefix).map(|(k, v)| Entry::new(k.clone(), v.clone())).collect())
    }

    async fn health_check(&self) -> StorageResult<()> {
        // Acquiring the read lock proves we're not deadlocked.
        let _unused = self.data.read();
        Ok(())
    }
}
