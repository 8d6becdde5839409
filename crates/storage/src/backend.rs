//! Trust map trait definition.
//!
//! This module defines the [`TrustMap`] trait, the keyed store that holds
//! ticket records and alias entries. All implementations
//! ([`MemoryTrustMap`](crate::MemoryTrustMap),
//! [`ReplicatedTrustMap`](crate::ReplicatedTrustMap)) satisfy the same
//! contract, which is exercised by the [`conformance`](crate::conformance)
//! suite.
//!
//! # Design Philosophy
//!
//! - **Keys are strings, values are bytes**: ticket IDs are already URL-safe text, and the map
//!   makes no assumption about the value encoding
//! - **Async by default**: replicated implementations hand writes to a group channel
//! - **Snapshot iteration**: [`entries`](TrustMap::entries) returns an owned snapshot so callers
//!   never hold the map's lock while they process results
//!
//! Domain logic (ticket expiry, alias indexing) lives in the layer built on
//! top of this trait, not in the maps.

use async_trait::async_trait;
use bytes::Bytes;

use crate::{error::StorageResult, types::Entry};

/// Keyed store of trust records.
///
/// Implementations are expected to be thread-safe (`Send + Sync`) and to make
/// every single-key operation atomic on the local node. Cross-node
/// visibility is eventual: a `put` on one member becomes visible to `get` on
/// another member after the replication transport delivers it.
///
/// # Key Operations
///
/// | Method | Description |
/// |--------|-------------|
/// | [`get`](TrustMap::get) | Retrieve a single value by key |
/// | [`put`](TrustMap::put) | Store or overwrite a value |
/// | [`remove`](TrustMap::remove) | Remove a key, returning its previous value |
/// | [`contains_key`](TrustMap::contains_key) | Presence check |
/// | [`size`](TrustMap::size) | Number of live keys in the local view |
/// | [`entries`](TrustMap::entries) | Snapshot of all live entries |
/// | [`scan_prefix`](TrustMap::scan_prefix) | Snapshot of entries sharing a key prefix |
/// | [`start`](TrustMap::start) / [`stop`](TrustMap::stop) | Lifecycle |
///
/// # Example
///
/// ```
/// use bytes::Bytes;
/// use trustgate_storage::{MemoryTrustMap, TrustMap};
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let map = MemoryTrustMap::new();
///
/// map.put("ticket-1", Bytes::from("record")).await.unwrap();
/// assert_eq!(map.get("ticket-1").await.unwrap(), Some(Bytes::from("record")));
/// # });
/// ```
#[async_trait]
pub trait TrustMap: Send + Sync {
    /// Retrieves a value by key.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(bytes))` if the key exists
    /// - `Ok(None)` if the key doesn't exist (or has not been replicated here yet)
    /// - `Err(...)` on storage errors
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get(&self, key: &str) -> StorageResult<Option<Bytes>>;

    /// Stores a key-value pair, overwriting any existing value.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn put(&self, key: &str, value: Bytes) -> StorageResult<()>;

    /// Removes a key.
    ///
    /// Removing an absent key is a no-op that returns `Ok(None)`.
    ///
    /// # Returns
    ///
    /// The value that was removed, if any.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn remove(&self, key: &str) -> StorageResult<Option<Bytes>>;

    /// Returns `true` if the key is present in the local view.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn contains_key(&self, key: &str) -> StorageResult<bool>;

    /// Returns the number of live keys in the local view.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn size(&self) -> StorageResult<usize>;

    /// Returns a snapshot of all live entries, ordered by key.
    ///
    /// The snapshot is taken under a short read lock and released before
    /// returning, so callers may interleave writes while iterating.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn entries(&self) -> StorageResult<Vec<Entry>>;

    /// Returns a snapshot of live entries whose key starts with `prefix`,
    /// ordered by key.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn scan_prefix(&self, prefix: &str) -> StorageResult<Vec<Entry>>;

    /// Brings the map into service.
    ///
    /// Replicated implementations join their process group here and block
    /// until the initial state transfer has completed (or the join timeout
    /// elapses). The default implementation does nothing.
    async fn start(&self) -> StorageResult<()> {
        Ok(())
    }

    /// Takes the map out of service, releasing any cluster membership.
    ///
    /// Calling `stop` more than once is a no-op.
    async fn stop(&self) -> StorageResult<()> {
        Ok(())
    }

    /// Verifies the map is able to serve requests.
    #[must_use = "health check results indicate availability and must be inspected"]
    async fn health_check(&self) -> StorageResult<()>;
}

#[async_trait]
impl<M: TrustMap + ?Sized> TrustMap for std::sync::Arc<M> {
    async fn get(&self, key: &str) -> StorageResult<Option<Bytes>> {
        (**self).get(key).await
    }

    async fn put(&self, key: &str, value: Bytes) -> StorageResult<()> {
        (**self).put(key, value).await
    }

    async fn remove(&self, key: &str) -> StorageResult<Option<Bytes>> {
        (**self).remove(key).await
    }

    async fn contains_key(&self, key: &str) -> StorageResult<bool> {
        (**self).contains_key(key).await
    }

    async fn size(&self) -> StorageResult<usize> {
        (**self).size().await
    }

    async fn entries(&self) -> StorageResult<Vec<Entry>> {
        (**self).entries().await
    }

    async fn scan_prefix(&self, prefix: &str) -> StorageResult<Vec<Entry>> {
        (**self).scan_prefix(prefix).await
    }

    async fn start(&self) -> StorageResult<()> {
        (**self).start().await
    }

    async fn stop(&self) -> StorageResult<()> {
        (**self).stop().await
    }

    async fn health_check(&self) -> StorageResult<()> {
        (**self).health_check().await
    }
}
