//! Backend registry for runtime selection of trust map implementations.
//!
//! Configuration names a backend by key (for example `"memory"` or
//! `"replicated"`); the [`BackendRegistry`] maps that key to a statically
//! known constructor. Adding a backend means registering one more function,
//! not loading anything by name at runtime.
//!
//! # Available Backends
//!
//! | Key | Implementation | Needs cluster |
//! |-----|----------------|---------------|
//! | `memory` | [`MemoryTrustMap`] | No |
//! | `replicated` | [`ReplicatedTrustMap`] | Yes |
//!
//! # Usage
//!
//! ```
//! use trustgate_storage::registry::{BackendRegistry, StoreContext};
//!
//! let registry = BackendRegistry::default();
//! let map = registry.build("memory", "tickets", &StoreContext::default())?;
//! # Ok::<(), trustgate_storage::ConfigError>(())
//! ```

use std::{collections::BTreeMap, sync::Arc};

use crate::{
    backend::TrustMap,
    cluster::ClusterMembership,
    error::ConfigError,
    memory::MemoryTrustMap,
    replicated::{ReplicatedMapConfig, ReplicatedTrustMap},
};

/// Key of the in-process backend.
pub const MEMORY_BACKEND: &str = "memory";

/// Key of the cluster-replicated backend.
pub const REPLICATED_BACKEND: &str = "replicated";

/// Collaborators handed to backend constructors.
#[derive(Clone, Default)]
pub struct StoreContext {
    /// Cluster membership for replicated backends.
    pub cluster: Option<Arc<dyn ClusterMembership>>,
    /// Settings for replicated backends.
    pub replication: ReplicatedMapConfig,
}

impl StoreContext {
    /// Context for a clustered deployment.
    pub fn clustered(
        cluster: Arc<dyn ClusterMembership>,
        replication: ReplicatedMapConfig,
    ) -> Self {
        Self { cluster: Some(cluster), replication }
    }
}

impl std::fmt::Debug for StoreContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreContext")
            .field("cluster", &self.cluster.as_ref().map(|c| c.member_id().to_string()))
            .field("replication", &self.replication)
            .finish()
    }
}

/// Constructor for one trust map backend.
///
/// Receives the process group name the map is bound to and the shared
/// [`StoreContext`].
pub type MapConstructor = fn(&str, &StoreContext) -> Result<Arc<dyn TrustMap>, ConfigError>;

fn build_memory(_group: &str, _ctx: &StoreContext) -> Result<Arc<dyn TrustMap>, ConfigError> {
    Ok(Arc::new(MemoryTrustMap::new()))
}

fn build_replicated(group: &str, ctx: &StoreContext) -> Result<Arc<dyn TrustMap>, ConfigError> {
    let cluster = ctx
        .cluster
        .clone()
        .ok_or_else(|| ConfigError::MissingCluster { backend: REPLICATED_BACKEND.to_owned() })?;
    if ctx.replication.join_timeout.is_zero() {
        return Err(ConfigError::invalid("join_timeout", "must be greater than zero"));
    }
    if ctx.replication.tombstone_ttl.is_zero() {
        return Err(ConfigError::invalid("tombstone_ttl", "must be greater than zero"));
    }
    if ctx.replication.sync_interval.is_zero() {
        return Err(ConfigError::invalid("sync_interval", "must be greater than zero"));
    }
    if ctx.replication.sync_interval >= ctx.replication.tombstone_ttl {
        return Err(ConfigError::invalid("sync_interval", "must be shorter than tombstone_ttl"));
    }
    Ok(Arc::new(ReplicatedTrustMap::new(group, cluster, ctx.replication.clone())))
}

/// Maps backend keys to constructors.
#[derive(Clone, Debug)]
pub struct BackendRegistry {
    constructors: BTreeMap<String, MapConstructor>,
}

impl Default for BackendRegistry {
    /// Registry with the `memory` and `replicated` backends.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(MEMORY_BACKEND, build_memory);
        registry.register(REPLICATED_BACKEND, build_replicated);
        registry
    }
}

impl BackendRegistry {
    /// Registry with no backends.
    #[must_use]
    pub fn empty() -> Self {
        Self { constructors: BTreeMap::new() }
    }

    /// Registers `constructor` under `key`, returning any constructor it replaced.
    pub fn register(
        &mut self,
        key: impl Into<String>,
        constructor: MapConstructor,
    ) -> Option<MapConstructor> {
        self.constructors.insert(key.into(), constructor)
    }

    /// Returns `true` if a backend is registered under `key`.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.constructors.contains_key(key)
    }

    /// Registered backend keys, sorted.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    /// Builds the backend registered under `key`, bound to `group`.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::UnknownBackend`] if nothing is registered under `key`
    /// - whatever the constructor reports, e.g. [`ConfigError::MissingCluster`]
    pub fn build(
        &self,
        key: &str,
        group: &str,
        ctx: &StoreContext,
    ) -> Result<Arc<dyn TrustMap>, ConfigError> {
        let constructor =
            self.constructors.get(key).ok_or_else(|| ConfigError::UnknownBackend(key.to_owned()))?;
        constructor(group, ctx)
    }
}
