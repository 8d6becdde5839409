//! Replicated trust store abstraction for Trustgate services.
//!
//! This crate provides the [`TrustMap`] trait, a string-keyed byte map that
//! the ticket factory and its alias indexes are built on, together with an
//! in-process implementation and a cluster-replicated one.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Ticket Factory                          │
//! │        (create, persist, retrieve, clean, sweep)            │
//! ├─────────────────────────────────────────────────────────────┤
//! │              Ticket store │ Alias stores                    │
//! │         (serialization, key layout, indexing)               │
//! ├─────────────────────────────────────────────────────────────┤
//! │                  trustgate-storage                          │
//! │                    TrustMap trait                           │
//! │       (get, put, remove, entries, scan_prefix)              │
//! ├────────────────┬────────────────────────────────────────────┤
//! │ MemoryTrustMap │           ReplicatedTrustMap               │
//! │  (single node) │   (last-writer-wins over a process group)  │
//! └────────────────┴────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use bytes::Bytes;
//! use trustgate_storage::{MemoryTrustMap, TrustMap};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let map = MemoryTrustMap::new();
//!     map.start().await?;
//!
//!     map.put("ticket.abc", Bytes::from("{}")).await?;
//!     assert!(map.contains_key("ticket.abc").await?);
//!
//!     map.remove("ticket.abc").await?;
//!     assert_eq!(map.size().await?, 0);
//!     Ok(())
//! }
//! ```
//!
//! # Available Backends
//!
//! | Backend | Registry key | Use Case |
//! |---------|--------------|----------|
//! | [`MemoryTrustMap`] | `memory` | Tests, single-node deployments |
//! | [`ReplicatedTrustMap`] | `replicated` | Clustered deployments |
//!
//! Backends are chosen at runtime through the [`BackendRegistry`].
//!
//! # Error Handling
//!
//! All map operations return [`StorageResult<T>`]. Backend resolution
//! failures are reported separately as [`ConfigError`] because they are
//! fatal at startup.
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` and `conformance` modules with shared test helpers
//!   (key/value generators, replicated group fixtures, the trait conformance suite).
//! - **`failpoints`**: Compiles the `fail` injection points used by the fault tests.

#![deny(unsafe_code)]

pub mod backend;
pub mod cluster;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::panic)]
pub mod conformance;
pub mod error;
pub mod memory;
pub mod registry;
pub mod replicated;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;
pub mod types;

// Re-export primary types at crate root for convenience
pub use backend::TrustMap;
pub use cluster::{ClusterMembership, LocalCluster};
pub use error::{BoxError, ConfigError, StorageError, StorageResult};
pub use memory::MemoryTrustMap;
pub use registry::{BackendRegistry, MEMORY_BACKEND, REPLICATED_BACKEND, StoreContext};
pub use replicated::{ReplicatedMapConfig, ReplicatedTrustMap};
pub use types::{Entry, MemberId};
