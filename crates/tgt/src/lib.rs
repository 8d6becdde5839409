//! Ticket-granting-ticket lifecycle for Trustgate.
//!
//! A ticket-granting ticket (TGT) is the server-side record proving that a
//! user completed authentication. Service providers and upstream identity
//! providers rely on it to avoid asking the user to log in again. This crate
//! creates, stores, refreshes and evicts those tickets on top of a
//! [`TrustMap`](trustgate_storage::TrustMap), and keeps two per-requestor
//! alias indexes alongside them.
//!
//! # Lifecycle
//!
//! ```text
//!   create_tgt ──► persist ──► ON_CREATE
//!                     │
//!        ┌────────────┴─────────────┐
//!     live│                          │expired
//!        ▼                          ▼
//!   persist ──► ON_UPDATE     persist / reaper ──► ON_REMOVE | ON_EXPIRE
//!                                         (record and aliases deleted)
//! ```
//!
//! Listeners registered on the factory observe every transition. The
//! bundled [`SingleLogoutListener`] turns ticket destruction into logout
//! requests for each requestor.
//!
//! # Quick Start
//!
//! ```
//! use std::time::Duration;
//! use trustgate_tgt::{FactoryStores, TgtFactory, TgtFactoryConfig, UserRef};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = TgtFactoryConfig::builder().ticket_ttl(Duration::from_secs(8 * 3600)).build()?;
//!     let factory = TgtFactory::new(config, FactoryStores::in_memory())?;
//!     factory.start().await?;
//!
//!     let mut ticket = factory.create_tgt(UserRef::new("alice"));
//!     factory.persist(&mut ticket).await?;
//!
//!     ticket.expire();
//!     factory.persist(&mut ticket).await?;
//!     assert_eq!(factory.size().await?, 0);
//!
//!     factory.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Clustering
//!
//! With the `replicated` backend every factory in the cluster shares the
//! ticket map and both alias maps through
//! [`ReplicatedTrustMap`](trustgate_storage::ReplicatedTrustMap). Use
//! [`TgtFactory::from_registry`] with a clustered
//! [`StoreContext`](trustgate_storage::StoreContext).
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module (recording listeners, scripted ID generator,
//!   in-memory and clustered factory builders).
//! - **`failpoints`**: Compiles the `fail` injection points used by the fault tests.

#![deny(unsafe_code)]

pub mod alias;
pub mod config;
pub mod error;
pub mod factory;
pub mod id;
pub mod listener;
pub mod logout;
pub mod metrics;
mod reaper;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;
pub mod ticket;

pub use alias::{AliasRole, AliasStore, MapAliasStore};
pub use config::{StoreConfig, TgtFactoryConfig};
pub use error::{ListenerFailures, Result, TgtError};
pub use factory::{FactoryStores, SweepReport, TgtFactory};
pub use id::{IdGenerator, SecureIdGenerator};
pub use listener::{ListenerError, ListenerRegistry, TicketEvent, TicketListener};
pub use logout::{LogoutError, LogoutNotifier, LogoutRequest, SingleLogoutListener};
pub use metrics::{FactoryMetrics, MetricsSnapshot};
pub use ticket::{AuthenticationProfile, Ticket, TicketId, UserRef};
