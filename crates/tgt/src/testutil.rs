//! Shared test utilities for ticket factory testing.
//!
//! Recording and failing listeners, a scripted ID generator for collision
//! tests, and builders for in-memory and clustered factories. Feature-gated
//! behind `testutil`.
//!
//! ```toml
//! [dev-dependencies]
//! trustgate-tgt = { path = "../tgt", features = ["testutil"] }
//! ```

use std::{collections::VecDeque, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use trustgate_storage::{
    BackendRegistry, LocalCluster, REPLICATED_BACKEND, StoreContext, testutil::fast_replication,
};

use crate::{
    config::{StoreConfig, TgtFactoryConfig},
    factory::{FactoryStores, TgtFactory},
    id::IdGenerator,
    listener::{ListenerError, TicketEvent, TicketListener},
    ticket::{Ticket, TicketId},
};

/// Listener that records every event it receives.
#[derive(Debug, Default)]
pub struct CountingListener {
    events: Mutex<Vec<(TicketEvent, Option<TicketId>)>>,
}

impl CountingListener {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Events received so far, in order.
    #[must_use]
    pub fn events(&self) -> Vec<(TicketEvent, Option<TicketId>)> {
        self.events.lock().clone()
    }

    /// Number of times `event` was received.
    #[must_use]
    pub fn count(&self, event: TicketEvent) -> usize {
        self.events.lock().iter().filter(|(e, _)| *e == event).count()
    }

    /// Number of times `event` was received for `id`.
    #[must_use]
    pub fn count_for(&self, event: TicketEvent, id: &TicketId) -> usize {
        self.events.lock().iter().filter(|(e, t)| *e == event && t.as_ref() == Some(id)).count()
    }

    /// Forgets everything recorded.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl TicketListener for CountingListener {
    fn name(&self) -> &str {
        "counting"
    }

    async fn process_ticket_event(
        &self,
        event: TicketEvent,
        ticket: &Ticket,
    ) -> Result<(), ListenerError> {
        self.events.lock().push((event, ticket.id().cloned()));
        Ok(())
    }
}

/// Listener that fails every event with code `always_fails`.
#[derive(Debug, Default)]
pub struct FailingListener;

#[async_trait]
impl TicketListener for FailingListener {
    fn name(&self) -> &str {
        "failing"
    }

    async fn process_ticket_event(
        &self,
        event: TicketEvent,
        _ticket: &Ticket,
    ) -> Result<(), ListenerError> {
        Err(ListenerError::new(event, "always_fails", "injected failure"))
    }
}

/// ID generator replaying a fixed script; the last ID repeats forever.
#[derive(Debug)]
pub struct ScriptedIdGenerator {
    script: Mutex<VecDeque<TicketId>>,
    last: TicketId,
}

impl ScriptedIdGenerator {
    /// Creates a generator yielding `ids` in order.
    ///
    /// # Panics
    ///
    /// Panics if `ids` is empty.
    #[must_use]
    pub fn new(ids: &[&str]) -> Arc<Self> {
        let last = TicketId::from(*ids.last().expect("script needs at least one ID"));
        let script = ids.iter().map(|id| TicketId::from(*id)).collect();
        Arc::new(Self { script: Mutex::new(script), last })
    }
}

impl IdGenerator for ScriptedIdGenerator {
    fn generate(&self) -> TicketId {
        self.script.lock().pop_front().unwrap_or_else(|| self.last.clone())
    }
}

/// Validated configuration with the given TTL and defaults elsewhere.
///
/// # Panics
///
/// Panics if `ttl` is zero.
#[must_use]
pub fn test_config(ttl: Duration) -> TgtFactoryConfig {
    TgtFactoryConfig::builder().ticket_ttl(ttl).build().expect("invalid test config")
}

/// Unstarted factory over fresh in-memory stores.
///
/// # Panics
///
/// Panics if `config` is invalid.
#[must_use]
pub fn memory_factory(config: TgtFactoryConfig) -> TgtFactory {
    TgtFactory::new(config, FactoryStores::in_memory()).expect("factory construction failed")
}

/// Factory on `member` of `cluster`, using the replicated backend.
///
/// `group_prefix` namespaces the three groups so tests sharing a cluster do
/// not see each other's maps.
///
/// # Panics
///
/// Panics if the factory cannot be built.
#[must_use]
pub fn clustered_factory(
    cluster: &LocalCluster,
    member: &str,
    group_prefix: &str,
    config: TgtFactoryConfig,
) -> TgtFactory {
    let store = StoreConfig {
        backend: REPLICATED_BACKEND.to_owned(),
        ticket_group: format!("{group_prefix}.tgt"),
        sp_alias_group: format!("{group_prefix}.alias.sp"),
        idp_alias_group: format!("{group_prefix}.alias.idp"),
    };
    let ctx = StoreContext::clustered(Arc::new(cluster.member(member)), fast_replication());
    let config = TgtFactoryConfig { store, ..config };
    TgtFactory::from_registry(config, &BackendRegistry::default(), &ctx)
        .expect("clustered factory construction failed")
}

/// Starts one clustered factory per member, in order.
///
/// # Panics
///
/// Panics if any factory fails to start.
pub async fn clustered_factories(
    cluster: &LocalCluster,
    group_prefix: &str,
    members: &[&str],
    config: &TgtFactoryConfig,
) -> Vec<TgtFactory> {
    let mut factories = Vec::with_capacity(members.len());
    for member in members {
        let factory = clustered_factory(cluster, member, group_prefix, config.clone());
        factory.start().await.expect("clustered factory failed to start");
        factories.push(factory);
    }
    factories
}
