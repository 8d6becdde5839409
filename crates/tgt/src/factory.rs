//! Ticket factory.
//!
//! [`TgtFactory`] owns the ticket map and both alias stores. It creates
//! tickets, allocates their IDs, persists caller copies back into the map,
//! evicts expired tickets and tells listeners about every transition.
//!
//! # Persisting
//!
//! [`persist`](TgtFactory::persist) branches on the ticket it is handed:
//!
//! | Ticket state          | Map mutation                         | Event              |
//! |-----------------------|--------------------------------------|--------------------|
//! | no ID                 | allocate ID, set expiration, insert  | `Create`           |
//! | ID, logically expired | remove, then delete its aliases      | `Remove`/`Expire`  |
//! | ID, live              | refresh expiration, write through    | `Update`           |
//!
//! An expired ticket reports `Remove` when [`Ticket::expire`] was called on
//! the copy (explicit logout) and `Expire` otherwise. Without the logout mark
//! the stored record decides: a copy that timed out while another copy
//! refreshed the ticket leaves the map untouched. Listener failures surface
//! as [`TgtError::Listeners`] after the mutation has taken effect.
//!
//! # Concurrency
//!
//! Read-modify-write sequences on one ticket are serialized by a striped
//! per-key lock. New-ticket allocation (capacity check, collision check and
//! insert) is serialized by a separate allocation lock. Cross-node ID
//! uniqueness relies on ID randomness.

use std::{
    collections::hash_map::DefaultHasher,
    fmt,
    hash::{Hash, Hasher},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use trustgate_storage::{BackendRegistry, MemoryTrustMap, StorageError, StoreContext, TrustMap};

use crate::{
    alias::{AliasRole, AliasStore, MapAliasStore},
    config::TgtFactoryConfig,
    error::{ListenerFailures, Result, TgtError},
    id::{IdGenerator, SecureIdGenerator},
    listener::{ListenerError, ListenerRegistry, TicketEvent, TicketListener},
    metrics::{FactoryMetrics, MetricsSnapshot},
    reaper::{self, ReaperHandle},
    ticket::{Ticket, TicketId, UserRef},
};

const KEY_LOCK_STRIPES: usize = 64;

/// Maps owned by a factory.
#[derive(Clone)]
pub struct FactoryStores {
    /// Ticket ID → encoded ticket record.
    pub tickets: Arc<dyn TrustMap>,
    /// Aliases handed to service providers.
    pub sp_aliases: Arc<dyn AliasStore>,
    /// Aliases received from identity providers.
    pub idp_aliases: Arc<dyn AliasStore>,
}

impl FactoryStores {
    /// Stores backed by fresh in-memory maps.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            tickets: Arc::new(MemoryTrustMap::new()),
            sp_aliases: Arc::new(MapAliasStore::in_memory(AliasRole::ServiceProvider)),
            idp_aliases: Arc::new(MapAliasStore::in_memory(AliasRole::IdentityProvider)),
        }
    }

    /// Stores over three separate maps.
    #[must_use]
    pub fn from_maps(
        tickets: Arc<dyn TrustMap>,
        sp_aliases: Arc<dyn TrustMap>,
        idp_aliases: Arc<dyn TrustMap>,
    ) -> Self {
        Self {
            tickets,
            sp_aliases: Arc::new(MapAliasStore::new(AliasRole::ServiceProvider, sp_aliases)),
            idp_aliases: Arc::new(MapAliasStore::new(AliasRole::IdentityProvider, idp_aliases)),
        }
    }
}

impl fmt::Debug for FactoryStores {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactoryStores").finish_non_exhaustive()
    }
}

/// Outcome of one [`TgtFactory::sweep_expired`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Records examined.
    pub scanned: usize,
    /// Tickets removed as expired.
    pub expired: usize,
    /// Records skipped because they could not be decoded.
    pub skipped: usize,
    /// Listener failures logged during the pass.
    pub listener_failures: usize,
}

/// Striped async locks keyed by ticket ID.
struct KeyLocks {
    stripes: Vec<Mutex<()>>,
}

impl KeyLocks {
    fn new(stripes: usize) -> Self {
        Self { stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect() }
    }

    async fn lock(&self, id: &TicketId) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        let stripe = (hasher.finish() % self.stripes.len() as u64) as usize;
        self.stripes[stripe].lock().await
    }
}

/// Shared factory state. The reaper holds a weak reference to it.
pub(crate) struct FactoryInner {
    config: TgtFactoryConfig,
    stores: FactoryStores,
    id_generator: parking_lot::RwLock<Arc<dyn IdGenerator>>,
    listeners: ListenerRegistry,
    metrics: FactoryMetrics,
    key_locks: KeyLocks,
    allocation: Mutex<()>,
    started: AtomicBool,
    reaper: parking_lot::Mutex<Option<ReaperHandle>>,
}

impl Drop for FactoryInner {
    fn drop(&mut self) {
        if let Some(reaper) = self.reaper.get_mut().take() {
            reaper.cancel();
        }
    }
}

impl FactoryInner {
    fn tickets(&self) -> &dyn TrustMap {
        self.stores.tickets.as_ref()
    }

    /// Applies the map mutation for `ticket` and returns the event it implies.
    async fn write(&self, ticket: &mut Ticket) -> Result<Option<TicketEvent>> {
        let Some(id) = ticket.id().cloned() else {
            self.insert_new(ticket).await?;
            return Ok(Some(TicketEvent::Create));
        };

        let _guard = self.key_locks.lock(&id).await;
        let now = Utc::now();

        if ticket.is_expired_at(now) {
            let event = if ticket.is_logout_requested() {
                self.tickets().remove(id.as_str()).await?;
                self.metrics.record_removed();
                TicketEvent::Remove
            } else {
                // The caller's copy may predate a refresh made through another copy.
                if !self.stored_is_expired(&id, now).await? {
                    debug!(ticket_id = %id, "stale copy expired, stored ticket kept");
                    return Ok(None);
                }
                self.tickets().remove(id.as_str()).await?;
                self.metrics.record_expired();
                TicketEvent::Expire
            };
            debug!(ticket_id = %id, %event, "ticket destroyed");
            return Ok(Some(event));
        }

        if !self.tickets().contains_key(id.as_str()).await? {
            // Removed elsewhere; writing would resurrect it.
            debug!(ticket_id = %id, "ticket no longer stored, update skipped");
            return Ok(None);
        }

        ticket.extend_expiration(self.config.expiration_from(now));
        self.tickets().put(id.as_str(), ticket.encode()?).await?;
        self.metrics.record_updated();
        Ok(Some(TicketEvent::Update))
    }

    /// Returns `true` if the stored record of `id` exists and is expired at `now`.
    async fn stored_is_expired(&self, id: &TicketId, now: DateTime<Utc>) -> Result<bool> {
        match self.tickets().get(id.as_str()).await? {
            Some(record) => Ok(Ticket::decode(&record)?.is_expired_at(now)),
            None => Ok(false),
        }
    }

    async fn insert_new(&self, ticket: &mut Ticket) -> Result<()> {
        let _allocation = self.allocation.lock().await;

        if let Some(max) = self.config.max_tickets {
            if self.tickets().size().await? >= max {
                self.metrics.record_capacity_rejection();
                warn!(max, "ticket capacity exceeded");
                return Err(TgtError::CapacityExceeded { max });
            }
        }

        let id = self.allocate_id().await?;
        ticket.assign_id(id.clone());
        ticket.extend_expiration(self.config.expiration_from(Utc::now()));

        let inserted = async {
            let record = ticket.encode()?;
            self.insert_record(&id, record).await
        }
        .await;
        if let Err(e) = inserted {
            ticket.clear_id();
            return Err(e);
        }

        self.metrics.record_created();
        debug!(ticket_id = %id, "ticket created");
        Ok(())
    }

    async fn insert_record(&self, id: &TicketId, record: Bytes) -> Result<()> {
        fail::fail_point!("factory-before-insert", |_| Err(TgtError::Storage(
            StorageError::internal("insert suppressed by fail point")
        )));
        self.tickets().put(id.as_str(), record).await?;
        Ok(())
    }

    async fn allocate_id(&self) -> Result<TicketId> {
        let generator = Arc::clone(&*self.id_generator.read());
        let attempts = self.config.max_id_attempts;
        for attempt in 1..=attempts {
            let candidate = generator.generate();
            if !self.tickets().contains_key(candidate.as_str()).await? {
                return Ok(candidate);
            }
            self.metrics.record_id_collision();
            debug!(attempt, "ticket ID collision");
        }
        warn!(attempts, "no unique ticket ID");
        Err(TgtError::IdExhausted { attempts })
    }

    /// Dispatches `event` (unless suppressed), then deletes aliases of
    /// destroyed tickets.
    ///
    /// Listener failures take precedence over an alias cleanup failure, which
    /// is then only logged.
    async fn complete(
        &self,
        event: Option<TicketEvent>,
        ticket: &Ticket,
        notify: bool,
    ) -> Result<()> {
        let Some(event) = event else {
            return Ok(());
        };
        let failures =
            if notify { self.listeners.dispatch(event, ticket).await } else { Vec::new() };
        let cleaned = match ticket.id() {
            Some(id) if event.is_terminal() => self.clean_aliases(id).await.map(|_| ()),
            _ => Ok(()),
        };
        match (self.check_failures(failures), cleaned) {
            (Err(listeners), Err(e)) => {
                warn!(ticket_id = ?ticket.id(), error = %e, "alias cleanup failed");
                Err(listeners)
            },
            (Ok(()), cleaned) => cleaned,
            (listeners, Ok(())) => listeners,
        }
    }

    fn check_failures(&self, failures: Vec<ListenerError>) -> Result<()> {
        self.metrics.record_listener_failures(failures.len());
        match ListenerFailures::from_errors(failures) {
            Some(failures) => Err(TgtError::Listeners(failures)),
            None => Ok(()),
        }
    }

    /// Removes every alias the ticket holds in both stores.
    async fn clean_aliases(&self, id: &TicketId) -> Result<usize> {
        let mut removed = 0;
        for store in [&self.stores.sp_aliases, &self.stores.idp_aliases] {
            for entity in store.entities(id).await? {
                removed += store.remove_all(&entity, id).await?;
            }
        }
        if removed > 0 {
            debug!(ticket_id = %id, removed, "aliases released");
        }
        Ok(removed)
    }

    async fn retrieve(&self, id: &TicketId) -> Result<Option<Ticket>> {
        let Some(record) = self.tickets().get(id.as_str()).await? else {
            return Ok(None);
        };
        let ticket = Ticket::decode(&record)?;
        Ok((!ticket.is_expired()).then_some(ticket))
    }

    /// Removes `id` if its stored record is still expired.
    async fn evict_if_expired(&self, id: &TicketId) -> Result<Option<Ticket>> {
        let _guard = self.key_locks.lock(id).await;
        let Some(record) = self.tickets().get(id.as_str()).await? else {
            return Ok(None);
        };
        let mut ticket = Ticket::decode(&record)?;
        if !ticket.is_expired() {
            return Ok(None);
        }
        self.tickets().remove(id.as_str()).await?;
        if ticket.id().is_none() {
            ticket.assign_id(id.clone());
        }
        Ok(Some(ticket))
    }

    pub(crate) async fn sweep_expired(&self) -> Result<SweepReport> {
        let now = Utc::now();
        let entries = self.tickets().entries().await?;
        let mut report = SweepReport { scanned: entries.len(), ..SweepReport::default() };

        for entry in entries {
            let snapshot = match Ticket::decode(&entry.value) {
                Ok(ticket) => ticket,
                Err(e) => {
                    warn!(key = %entry.key, error = %e, "skipping undecodable ticket record");
                    report.skipped += 1;
                    continue;
                },
            };
            if !snapshot.is_expired_at(now) {
                continue;
            }

            let id = TicketId::from(entry.key);
            let ticket = match self.evict_if_expired(&id).await {
                Ok(Some(ticket)) => ticket,
                Ok(None) => continue,
                Err(e) => {
                    warn!(ticket_id = %id, error = %e, "failed to evict expired ticket");
                    continue;
                },
            };
            self.metrics.record_expired();
            report.expired += 1;

            let failures = self.listeners.dispatch(TicketEvent::Expire, &ticket).await;
            if !failures.is_empty() {
                warn!(ticket_id = %id, failures = failures.len(), "listeners failed on expiry");
                self.metrics.record_listener_failures(failures.len());
                report.listener_failures += failures.len();
            }
            if let Err(e) = self.clean_aliases(&id).await {
                warn!(ticket_id = %id, error = %e, "failed to release aliases of expired ticket");
            }
        }

        self.metrics.record_sweep();
        Ok(report)
    }

    async fn start_stores(&self) -> Result<()> {
        self.stores.tickets.start().await?;
        if let Err(e) = self.stores.sp_aliases.start().await {
            let _ = self.stop_stores().await;
            return Err(e.into());
        }
        if let Err(e) = self.stores.idp_aliases.start().await {
            let _ = self.stop_stores().await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Stops every store, returning the first failure.
    async fn stop_stores(&self) -> std::result::Result<(), StorageError> {
        let results = [
            self.stores.tickets.stop().await,
            self.stores.sp_aliases.stop().await,
            self.stores.idp_aliases.stop().await,
        ];
        results.into_iter().collect()
    }
}

/// Creates, persists and evicts ticket-granting tickets.
///
/// Cheap to clone; clones share state.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use trustgate_tgt::{FactoryStores, TgtFactory, TgtFactoryConfig, UserRef};
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let config = TgtFactoryConfig::builder().ticket_ttl(Duration::from_secs(3600)).build()?;
/// let factory = TgtFactory::new(config, FactoryStores::in_memory())?;
/// factory.start().await?;
///
/// let mut ticket = factory.create_tgt(UserRef::new("alice"));
/// ticket.add_requestor_id("https://sp.example.org");
/// factory.persist(&mut ticket).await?;
///
/// let stored = factory.retrieve(ticket.id().unwrap()).await?.unwrap();
/// assert!(stored.has_requestor_id("https://sp.example.org"));
///
/// factory.stop().await?;
/// # Ok::<(), trustgate_tgt::TgtError>(())
/// # }).unwrap();
/// ```
#[derive(Clone)]
pub struct TgtFactory {
    inner: Arc<FactoryInner>,
}

impl fmt::Debug for TgtFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TgtFactory")
            .field("config", &self.inner.config)
            .field("listeners", &self.inner.listeners)
            .field("started", &self.is_started())
            .finish_non_exhaustive()
    }
}

impl TgtFactory {
    /// Creates a factory over explicitly supplied stores.
    ///
    /// # Errors
    ///
    /// Returns [`TgtError::Config`] if `config` fails validation.
    pub fn new(config: TgtFactoryConfig, stores: FactoryStores) -> Result<Self> {
        config.validate()?;
        let id_generator = SecureIdGenerator::new(config.id_byte_length)?;
        Ok(Self {
            inner: Arc::new(FactoryInner {
                config,
                stores,
                id_generator: parking_lot::RwLock::new(Arc::new(id_generator)),
                listeners: ListenerRegistry::new(),
                metrics: FactoryMetrics::new(),
                key_locks: KeyLocks::new(KEY_LOCK_STRIPES),
                allocation: Mutex::new(()),
                started: AtomicBool::new(false),
                reaper: parking_lot::Mutex::new(None),
            }),
        })
    }

    /// Creates a factory whose three maps come from `registry`, keyed by
    /// `config.store.backend` and bound to the configured group names.
    ///
    /// The configured `join_timeout` overrides the one in `ctx`.
    ///
    /// # Errors
    ///
    /// Returns [`TgtError::Config`] for an invalid configuration, an unknown
    /// backend key or a replicated backend without a cluster reference.
    pub fn from_registry(
        config: TgtFactoryConfig,
        registry: &BackendRegistry,
        ctx: &StoreContext,
    ) -> Result<Self> {
        config.validate()?;
        let ctx = StoreContext { replication: config.replication(&ctx.replication), ..ctx.clone() };
        let store = &config.store;
        let stores = FactoryStores::from_maps(
            registry.build(&store.backend, &store.ticket_group, &ctx)?,
            registry.build(&store.backend, &store.sp_alias_group, &ctx)?,
            registry.build(&store.backend, &store.idp_alias_group, &ctx)?,
        );
        info!(backend = %store.backend, "ticket stores resolved");
        Self::new(config, stores)
    }

    /// Replaces the ID generator.
    #[must_use]
    pub fn with_id_generator(self, generator: Arc<dyn IdGenerator>) -> Self {
        *self.inner.id_generator.write() = generator;
        self
    }

    /// The factory configuration.
    #[must_use]
    pub fn config(&self) -> &TgtFactoryConfig {
        &self.inner.config
    }

    /// Current counter values.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Registered listeners.
    #[must_use]
    pub fn listeners(&self) -> &ListenerRegistry {
        &self.inner.listeners
    }

    /// Registers a listener for every subsequent event.
    pub fn add_listener(&self, listener: Arc<dyn TicketListener>) {
        self.inner.listeners.add_listener(listener);
    }

    /// Unregisters a listener; returns `false` if it was not registered.
    pub fn remove_listener(&self, listener: &Arc<dyn TicketListener>) -> bool {
        self.inner.listeners.remove_listener(listener)
    }

    /// The service-provider alias store.
    #[must_use]
    pub fn sp_aliases(&self) -> &Arc<dyn AliasStore> {
        &self.inner.stores.sp_aliases
    }

    /// The identity-provider alias store.
    #[must_use]
    pub fn idp_aliases(&self) -> &Arc<dyn AliasStore> {
        &self.inner.stores.idp_aliases
    }

    /// Returns `true` between a successful [`start`](Self::start) and [`stop`](Self::stop).
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    /// Creates a ticket for `owner`. Nothing is stored until it is persisted.
    #[must_use]
    pub fn create_tgt(&self, owner: UserRef) -> Ticket {
        Ticket::new(owner, Utc::now())
    }

    /// Writes `ticket` to the map and notifies listeners.
    ///
    /// A new ticket receives its ID and expiration; a live ticket has its
    /// expiration refreshed; an expired ticket is removed together with its
    /// aliases.
    ///
    /// # Errors
    ///
    /// - [`TgtError::CapacityExceeded`] if a new ticket would exceed `max_tickets`
    /// - [`TgtError::IdExhausted`] if no unique ID was found
    /// - [`TgtError::Storage`] if the map fails
    /// - [`TgtError::Listeners`] if listeners failed after the write took effect
    #[tracing::instrument(skip(self, ticket), fields(ticket_id = ?ticket.id()))]
    pub async fn persist(&self, ticket: &mut Ticket) -> Result<()> {
        let event = self.inner.write(ticket).await?;
        self.inner.complete(event, ticket, true).await
    }

    /// Same map mutation as [`persist`](Self::persist) without notifying listeners.
    ///
    /// # Errors
    ///
    /// As [`persist`](Self::persist), except [`TgtError::Listeners`].
    #[tracing::instrument(skip(self, ticket), fields(ticket_id = ?ticket.id()))]
    pub async fn persist_passing_listener_event(&self, ticket: &mut Ticket) -> Result<()> {
        let event = self.inner.write(ticket).await?;
        self.inner.complete(event, ticket, false).await
    }

    /// Reads the stored copy of a ticket without refreshing it.
    ///
    /// A stored ticket that has expired reads as `None`.
    ///
    /// # Errors
    ///
    /// Returns [`TgtError::Storage`] or [`TgtError::Serialization`].
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn retrieve(&self, id: &TicketId) -> Result<Option<Ticket>> {
        self.inner.retrieve(id).await
    }

    /// Returns `true` if a record for `id` is stored, expired or not.
    ///
    /// # Errors
    ///
    /// Returns [`TgtError::Storage`].
    pub async fn exists(&self, id: &TicketId) -> Result<bool> {
        Ok(self.inner.tickets().contains_key(id.as_str()).await?)
    }

    /// Removes a ticket and its aliases regardless of expiry and dispatches
    /// [`TicketEvent::Remove`]. A ticket that was never persisted is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`TgtError::Storage`] or [`TgtError::Listeners`].
    #[tracing::instrument(skip(self, ticket), fields(ticket_id = ?ticket.id()))]
    pub async fn clean(&self, ticket: &Ticket) -> Result<()> {
        let Some(id) = ticket.id() else {
            return Ok(());
        };
        {
            let _guard = self.inner.key_locks.lock(id).await;
            self.inner.tickets().remove(id.as_str()).await?;
        }
        self.inner.metrics.record_removed();
        self.inner.complete(Some(TicketEvent::Remove), ticket, true).await
    }

    /// Number of tickets in the local view of the map.
    ///
    /// # Errors
    ///
    /// Returns [`TgtError::Storage`].
    pub async fn size(&self) -> Result<usize> {
        Ok(self.inner.tickets().size().await?)
    }

    /// Removes every logically expired ticket and dispatches
    /// [`TicketEvent::Expire`] for each.
    ///
    /// A ticket refreshed concurrently survives. Listener failures are
    /// logged and counted in the report rather than returned.
    ///
    /// # Errors
    ///
    /// Returns [`TgtError::Storage`] if the map cannot be enumerated.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_expired(&self) -> Result<SweepReport> {
        self.inner.sweep_expired().await
    }

    /// Starts the ticket map and both alias stores, then the reaper.
    ///
    /// For replicated backends this joins the cluster groups and waits for
    /// their state transfer.
    ///
    /// # Errors
    ///
    /// - [`TgtError::AlreadyStarted`] if the factory is running
    /// - [`TgtError::Storage`] if a store fails to start, including a join timeout
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        if self
            .inner
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TgtError::AlreadyStarted);
        }

        if let Err(e) = self.inner.start_stores().await {
            warn!(error = %e, "ticket factory failed to start");
            self.inner.started.store(false, Ordering::Release);
            return Err(e);
        }

        let handle = reaper::spawn(Arc::downgrade(&self.inner), self.inner.config.reaper_interval);
        *self.inner.reaper.lock() = Some(handle);
        info!(reaper_interval = ?self.inner.config.reaper_interval, "ticket factory started");
        Ok(())
    }

    /// Stops the reaper and every store. Stopping a stopped factory is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`TgtError::Storage`] with the first store that failed to stop;
    /// the remaining stores are still stopped.
    #[tracing::instrument(skip(self))]
    pub async fn stop(&self) -> Result<()> {
        if !self.inner.started.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let reaper = self.inner.reaper.lock().take();
        if let Some(reaper) = reaper {
            reaper.shutdown().await;
        }
        self.inner.stop_stores().await?;
        info!("ticket factory stopped");
        Ok(())
    }
}
