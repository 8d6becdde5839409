//! Cluster-replicated trust map.
//!
//! [`ReplicatedTrustMap`] keeps a full local replica of every entry and
//! propagates writes to the other members of a named process group through
//! a [`ClusterMembership`].
//!
//! # Convergence
//!
//! Every write is stamped with a Lamport clock paired with the writing
//! member's ID. A replica applies a remote write only when its stamp is
//! greater than the stamp it already holds for that key, so replicas agree
//! on the last writer regardless of delivery order:
//!
//! ```text
//!   node-a: put(k, v1) @ (7, a) ──┐
//!                                 ├──► every replica keeps (8, b) → v2
//!   node-b: put(k, v2) @ (8, b) ──┘
//! ```
//!
//! Removals are recorded as tombstones carrying their own stamp, so a late
//! `Put` cannot resurrect a removed key. Tombstones are compacted once they
//! are older than [`ReplicatedMapConfig::tombstone_ttl`].
//!
//! # Joining
//!
//! [`start`](TrustMap::start) joins the group and, when other members are
//! present, asks the oldest one for a full state transfer. `start` blocks
//! until the transfer has been applied or
//! [`ReplicatedMapConfig::join_timeout`] elapses; on timeout the map leaves
//! the group again and reports [`StorageError::Timeout`].
//!
//! During the join window reads may observe absence for keys that exist
//! elsewhere in the cluster.
//!
//! # Anti-entropy
//!
//! Broadcasts are best effort. Every [`ReplicatedMapConfig::sync_interval`]
//! each member pulls a full state transfer from the next peer in round-robin
//! order, and it pulls from every member that joins the group. Writes lost to
//! a partition or a failed broadcast therefore reach every connected member
//! within `sync_interval × (members - 1)` of connectivity returning. Merging
//! is idempotent, so repeated transfers are harmless.
//!
//! Tombstones must outlive the sync window or a stale replica can resurrect a
//! removed key; `tombstone_ttl` is expected to be many sync intervals long.
//!
//! # Partitions
//!
//! Local writes always succeed. If the broadcast cannot be handed to the
//! group channel, the write stays local and a warning is logged until the
//! next anti-entropy round carries it to the other members.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::{
    select,
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{self, MissedTickBehavior, interval, interval_at, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    backend::TrustMap,
    cluster::{ClusterMembership, GroupChannel, GroupEvent},
    error::{StorageError, StorageResult},
    memory::prefix_range,
    types::{Entry, MemberId},
};

/// Default time allowed for the initial state transfer (10 seconds).
const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Default tombstone retention (10 minutes).
const DEFAULT_TOMBSTONE_TTL: Duration = Duration::from_secs(600);

/// Default anti-entropy period (5 seconds).
const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(5);

/// Configuration for a [`ReplicatedTrustMap`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplicatedMapConfig {
    /// Maximum time [`start`](TrustMap::start) waits for the initial state transfer.
    #[serde(with = "humantime_serde", default = "default_join_timeout")]
    pub join_timeout: Duration,

    /// How long removal tombstones are retained before compaction.
    #[serde(with = "humantime_serde", default = "default_tombstone_ttl")]
    pub tombstone_ttl: Duration,

    /// Period between anti-entropy pulls from a peer.
    #[serde(with = "humantime_serde", default = "default_sync_interval")]
    pub sync_interval: Duration,
}

fn default_join_timeout() -> Duration {
    DEFAULT_JOIN_TIMEOUT
}

fn default_tombstone_ttl() -> Duration {
    DEFAULT_TOMBSTONE_TTL
}

fn default_sync_interval() -> Duration {
    DEFAULT_SYNC_INTERVAL
}

impl Default for ReplicatedMapConfig {
    fn default() -> Self {
        Self {
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            tombstone_ttl: DEFAULT_TOMBSTONE_TTL,
            sync_interval: DEFAULT_SYNC_INTERVAL,
        }
    }
}

/// Version attached to every replicated write.
///
/// Ordered by clock first, then by member ID as a deterministic tiebreak.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
struct Stamp {
    clock: u64,
    member: MemberId,
}

#[derive(Debug, Clone)]
struct Slot {
    /// `None` marks a tombstone.
    value: Option<Bytes>,
    stamp: Stamp,
    /// Local time the tombstone was written; never replicated.
    removed_at: Option<Instant>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireSlot {
    key: String,
    value: Option<String>,
    stamp: Stamp,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ReplicationMessage {
    Put { key: String, value: String, stamp: Stamp },
    Remove { key: String, stamp: Stamp },
    StateRequest,
    StateTransfer { entries: Vec<WireSlot> },
}

impl ReplicationMessage {
    fn encode(&self) -> StorageResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    fn decode(payload: &[u8]) -> StorageResult<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

fn decode_value(encoded: &str) -> StorageResult<Bytes> {
    URL_SAFE_NO_PAD
        .decode(encoded)
        .map(Bytes::from)
        .map_err(|e| StorageError::serialization_with_source("invalid replicated value", e))
}

struct Running {
    channel: Arc<dyn GroupChannel>,
    shutdown_tx: watch::Sender<()>,
    task: JoinHandle<()>,
}

struct Inner {
    group: String,
    membership: Arc<dyn ClusterMembership>,
    config: ReplicatedMapConfig,
    slots: RwLock<BTreeMap<String, Slot>>,
    clock: AtomicU64,
    running: Mutex<Option<Running>>,
}

/// Trust map replicated across the members of a process group.
///
/// Cloning is cheap; clones share the same replica and lifecycle.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
///
/// use bytes::Bytes;
/// use trustgate_storage::{
///     ReplicatedMapConfig, ReplicatedTrustMap, TrustMap, cluster::LocalCluster,
/// };
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let cluster = LocalCluster::new();
/// let map = ReplicatedTrustMap::new(
///     "tickets",
///     Arc::new(cluster.member("node-a")),
///     ReplicatedMapConfig::default(),
/// );
/// map.start().await.unwrap();
/// map.put("t-1", Bytes::from("record")).await.unwrap();
/// map.stop().await.unwrap();
/// # });
/// ```
#[derive(Clone)]
pub struct ReplicatedTrustMap {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ReplicatedTrustMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedTrustMap")
            .field("group", &self.inner.group)
            .field("member", self.inner.membership.member_id())
            .field("started", &self.is_started())
            .finish()
    }
}

impl ReplicatedTrustMap {
    /// Creates a replicated map bound to `group`. Call
    /// [`start`](TrustMap::start) before writing.
    pub fn new(
        group: impl Into<String>,
        membership: Arc<dyn ClusterMembership>,
        config: ReplicatedMapConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                group: group.into(),
                membership,
                config,
                slots: RwLock::new(BTreeMap::new()),
                clock: AtomicU64::new(0),
                running: Mutex::new(None),
            }),
        }
    }

    /// The group this map replicates through.
    #[must_use]
    pub fn group(&self) -> &str {
        &self.inner.group
    }

    /// Identity of the local member.
    #[must_use]
    pub fn member_id(&self) -> &MemberId {
        self.inner.membership.member_id()
    }

    /// Returns `true` between a successful `start` and `stop`.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.inner.running.lock().is_some()
    }

    /// Number of tombstones currently retained.
    #[must_use]
    pub fn tombstone_count(&self) -> usize {
        self.inner.slots.read().values().filter(|slot| slot.value.is_none()).count()
    }

    /// Drops tombstones older than `max_age`; returns how many were dropped.
    pub fn compact_tombstones(&self, max_age: Duration) -> usize {
        self.inner.compact_tombstones(max_age)
    }

    fn channel(&self) -> StorageResult<Arc<dyn GroupChannel>> {
        self.inner
            .running
            .lock()
            .as_ref()
            .map(|running| Arc::clone(&running.channel))
            .ok_or(StorageError::NotStarted)
    }

    async fn replicate(&self, channel: &dyn GroupChannel, message: &ReplicationMessage) {
        let result = async {
            fail::fail_point!("replicated-before-broadcast", |_| Err(StorageError::connection(
                "broadcast suppressed by fail point"
            )));
            channel.broadcast(message.encode()?).await
        }
        .await;

        if let Err(e) = result {
            warn!(
                group = %self.inner.group,
                error = %e,
                "replication broadcast failed; write kept local"
            );
        }
    }
}

impl Inner {
    fn next_stamp(&self) -> Stamp {
        let clock = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        Stamp { clock, member: self.membership.member_id().clone() }
    }

    fn observe(&self, stamp: &Stamp) {
        self.clock.fetch_max(stamp.clock, Ordering::SeqCst);
    }

    /// Applies a write if its stamp is newer than the one held locally.
    ///
    /// Returns `true` if the slot changed.
    fn merge(&self, key: String, value: Option<Bytes>, stamp: Stamp) -> bool {
        self.observe(&stamp);
        let mut slots = self.slots.write();
        if let Some(existing) = slots.get(&key) {
            if existing.stamp >= stamp {
                return false;
            }
        }
        let removed_at = value.is_none().then(Instant::now);
        slots.insert(key, Slot { value, stamp, removed_at });
        true
    }

    fn compact_tombstones(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut slots = self.slots.write();
        let before = slots.len();
        slots.retain(|_, slot| {
            slot.removed_at.is_none_or(|removed_at| now.duration_since(removed_at) < max_age)
        });
        before - slots.len()
    }

    fn snapshot(&self) -> Vec<WireSlot> {
        self.slots
            .read()
            .iter()
            .map(|(key, slot)| WireSlot {
                key: key.clone(),
                value: slot.value.as_ref().map(|v| URL_SAFE_NO_PAD.encode(v)),
                stamp: slot.stamp.clone(),
            })
            .collect()
    }

    async fn handle_message(
        &self,
        channel: &dyn GroupChannel,
        from: MemberId,
        payload: Bytes,
        caught_up: &mut Option<oneshot::Sender<()>>,
    ) -> StorageResult<()> {
        match ReplicationMessage::decode(&payload)? {
            ReplicationMessage::Put { key, value, stamp } => {
                let value = decode_value(&value)?;
                if !self.merge(key.clone(), Some(value), stamp) {
                    debug!(group = %self.group, %from, key, "ignored stale put");
                }
            },
            ReplicationMessage::Remove { key, stamp } => {
                if !self.merge(key.clone(), None, stamp) {
                    debug!(group = %self.group, %from, key, "ignored stale remove");
                }
            },
            ReplicationMessage::StateRequest => {
                let entries = self.snapshot();
                debug!(
                    group = %self.group,
                    to = %from,
                    entries = entries.len(),
                    "sending state transfer"
                );
                let reply = ReplicationMessage::StateTransfer { entries }.encode()?;
                channel.send(&from, reply).await?;
            },
            ReplicationMessage::StateTransfer { entries } => {
                let received = entries.len();
                for slot in entries {
                    let value = slot.value.as_deref().map(decode_value).transpose()?;
                    self.merge(slot.key, value, slot.stamp);
                }
                if let Some(tx) = caught_up.take() {
                    info!(group = %self.group, %from, received, "initial state transfer applied");
                    let _ = tx.send(());
                } else {
                    debug!(group = %self.group, %from, received, "anti-entropy transfer applied");
                }
            },
        }
        Ok(())
    }

    /// Asks `peer` for a full state transfer; failures wait for the next round.
    async fn request_state(&self, channel: &dyn GroupChannel, peer: &MemberId) {
        let sent = async { channel.send(peer, ReplicationMessage::StateRequest.encode()?).await };
        if let Err(e) = sent.await {
            debug!(group = %self.group, %peer, error = %e, "state request not sent");
        }
    }

    /// Peer to pull from on the `round`-th sync tick, cycling through the group.
    fn sync_peer(channel: &dyn GroupChannel, round: usize) -> Option<MemberId> {
        let local = channel.local_member();
        let peers: Vec<MemberId> =
            channel.members().into_iter().filter(|member| member != local).collect();
        if peers.is_empty() {
            return None;
        }
        peers.get(round % peers.len()).cloned()
    }

    async fn receive_loop(
        self: Arc<Self>,
        channel: Arc<dyn GroupChannel>,
        mut events: mpsc::UnboundedReceiver<GroupEvent>,
        mut shutdown_rx: watch::Receiver<()>,
        mut caught_up: Option<oneshot::Sender<()>>,
    ) {
        let mut compaction = interval(self.config.tombstone_ttl.max(Duration::from_millis(1)));
        let period = self.config.sync_interval.max(Duration::from_millis(1));
        let mut sync = interval_at(time::Instant::now() + period, period);
        sync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut round = 0usize;
        loop {
            select! {
                _ = shutdown_rx.changed() => {
                    return;
                }
                _ = compaction.tick() => {
                    let dropped = self.compact_tombstones(self.config.tombstone_ttl);
                    if dropped > 0 {
                        debug!(group = %self.group, dropped, "compacted tombstones");
                    }
                }
                _ = sync.tick() => {
                    if let Some(peer) = Self::sync_peer(channel.as_ref(), round) {
                        self.request_state(channel.as_ref(), &peer).await;
                    }
                    round = round.wrapping_add(1);
                }
                event = events.recv() => match event {
                    Some(GroupEvent::Message { from, payload }) => {
                        let handled = self
                            .handle_message(channel.as_ref(), from.clone(), payload, &mut caught_up)
                            .await;
                        if let Err(e) = handled {
                            warn!(group = %self.group, %from, error = %e, "dropping message");
                        }
                    },
                    Some(GroupEvent::MemberJoined(member)) => {
                        debug!(group = %self.group, %member, "member joined");
                        self.request_state(channel.as_ref(), &member).await;
                    },
                    Some(GroupEvent::MemberLeft(member)) => {
                        debug!(group = %self.group, %member, "member left");
                    },
                    None => {
                        warn!(group = %self.group, "group channel closed");
                        return;
                    },
                },
            }
        }
    }
}

#[async_trait]
impl TrustMap for ReplicatedTrustMap {
    async fn get(&self, key: &str) -> StorageResult<Option<Bytes>> {
        Ok(self.inner.slots.read().get(key).and_then(|slot| slot.value.clone()))
    }

    #[tracing::instrument(level = "trace", skip(self, value), fields(group = %self.inner.group))]
    async fn put(&self, key: &str, value: Bytes) -> StorageResult<()> {
        let channel = self.channel()?;
        let stamp = self.inner.next_stamp();
        self.inner.merge(key.to_owned(), Some(value.clone()), stamp.clone());

        let message = ReplicationMessage::Put {
            key: key.to_owned(),
            value: URL_SAFE_NO_PAD.encode(&value),
            stamp,
        };
        self.replicate(channel.as_ref(), &message).await;
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self), fields(group = %self.inner.group))]
    async fn remove(&self, key: &str) -> StorageResult<Option<Bytes>> {
        let channel = self.channel()?;
        let previous = self.get(key).await?;
        let stamp = self.inner.next_stamp();
        // Tombstone even when absent locally: the key may not have reached this replica yet.
        self.inner.merge(key.to_owned(), None, stamp.clone());

        let message = ReplicationMessage::Remove { key: key.to_owned(), stamp };
        self.replicate(channel.as_ref(), &message).await;
        Ok(previous)
    }

    async fn contains_key(&self, key: &str) -> StorageResult<bool> {
        Ok(self.inner.slots.read().get(key).is_some_and(|slot| slot.value.is_some()))
    }

    async fn size(&self) -> StorageResult<usize> {
        Ok(self.inner.slots.read().values().filter(|slot| slot.value.is_some()).count())
    }

    async fn entries(&self) -> StorageResult<Vec<Entry>> {
        let slots = self.inner.slots.read();
        Ok(slots
            .iter()
            .filter_map(|(k, slot)| slot.value.as_ref().map(|v| Entry::new(k.clone(), v.clone())))
            .collect())
    }

    async fn scan_prefix(&self, prefix: &str) -> StorageResult<Vec<Entry>> {
        let slots = self.inner.slots.read();
        Ok(prefix_range(&slots, prefix)
            .filter_map(|(k, slot)| slot.value.as_ref().map(|v| Entry::new(k.clone(), v.clone())))
            .collect())
    }

    #[tracing::instrument(
        skip(self),
        fields(group = %self.inner.group, member = %self.member_id())
    )]
    async fn start(&self) -> StorageResult<()> {
        if self.is_started() {
            return Ok(());
        }

        let connection = self.inner.membership.join(&self.inner.group).await?;
        let channel = connection.channel;
        let local = channel.local_member().clone();
        let seed = channel.members().into_iter().find(|member| *member != local);

        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let (caught_up_tx, caught_up_rx) = oneshot::channel();
        let task = tokio::spawn(Arc::clone(&self.inner).receive_loop(
            Arc::clone(&channel),
            connection.events,
            shutdown_rx,
            seed.is_some().then_some(caught_up_tx),
        ));

        if let Some(seed) = seed {
            let requested = async {
                channel.send(&seed, ReplicationMessage::StateRequest.encode()?).await?;
                match timeout(self.inner.config.join_timeout, caught_up_rx).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(_)) => Err(StorageError::connection("receive loop ended during join")),
                    Err(_) => Err(StorageError::timeout(format!(
                        "state transfer for group {}",
                        self.inner.group
                    ))),
                }
            }
            .await;

            if let Err(e) = requested {
                warn!(%seed, error = %e, "cluster join failed");
                let _ = shutdown_tx.send(());
                let _ = task.await;
                let _ = channel.leave().await;
                return Err(e);
            }
        }

        info!("joined replication group");
        *self.inner.running.lock() = Some(Running { channel, shutdown_tx, task });
        Ok(())
    }

    #[tracing::instrument(
        skip(self),
        fields(group = %self.inner.group, member = %self.member_id())
    )]
    async fn stop(&self) -> StorageResult<()> {
        let running = self.inner.running.lock().take();
        let Some(running) = running else {
            return Ok(());
        };
        let _ = running.shutdown_tx.send(());
        if let Err(e) = running.task.await {
            warn!(error = %e, "replication receive loop ended abnormally");
        }
        running.channel.leave().await?;
        info!("left replication group");
        Ok(())
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.channel().map(|_| ())
    }
}
