//! In-process cluster hub.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::{ClusterMembership, GroupChannel, GroupConnection, GroupEvent};
use crate::{
    error::{StorageError, StorageResult},
    types::MemberId,
};

#[derive(Default)]
struct HubState {
    /// Group name -> members in join order.
    groups: HashMap<String, Vec<(MemberId, mpsc::UnboundedSender<GroupEvent>)>>,
    /// Members whose traffic is currently dropped in both directions.
    partitioned: HashSet<MemberId>,
}

/// In-process broadcast hub connecting simulated cluster members.
///
/// Every [`LocalMember`] created from the same hub can join the same named
/// groups. Delivery is reliable and ordered per sender unless a member is
/// [`partition`](Self::partition)ed, in which case its traffic is dropped
/// until [`heal`](Self::heal) is called.
///
/// # Example
///
/// ```
/// use trustgate_storage::cluster::{ClusterMembership, LocalCluster};
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let cluster = LocalCluster::new();
/// let a = cluster.member("node-a");
/// let conn = a.join("tickets").await.unwrap();
/// assert_eq!(conn.channel.members().len(), 1);
/// # });
/// ```
#[derive(Clone, Default)]
pub struct LocalCluster {
    state: Arc<Mutex<HubState>>,
}

impl LocalCluster {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a member handle attached to this hub.
    #[must_use]
    pub fn member(&self, id: impl Into<MemberId>) -> LocalMember {
        LocalMember { id: id.into(), hub: self.clone() }
    }

    /// Drops all traffic to and from `member` until healed.
    pub fn partition(&self, member: &MemberId) {
        self.state.lock().partitioned.insert(member.clone());
    }

    /// Restores traffic for a partitioned member.
    ///
    /// Messages dropped while partitioned are not redelivered.
    pub fn heal(&self, member: &MemberId) {
        self.state.lock().partitioned.remove(member);
    }

    /// Members of `group`, oldest first.
    #[must_use]
    pub fn group_members(&self, group: &str) -> Vec<MemberId> {
        self.state
            .lock()
            .groups
            .get(group)
            .map(|members| members.iter().map(|(id, _)| id.clone()).collect())
            .unwrap_or_default()
    }

    fn deliver(&self, group: &str, from: &MemberId, to: Option<&MemberId>, payload: &Bytes) {
        let state = self.state.lock();
        if state.partitioned.contains(from) {
            return;
        }
        let Some(members) = state.groups.get(group) else {
            return;
        };
        for (id, tx) in members {
            if id == from || state.partitioned.contains(id) {
                continue;
            }
            if to.is_some_and(|target| target != id) {
                continue;
            }
            // A closed receiver means the member is shutting down.
            let _ = tx.send(GroupEvent::Message { from: from.clone(), payload: payload.clone() });
        }
    }

    fn announce(&self, group: &str, event: &GroupEvent, skip: &MemberId) {
        let state = self.state.lock();
        if let Some(members) = state.groups.get(group) {
            for (id, tx) in members.iter().filter(|(id, _)| id != skip) {
                debug!(group, member = %id, ?event, "membership change");
                let _ = tx.send(event.clone());
            }
        }
    }
}

/// A member of a [`LocalCluster`].
#[derive(Clone)]
pub struct LocalMember {
    id: MemberId,
    hub: LocalCluster,
}

#[async_trait]
impl ClusterMembership for LocalMember {
    fn member_id(&self) -> &MemberId {
        &self.id
    }

    async fn join(&self, group: &str) -> StorageResult<GroupConnection> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.hub.state.lock();
            let members = state.groups.entry(group.to_owned()).or_default();
            if members.iter().any(|(id, _)| *id == self.id) {
                return Err(StorageError::internal(format!(
                    "member {} already joined group {group}",
                    self.id
                )));
            }
            members.push((self.id.clone(), tx));
        }
        self.hub.announce(group, &GroupEvent::MemberJoined(self.id.clone()), &self.id);

        let channel = LocalGroupChannel {
            group: group.to_owned(),
            id: self.id.clone(),
            hub: self.hub.clone(),
            left: AtomicBool::new(false),
        };
        Ok(GroupConnection { channel: Arc::new(channel), events: rx })
    }
}

struct LocalGroupChannel {
    group: String,
    id: MemberId,
    hub: LocalCluster,
    left: AtomicBool,
}

impl LocalGroupChannel {
    fn ensure_joined(&self) -> StorageResult<()> {
        if self.left.load(Ordering::Acquire) {
            return Err(StorageError::connection(format!(
                "member {} has left group {}",
                self.id, self.group
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl GroupChannel for LocalGroupChannel {
    fn local_member(&self) -> &MemberId {
        &self.id
    }

    fn members(&self) -> Vec<MemberId> {
        self.hub.group_members(&self.group)
    }

    async fn broadcast(&self, payload: Bytes) -> StorageResult<()> {
        self.ensure_joined()?;
        self.hub.deliver(&self.group, &self.id, None, &payload);
        Ok(())
    }

    async fn send(&self, to: &MemberId, payload: Bytes) -> StorageResult<()> {
        self.ensure_joined()?;
        self.hub.deliver(&self.group, &self.id, Some(to), &payload);
        Ok(())
    }

    async fn leave(&self) -> StorageResult<()> {
        if self.left.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        {
            let mut state = self.hub.state.lock();
            if let Some(members) = state.groups.get_mut(&self.group) {
                members.retain(|(id, _)| *id != self.id);
            }
        }
        self.hub.announce(&self.group, &GroupEvent::MemberLeft(self.id.clone()), &self.id);
        Ok(())
    }
}
