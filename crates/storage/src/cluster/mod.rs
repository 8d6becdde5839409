//! Cluster membership layer.
//!
//! A [`ClusterMembership`] hands out named process groups. Members of a
//! group can broadcast payloads to every other member, send a payload to a
//! single member, and observe membership changes through the
//! [`GroupEvent`] stream returned by [`ClusterMembership::join`].
//!
//! The layer makes no promise about wire format; replicated maps only rely
//! on reliable, eventually delivered messages between live members.
//!
//! ```text
//!   ReplicatedTrustMap ──join(group)──► ClusterMembership
//!          │                                  │
//!          │◄────── GroupEvent stream ────────┤
//!          └─────── broadcast / send ────────►│ GroupChannel
//! ```
//!
//! [`LocalCluster`] is an in-process hub that connects any number of
//! simulated members; integration tests use it to run several nodes inside
//! one process.

mod local;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

pub use self::local::{LocalCluster, LocalMember};
use crate::{error::StorageResult, types::MemberId};

/// Event delivered to a group member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupEvent {
    /// A payload sent by another member.
    Message {
        /// Sender of the payload.
        from: MemberId,
        /// Opaque payload bytes.
        payload: Bytes,
    },
    /// A member joined the group.
    MemberJoined(MemberId),
    /// A member left the group.
    MemberLeft(MemberId),
}

/// Handle to a joined process group.
#[async_trait]
pub trait GroupChannel: Send + Sync {
    /// Identity of the local member.
    fn local_member(&self) -> &MemberId;

    /// Current members of the group, oldest first, including the local member.
    fn members(&self) -> Vec<MemberId>;

    /// Sends `payload` to every other live member.
    async fn broadcast(&self, payload: Bytes) -> StorageResult<()>;

    /// Sends `payload` to a single member.
    async fn send(&self, to: &MemberId, payload: Bytes) -> StorageResult<()>;

    /// Leaves the group. Leaving twice is a no-op.
    async fn leave(&self) -> StorageResult<()>;
}

/// Result of joining a group: the outbound channel and the inbound event stream.
pub struct GroupConnection {
    /// Outbound side of the group.
    pub channel: Arc<dyn GroupChannel>,
    /// Inbound events for the local member.
    pub events: mpsc::UnboundedReceiver<GroupEvent>,
}

impl std::fmt::Debug for GroupConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupConnection")
            .field("member", self.channel.local_member())
            .finish_non_exhaustive()
    }
}

/// Provides named process groups for a single cluster member.
#[async_trait]
pub trait ClusterMembership: Send + Sync {
    /// Identity of this member.
    fn member_id(&self) -> &MemberId;

    /// Joins the named group.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`](crate::StorageError) if the member is
    /// already part of the group or the transport cannot be reached.
    async fn join(&self, group: &str) -> StorageResult<GroupConnection>;
}
