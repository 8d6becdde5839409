//! Per-requestor alias index.
//!
//! An alias is an opaque pseudonym a relying party knows a ticket by. Aliases
//! are scoped by `(alias type, entity ID)`: within one scope an alias maps to
//! exactly one ticket and a ticket has at most one alias.
//!
//! [`MapAliasStore`] keeps two entries per alias in a [`TrustMap`]:
//!
//! ```text
//! fwd.<ticket>.<type>.<entity>  → alias
//! rev.<type>.<entity>.<alias>   → ticket
//! ```
//!
//! Every component is base64url encoded, so entity IDs containing `.` stay
//! unambiguous and all forward entries of a ticket share one scannable
//! prefix.
//!
//! # Collisions
//!
//! [`put_alias`](AliasStore::put_alias) overwrites. If the alias already
//! belonged to another ticket in the same scope, that ticket loses it; if the
//! ticket already had a different alias in the scope, the old alias is
//! released.

use std::{collections::BTreeSet, fmt, sync::Arc};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use trustgate_storage::{MemoryTrustMap, StorageError, StorageResult, TrustMap};

use crate::ticket::TicketId;

const FORWARD_PREFIX: &str = "fwd.";
const REVERSE_PREFIX: &str = "rev.";

/// Which side of the federation an alias store serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AliasRole {
    /// Aliases handed to downstream service providers.
    ServiceProvider,
    /// Aliases received from upstream identity providers.
    IdentityProvider,
}

impl AliasRole {
    /// Short label used in logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ServiceProvider => "sp",
            Self::IdentityProvider => "idp",
        }
    }
}

impl fmt::Display for AliasRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bidirectional `(type, entity, ticket) ↔ alias` index.
#[async_trait]
pub trait AliasStore: Send + Sync {
    /// Role this store serves.
    fn role(&self) -> AliasRole;

    /// Associates `alias` with `ticket_id` in the `(alias_type, entity_id)` scope.
    async fn put_alias(
        &self,
        alias_type: &str,
        entity_id: &str,
        ticket_id: &TicketId,
        alias: &str,
    ) -> StorageResult<()>;

    /// The ticket's alias in a scope.
    async fn get_alias(
        &self,
        alias_type: &str,
        entity_id: &str,
        ticket_id: &TicketId,
    ) -> StorageResult<Option<String>>;

    /// The ticket an alias refers to in a scope.
    async fn get_ticket_id(
        &self,
        alias_type: &str,
        entity_id: &str,
        alias: &str,
    ) -> StorageResult<Option<TicketId>>;

    /// Returns `true` if `alias` is in use in a scope.
    async fn is_alias(
        &self,
        alias_type: &str,
        entity_id: &str,
        alias: &str,
    ) -> StorageResult<bool> {
        Ok(self.get_ticket_id(alias_type, entity_id, alias).await?.is_some())
    }

    /// Removes one alias; returns `false` if it did not exist.
    async fn remove_alias(&self, alias_type: &str, entity_id: &str, alias: &str)
    -> StorageResult<bool>;

    /// Removes every alias of any type the ticket holds under `entity_id`.
    ///
    /// Returns the number of aliases removed.
    async fn remove_all(&self, entity_id: &str, ticket_id: &TicketId) -> StorageResult<usize>;

    /// Entity IDs under which the ticket holds at least one alias, sorted.
    async fn entities(&self, ticket_id: &TicketId) -> StorageResult<Vec<String>>;

    /// Brings the backing map into service.
    async fn start(&self) -> StorageResult<()> {
        Ok(())
    }

    /// Takes the backing map out of service.
    async fn stop(&self) -> StorageResult<()> {
        Ok(())
    }
}

fn encode(component: &str) -> String {
    URL_SAFE_NO_PAD.encode(component)
}

fn decode(component: &str) -> StorageResult<String> {
    let raw = URL_SAFE_NO_PAD
        .decode(component)
        .map_err(|e| StorageError::serialization_with_source("malformed alias key", e))?;
    String::from_utf8(raw)
        .map_err(|e| StorageError::serialization_with_source("alias key is not UTF-8", e))
}

fn forward_prefix(ticket_id: &TicketId) -> String {
    format!("{FORWARD_PREFIX}{}.", encode(ticket_id.as_str()))
}

fn forward_key(ticket_id: &TicketId, alias_type: &str, entity_id: &str) -> String {
    format!("{}{}.{}", forward_prefix(ticket_id), encode(alias_type), encode(entity_id))
}

fn reverse_key(alias_type: &str, entity_id: &str, alias: &str) -> String {
    format!("{REVERSE_PREFIX}{}.{}.{}", encode(alias_type), encode(entity_id), encode(alias))
}

/// Splits the `<type>.<entity>` tail of a forward key.
fn parse_forward_tail(tail: &str) -> StorageResult<(String, String)> {
    let (alias_type, entity_id) = tail
        .split_once('.')
        .ok_or_else(|| StorageError::serialization(format!("malformed forward key tail: {tail}")))?;
    Ok((decode(alias_type)?, decode(entity_id)?))
}

fn text(value: Bytes) -> StorageResult<String> {
    String::from_utf8(value.to_vec())
        .map_err(|e| StorageError::serialization_with_source("alias value is not UTF-8", e))
}

/// [`AliasStore`] backed by a [`TrustMap`].
///
/// Mutations are serialized by a store-local lock so the forward and reverse
/// entries of one alias stay consistent on this node.
pub struct MapAliasStore {
    role: AliasRole,
    map: Arc<dyn TrustMap>,
    write_lock: Mutex<()>,
}

impl MapAliasStore {
    /// Creates a store over `map`.
    #[must_use]
    pub fn new(role: AliasRole, map: Arc<dyn TrustMap>) -> Self {
        Self { role, map, write_lock: Mutex::new(()) }
    }

    /// Creates a store over a fresh [`MemoryTrustMap`].
    #[must_use]
    pub fn in_memory(role: AliasRole) -> Self {
        Self::new(role, Arc::new(MemoryTrustMap::new()))
    }

    /// The backing map.
    #[must_use]
    pub fn map(&self) -> &Arc<dyn TrustMap> {
        &self.map
    }

    async fn get_text(&self, key: &str) -> StorageResult<Option<String>> {
        self.map.get(key).await?.map(text).transpose()
    }

    /// Removes the reverse entry only if it still points at `ticket_id`.
    async fn release_reverse(
        &self,
        alias_type: &str,
        entity_id: &str,
        alias: &str,
        ticket_id: &TicketId,
    ) -> StorageResult<()> {
        let key = reverse_key(alias_type, entity_id, alias);
        if self.get_text(&key).await?.as_deref() == Some(ticket_id.as_str()) {
            self.map.remove(&key).await?;
        }
        Ok(())
    }
}

impl fmt::Debug for MapAliasStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapAliasStore").field("role", &self.role).finish_non_exhaustive()
    }
}

#[async_trait]
impl AliasStore for MapAliasStore {
    fn role(&self) -> AliasRole {
        self.role
    }

    #[tracing::instrument(skip(self, alias), fields(role = %self.role))]
    async fn put_alias(
        &self,
        alias_type: &str,
        entity_id: &str,
        ticket_id: &TicketId,
        alias: &str,
    ) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        let fwd = forward_key(ticket_id, alias_type, entity_id);
        let rev = reverse_key(alias_type, entity_id, alias);

        if let Some(previous_alias) = self.get_text(&fwd).await? {
            if previous_alias != alias {
                self.release_reverse(alias_type, entity_id, &previous_alias, ticket_id).await?;
            }
        }

        if let Some(previous_ticket) = self.get_text(&rev).await? {
            if previous_ticket != ticket_id.as_str() {
                let previous_ticket = TicketId::from(previous_ticket);
                let stale = forward_key(&previous_ticket, alias_type, entity_id);
                if self.get_text(&stale).await?.as_deref() == Some(alias) {
                    self.map.remove(&stale).await?;
                }
                debug!(%previous_ticket, "alias reassigned to another ticket");
            }
        }

        self.map.put(&fwd, Bytes::copy_from_slice(alias.as_bytes())).await?;
        self.map.put(&rev, Bytes::copy_from_slice(ticket_id.as_str().as_bytes())).await
    }

    async fn get_alias(
        &self,
        alias_type: &str,
        entity_id: &str,
        ticket_id: &TicketId,
    ) -> StorageResult<Option<String>> {
        self.get_text(&forward_key(ticket_id, alias_type, entity_id)).await
    }

    async fn get_ticket_id(
        &self,
        alias_type: &str,
        entity_id: &str,
        alias: &str,
    ) -> StorageResult<Option<TicketId>> {
        Ok(self.get_text(&reverse_key(alias_type, entity_id, alias)).await?.map(TicketId::from))
    }

    #[tracing::instrument(skip(self, alias), fields(role = %self.role))]
    async fn remove_alias(
        &self,
        alias_type: &str,
        entity_id: &str,
        alias: &str,
    ) -> StorageResult<bool> {
        let _guard = self.write_lock.lock().await;
        let Some(ticket_id) = self.map.remove(&reverse_key(alias_type, entity_id, alias)).await?
        else {
            return Ok(false);
        };
        let ticket_id = TicketId::from(text(ticket_id)?);
        let fwd = forward_key(&ticket_id, alias_type, entity_id);
        if self.get_text(&fwd).await?.as_deref() == Some(alias) {
            self.map.remove(&fwd).await?;
        }
        Ok(true)
    }

    #[tracing::instrument(skip(self), fields(role = %self.role))]
    async fn remove_all(&self, entity_id: &str, ticket_id: &TicketId) -> StorageResult<usize> {
        let _guard = self.write_lock.lock().await;
        let prefix = forward_prefix(ticket_id);
        let mut removed = 0;
        for entry in self.map.scan_prefix(&prefix).await? {
            let (alias_type, entity) = match parse_forward_tail(&entry.key[prefix.len()..]) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(key = %entry.key, error = %e, "skipping malformed alias entry");
                    continue;
                },
            };
            if entity != entity_id {
                continue;
            }
            let alias = text(entry.value)?;
            self.map.remove(&entry.key).await?;
            self.release_reverse(&alias_type, &entity, &alias, ticket_id).await?;
            removed += 1;
        }
        Ok(removed)
    }

    async fn entities(&self, ticket_id: &TicketId) -> StorageResult<Vec<String>> {
        let prefix = forward_prefix(ticket_id);
        let mut entities = BTreeSet::new();
        for entry in self.map.scan_prefix(&prefix).await? {
            match parse_forward_tail(&entry.key[prefix.len()..]) {
                Ok((_, entity)) => {
                    entities.insert(entity);
                },
                Err(e) => warn!(key = %entry.key, error = %e, "skipping malformed alias entry"),
            }
        }
        Ok(entities.into_iter().collect())
    }

    async fn start(&self) -> StorageResult<()> {
        self.map.start().await
    }

    async fn stop(&self) -> StorageResult<()> {
        self.map.stop().await
    }
}
