//! Ticket-granting ticket model.
//!
//! A [`Ticket`] is the server-side record proving that a user completed
//! authentication. Callers obtain a detached copy from the factory, mutate
//! it, and hand it back through
//! [`TgtFactory::persist`](crate::TgtFactory::persist); the authoritative
//! copy lives in the ticket map as a `serde_json` document.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TgtError};

/// Opaque, cluster-unique ticket identifier.
///
/// The text form is also the ticket's key in the ticket map.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketId(String);

impl TicketId {
    /// Wraps an already generated identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TicketId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for TicketId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl AsRef<str> for TicketId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to the authenticated user. The ticket does not own the user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
pub struct UserRef {
    /// User identifier within its organization.
    #[builder(into)]
    pub id: String,
    /// Organization the user belongs to, if any.
    #[builder(into)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
}

impl UserRef {
    /// A user without an organization.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), organization: None }
    }
}

/// An authentication profile: the set of authentication methods it satisfied.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationProfile {
    id: String,
    methods: BTreeSet<String>,
}

impl AuthenticationProfile {
    /// Creates a profile satisfying `methods`.
    pub fn new<I, S>(id: impl Into<String>, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { id: id.into(), methods: methods.into_iter().map(Into::into).collect() }
    }

    /// Profile identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Satisfied authentication methods, sorted.
    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.methods.iter().map(String::as_str)
    }

    /// Returns `true` if `method` was satisfied.
    #[must_use]
    pub fn satisfies(&self, method: &str) -> bool {
        self.methods.contains(method)
    }
}

/// Server-side record asserting that a user has authenticated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<TicketId>,
    owner: UserRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    authentication_profile: Option<AuthenticationProfile>,
    #[serde(default)]
    profile_history: Vec<String>,
    #[serde(default)]
    requestor_ids: Vec<String>,
    #[serde(default)]
    attributes: BTreeMap<String, Vec<String>>,
    created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expiration_time: Option<DateTime<Utc>>,
    /// Set by [`expire`](Self::expire); never persisted.
    #[serde(skip)]
    logout_requested: bool,
}

impl Ticket {
    pub(crate) fn new(owner: UserRef, created: DateTime<Utc>) -> Self {
        Self {
            id: None,
            owner,
            authentication_profile: None,
            profile_history: Vec::new(),
            requestor_ids: Vec::new(),
            attributes: BTreeMap::new(),
            created,
            expiration_time: None,
            logout_requested: false,
        }
    }

    /// Ticket identifier; `None` until the ticket is first persisted.
    #[must_use]
    pub fn id(&self) -> Option<&TicketId> {
        self.id.as_ref()
    }

    /// The authenticated user.
    #[must_use]
    pub fn owner(&self) -> &UserRef {
        &self.owner
    }

    /// When the ticket was created.
    #[must_use]
    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    /// Absolute expiration; `None` until the ticket is first persisted.
    #[must_use]
    pub fn expiration_time(&self) -> Option<DateTime<Utc>> {
        self.expiration_time
    }

    /// Returns `true` once the expiration time has been reached.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Returns `true` if the ticket is expired at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiration_time.is_some_and(|expiration| now >= expiration)
    }

    /// Marks the ticket for explicit logout.
    ///
    /// The ticket becomes expired immediately. The next
    /// [`persist`](crate::TgtFactory::persist) removes it and reports
    /// [`TicketEvent::Remove`](crate::TicketEvent::Remove) rather than
    /// `Expire`.
    pub fn expire(&mut self) {
        self.expiration_time = Some(Utc::now());
        self.logout_requested = true;
    }

    /// Returns `true` if [`expire`](Self::expire) was called on this copy.
    #[must_use]
    pub fn is_logout_requested(&self) -> bool {
        self.logout_requested
    }

    /// Current authentication profile.
    #[must_use]
    pub fn authentication_profile(&self) -> Option<&AuthenticationProfile> {
        self.authentication_profile.as_ref()
    }

    /// Profile IDs used by this ticket, oldest first.
    #[must_use]
    pub fn profile_history(&self) -> &[String] {
        &self.profile_history
    }

    /// Replaces the current profile and appends its ID to the history.
    pub fn set_authentication_profile(&mut self, profile: AuthenticationProfile) {
        if self.profile_history.last().is_none_or(|last| *last != profile.id) {
            self.profile_history.push(profile.id.clone());
        }
        self.authentication_profile = Some(profile);
    }

    /// Requestors this ticket is valid for, in the order they were added.
    #[must_use]
    pub fn requestor_ids(&self) -> &[String] {
        &self.requestor_ids
    }

    /// Returns `true` if the ticket is valid for `requestor_id`.
    #[must_use]
    pub fn has_requestor_id(&self, requestor_id: &str) -> bool {
        self.requestor_ids.iter().any(|r| r == requestor_id)
    }

    /// Adds a requestor; returns `false` if it was already present.
    pub fn add_requestor_id(&mut self, requestor_id: impl Into<String>) -> bool {
        let requestor_id = requestor_id.into();
        if self.has_requestor_id(&requestor_id) {
            return false;
        }
        self.requestor_ids.push(requestor_id);
        true
    }

    /// Removes a requestor; returns `false` if it was not present.
    pub fn remove_requestor_id(&mut self, requestor_id: &str) -> bool {
        let before = self.requestor_ids.len();
        self.requestor_ids.retain(|r| r != requestor_id);
        self.requestor_ids.len() != before
    }

    /// All attributes.
    #[must_use]
    pub fn attributes(&self) -> &BTreeMap<String, Vec<String>> {
        &self.attributes
    }

    /// Values of one attribute.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&[String]> {
        self.attributes.get(name).map(Vec::as_slice)
    }

    /// Replaces the values of an attribute.
    pub fn set_attribute<I, S>(&mut self, name: impl Into<String>, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes.insert(name.into(), values.into_iter().map(Into::into).collect());
    }

    /// Appends one value to an attribute, creating it if needed.
    pub fn add_attribute_value(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.attributes.entry(name.into()).or_default().push(value.into());
    }

    /// Removes an attribute, returning its values.
    pub fn remove_attribute(&mut self, name: &str) -> Option<Vec<String>> {
        self.attributes.remove(name)
    }

    pub(crate) fn assign_id(&mut self, id: TicketId) {
        self.id = Some(id);
    }

    pub(crate) fn clear_id(&mut self) {
        self.id = None;
    }

    /// Moves the expiration to `expiration` without ever moving it backwards.
    pub(crate) fn extend_expiration(&mut self, expiration: DateTime<Utc>) {
        self.expiration_time =
            Some(self.expiration_time.map_or(expiration, |current| current.max(expiration)));
    }

    pub(crate) fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| TgtError::serialization(format!("undecodable ticket record: {e}")))
    }
}
