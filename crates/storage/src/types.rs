//! Common types used across trust map operations.

use std::{fmt, sync::Arc};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Key-value pair returned from [`entries`](crate::TrustMap::entries) and
/// [`scan_prefix`](crate::TrustMap::scan_prefix).
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use trustgate_storage::Entry;
///
/// let entry = Entry::new("ticket-1", Bytes::from_static(b"{}"));
/// assert_eq!(entry.key, "ticket-1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// The key identifying this entry.
    pub key: String,

    /// The value stored at this key.
    pub value: Bytes,
}

impl Entry {
    /// Creates a new entry.
    pub fn new(key: impl Into<String>, value: Bytes) -> Self {
        Self { key: key.into(), value }
    }
}

/// Identity of a member of a cluster process group.
///
/// Member IDs order lexicographically; replicated maps use that order to
/// break ties between writes carrying the same logical clock.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(Arc<str>);

impl MemberId {
    /// Creates a member ID.
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MemberId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
