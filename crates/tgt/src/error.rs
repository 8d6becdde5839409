//! Ticket factory error types.

use std::fmt;

use thiserror::Error;
use trustgate_storage::{ConfigError, StorageError};

use crate::listener::ListenerError;

/// Result type alias for ticket factory operations.
pub type Result<T> = std::result::Result<T, TgtError>;

/// Errors returned by the ticket factory.
///
/// # Non-exhaustive
///
/// This enum is marked `#[non_exhaustive]`; downstream match expressions
/// must include a wildcard arm (`_ =>`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TgtError {
    /// The factory configuration or its backend selection is invalid.
    ///
    /// Raised at construction; a factory never reaches the started state
    /// with an invalid configuration.
    #[error("Invalid factory configuration: {0}")]
    Config(#[from] ConfigError),

    /// The configured maximum number of live tickets has been reached.
    #[error("Ticket capacity exceeded (max {max})")]
    CapacityExceeded {
        /// Configured `max_tickets`.
        max: usize,
    },

    /// Every generated ID collided with an existing ticket.
    #[error("No unique ticket ID after {attempts} attempts")]
    IdExhausted {
        /// Number of IDs generated before giving up.
        attempts: u32,
    },

    /// One or more listeners failed after the store mutation took effect.
    ///
    /// The mutation is not rolled back.
    #[error("{0}")]
    Listeners(ListenerFailures),

    /// The underlying trust map failed.
    #[error("Ticket storage error: {0}")]
    Storage(
        /// The underlying storage error.
        #[source]
        StorageError,
    ),

    /// A stored ticket record could not be encoded or decoded.
    #[error("Ticket serialization error: {0}")]
    Serialization(String),

    /// `start` was called on a factory that is already running.
    #[error("Ticket factory already started")]
    AlreadyStarted,
}

impl TgtError {
    /// Creates a new `Serialization` error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    /// Listener failures carried by this error, if any.
    #[must_use]
    pub fn listener_failures(&self) -> Option<&ListenerFailures> {
        match self {
            Self::Listeners(failures) => Some(failures),
            _ => None,
        }
    }
}

impl From<StorageError> for TgtError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err)
    }
}

impl From<serde_json::Error> for TgtError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Aggregate of the listener errors raised by a single dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerFailures(Vec<ListenerError>);

impl ListenerFailures {
    /// Wraps a non-empty list of listener errors; returns `None` when empty.
    #[must_use]
    pub fn from_errors(errors: Vec<ListenerError>) -> Option<Self> {
        (!errors.is_empty()).then_some(Self(errors))
    }

    /// The individual listener errors, in listener registration order.
    #[must_use]
    pub fn errors(&self) -> &[ListenerError] {
        &self.0
    }

    /// Number of failed listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always `false`; an aggregate is never built from an empty list.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Consumes the aggregate, returning the individual errors.
    #[must_use]
    pub fn into_errors(self) -> Vec<ListenerError> {
        self.0
    }
}

impl fmt::Display for ListenerFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ticket listener(s) failed", self.0.len())?;
        for (i, err) in self.0.iter().enumerate() {
            write!(f, "{}{err}", if i == 0 { ": " } else { "; " })?;
        }
        Ok(())
    }
}
