//! Storage error types and result alias.
//!
//! This module defines the error types that can occur during trust map
//! operations. Every [`TrustMap`](crate::TrustMap) implementation maps its
//! internal failures (lock poisoning, transport loss, undecodable replication
//! messages) onto these variants.
//!
//! # Error Types
//!
//! - [`StorageError::Connection`] - Cluster transport failures
//! - [`StorageError::Serialization`] - Data encoding/decoding failures
//! - [`StorageError::Internal`] - Implementation-specific internal errors
//! - [`StorageError::Timeout`] - Operation exceeded time limit (e.g. cluster join)
//! - [`StorageError::NotStarted`] - Map used before `start()` or after `stop()`
//!
//! # Example
//!
//! ```
//! use trustgate_storage::{StorageError, StorageResult};
//!
//! fn join(group: &str) -> StorageResult<()> {
//!     Err(StorageError::timeout(format!("state transfer for group {group}")))
//! }
//! ```

use std::sync::Arc;

use thiserror::Error;

/// A boxed error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during trust map operations.
///
/// Errors preserve their source chain via the `#[source]` attribute, enabling
/// debugging tools to display the full error context.
///
/// # Non-exhaustive
///
/// This enum is marked `#[non_exhaustive]`; downstream match expressions must
/// include a wildcard arm (`_ =>`).
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// Cluster transport error.
    ///
    /// Raised when a replication message cannot be handed to the group
    /// channel, or when the channel has been closed underneath the map.
    #[error("Connection error: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
        /// The underlying error that caused this connection failure.
        #[source]
        source: Option<BoxError>,
    },

    /// Serialization or deserialization error.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the serialization error.
        message: String,
        /// The underlying error that caused serialization to fail.
        #[source]
        source: Option<BoxError>,
    },

    /// Internal storage error.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
        /// The underlying error that caused this internal failure.
        #[source]
        source: Option<BoxError>,
    },

    /// Operation timed out.
    ///
    /// For replicated maps this is raised when the initial state transfer
    /// does not complete within the configured join timeout.
    #[error("Operation timeout: {operation}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
    },

    /// The map has not been started, or has already been stopped.
    #[error("Trust map not started")]
    NotStarted,
}

impl StorageError {
    /// Creates a new `Connection` error with the given message.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Creates a new `Connection` error with a message and source error.
    #[must_use]
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Serialization` error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into(), source: None }
    }

    /// Creates a new `Serialization` error with a message and source error.
    #[must_use]
    pub fn serialization_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Internal` error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Creates a new `Timeout` error for the named operation.
    #[must_use]
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout { operation: operation.into() }
    }

    /// Returns `true` for failures that may succeed if retried later.
    ///
    /// Connection losses and timeouts are transient; everything else
    /// indicates a programming or data error.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization_with_source("JSON encoding failed", err)
    }
}

/// Configuration errors raised while resolving a trust map backend.
///
/// These are fatal at startup: a component that fails to resolve its
/// backend must not reach a started state.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// The configured backend key has no registered constructor.
    #[error("Unknown trust map backend: {0}")]
    UnknownBackend(String),

    /// The backend needs a cluster membership handle but none was supplied.
    #[error("Backend '{backend}' requires a cluster reference")]
    MissingCluster {
        /// The backend key that required the cluster.
        backend: String,
    },

    /// A configuration value failed validation.
    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidValue {
        /// The offending field name.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

impl ConfigError {
    /// Creates a new `InvalidValue` error.
    #[must_use]
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue { field, reason: reason.into() }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use std::error::Error;

    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            StorageError::connection("group channel closed").to_string(),
            "Connection error: group channel closed"
        );
        assert_eq!(
            StorageError::timeout("cluster join").to_string(),
            "Operation timeout: cluster join"
        );
        assert_eq!(StorageError::NotStarted.to_string(), "Trust map not started");
    }

    #[test]
    fn test_source_chain_preserved() {
        let inner = StorageError::timeout("send");
        let err = StorageError::connection_with_source("group channel closed", inner);
        let source = err.source().expect("source must be preserved");
        assert_eq!(source.to_string(), "Operation timeout: send");
    }

    #[test]
    fn test_transient_classification() {
        assert!(StorageError::connection("down").is_transient());
        assert!(StorageError::timeout("join").is_transient());
        assert!(!StorageError::serialization("bad").is_transient());
        assert!(!StorageError::NotStarted.is_transient());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::MissingCluster { backend: "replicated".into() };
        assert_eq!(err.to_string(), "Backend 'replicated' requires a cluster reference");
        assert_eq!(
            ConfigError::UnknownBackend("jdbc".into()).to_string(),
            "Unknown trust map backend: jdbc"
        );
    }
}
