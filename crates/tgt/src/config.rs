//! Ticket factory configuration.
//!
//! [`TgtFactoryConfig`] can be deserialized (durations in `humantime`
//! notation such as `"8h"` or `"90s"`) or assembled with the validating
//! builder:
//!
//! ```
//! use std::time::Duration;
//! use trustgate_tgt::TgtFactoryConfig;
//!
//! let config = TgtFactoryConfig::builder()
//!     .ticket_ttl(Duration::from_secs(8 * 3600))
//!     .max_tickets(100_000)
//!     .build()?;
//! assert_eq!(config.reaper_interval, Duration::from_secs(60));
//! # Ok::<(), trustgate_storage::ConfigError>(())
//! ```
//!
//! Deserialized values are validated when the factory is constructed.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use trustgate_storage::{ConfigError, MEMORY_BACKEND, ReplicatedMapConfig};

use crate::id::{DEFAULT_ID_BYTE_LENGTH, MIN_ID_BYTE_LENGTH};

/// Default interval between reaper sweeps (60 seconds).
pub const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_secs(60);

/// Default number of ID candidates tried before giving up.
pub const DEFAULT_MAX_ID_ATTEMPTS: u32 = 3;

/// Default time allowed for a replicated map to join its group (10 seconds).
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Default process group of the ticket map.
pub const DEFAULT_TICKET_GROUP: &str = "trustgate.tgt";

/// Default process group of the service-provider alias map.
pub const DEFAULT_SP_ALIAS_GROUP: &str = "trustgate.alias.sp";

/// Default process group of the identity-provider alias map.
pub const DEFAULT_IDP_ALIAS_GROUP: &str = "trustgate.alias.idp";

fn default_backend() -> String {
    MEMORY_BACKEND.to_owned()
}

fn default_ticket_group() -> String {
    DEFAULT_TICKET_GROUP.to_owned()
}

fn default_sp_alias_group() -> String {
    DEFAULT_SP_ALIAS_GROUP.to_owned()
}

fn default_idp_alias_group() -> String {
    DEFAULT_IDP_ALIAS_GROUP.to_owned()
}

fn default_reaper_interval() -> Duration {
    DEFAULT_REAPER_INTERVAL
}

fn default_id_byte_length() -> usize {
    DEFAULT_ID_BYTE_LENGTH
}

fn default_max_id_attempts() -> u32 {
    DEFAULT_MAX_ID_ATTEMPTS
}

fn default_join_timeout() -> Duration {
    DEFAULT_JOIN_TIMEOUT
}

/// Backend selection for the ticket map and both alias maps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Registry key of the map backend (`"memory"` or `"replicated"`).
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Process group of the ticket map.
    #[serde(default = "default_ticket_group")]
    pub ticket_group: String,
    /// Process group of the service-provider alias map.
    #[serde(default = "default_sp_alias_group")]
    pub sp_alias_group: String,
    /// Process group of the identity-provider alias map.
    #[serde(default = "default_idp_alias_group")]
    pub idp_alias_group: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            ticket_group: default_ticket_group(),
            sp_alias_group: default_sp_alias_group(),
            idp_alias_group: default_idp_alias_group(),
        }
    }
}

impl StoreConfig {
    /// Store settings using the given backend and default group names.
    #[must_use]
    pub fn with_backend(backend: impl Into<String>) -> Self {
        Self { backend: backend.into(), ..Self::default() }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.backend.is_empty() {
            return Err(ConfigError::invalid("store.backend", "must not be empty"));
        }
        let groups = [&self.ticket_group, &self.sp_alias_group, &self.idp_alias_group];
        if groups.iter().any(|g| g.is_empty()) {
            return Err(ConfigError::invalid("store", "group names must not be empty"));
        }
        if self.ticket_group == self.sp_alias_group
            || self.ticket_group == self.idp_alias_group
            || self.sp_alias_group == self.idp_alias_group
        {
            return Err(ConfigError::invalid("store", "group names must be distinct"));
        }
        Ok(())
    }
}

/// Ticket factory configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TgtFactoryConfig {
    /// Lifetime granted to a ticket on every persist.
    #[serde(with = "humantime_serde")]
    pub ticket_ttl: Duration,

    /// Maximum number of live tickets; unlimited when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tickets: Option<usize>,

    /// Interval between reaper sweeps.
    #[serde(with = "humantime_serde", default = "default_reaper_interval")]
    pub reaper_interval: Duration,

    /// Random bytes per ticket ID.
    #[serde(default = "default_id_byte_length")]
    pub id_byte_length: usize,

    /// ID candidates tried before reporting exhaustion.
    #[serde(default = "default_max_id_attempts")]
    pub max_id_attempts: u32,

    /// Time allowed for replicated maps to complete their initial state transfer.
    #[serde(with = "humantime_serde", default = "default_join_timeout")]
    pub join_timeout: Duration,

    /// Anti-entropy period for replicated maps; the store context's value
    /// applies when absent.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub sync_interval: Option<Duration>,

    /// Map backend and group names.
    #[serde(default)]
    pub store: StoreConfig,
}

#[bon::bon]
impl TgtFactoryConfig {
    /// Creates a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for the first value that fails
    /// [`validate`](Self::validate).
    #[builder]
    pub fn new(
        ticket_ttl: Duration,
        max_tickets: Option<usize>,
        #[builder(default = DEFAULT_REAPER_INTERVAL)] reaper_interval: Duration,
        #[builder(default = DEFAULT_ID_BYTE_LENGTH)] id_byte_length: usize,
        #[builder(default = DEFAULT_MAX_ID_ATTEMPTS)] max_id_attempts: u32,
        #[builder(default = DEFAULT_JOIN_TIMEOUT)] join_timeout: Duration,
        sync_interval: Option<Duration>,
        #[builder(default)] store: StoreConfig,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            ticket_ttl,
            max_tickets,
            reaper_interval,
            id_byte_length,
            max_id_attempts,
            join_timeout,
            sync_interval,
            store,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks every value against its bounds.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ticket_ttl.is_zero() {
            return Err(ConfigError::invalid("ticket_ttl", "must be greater than zero"));
        }
        if self.max_tickets == Some(0) {
            return Err(ConfigError::invalid("max_tickets", "must be greater than zero when set"));
        }
        if self.reaper_interval.is_zero() {
            return Err(ConfigError::invalid("reaper_interval", "must be greater than zero"));
        }
        if self.id_byte_length < MIN_ID_BYTE_LENGTH {
            return Err(ConfigError::invalid(
                "id_byte_length",
                format!("must be at least {MIN_ID_BYTE_LENGTH}, got {}", self.id_byte_length),
            ));
        }
        if self.max_id_attempts == 0 {
            return Err(ConfigError::invalid("max_id_attempts", "must be at least 1"));
        }
        if self.join_timeout.is_zero() {
            return Err(ConfigError::invalid("join_timeout", "must be greater than zero"));
        }
        if self.sync_interval.is_some_and(|interval| interval.is_zero()) {
            return Err(ConfigError::invalid("sync_interval", "must be greater than zero when set"));
        }
        self.store.validate()
    }

    /// Expiration granted by a persist at `now`, saturating at the latest
    /// representable instant.
    pub(crate) fn expiration_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.ticket_ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Replication settings derived from this configuration.
    #[must_use]
    pub fn replication(&self, base: &ReplicatedMapConfig) -> ReplicatedMapConfig {
        ReplicatedMapConfig {
            join_timeout: self.join_timeout,
            sync_interval: self.sync_interval.unwrap_or(base.sync_interval),
            ..base.clone()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn base() -> TgtFactoryConfig {
        TgtFactoryConfig::builder().ticket_ttl(Duration::from_secs(60)).build().unwrap()
    }

    #[test]
    fn test_builder_defaults() {
        let config = base();
        assert_eq!(config.max_tickets, None);
        assert_eq!(config.reaper_interval, DEFAULT_REAPER_INTERVAL);
        assert_eq!(config.id_byte_length, 32);
        assert_eq!(config.max_id_attempts, 3);
        assert_eq!(config.store.backend, "memory");
    }

    #[test]
    fn test_deserialize_with_humantime() {
        let config: TgtFactoryConfig = serde_json::from_str(
            r#"{
                "ticket_ttl": "8h",
                "max_tickets": 500,
                "reaper_interval": "30s",
                "store": { "backend": "replicated" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.ticket_ttl, Duration::from_secs(8 * 3600));
        assert_eq!(config.max_tickets, Some(500));
        assert_eq!(config.reaper_interval, Duration::from_secs(30));
        assert_eq!(config.store.backend, "replicated");
        assert_eq!(config.store.ticket_group, DEFAULT_TICKET_GROUP);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_rejects_unknown_fields() {
        let json = r#"{"ticket_ttl": "1h", "ttl": "1h"}"#;
        assert!(serde_json::from_str::<TgtFactoryConfig>(json).is_err());
    }

    #[test]
    fn test_ticket_ttl_is_required() {
        assert!(serde_json::from_str::<TgtFactoryConfig>("{}").is_err());
    }

    #[rstest]
    #[case::zero_ttl(TgtFactoryConfig { ticket_ttl: Duration::ZERO, ..base() }, "ticket_ttl")]
    #[case::zero_capacity(TgtFactoryConfig { max_tickets: Some(0), ..base() }, "max_tickets")]
    #[case::zero_interval(
        TgtFactoryConfig { reaper_interval: Duration::ZERO, ..base() },
        "reaper_interval"
    )]
    #[case::short_ids(TgtFactoryConfig { id_byte_length: 15, ..base() }, "id_byte_length")]
    #[case::no_attempts(TgtFactoryConfig { max_id_attempts: 0, ..base() }, "max_id_attempts")]
    #[case::zero_join(TgtFactoryConfig { join_timeout: Duration::ZERO, ..base() }, "join_timeout")]
    #[case::zero_sync(
        TgtFactoryConfig { sync_interval: Some(Duration::ZERO), ..base() },
        "sync_interval"
    )]
    #[case::empty_backend(
        TgtFactoryConfig { store: StoreConfig::with_backend(""), ..base() },
        "store.backend"
    )]
    fn test_validation_rejects(#[case] config: TgtFactoryConfig, #[case] field: &str) {
        match config.validate() {
            Err(ConfigError::InvalidValue { field: f, .. }) => assert_eq!(f, field),
            other => panic!("expected InvalidValue for {field}, got {other:?}"),
        }
    }

    #[test]
    fn test_groups_must_be_distinct() {
        let store =
            StoreConfig { sp_alias_group: DEFAULT_TICKET_GROUP.into(), ..StoreConfig::default() };
        assert!(TgtFactoryConfig { store, ..base() }.validate().is_err());
    }

    #[test]
    fn test_builder_validates() {
        let result = TgtFactoryConfig::builder()
            .ticket_ttl(Duration::from_secs(60))
            .id_byte_length(8)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_expiration_saturates() {
        let config = TgtFactoryConfig { ticket_ttl: Duration::MAX, ..base() };
        assert_eq!(config.expiration_from(Utc::now()), DateTime::<Utc>::MAX_UTC);

        let now = Utc::now();
        assert_eq!(base().expiration_from(now), now + chrono::Duration::seconds(60));
    }

    #[test]
    fn test_replication_overrides_join_timeout() {
        let config = TgtFactoryConfig { join_timeout: Duration::from_secs(3), ..base() };
        let replication = config.replication(&ReplicatedMapConfig::default());
        assert_eq!(replication.join_timeout, Duration::from_secs(3));
        assert_eq!(replication.tombstone_ttl, ReplicatedMapConfig::default().tombstone_ttl);
        assert_eq!(replication.sync_interval, ReplicatedMapConfig::default().sync_interval);
    }

    #[test]
    fn test_replication_overrides_sync_interval_when_set() {
        let config: TgtFactoryConfig =
            serde_json::from_str(r#"{"ticket_ttl": "1h", "sync_interval": "250ms"}"#).unwrap();
        let replication = config.replication(&ReplicatedMapConfig::default());
        assert_eq!(replication.sync_interval, Duration::from_millis(250));
    }
}
