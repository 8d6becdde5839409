//! Ticket ID generation.
//!
//! Generators only produce candidates; the factory checks the ticket map
//! and retries on collision.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::{RngCore, rngs::OsRng};
use trustgate_storage::ConfigError;
use zeroize::Zeroizing;

use crate::ticket::TicketId;

/// Smallest accepted number of random bytes per ID.
pub const MIN_ID_BYTE_LENGTH: usize = 16;

/// Default number of random bytes per ID.
pub const DEFAULT_ID_BYTE_LENGTH: usize = 32;

/// Source of candidate ticket IDs.
pub trait IdGenerator: Send + Sync {
    /// Produces a new candidate ID.
    fn generate(&self) -> TicketId;
}

/// Generates IDs from the operating system CSPRNG.
///
/// Each ID is `byte_length` random bytes encoded as unpadded base64url, so a
/// 32-byte ID is 43 characters long.
#[derive(Debug, Clone)]
pub struct SecureIdGenerator {
    byte_length: usize,
}

impl SecureIdGenerator {
    /// Creates a generator producing `byte_length` random bytes per ID.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if `byte_length` is below
    /// [`MIN_ID_BYTE_LENGTH`].
    pub fn new(byte_length: usize) -> Result<Self, ConfigError> {
        if byte_length < MIN_ID_BYTE_LENGTH {
            return Err(ConfigError::invalid(
                "id_byte_length",
                format!("must be at least {MIN_ID_BYTE_LENGTH}, got {byte_length}"),
            ));
        }
        Ok(Self { byte_length })
    }

    /// Number of random bytes per ID.
    #[must_use]
    pub fn byte_length(&self) -> usize {
        self.byte_length
    }
}

impl Default for SecureIdGenerator {
    fn default() -> Self {
        Self { byte_length: DEFAULT_ID_BYTE_LENGTH }
    }
}

impl IdGenerator for SecureIdGenerator {
    fn generate(&self) -> TicketId {
        let mut raw = Zeroizing::new(vec![0u8; self.byte_length]);
        OsRng.fill_bytes(&mut raw);
        TicketId::new(URL_SAFE_NO_PAD.encode(raw.as_slice()))
    }
}
