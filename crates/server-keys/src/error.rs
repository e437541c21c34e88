//! Error types for the server-key store and cache.

use fedkeys_storage::StorageError;
use thiserror::Error;

/// Result alias for server-key operations.
pub type Result<T> = std::result::Result<T, KeyStoreError>;

/// Errors returned by [`ServerKeyService`](crate::ServerKeyService).
///
/// # Non-exhaustive
///
/// This enum is marked `#[non_exhaustive]`; downstream match expressions
/// must include a wildcard arm.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum KeyStoreError {
    /// The storage backend failed. Passed through unchanged.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A record was rejected before reaching the store.
    #[error("Invalid record for {origin_server}/{key_id}: {reason}")]
    InvalidRecord {
        /// Origin server of the rejected record.
        origin_server: String,
        /// Key id of the rejected record.
        key_id: String,
        /// Why the record was rejected.
        reason: String,
    },

    /// A key id is not of the form `<algorithm>:<version>`.
    #[error("Invalid key id {key_id:?}: expected \"<algorithm>:<version>\"")]
    InvalidKeyId {
        /// The offending key id.
        key_id: String,
    },

    /// Key material could not be decoded.
    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),

    /// Cache configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl KeyStoreError {
    /// Creates an `InvalidRecord` error.
    #[must_use]
    pub fn invalid_record(
        origin_server: impl Into<String>,
        key_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidRecord {
            origin_server: origin_server.into(),
            key_id: key_id.into(),
            reason: reason.into(),
        }
    }

    /// Returns the underlying storage error, if this is one.
    #[must_use]
    pub fn as_storage(&self) -> Option<&StorageError> {
        match self {
            Self::Storage(err) => Some(err),
            _ => None,
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A numeric or duration setting is below its minimum.
    #[error("{field} = {value} is below the minimum of {min}")]
    BelowMinimum {
        /// Name of the setting.
        field: &'static str,
        /// The rejected value.
        value: String,
        /// The minimum accepted value.
        min: String,
    },
}
