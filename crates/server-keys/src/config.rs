//! Configuration for the server-key cache.
//!
//! ```
//! # use std::time::Duration;
//! # use fedkeys_server_keys::KeyCacheConfig;
//! let config = KeyCacheConfig::builder()
//!     .max_entries(5_000)
//!     .ttl(Duration::from_secs(3_600))
//!     .build()
//!     .expect("valid config");
//! assert_eq!(config.max_entries(), 5_000);
//! ```

use std::time::Duration;

use crate::error::ConfigError;

/// Default maximum number of cached identities (present and absent).
pub const DEFAULT_MAX_ENTRIES: u64 = 10_000;

/// Shortest TTL accepted when a TTL is configured.
pub const MIN_TTL: Duration = Duration::from_secs(1);

/// Validated cache configuration.
///
/// With no TTL, entries live until evicted for capacity or invalidated by
/// a write. Writes always invalidate, so a TTL only bounds how long a
/// record written by *another process* can stay hidden, including a cached
/// "absent".
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyCacheConfig {
    max_entries: u64,
    ttl: Option<Duration>,
}

impl KeyCacheConfig {
    /// Starts a builder with the default settings.
    pub fn builder() -> KeyCacheConfigBuilder {
        KeyCacheConfigBuilder { max_entries: DEFAULT_MAX_ENTRIES, ttl: None }
    }

    /// Maximum number of cache entries.
    #[must_use]
    pub fn max_entries(&self) -> u64 {
        self.max_entries
    }

    /// Time-to-live for cache entries, if any.
    #[must_use]
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }
}

impl Default for KeyCacheConfig {
    fn default() -> Self {
        Self { max_entries: DEFAULT_MAX_ENTRIES, ttl: None }
    }
}

/// Builder for [`KeyCacheConfig`].
pub struct KeyCacheConfigBuilder {
    max_entries: u64,
    ttl: Option<Duration>,
}

impl KeyCacheConfigBuilder {
    /// Sets the maximum number of entries in the cache.
    pub fn max_entries(mut self, max_entries: u64) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Sets a time-to-live for cache entries.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Builds the [`KeyCacheConfig`], validating all fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BelowMinimum`] if `max_entries` is 0 or a TTL
    /// shorter than [`MIN_TTL`] was set.
    pub fn build(self) -> Result<KeyCacheConfig, ConfigError> {
        if self.max_entries == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "max_entries",
                value: self.max_entries.to_string(),
                min: "1".to_owned(),
            });
        }
        if let Some(ttl) = self.ttl
            && ttl < MIN_TTL
        {
            return Err(ConfigError::BelowMinimum {
                field: "ttl",
                value: format!("{}ms", ttl.as_millis()),
                min: "1s".to_owned(),
            });
        }
        Ok(KeyCacheConfig { max_entries: self.max_entries, ttl: self.ttl })
    }
}
