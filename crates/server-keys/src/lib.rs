//! Persistent, cache-coherent store for remote servers' signing keys.
//!
//! A federated server verifies signed requests from other servers using
//! their published Ed25519 verification keys. Fetching those keys is slow,
//! so every key ever observed is persisted together with who supplied it
//! and until when it is valid, and a cache in front of the store serves
//! repeated lookups.
//!
//! Two layers:
//!
//! - [`ServerKeyStore`] / [`StorageServerKeyStore`]: durable mapping from [`ServerKeyId`] to the
//!   latest [`ServerKeyRecord`], over any [`fedkeys_storage::StorageBackend`].
//! - [`ServerKeyService`]: [`store_keys`](ServerKeyService::store_keys) and
//!   [`get_keys`](ServerKeyService::get_keys) with negative caching, request coalescing and
//!   write-ordered invalidation.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//!
//! use fedkeys_server_keys::{FetchKeyResult, ServerKeyId, ServerKeyService, StorageServerKeyStore, VerifyKey};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = ServerKeyService::new(Arc::new(StorageServerKeyStore::in_memory()));
//!
//!     let id = ServerKeyId::new("server1", "ed25519:key1");
//!     let key = VerifyKey::from_base64("ed25519:key1", "fP5l4JzpZPq/zdbBg5xx6lQGAAOM9/3w94cqiJ5jPrw")?;
//!     service.store_keys("server1", 1_000, [(id.clone(), FetchKeyResult::new(key.clone(), 2_000))]).await?;
//!
//!     let found = service.get_keys([id.clone()]).await?;
//!     let record = found[&id].as_ref().expect("stored");
//!     assert_eq!(record.verify_key, key);
//!     assert_eq!(record.fetched_from, "server1");
//!     Ok(())
//! }
//! ```
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module (key generators, a counting and gating
//!   [`ServerKeyStore`] wrapper).
//! - **`failpoints`**: Compiles fail points into [`StorageServerKeyStore`] and the memory backend.

mod cache;
mod config;
mod encoding;
mod error;
pub mod metrics;
mod slots;
mod store;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::panic)]
pub mod testutil;
mod types;

pub use cache::{ServerKeyLookup, ServerKeyService};
pub use config::{DEFAULT_MAX_ENTRIES, KeyCacheConfig, KeyCacheConfigBuilder, MIN_TTL};
pub use encoding::SERVER_KEY_PREFIX;
pub use error::{ConfigError, KeyStoreError, Result};
pub use metrics::{KeyCacheMetrics, KeyCacheMetricsSnapshot};
pub use store::{ServerKeyStore, StorageServerKeyStore};
pub use types::{FetchKeyResult, ServerKeyId, ServerKeyRecord, VerifyKey};
