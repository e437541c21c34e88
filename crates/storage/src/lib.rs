//! Durable storage backend abstraction for the fedkeys server-key store.
//!
//! This crate provides the [`StorageBackend`] trait that the server-key
//! store persists through, together with the canonical [`StorageError`]
//! type and an in-memory reference backend.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              ServerKeyService (fedkeys-server-keys)         │
//! │        batched lookups, negative cache, invalidation        │
//! ├─────────────────────────────────────────────────────────────┤
//! │            StorageServerKeyStore (put_many/get_many)        │
//! │              record encoding, storage key layout            │
//! ├─────────────────────────────────────────────────────────────┤
//! │                     fedkeys-storage                         │
//! │                   StorageBackend trait                      │
//! │           (get, get_many, set, transaction)                 │
//! ├──────────────┬──────────────────────────────────────────────┤
//! │ MemoryBackend│        database-backed implementations       │
//! │   (testing)  │                                              │
//! └──────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use fedkeys_storage::{MemoryBackend, StorageBackend};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = MemoryBackend::new();
//!
//!     let mut txn = backend.transaction().await?;
//!     txn.set(b"k1".to_vec(), b"v1".to_vec());
//!     txn.set(b"k2".to_vec(), b"v2".to_vec());
//!     txn.commit().await?;
//!
//!     let values = backend.get_many(&[b"k1".to_vec(), b"missing".to_vec()]).await?;
//!     assert!(values[0].is_some());
//!     assert!(values[1].is_none());
//!     Ok(())
//! }
//! ```
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module ([`FailingBackend`](testutil::FailingBackend),
//!   assertion macros). Enable this in `[dev-dependencies]` for integration tests.
//! - **`failpoints`**: Compiles the `fail` crate's fail points into [`MemoryBackend`].

pub mod backend;
pub mod error;
pub mod memory;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::panic)]
pub mod testutil;
pub mod transaction;

pub use backend::StorageBackend;
pub use error::{BoxError, StorageError, StorageResult};
pub use memory::MemoryBackend;
pub use transaction::Transaction;
