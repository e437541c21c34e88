//! Storage backend trait definition.
//!
//! [`StorageBackend`] is the minimal durable key-value interface the server
//! key store is written against. Keys and values are plain bytes; encoding
//! of records lives in the layer above.
//!
//! # Implementing a Backend
//!
//! 1. Implement the [`StorageBackend`] trait
//! 2. Implement a corresponding [`Transaction`] type
//! 3. Map backend-specific errors to [`StorageError`](crate::StorageError)
//!
//! See [`MemoryBackend`](crate::MemoryBackend) for a reference implementation.

use async_trait::async_trait;
use bytes::Bytes;

use crate::{error::StorageResult, transaction::Transaction};

/// Abstract storage backend for key-value operations.
///
/// Backends must be thread-safe (`Send + Sync`) and support concurrent
/// operations.
///
/// | Method | Description |
/// |--------|-------------|
/// | [`get`](StorageBackend::get) | Retrieve a single value by key |
/// | [`get_many`](StorageBackend::get_many) | Retrieve several values in one round trip |
/// | [`set`](StorageBackend::set) | Store a key-value pair |
/// | [`transaction`](StorageBackend::transaction) | Begin an atomic transaction |
///
/// # Example
///
/// ```
/// use bytes::Bytes;
/// use fedkeys_storage::{MemoryBackend, StorageBackend};
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let backend = MemoryBackend::new();
///
/// backend.set(b"key".to_vec(), b"value".to_vec()).await.unwrap();
/// let value = backend.get(b"key").await.unwrap();
/// assert_eq!(value, Some(Bytes::from("value")));
/// # });
/// ```
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Retrieves a value by key.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(bytes))` if the key exists
    /// - `Ok(None)` if the key doesn't exist
    /// - `Err(...)` on storage errors
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>>;

    /// Retrieves several values at once.
    ///
    /// The result has exactly one slot per requested key, in request order,
    /// with `None` for keys that do not exist. The whole call fails if any
    /// individual read fails.
    ///
    /// The default implementation issues sequential [`get`](Self::get)
    /// calls. Backends should override it with a single round trip or a
    /// single lock acquisition.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get_many(&self, keys: &[Vec<u8>]) -> StorageResult<Vec<Option<Bytes>>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key).await?);
        }
        Ok(values)
    }

    /// Stores a key-value pair, overwriting any existing value.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()>;

    /// Begins a new transaction.
    ///
    /// Returns a boxed [`Transaction`] that buffers writes until
    /// [`commit`](Transaction::commit).
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn transaction(&self) -> StorageResult<Box<dyn Transaction>>;
}
