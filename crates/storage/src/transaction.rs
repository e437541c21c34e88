//! Transaction trait for atomic storage operations.
//!
//! Transactions buffer writes until [`Transaction::commit`], then apply
//! them as one unit.
//!
//! # Example
//!
//! ```
//! use fedkeys_storage::{MemoryBackend, StorageBackend};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let backend = MemoryBackend::new();
//!
//! let mut txn = backend.transaction().await.unwrap();
//! txn.set(b"server-keys/a".to_vec(), b"1".to_vec());
//! txn.set(b"server-keys/b".to_vec(), b"2".to_vec());
//! txn.commit().await.unwrap();
//!
//! let a = backend.get(b"server-keys/a").await.unwrap().unwrap();
//! assert_eq!(&a[..], b"1");
//! # });
//! ```

use async_trait::async_trait;

use crate::error::StorageResult;

/// Transaction handle for atomic multi-operation commits.
///
/// Writes to the same key within one transaction resolve in call order:
/// the last buffered `set` is the one applied.
#[async_trait]
pub trait Transaction: Send + Sync {
    /// Buffers a set operation.
    fn set(&mut self, key: Vec<u8>, value: Vec<u8>);

    /// Commits all buffered operations atomically.
    ///
    /// Consumes the transaction. On error none of the buffered operations
    /// are applied.
    async fn commit(self: Box<Self>) -> StorageResult<()>;
}
