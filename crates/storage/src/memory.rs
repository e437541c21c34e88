//! In-memory storage backend implementation.
//!
//! [`MemoryBackend`] implements [`StorageBackend`] on an ordered map behind
//! a [`parking_lot::RwLock`]. It is the reference backend for tests and
//! development; nothing survives process exit.
//!
//! # Example
//!
//! ```
//! use fedkeys_storage::{MemoryBackend, StorageBackend};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let backend = MemoryBackend::new();
//!
//!     backend.set(b"greeting".to_vec(), b"hello".to_vec()).await.unwrap();
//!     let value = backend.get(b"greeting").await.unwrap();
//!
//!     assert_eq!(value.unwrap().as_ref(), b"hello");
//! }
//! ```
//!
//! # Performance Characteristics
//!
//! | Operation | Complexity |
//! |-----------|------------|
//! | get | O(log n) |
//! | get_many | O(k log n), one read lock |
//! | set | O(log n) |
//! | commit | O(k log n), one write lock |

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use fail::fail_point;
use parking_lot::RwLock;

use crate::{
    backend::StorageBackend,
    error::{StorageError, StorageResult},
    transaction::Transaction,
};

/// In-memory storage backend using [`BTreeMap`].
///
/// `MemoryBackend` is cheaply cloneable; all clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Bytes>>>,
}

impl MemoryBackend {
    /// Creates a new, empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Returns `true` if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    #[tracing::instrument(skip(self, key), fields(key_len = key.len()))]
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        fail_point!("memory-get", |_| Err(StorageError::connection("injected get failure")));
        Ok(self.data.read().get(key).cloned())
    }

    #[tracing::instrument(skip(self, keys), fields(count = keys.len()))]
    async fn get_many(&self, keys: &[Vec<u8>]) -> StorageResult<Vec<Option<Bytes>>> {
        fail_point!("memory-get-many", |_| {
            Err(StorageError::connection("injected get_many failure"))
        });
        let data = self.data.read();
        Ok(keys.iter().map(|key| data.get(key).cloned()).collect())
    }

    #[tracing::instrument(skip(self, key, value), fields(key_len = key.len()))]
    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()> {
        self.data.write().insert(key, Bytes::from(value));
        Ok(())
    }

    async fn transaction(&self) -> StorageResult<Box<dyn Transaction>> {
        Ok(Box::new(MemoryTransaction::new(self.clone())))
    }
}

/// In-memory transaction buffering writes until commit.
struct MemoryTransaction {
    backend: MemoryBackend,
    pending_writes: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemoryTransaction {
    fn new(backend: MemoryBackend) -> Self {
        Self { backend, pending_writes: BTreeMap::new() }
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    fn set(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.pending_writes.insert(key, value);
    }

    #[tracing::instrument(skip(self), fields(ops = self.pending_writes.len()))]
    async fn commit(self: Box<Self>) -> StorageResult<()> {
        fail_point!("memory-before-commit", |_| {
            Err(StorageError::internal("injected failure before commit"))
        });

        let mut data = self.backend.data.write();
        for (key, value) in self.pending_writes {
            data.insert(key, Bytes::from(value));
        }
        Ok(())
    }
}
