//! Persistent key store for remote servers' verification keys.
//!
//! [`ServerKeyStore`] is the durable half of the cache-store: a mapping from
//! `(origin_server, key_id)` to the latest observed key. It has no cache of
//! its own; [`ServerKeyService`](crate::ServerKeyService) puts one in front
//! of it.
//!
//! # Usage
//!
//! ```no_run
//! use fedkeys_server_keys::{FetchKeyResult, ServerKeyId, ServerKeyStore, StorageServerKeyStore, VerifyKey};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = StorageServerKeyStore::in_memory();
//! let id = ServerKeyId::new("server1", "ed25519:key1");
//! let key = VerifyKey::new("ed25519", "key1", vec![0u8; 32]);
//!
//! store.put_many("notary.example", 10, &[(id.clone(), FetchKeyResult::new(key, 100))]).await?;
//!
//! let found = store.get_many(&[id.clone()]).await?;
//! assert_eq!(found[&id].as_ref().map(|r| r.valid_until_ts), Some(100));
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;

use async_trait::async_trait;
use fail::fail_point;
use fedkeys_storage::{MemoryBackend, StorageBackend, StorageError, StorageResult};

use crate::{
    encoding::{decode_record, encode_record, storage_key},
    types::{FetchKeyResult, ServerKeyId, ServerKeyRecord, split_key_id},
};

/// Persistence layer for server verification keys.
///
/// # Error Handling
///
/// I/O faults surface as [`StorageError`]. Implementations do not retry.
///
/// # Validation
///
/// Input validation happens in
/// [`ServerKeyService::store_keys`](crate::ServerKeyService::store_keys).
/// `put_many` still rejects any key id that is not `algorithm:version`,
/// since such a row could never be decoded again.
#[async_trait]
pub trait ServerKeyStore: Send + Sync {
    /// Writes or overwrites every record, all tagged with the same
    /// `fetched_from` / `fetched_at_ts`.
    ///
    /// The records are durable when this returns `Ok`. If an identity
    /// appears more than once, the last occurrence wins.
    async fn put_many(
        &self,
        fetched_from: &str,
        fetched_at_ts: i64,
        records: &[(ServerKeyId, FetchKeyResult)],
    ) -> StorageResult<()>;

    /// Looks up every identity.
    ///
    /// The returned map has exactly one entry per distinct requested identity;
    /// identities with no stored record map to `None`.
    async fn get_many(
        &self,
        ids: &[ServerKeyId],
    ) -> StorageResult<HashMap<ServerKeyId, Option<ServerKeyRecord>>>;
}

/// [`ServerKeyStore`] over any [`StorageBackend`].
///
/// Each call to `put_many` is one backend transaction, and each call to
/// `get_many` is one batched backend read.
#[derive(Clone)]
pub struct StorageServerKeyStore<B> {
    backend: B,
}

impl<B: StorageBackend> StorageServerKeyStore<B> {
    /// Wraps `backend`.
    #[must_use]
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    /// The wrapped backend.
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }
}

impl StorageServerKeyStore<MemoryBackend> {
    /// A store over a fresh [`MemoryBackend`].
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(MemoryBackend::new())
    }
}

#[async_trait]
impl<B: StorageBackend> ServerKeyStore for StorageServerKeyStore<B> {
    #[tracing::instrument(skip(self, records), fields(count = records.len()))]
    async fn put_many(
        &self,
        fetched_from: &str,
        fetched_at_ts: i64,
        records: &[(ServerKeyId, FetchKeyResult)],
    ) -> StorageResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        fail_point!("server-keys-put-many", |_| {
            Err(StorageError::internal("injected failure in put_many"))
        });

        for (id, _) in records {
            if split_key_id(&id.key_id).is_err() {
                return Err(StorageError::serialization(format!(
                    "key id {:?} of {} is not algorithm:version",
                    id.key_id, id.origin_server
                )));
            }
        }

        let mut txn = self.backend.transaction().await?;
        for (id, result) in records {
            txn.set(storage_key(id), encode_record(result, fetched_from, fetched_at_ts)?);
        }
        txn.commit().await
    }

    #[tracing::instrument(skip(self, ids), fields(count = ids.len()))]
    async fn get_many(
        &self,
        ids: &[ServerKeyId],
    ) -> StorageResult<HashMap<ServerKeyId, Option<ServerKeyRecord>>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        fail_point!("server-keys-get-many", |_| {
            Err(StorageError::connection("injected failure in get_many"))
        });

        let keys: Vec<Vec<u8>> = ids.iter().map(storage_key).collect();
        let values = self.backend.get_many(&keys).await?;
        if values.len() != ids.len() {
            return Err(StorageError::internal(format!(
                "backend returned {} values for {} keys",
                values.len(),
                ids.len()
            )));
        }

        let mut found = HashMap::with_capacity(ids.len());
        for (id, value) in ids.iter().zip(values) {
            let record = value.map(|bytes| decode_record(&id.key_id, &bytes)).transpose()?;
            found.insert(id.clone(), record);
        }
        tracing::debug!(
            requested = ids.len(),
            present = found.values().filter(|r| r.is_some()).count(),
            "server keys read"
        );
        Ok(found)
    }
}
