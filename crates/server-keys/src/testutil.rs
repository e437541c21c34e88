//! Shared test utilities for the server-key store and cache.
//!
//! Feature-gated behind `testutil`:
//!
//! ```toml
//! [dev-dependencies]
//! fedkeys-server-keys = { path = "../server-keys", features = ["testutil"] }
//! ```
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use fedkeys_server_keys::testutil::{CountingKeyStore, generate_verify_key};
//! ```

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use fedkeys_storage::StorageResult;
use parking_lot::Mutex;
use rand_core::OsRng;
use tokio::sync::watch;

use crate::{
    store::{ServerKeyStore, StorageServerKeyStore},
    types::{FetchKeyResult, ServerKeyId, ServerKeyRecord, VerifyKey},
};

/// Generates a fresh Ed25519 verification key tagged with `version`.
pub fn generate_verify_key(version: &str) -> VerifyKey {
    let signing_key = SigningKey::generate(&mut OsRng);
    VerifyKey::new("ed25519", version, signing_key.verifying_key().to_bytes().to_vec())
}

/// Deterministic Ed25519 verification key derived from a one-byte seed.
///
/// Equal seeds give equal keys regardless of `version`.
pub fn seeded_verify_key(version: &str, seed: u8) -> VerifyKey {
    let signing_key = SigningKey::from_bytes(&[seed; 32]);
    VerifyKey::new("ed25519", version, signing_key.verifying_key().to_bytes().to_vec())
}

/// `(id, FetchKeyResult)` pair for `store_keys` with a seeded key.
pub fn fetch_result(
    origin_server: &str,
    version: &str,
    seed: u8,
    valid_until_ts: i64,
) -> (ServerKeyId, FetchKeyResult) {
    (
        ServerKeyId::new(origin_server, format!("ed25519:{version}")),
        FetchKeyResult::new(seeded_verify_key(version, seed), valid_until_ts),
    )
}

/// Store wrapper that counts calls and can hold reads open.
///
/// A held read performs the inner read first and then waits for
/// [`release_reads`](Self::release_reads) or
/// [`release_read`](Self::release_read) before returning, which parks a
/// lookup with an already-read (possibly stale) result.
pub struct CountingKeyStore {
    inner: Arc<dyn ServerKeyStore>,
    reads: AtomicUsize,
    read_ids: AtomicUsize,
    writes: AtomicUsize,
    read_delay: Mutex<Duration>,
    gate: watch::Sender<ReadGate>,
}

/// Reads are numbered from 1 in the order they reach the inner store.
#[derive(Default)]
struct ReadGate {
    closed: bool,
    passed: HashSet<usize>,
}

impl ReadGate {
    fn lets_through(&self, read: usize) -> bool {
        !self.closed || self.passed.contains(&read)
    }
}

impl CountingKeyStore {
    /// Wraps a fresh in-memory store.
    pub fn new() -> Self {
        Self::wrap(Arc::new(StorageServerKeyStore::in_memory()))
    }

    /// Wraps `inner`.
    pub fn wrap(inner: Arc<dyn ServerKeyStore>) -> Self {
        let (gate, _) = watch::channel(ReadGate::default());
        Self {
            inner,
            reads: AtomicUsize::new(0),
            read_ids: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            read_delay: Mutex::new(Duration::ZERO),
            gate,
        }
    }

    /// Number of `get_many` calls that reached the inner store.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Total identities requested across all reads.
    pub fn read_id_count(&self) -> usize {
        self.read_ids.load(Ordering::SeqCst)
    }

    /// Number of `put_many` calls.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Delays every read by `delay` before it reaches the inner store.
    pub fn set_read_delay(&self, delay: Duration) {
        *self.read_delay.lock() = delay;
    }

    /// Holds subsequent reads after they complete.
    pub fn hold_reads(&self) {
        self.gate.send_replace(ReadGate { closed: true, passed: HashSet::new() });
    }

    /// Lets held reads return.
    pub fn release_reads(&self) {
        self.gate.send_modify(|gate| gate.closed = false);
    }

    /// Lets the `n`th read (counting from 1) return while others stay held.
    /// `n` may name a read that has not started yet.
    pub fn release_read(&self, n: usize) {
        self.gate.send_modify(|gate| {
            gate.passed.insert(n);
        });
    }

    /// Waits until at least `n` reads have reached the inner store.
    ///
    /// # Panics
    ///
    /// Panics after five seconds.
    pub async fn wait_for_reads(&self, n: usize) {
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while self.read_count() < n {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "timed out waiting for {n} reads, saw {}", self.read_count());
    }
}

impl Default for CountingKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServerKeyStore for CountingKeyStore {
    async fn put_many(
        &self,
        fetched_from: &str,
        fetched_at_ts: i64,
        records: &[(ServerKeyId, FetchKeyResult)],
    ) -> StorageResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.put_many(fetched_from, fetched_at_ts, records).await
    }

    async fn get_many(
        &self,
        ids: &[ServerKeyId],
    ) -> StorageResult<HashMap<ServerKeyId, Option<ServerKeyRecord>>> {
        let delay = *self.read_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let result = self.inner.get_many(ids).await;
        self.read_ids.fetch_add(ids.len(), Ordering::SeqCst);
        let read = self.reads.fetch_add(1, Ordering::SeqCst) + 1;

        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|gate| gate.lets_through(read)).await;
        result
    }
}
