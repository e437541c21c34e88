//! Shared test utilities for storage backend testing.
//!
//! Feature-gated behind `testutil` so it never leaks into production builds.
//!
//! ```toml
//! [dev-dependencies]
//! fedkeys-storage = { path = "../storage", features = ["testutil"] }
//! ```

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::{
    backend::StorageBackend,
    error::{StorageError, StorageResult},
    memory::MemoryBackend,
    transaction::Transaction,
};

/// Which operations a [`FailingBackend`] should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOn {
    /// `get` and `get_many`.
    Reads,
    /// `set` and transaction commits.
    Writes,
    /// Every operation.
    All,
}

/// A [`MemoryBackend`] wrapper that can be switched into a failing state.
///
/// While armed, the selected operations return a clone of the configured
/// error without touching the inner backend. Read and commit calls are
/// counted whether or not they fail.
#[derive(Clone)]
pub struct FailingBackend {
    inner: MemoryBackend,
    armed: Arc<AtomicBool>,
    fail_on: Arc<Mutex<FailOn>>,
    error: Arc<Mutex<StorageError>>,
    reads: Arc<AtomicUsize>,
    commits: Arc<AtomicUsize>,
}

impl FailingBackend {
    /// Wraps a fresh [`MemoryBackend`]. Starts disarmed.
    #[must_use]
    pub fn new() -> Self {
        Self::wrap(MemoryBackend::new())
    }

    /// Wraps an existing backend so tests can inspect it directly.
    #[must_use]
    pub fn wrap(inner: MemoryBackend) -> Self {
        Self {
            inner,
            armed: Arc::new(AtomicBool::new(false)),
            fail_on: Arc::new(Mutex::new(FailOn::All)),
            error: Arc::new(Mutex::new(StorageError::connection("injected failure"))),
            reads: Arc::new(AtomicUsize::new(0)),
            commits: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Starts failing `fail_on` operations with `error`.
    pub fn fail(&self, fail_on: FailOn, error: StorageError) {
        *self.fail_on.lock() = fail_on;
        *self.error.lock() = error;
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Stops failing.
    pub fn heal(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }

    /// The wrapped backend.
    #[must_use]
    pub fn inner(&self) -> &MemoryBackend {
        &self.inner
    }

    /// Number of `get`/`get_many` calls observed.
    #[must_use]
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of transaction commits observed.
    #[must_use]
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    fn check(&self, op: FailOn) -> StorageResult<()> {
        if !self.armed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let fail_on = *self.fail_on.lock();
        if fail_on == FailOn::All || fail_on == op {
            return Err(self.error.lock().clone());
        }
        Ok(())
    }
}

impl Default for FailingBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for FailingBackend {
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.check(FailOn::Reads)?;
        self.inner.get(key).await
    }

    async fn get_many(&self, keys: &[Vec<u8>]) -> StorageResult<Vec<Option<Bytes>>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.check(FailOn::Reads)?;
        self.inner.get_many(keys).await
    }

    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()> {
        self.check(FailOn::Writes)?;
        self.inner.set(key, value).await
    }

    async fn transaction(&self) -> StorageResult<Box<dyn Transaction>> {
        let inner = self.inner.transaction().await?;
        Ok(Box::new(FailingTransaction { inner, backend: self.clone() }))
    }
}

struct FailingTransaction {
    inner: Box<dyn Transaction>,
    backend: FailingBackend,
}

#[async_trait]
impl Transaction for FailingTransaction {
    fn set(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.inner.set(key, value);
    }

    async fn commit(self: Box<Self>) -> StorageResult<()> {
        self.backend.commits.fetch_add(1, Ordering::SeqCst);
        self.backend.check(FailOn::Writes)?;
        self.inner.commit().await
    }
}

/// Assert that a result is an error matching the given [`StorageError`] pattern.
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use fedkeys_storage::{StorageError, StorageResult, assert_storage_error};
///
/// let result: StorageResult<()> = Err(StorageError::Timeout);
/// assert_storage_error!(result, StorageError::Timeout);
/// ```
#[macro_export]
macro_rules! assert_storage_error {
    ($result:expr, $pattern:pat) => {
        match &$result {
            Err($pattern) => {},
            other => panic!("expected {}, got: {:?}", stringify!($pattern), other),
        }
    };
}
