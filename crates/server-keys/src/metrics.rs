//! Counters for the server-key cache.
//!
//! ```
//! use fedkeys_server_keys::metrics::KeyCacheMetrics;
//!
//! let metrics = KeyCacheMetrics::new();
//! metrics.record_hits(3, 1);
//! metrics.record_misses(1);
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.hits, 3);
//! assert_eq!(snapshot.negative_hits, 1);
//! assert!((snapshot.hit_rate() - 0.75).abs() < f64::EPSILON);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of [`KeyCacheMetrics`].
#[derive(Debug, Clone, Default, PartialEq, bon::Builder)]
pub struct KeyCacheMetricsSnapshot {
    /// Identities served from the cache (including negative hits).
    #[builder(default)]
    pub hits: u64,
    /// Cache hits whose cached value was "absent".
    #[builder(default)]
    pub negative_hits: u64,
    /// Identities not found in the cache.
    #[builder(default)]
    pub misses: u64,
    /// Misses satisfied by joining another caller's in-flight lookup.
    #[builder(default)]
    pub coalesced: u64,
    /// Batched `get_many` calls issued to the store.
    #[builder(default)]
    pub store_reads: u64,
    /// Identities requested across all store reads.
    #[builder(default)]
    pub store_read_keys: u64,
    /// Failed store reads.
    #[builder(default)]
    pub store_read_errors: u64,
    /// Lookup results not cached because a write or invalidation raced them.
    #[builder(default)]
    pub discarded: u64,
    /// Identities evicted by writes and explicit invalidation.
    #[builder(default)]
    pub invalidations: u64,
    /// `put_many` calls issued to the store.
    #[builder(default)]
    pub store_writes: u64,
    /// Failed store writes.
    #[builder(default)]
    pub store_write_errors: u64,
}

impl KeyCacheMetricsSnapshot {
    /// Fraction of looked-up identities served from cache (0.0 to 1.0).
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

/// Lock-free counters updated by [`ServerKeyService`](crate::ServerKeyService).
#[derive(Debug, Default)]
pub struct KeyCacheMetrics {
    hits: AtomicU64,
    negative_hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    store_reads: AtomicU64,
    store_read_keys: AtomicU64,
    store_read_errors: AtomicU64,
    discarded: AtomicU64,
    invalidations: AtomicU64,
    store_writes: AtomicU64,
    store_write_errors: AtomicU64,
}

impl KeyCacheMetrics {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `hits` cache hits, `negative` of which were cached absences.
    pub fn record_hits(&self, hits: u64, negative: u64) {
        self.hits.fetch_add(hits, Ordering::Relaxed);
        self.negative_hits.fetch_add(negative, Ordering::Relaxed);
    }

    /// Records cache misses.
    pub fn record_misses(&self, misses: u64) {
        self.misses.fetch_add(misses, Ordering::Relaxed);
    }

    /// Records misses that joined an in-flight lookup.
    pub fn record_coalesced(&self, count: u64) {
        self.coalesced.fetch_add(count, Ordering::Relaxed);
    }

    /// Records one batched store read of `keys` identities.
    pub fn record_store_read(&self, keys: u64, ok: bool) {
        self.store_reads.fetch_add(1, Ordering::Relaxed);
        self.store_read_keys.fetch_add(keys, Ordering::Relaxed);
        if !ok {
            self.store_read_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records lookup results that were not cached.
    pub fn record_discarded(&self, count: u64) {
        self.discarded.fetch_add(count, Ordering::Relaxed);
    }

    /// Records evicted identities.
    pub fn record_invalidations(&self, count: u64) {
        self.invalidations.fetch_add(count, Ordering::Relaxed);
    }

    /// Records one store write.
    pub fn record_store_write(&self, ok: bool) {
        self.store_writes.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.store_write_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Copies the current counter values.
    #[must_use]
    pub fn snapshot(&self) -> KeyCacheMetricsSnapshot {
        KeyCacheMetricsSnapshot::builder()
            .hits(self.hits.load(Ordering::Relaxed))
            .negative_hits(self.negative_hits.load(Ordering::Relaxed))
            .misses(self.misses.load(Ordering::Relaxed))
            .coalesced(self.coalesced.load(Ordering::Relaxed))
            .store_reads(self.store_reads.load(Ordering::Relaxed))
            .store_read_keys(self.store_read_keys.load(Ordering::Relaxed))
            .store_read_errors(self.store_read_errors.load(Ordering::Relaxed))
            .discarded(self.discarded.load(Ordering::Relaxed))
            .invalidations(self.invalidations.load(Ordering::Relaxed))
            .store_writes(self.store_writes.load(Ordering::Relaxed))
            .store_write_errors(self.store_write_errors.load(Ordering::Relaxed))
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_counters() {
        let metrics = KeyCacheMetrics::new();
        metrics.record_store_read(3, true);
        metrics.record_store_read(2, false);
        metrics.record_store_write(true);
        metrics.record_store_write(false);

        let snap = metrics.snapshot();
        assert_eq!(snap.store_reads, 2);
        assert_eq!(snap.store_read_keys, 5);
        assert_eq!(snap.store_read_errors, 1);
        assert_eq!(snap.store_writes, 2);
        assert_eq!(snap.store_write_errors, 1);
    }

    #[test]
    fn hit_rate_empty_is_zero() {
        assert_eq!(KeyCacheMetricsSnapshot::default().hit_rate(), 0.0);
    }

    #[test]
    fn builder_defaults_to_zero() {
        let snap = KeyCacheMetricsSnapshot::builder().misses(4).build();
        assert_eq!(snap.misses, 4);
        assert_eq!(snap.hits, 0);
        assert_eq!(snap.hit_rate(), 0.0);
    }
}
