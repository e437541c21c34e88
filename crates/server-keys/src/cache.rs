//! Cache-coherent key service.
//!
//! [`ServerKeyService`] fronts a [`ServerKeyStore`] with an in-memory cache
//! that remembers both present and absent identities. Concurrent lookups
//! for the same identity share one store read, and writes invalidate
//! before they persist, so once [`store_keys`](ServerKeyService::store_keys)
//! returns no reader observes the value it replaced.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use fedkeys_server_keys::{FetchKeyResult, ServerKeyId, ServerKeyService, StorageServerKeyStore, VerifyKey};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let service = ServerKeyService::new(Arc::new(StorageServerKeyStore::in_memory()));
//! let id = ServerKeyId::new("server1", "ed25519:key1");
//!
//! // Unknown identities come back as `None`, and the absence is cached
//! assert!(service.get_keys([id.clone()]).await?[&id].is_none());
//!
//! let key = VerifyKey::new("ed25519", "key1", vec![0u8; 32]);
//! service.store_keys("notary.example", 1_000, [(id.clone(), FetchKeyResult::new(key, 2_000))]).await?;
//!
//! let found = service.get_keys([id.clone()]).await?;
//! assert_eq!(found[&id].as_ref().map(|r| r.valid_until_ts), Some(2_000));
//! # Ok(())
//! # }
//! ```
//!
//! # Background tasks
//!
//! Store reads and writes run on spawned Tokio tasks. A caller that stops
//! polling does not cancel a read other callers are waiting on, nor a write
//! that has already invalidated the cache. Every method that touches the
//! store must therefore be called from within a Tokio runtime.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use fedkeys_storage::StorageError;
use moka::sync::Cache;
use tracing::field::Empty;

use crate::{
    config::KeyCacheConfig,
    error::Result,
    metrics::{KeyCacheMetrics, KeyCacheMetricsSnapshot},
    slots::{BatchResults, KeyCache, Lead, OutcomeReceiver, SlotTable},
    store::ServerKeyStore,
    types::{FetchKeyResult, ServerKeyId, ServerKeyRecord, validate_record},
};

/// Lookup results: one entry per distinct requested identity, `None` when
/// the store has no record.
pub type ServerKeyLookup = HashMap<ServerKeyId, Option<ServerKeyRecord>>;

/// Caching, coalescing front for a [`ServerKeyStore`].
///
/// Cloning is cheap; clones share the cache and the store.
#[derive(Clone)]
pub struct ServerKeyService {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn ServerKeyStore>,
    cache: KeyCache,
    slots: Arc<SlotTable>,
    metrics: KeyCacheMetrics,
    config: KeyCacheConfig,
}

impl ServerKeyService {
    /// Creates a service with [`KeyCacheConfig::default`].
    #[must_use]
    pub fn new(store: Arc<dyn ServerKeyStore>) -> Self {
        Self::with_config(store, KeyCacheConfig::default())
    }

    /// Creates a service with an explicit cache configuration.
    #[must_use]
    pub fn with_config(store: Arc<dyn ServerKeyStore>, config: KeyCacheConfig) -> Self {
        let mut builder = Cache::builder().max_capacity(config.max_entries());
        if let Some(ttl) = config.ttl() {
            builder = builder.time_to_live(ttl);
        }

        Self {
            inner: Arc::new(Inner {
                store,
                cache: builder.build(),
                slots: Arc::new(SlotTable::new()),
                metrics: KeyCacheMetrics::new(),
                config,
            }),
        }
    }

    /// Looks up the most recent record for each identity.
    ///
    /// Duplicates in `ids` are collapsed. Cached identities (present or
    /// absent) are answered without touching the store. The rest are either
    /// joined onto a matching in-flight read or fetched in one batched
    /// `get_many`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::Storage`](crate::KeyStoreError::Storage) if a
    /// store read this call depends on fails. Nothing is cached from a
    /// failed read.
    #[tracing::instrument(
        skip(self, ids),
        fields(requested = Empty, hits = Empty, store_keys = Empty)
    )]
    pub async fn get_keys<I>(&self, ids: I) -> Result<ServerKeyLookup>
    where
        I: IntoIterator<Item = ServerKeyId>,
    {
        let requested: HashSet<ServerKeyId> = ids.into_iter().collect();
        let span = tracing::Span::current();
        span.record("requested", requested.len());
        if requested.is_empty() {
            return Ok(HashMap::new());
        }

        let mut results = HashMap::with_capacity(requested.len());
        let mut misses = Vec::new();
        let (mut hits, mut negative) = (0u64, 0u64);

        for id in requested {
            match self.inner.cache.get(&id) {
                Some(lookup) => {
                    hits += 1;
                    negative += u64::from(lookup.is_none());
                    results.insert(id, lookup);
                },
                None => misses.push(id),
            }
        }

        if misses.is_empty() {
            self.inner.metrics.record_hits(hits, negative);
            span.record("hits", hits);
            tracing::debug!(hits, "Server key cache hit");
            return Ok(results);
        }

        let plan = self.inner.slots.plan(misses, &self.inner.cache);
        for (id, lookup) in plan.hits {
            hits += 1;
            negative += u64::from(lookup.is_none());
            results.insert(id, lookup);
        }

        let mut waits: Vec<(ServerKeyId, OutcomeReceiver)> = plan.joined;
        let coalesced = waits.len() as u64;
        let mut led = 0;
        if let Some(lead) = plan.lead {
            let rx = lead.subscribe();
            let ids = lead.ids();
            led = ids.len();
            waits.extend(ids.into_iter().map(|id| (id, rx.clone())));
            tokio::spawn(Arc::clone(&self.inner).run_lookup(lead));
        }

        self.inner.metrics.record_hits(hits, negative);
        self.inner.metrics.record_misses(waits.len() as u64);
        self.inner.metrics.record_coalesced(coalesced);
        span.record("hits", hits);
        span.record("store_keys", led);
        tracing::debug!(hits, misses = waits.len(), coalesced, "Server key cache miss");

        for (id, mut rx) in waits {
            let found = wait_outcome(&mut rx).await?;
            results.insert(id.clone(), found.get(&id).cloned().flatten());
        }

        Ok(results)
    }

    /// Persists a batch of records and evicts them from the cache.
    ///
    /// All records share `fetched_from` and `fetched_at_ts`. The cache is
    /// invalidated before the store commit, and no read that overlaps the
    /// write can repopulate it with the old value. If an identity appears
    /// more than once, the last occurrence wins.
    ///
    /// # Errors
    ///
    /// - [`KeyStoreError::InvalidRecord`](crate::KeyStoreError::InvalidRecord)
    ///   if any record fails validation. Nothing is written.
    /// - [`KeyStoreError::Storage`](crate::KeyStoreError::Storage) if the
    ///   store write fails. The affected identities stay uncached, so the
    ///   next lookup reads whatever the store actually holds.
    #[tracing::instrument(skip(self, records), fields(count = Empty))]
    pub async fn store_keys<I>(
        &self,
        fetched_from: &str,
        fetched_at_ts: i64,
        records: I,
    ) -> Result<()>
    where
        I: IntoIterator<Item = (ServerKeyId, FetchKeyResult)>,
    {
        let records: Vec<(ServerKeyId, FetchKeyResult)> = records.into_iter().collect();
        tracing::Span::current().record("count", records.len());

        for (id, result) in &records {
            validate_record(fetched_from, fetched_at_ts, id, result)?;
        }
        if records.is_empty() {
            return Ok(());
        }

        let ids: Vec<ServerKeyId> = records
            .iter()
            .map(|(id, _)| id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let inner = Arc::clone(&self.inner);
        let fetched_from = fetched_from.to_owned();

        let write = tokio::spawn(inner.run_write(fetched_from, fetched_at_ts, ids, records));
        match write.await {
            Ok(result) => result,
            Err(e) => {
                Err(StorageError::internal_with_source("server key write task failed", e).into())
            },
        }
    }

    /// Evicts one identity from the cache.
    ///
    /// A lookup already in flight for it will not cache its result.
    #[tracing::instrument(skip(self))]
    pub fn invalidate(&self, id: &ServerKeyId) {
        self.inner.slots.invalidate(id, &self.inner.cache);
        self.inner.metrics.record_invalidations(1);

        tracing::info!(
            audit.action = "invalidate_cache",
            audit.resource = %id,
            audit.result = "success",
            "audit_event"
        );
    }

    /// Evicts every cached identity.
    #[tracing::instrument(skip(self))]
    pub fn clear_all(&self) {
        let evicted = self.inner.cache.entry_count();
        self.inner.slots.invalidate_all(&self.inner.cache);
        self.inner.metrics.record_invalidations(evicted);

        tracing::info!(
            audit.action = "clear_cache",
            audit.result = "success",
            evicted,
            "audit_event"
        );
    }

    /// Whether `id` currently has a cache entry (present or absent).
    #[must_use]
    pub fn is_cached(&self, id: &ServerKeyId) -> bool {
        self.inner.cache.contains_key(id)
    }

    /// Approximate number of cache entries.
    ///
    /// Eviction bookkeeping is deferred; call [`sync`](Self::sync) first for
    /// an exact count.
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.inner.cache.entry_count()
    }

    /// Runs pending cache maintenance.
    pub fn sync(&self) {
        self.inner.cache.run_pending_tasks();
    }

    /// Counter snapshot.
    #[must_use]
    pub fn metrics(&self) -> KeyCacheMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &KeyCacheConfig {
        &self.inner.config
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ServerKeyStore> {
        &self.inner.store
    }
}

impl Inner {
    async fn run_lookup(self: Arc<Self>, lead: Lead) {
        let ids = lead.ids();
        let result = self.store.get_many(&ids).await;
        self.metrics.record_store_read(ids.len() as u64, result.is_ok());

        let outcome = result.map(|mut found| {
            for id in &ids {
                found.entry(id.clone()).or_insert(None);
            }
            Arc::new(found)
        });
        if let Err(err) = &outcome {
            tracing::warn!(error = %err, count = ids.len(), "Server key lookup failed");
        }

        let discarded = lead.finish(outcome);
        if discarded > 0 {
            self.metrics.record_discarded(discarded);
            tracing::debug!(discarded, "Lookup overlapped a write; results not cached");
        }
    }

    async fn run_write(
        self: Arc<Self>,
        fetched_from: String,
        fetched_at_ts: i64,
        ids: Vec<ServerKeyId>,
        records: Vec<(ServerKeyId, FetchKeyResult)>,
    ) -> Result<()> {
        let guard = self.slots.open_write(ids, &self.cache);
        self.metrics.record_invalidations(guard.len() as u64);

        let result = self.store.put_many(&fetched_from, fetched_at_ts, &records).await;
        drop(guard);
        self.metrics.record_store_write(result.is_ok());

        match &result {
            Ok(()) => tracing::debug!(count = records.len(), %fetched_from, "Server keys stored"),
            Err(err) => tracing::warn!(
                error = %err,
                count = records.len(),
                %fetched_from,
                "Server key write failed"
            ),
        }
        result.map_err(Into::into)
    }
}

async fn wait_outcome(rx: &mut OutcomeReceiver) -> Result<BatchResults> {
    let outcome = rx
        .wait_for(Option::is_some)
        .await
        .map_err(|_| StorageError::internal("server key lookup ended without a result"))?;

    match outcome.as_ref() {
        Some(Ok(found)) => Ok(Arc::clone(found)),
        Some(Err(err)) => Err(err.clone().into()),
        None => Err(StorageError::internal("server key lookup ended without a result").into()),
    }
}
