//! Per-identity coordination between lookups, writes and the cache.
//!
//! Every identity that has a lookup or a write in progress owns a [`Slot`]:
//!
//! - `generation` is bumped whenever a write opens or the identity is invalidated,
//! - `writers` counts writes that have invalidated the identity but not yet finished,
//! - `pending` is the in-flight lookup other callers may join.
//!
//! A lookup result is put into the cache only if, when it finishes, its
//! slot still has the generation the lookup started with and no open
//! writer. Populating and invalidating both happen under the table lock, so
//! a read that began before a write can never be cached after it.
//!
//! A lookup is joinable under the same condition. A caller arriving after a
//! write completed therefore never shares a read that started before it.
//!
//! Idle slots (no writer, no pending lookup) are removed. Generations come
//! from one table-wide counter, so a slot recreated after removal never
//! reuses a generation an older lookup may still hold.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use fedkeys_storage::StorageError;
use moka::sync::Cache;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::types::{ServerKeyId, ServerKeyRecord};

/// Cached lookup outcome; `None` is a cached absence.
pub(crate) type Lookup = Option<ServerKeyRecord>;
pub(crate) type KeyCache = Cache<ServerKeyId, Lookup>;
pub(crate) type BatchResults = Arc<HashMap<ServerKeyId, Lookup>>;
pub(crate) type BatchOutcome = Result<BatchResults, StorageError>;
/// Resolves to `Some(outcome)` once the lookup that owns it finishes.
pub(crate) type OutcomeReceiver = watch::Receiver<Option<BatchOutcome>>;

struct Pending {
    fetch_id: u64,
    generation: u64,
    rx: OutcomeReceiver,
}

struct Slot {
    generation: u64,
    writers: usize,
    pending: Option<Pending>,
}

impl Slot {
    fn new(generation: u64) -> Self {
        Self { generation, writers: 0, pending: None }
    }

    fn is_idle(&self) -> bool {
        self.writers == 0 && self.pending.is_none()
    }
}

#[derive(Default)]
pub(crate) struct SlotTable {
    slots: Mutex<HashMap<ServerKeyId, Slot>>,
    next_fetch_id: AtomicU64,
    /// Only advanced while `slots` is locked.
    next_generation: AtomicU64,
}

/// How a batch of cache misses will be resolved.
pub(crate) struct LookupPlan {
    /// Identities cached by a lookup that finished since the caller's first check.
    pub hits: Vec<(ServerKeyId, Lookup)>,
    /// Identities served by another caller's in-flight lookup.
    pub joined: Vec<(ServerKeyId, OutcomeReceiver)>,
    /// Identities this caller must read from the store.
    pub lead: Option<Lead>,
}

struct Claim {
    id: ServerKeyId,
    generation: u64,
    cacheable: bool,
}

/// Ownership of one batched store read.
///
/// Dropping a `Lead` without [`finish`](Lead::finish) releases its slots and
/// closes its channel, so waiters fail instead of hanging.
pub(crate) struct Lead {
    fetch_id: u64,
    tx: watch::Sender<Option<BatchOutcome>>,
    claims: Vec<Claim>,
    slots: Arc<SlotTable>,
    cache: KeyCache,
    finished: bool,
}

impl Lead {
    pub fn ids(&self) -> Vec<ServerKeyId> {
        self.claims.iter().map(|c| c.id.clone()).collect()
    }

    pub fn subscribe(&self) -> OutcomeReceiver {
        self.tx.subscribe()
    }

    /// Caches what may be cached, releases the slots and wakes waiters.
    ///
    /// Returns the number of results that were not cached because a write
    /// or invalidation overlapped the read.
    pub fn finish(mut self, outcome: BatchOutcome) -> u64 {
        let results = outcome.as_ref().ok().map(Arc::as_ref);
        let discarded = self.slots.settle(self.fetch_id, &self.claims, results, &self.cache);
        self.finished = true;
        self.tx.send_replace(Some(outcome));
        discarded
    }
}

impl Drop for Lead {
    fn drop(&mut self) {
        if !self.finished {
            self.slots.settle(self.fetch_id, &self.claims, None, &self.cache);
        }
    }
}

/// An open write over a set of identities. Closes on drop.
pub(crate) struct WriteGuard {
    slots: Arc<SlotTable>,
    ids: Vec<ServerKeyId>,
}

impl WriteGuard {
    pub fn len(&self) -> usize {
        self.ids.len()
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        self.slots.close_write(&self.ids);
    }
}

impl SlotTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Splits `misses` into late hits, joinable lookups and a new lead.
    pub fn plan(self: &Arc<Self>, misses: Vec<ServerKeyId>, cache: &KeyCache) -> LookupPlan {
        let fetch_id = self.next_fetch_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        let mut hits = Vec::new();
        let mut joined = Vec::new();
        let mut claims = Vec::new();

        {
            let mut slots = self.slots.lock();
            for id in misses {
                // Population happens under this lock, so this check is exact.
                if let Some(lookup) = cache.get(&id) {
                    hits.push((id, lookup));
                    continue;
                }

                let slot =
                    slots.entry(id.clone()).or_insert_with(|| Slot::new(self.fresh_generation()));
                if let Some(pending) = &slot.pending
                    && pending.generation == slot.generation
                    && slot.writers == 0
                {
                    joined.push((id, pending.rx.clone()));
                    continue;
                }

                // During a write the read may see either side of it: serve the
                // caller, but neither cache the result nor let others join.
                let cacheable = slot.writers == 0;
                if cacheable {
                    slot.pending =
                        Some(Pending { fetch_id, generation: slot.generation, rx: rx.clone() });
                }
                claims.push(Claim { id, generation: slot.generation, cacheable });
            }
        }

        let lead = (!claims.is_empty()).then(|| Lead {
            fetch_id,
            tx,
            claims,
            slots: Arc::clone(self),
            cache: cache.clone(),
            finished: false,
        });

        LookupPlan { hits, joined, lead }
    }

    fn settle(
        &self,
        fetch_id: u64,
        claims: &[Claim],
        results: Option<&HashMap<ServerKeyId, Lookup>>,
        cache: &KeyCache,
    ) -> u64 {
        let mut discarded = 0;
        let mut slots = self.slots.lock();

        for claim in claims {
            let Some(slot) = slots.get_mut(&claim.id) else {
                if results.is_some() {
                    discarded += 1;
                }
                continue;
            };

            if let Some(results) = results {
                if claim.cacheable && slot.generation == claim.generation && slot.writers == 0 {
                    let lookup = results.get(&claim.id).cloned().flatten();
                    cache.insert(claim.id.clone(), lookup);
                } else {
                    discarded += 1;
                }
            }

            if slot.pending.as_ref().is_some_and(|p| p.fetch_id == fetch_id) {
                slot.pending = None;
            }
            let idle = slot.is_idle();
            if idle {
                slots.remove(&claim.id);
            }
        }

        discarded
    }

    /// Evicts `ids` and registers a writer on each. No lookup that started
    /// before this call, or runs while the guard is alive, can cache them.
    pub fn open_write(self: &Arc<Self>, ids: Vec<ServerKeyId>, cache: &KeyCache) -> WriteGuard {
        {
            let mut slots = self.slots.lock();
            for id in &ids {
                let slot =
                    slots.entry(id.clone()).or_insert_with(|| Slot::new(self.fresh_generation()));
                slot.generation = self.fresh_generation();
                slot.writers += 1;
                cache.invalidate(id);
            }
        }
        WriteGuard { slots: Arc::clone(self), ids }
    }

    fn close_write(&self, ids: &[ServerKeyId]) {
        let mut slots = self.slots.lock();
        for id in ids {
            let Some(slot) = slots.get_mut(id) else {
                continue;
            };
            slot.generation = self.fresh_generation();
            slot.writers = slot.writers.saturating_sub(1);
            let idle = slot.is_idle();
            if idle {
                slots.remove(id);
            }
        }
    }

    /// Evicts one identity and fences off any lookup in flight for it.
    pub fn invalidate(&self, id: &ServerKeyId, cache: &KeyCache) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(id) {
            slot.generation = self.fresh_generation();
        }
        cache.invalidate(id);
    }

    /// Evicts everything and fences off every lookup in flight.
    pub fn invalidate_all(&self, cache: &KeyCache) {
        let mut slots = self.slots.lock();
        for slot in slots.values_mut() {
            slot.generation = self.fresh_generation();
        }
        cache.invalidate_all();
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots.lock().len()
    }
}
