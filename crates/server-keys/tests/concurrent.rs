//! Concurrency tests for `ServerKeyService`: coalescing, write/read races
//! and cancellation.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::{sync::Arc, time::Duration};

use fedkeys_server_keys::{
    KeyCacheConfig, ServerKeyId, ServerKeyService, ServerKeyStore, StorageServerKeyStore,
    testutil::{CountingKeyStore, fetch_result},
};
use tokio::task::JoinSet;

/// Concurrent callers in the coalescing and stress tests.
const CONCURRENCY: usize = 16;

/// Operations per task in the stress test.
const OPS_PER_TASK: usize = 50;

fn counting_service() -> (ServerKeyService, Arc<CountingKeyStore>) {
    let store = Arc::new(CountingKeyStore::new());
    (ServerKeyService::new(store.clone()), store)
}

// ---------------------------------------------------------------------------
// Coalescing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_misses_share_one_store_read() {
    let (service, store) = counting_service();
    let (id, result) = fetch_result("server1", "key1", 1, 100);
    service.store_keys("notary", 1, [(id.clone(), result)]).await.unwrap();

    store.hold_reads();
    let mut set = JoinSet::new();
    {
        let service = service.clone();
        let id = id.clone();
        set.spawn(async move { service.get_keys([id]).await });
    }
    store.wait_for_reads(1).await;

    for _ in 1..CONCURRENCY {
        let service = service.clone();
        let id = id.clone();
        set.spawn(async move { service.get_keys([id]).await });
    }
    // Let the joiners register before the read returns
    tokio::time::sleep(Duration::from_millis(20)).await;
    store.release_reads();

    while let Some(joined) = set.join_next().await {
        let found = joined.expect("task should not panic").expect("lookup should succeed");
        assert_eq!(found[&id].as_ref().map(|r| r.valid_until_ts), Some(100));
    }

    assert_eq!(store.read_count(), 1);
    let m = service.metrics();
    assert_eq!(m.coalesced, (CONCURRENCY - 1) as u64);
    assert_eq!(m.misses, CONCURRENCY as u64);
}

#[tokio::test]
async fn concurrent_absent_lookups_coalesce() {
    let (service, store) = counting_service();
    store.set_read_delay(Duration::from_millis(30));
    let id = ServerKeyId::new("server1", "ed25519:missing");

    let mut set = JoinSet::new();
    for _ in 0..CONCURRENCY {
        let service = service.clone();
        let id = id.clone();
        set.spawn(async move { service.get_keys([id]).await });
    }
    while let Some(joined) = set.join_next().await {
        let found = joined.unwrap().unwrap();
        assert!(found[&id].is_none());
    }

    assert_eq!(store.read_count(), 1);
    assert!(service.is_cached(&id));
}

#[tokio::test]
async fn overlapping_batches_read_only_their_own_misses() {
    let (service, store) = counting_service();
    let a = ServerKeyId::new("o", "ed25519:a");
    let b = ServerKeyId::new("o", "ed25519:b");

    store.hold_reads();
    let first = {
        let service = service.clone();
        let a = a.clone();
        tokio::spawn(async move { service.get_keys([a]).await })
    };
    store.wait_for_reads(1).await;

    let second = {
        let service = service.clone();
        let (a, b) = (a.clone(), b.clone());
        tokio::spawn(async move { service.get_keys([a, b]).await })
    };
    store.wait_for_reads(2).await;
    store.release_reads();

    assert_eq!(first.await.unwrap().unwrap().len(), 1);
    assert_eq!(second.await.unwrap().unwrap().len(), 2);
    // `a` joined the first read; the second read covered only `b`
    assert_eq!(store.read_id_count(), 2);
}

// ---------------------------------------------------------------------------
// Write/read races
// ---------------------------------------------------------------------------

/// A read that fetched V1 and is still in flight when V2 is written must
/// neither populate the cache nor be joined by later callers.
#[tokio::test]
async fn stale_inflight_read_is_not_cached_or_joined() {
    let (service, store) = counting_service();
    let (id, v1) = fetch_result("server1", "key1", 1, 100);
    let (_, v2) = fetch_result("server1", "key1", 2, 300);
    service.store_keys("notary", 1, [(id.clone(), v1)]).await.unwrap();

    store.hold_reads();
    let stale = {
        let service = service.clone();
        let id = id.clone();
        tokio::spawn(async move { service.get_keys([id]).await })
    };
    store.wait_for_reads(1).await;

    service.store_keys("notary", 2, [(id.clone(), v2.clone())]).await.unwrap();

    let fresh = {
        let service = service.clone();
        let id = id.clone();
        tokio::spawn(async move { service.get_keys([id]).await })
    };
    // The fresh caller leads its own read instead of joining the stale one
    store.wait_for_reads(2).await;
    store.release_reads();

    let stale = stale.await.unwrap().unwrap();
    assert_eq!(stale[&id].as_ref().unwrap().valid_until_ts, 100);

    let fresh = fresh.await.unwrap().unwrap();
    assert_eq!(fresh[&id].as_ref().unwrap().verify_key, v2.verify_key);

    let again = service.get_keys([id.clone()]).await.unwrap();
    assert_eq!(again[&id].as_ref().unwrap().valid_until_ts, 300);
    assert_eq!(store.read_count(), 2);
    assert_eq!(service.metrics().discarded, 1);
}

/// A cached absence read before a write is never served after it.
#[tokio::test]
async fn stale_absent_read_does_not_outlive_write() {
    let (service, store) = counting_service();
    let (id, result) = fetch_result("server1", "key1", 1, 100);

    store.hold_reads();
    let stale = {
        let service = service.clone();
        let id = id.clone();
        tokio::spawn(async move { service.get_keys([id]).await })
    };
    store.wait_for_reads(1).await;

    service.store_keys("notary", 1, [(id.clone(), result)]).await.unwrap();
    store.release_reads();
    assert!(stale.await.unwrap().unwrap()[&id].is_none());

    assert!(!service.is_cached(&id));
    let found = service.get_keys([id.clone()]).await.unwrap();
    assert_eq!(found[&id].as_ref().unwrap().valid_until_ts, 100);
}

/// A read of V1 parked across a write, a fresh read of V2 and an eviction
/// must not cache V1 once a newer lookup has taken the identity again.
#[tokio::test]
async fn stale_read_settling_after_eviction_is_discarded() {
    let (service, store) = counting_service();
    let (id, v1) = fetch_result("server1", "key1", 1, 100);
    let (_, v2) = fetch_result("server1", "key1", 2, 300);
    service.store_keys("notary", 1, [(id.clone(), v1)]).await.unwrap();

    store.hold_reads();
    let stale = {
        let service = service.clone();
        let id = id.clone();
        tokio::spawn(async move { service.get_keys([id]).await })
    };
    store.wait_for_reads(1).await;

    service.store_keys("notary", 2, [(id.clone(), v2)]).await.unwrap();

    store.release_read(2);
    let fresh = service.get_keys([id.clone()]).await.unwrap();
    assert_eq!(fresh[&id].as_ref().unwrap().valid_until_ts, 300);
    assert!(service.is_cached(&id));

    service.invalidate(&id);
    assert!(!service.is_cached(&id));

    let newest = {
        let service = service.clone();
        let id = id.clone();
        tokio::spawn(async move { service.get_keys([id]).await })
    };
    store.wait_for_reads(3).await;

    // The stale read settles while the newest lookup is still pending
    store.release_read(1);
    let stale = stale.await.unwrap().unwrap();
    assert_eq!(stale[&id].as_ref().unwrap().valid_until_ts, 100);
    assert!(!service.is_cached(&id), "V1 must not be cached after V2 was written");

    store.release_reads();
    let newest = newest.await.unwrap().unwrap();
    assert_eq!(newest[&id].as_ref().unwrap().valid_until_ts, 300);

    let again = service.get_keys([id.clone()]).await.unwrap();
    assert_eq!(again[&id].as_ref().unwrap().valid_until_ts, 300);
    assert_eq!(store.read_count(), 3);
    assert_eq!(service.metrics().discarded, 1);
}

/// Capacity eviction between a write and a stale read settling behaves like
/// an explicit invalidation.
#[tokio::test]
async fn stale_read_settling_after_capacity_eviction_is_discarded() {
    let store = Arc::new(CountingKeyStore::new());
    let config = KeyCacheConfig::builder().max_entries(1).build().expect("valid config");
    let service = ServerKeyService::with_config(store.clone(), config);
    let (id, v1) = fetch_result("server1", "key1", 1, 100);
    let (_, v2) = fetch_result("server1", "key1", 2, 300);
    let (other, other_result) = fetch_result("server2", "key1", 1, 500);
    service
        .store_keys("notary", 1, [(id.clone(), v1), (other.clone(), other_result)])
        .await
        .unwrap();

    store.hold_reads();
    let stale = {
        let service = service.clone();
        let id = id.clone();
        tokio::spawn(async move { service.get_keys([id]).await })
    };
    store.wait_for_reads(1).await;

    service.store_keys("notary", 2, [(id.clone(), v2)]).await.unwrap();
    store.release_read(2);
    service.get_keys([id.clone()]).await.unwrap();

    // Filling the single-entry cache with another identity pushes `id` out.
    // Admission may keep `id` and drop `other` instead, so make sure it is gone.
    store.release_read(3);
    service.get_keys([other.clone()]).await.unwrap();
    service.sync();
    if service.is_cached(&id) {
        service.invalidate(&id);
    }

    let newest = {
        let service = service.clone();
        let id = id.clone();
        tokio::spawn(async move { service.get_keys([id]).await })
    };
    store.wait_for_reads(4).await;

    store.release_read(1);
    stale.await.unwrap().unwrap();
    assert!(!service.is_cached(&id));

    store.release_reads();
    newest.await.unwrap().unwrap();
    let again = service.get_keys([id.clone()]).await.unwrap();
    assert_eq!(again[&id].as_ref().unwrap().valid_until_ts, 300);
}

#[tokio::test]
async fn cancelled_leader_does_not_strand_joiners() {
    let (service, store) = counting_service();
    let (id, result) = fetch_result("server1", "key1", 1, 100);
    service.store_keys("notary", 1, [(id.clone(), result)]).await.unwrap();

    store.hold_reads();
    let leader = {
        let service = service.clone();
        let id = id.clone();
        tokio::spawn(async move { service.get_keys([id]).await })
    };
    store.wait_for_reads(1).await;

    let joiner = {
        let service = service.clone();
        let id = id.clone();
        tokio::spawn(async move { service.get_keys([id]).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    leader.abort();
    assert!(leader.await.unwrap_err().is_cancelled());
    store.release_reads();

    let found = tokio::time::timeout(Duration::from_secs(5), joiner)
        .await
        .expect("joiner should finish")
        .unwrap()
        .unwrap();
    assert_eq!(found[&id].as_ref().unwrap().valid_until_ts, 100);
    assert_eq!(store.read_count(), 1);
    assert!(service.is_cached(&id));
}

// ---------------------------------------------------------------------------
// Stress
// ---------------------------------------------------------------------------

/// Writers and readers hammer a small key space. Once the writers are done,
/// every cached answer must match the store.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writes_and_reads_leave_no_stale_entries() {
    let backing = Arc::new(StorageServerKeyStore::in_memory());
    let service = ServerKeyService::new(backing.clone());
    let ids: Vec<ServerKeyId> =
        (0..4).map(|i| ServerKeyId::new("stress.example", format!("ed25519:k{i}"))).collect();

    let mut set = JoinSet::new();
    for task in 0..CONCURRENCY {
        let service = service.clone();
        let ids = ids.clone();
        set.spawn(async move {
            for op in 0..OPS_PER_TASK {
                let id = ids[(task + op) % ids.len()].clone();
                if task % 2 == 0 {
                    let valid_until_ts = (task * OPS_PER_TASK + op) as i64;
                    let (_, result) = fetch_result("stress.example", "x", task as u8, valid_until_ts);
                    service
                        .store_keys("stress", op as i64, [(id, result)])
                        .await
                        .expect("store should succeed");
                } else {
                    service.get_keys([id]).await.expect("lookup should succeed");
                }
            }
        });
    }
    while let Some(joined) = set.join_next().await {
        joined.expect("task should not panic");
    }

    let cached = service.get_keys(ids.clone()).await.unwrap();
    let stored = backing.get_many(&ids).await.unwrap();
    assert_eq!(cached, stored);
    for id in &ids {
        assert!(stored[id].is_some(), "{id} should have been written");
    }
}
