#![cfg(feature = "failpoints")]
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
//! Storage failure propagation through `ServerKeyService`.
//!
//! These tests require the `failpoints` feature:
//! ```bash
//! cargo test -p fedkeys-server-keys --features failpoints --test failpoint_tests
//! ```

use std::sync::Arc;

use fedkeys_server_keys::{
    KeyStoreError, ServerKeyId, ServerKeyService, ServerKeyStore, StorageServerKeyStore,
    testutil::fetch_result,
};
use fedkeys_storage::StorageError;

fn service() -> (ServerKeyService, Arc<StorageServerKeyStore<fedkeys_storage::MemoryBackend>>) {
    let store = Arc::new(StorageServerKeyStore::in_memory());
    (ServerKeyService::new(store.clone()), store)
}

#[tokio::test]
async fn read_failure_surfaces_and_is_not_cached() {
    let scenario = fail::FailScenario::setup();
    let (service, _) = service();
    let id = ServerKeyId::new("server1", "ed25519:key1");

    fail::cfg("server-keys-get-many", "return").expect("failed to configure fail point");
    let err = service.get_keys([id.clone()]).await.unwrap_err();
    assert!(matches!(err, KeyStoreError::Storage(StorageError::Connection { .. })), "got {err:?}");
    assert!(!service.is_cached(&id));

    fail::remove("server-keys-get-many");
    assert!(service.get_keys([id.clone()]).await.unwrap()[&id].is_none());
    assert!(service.is_cached(&id));

    scenario.teardown();
}

#[tokio::test]
async fn write_failure_evicts_and_next_read_hits_store() {
    let scenario = fail::FailScenario::setup();
    let (service, store) = service();
    let (id, v1) = fetch_result("server1", "key1", 1, 100);
    let (_, v2) = fetch_result("server1", "key1", 2, 300);

    service.store_keys("notary", 1, [(id.clone(), v1)]).await.unwrap();
    service.get_keys([id.clone()]).await.unwrap();
    assert!(service.is_cached(&id));

    fail::cfg("server-keys-put-many", "return").expect("failed to configure fail point");
    let err = service.store_keys("notary", 2, [(id.clone(), v2)]).await.unwrap_err();
    assert!(matches!(err, KeyStoreError::Storage(StorageError::Internal { .. })), "got {err:?}");
    assert!(!service.is_cached(&id));
    fail::remove("server-keys-put-many");

    // The store still holds V1, and that is what the next read returns
    let found = service.get_keys([id.clone()]).await.unwrap();
    assert_eq!(found[&id].as_ref().unwrap().valid_until_ts, 100);
    assert_eq!(store.get_many(&[id.clone()]).await.unwrap()[&id].as_ref().unwrap().valid_until_ts, 100);

    let m = service.metrics();
    assert_eq!(m.store_write_errors, 1);
    assert_eq!(m.store_reads, 2);

    scenario.teardown();
}

#[tokio::test]
async fn backend_commit_failure_propagates_unchanged() {
    let scenario = fail::FailScenario::setup();
    let (service, store) = service();
    let (id, result) = fetch_result("server1", "key1", 1, 100);

    fail::cfg("memory-before-commit", "return").expect("failed to configure fail point");
    let err = service.store_keys("notary", 1, [(id.clone(), result)]).await.unwrap_err();
    assert_eq!(err.to_string(), StorageError::internal("injected failure before commit").to_string());
    assert!(store.backend().is_empty());

    scenario.teardown();
}

#[tokio::test]
async fn one_read_failure_reaches_every_coalesced_waiter() {
    let scenario = fail::FailScenario::setup();
    let (service, _) = service();
    let id = ServerKeyId::new("server1", "ed25519:key1");

    fail::cfg("memory-get-many", "return").expect("failed to configure fail point");
    let mut handles = Vec::new();
    for _ in 0..4 {
        let service = service.clone();
        let id = id.clone();
        handles.push(tokio::spawn(async move { service.get_keys([id]).await }));
    }
    for handle in handles {
        let err = handle.await.unwrap().unwrap_err();
        assert!(err.as_storage().is_some_and(StorageError::is_transient), "got {err:?}");
    }
    assert_eq!(service.metrics().store_reads, 1);

    scenario.teardown();
}
