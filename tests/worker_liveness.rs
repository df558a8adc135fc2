//! Worker registration liveness with an accelerated lease TTL

use mastercoord::common::WorkerConfig;
use mastercoord::store::{CoordinationStore, MemoryStore, SharedStore};
use mastercoord::worker::{StaticAddress, WorkerRegistrar};
use std::sync::Arc;
use std::time::Duration;

const TTL_SECS: i64 = 2;

fn registrar(store: &SharedStore) -> WorkerRegistrar {
    let config = WorkerConfig {
        lease_ttl_secs: TTL_SECS,
        ..Default::default()
    };
    WorkerRegistrar::new(store.clone(), config).with_resolver(StaticAddress("10.0.0.7".into()))
}

#[tokio::test(start_paused = true)]
async fn test_registration_survives_while_kept_alive() {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let reg = registrar(&store)
        .register(Duration::from_secs(1))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(TTL_SECS as u64 * 5)).await;
    assert!(store.get(reg.key()).await.unwrap().is_some());
    assert!(reg.is_alive());
}

#[tokio::test(start_paused = true)]
async fn test_key_expires_after_keep_alive_stops() {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let registrar = registrar(&store);
    let reg = registrar.register(Duration::from_secs(1)).await.unwrap();
    let key = reg.key().to_string();
    assert_eq!(registrar.list_workers().await.unwrap().len(), 1);

    reg.stop_keep_alive().await;
    // Still registered until the lease lapses.
    assert!(store.get(&key).await.unwrap().is_some());

    tokio::time::sleep(Duration::from_secs(TTL_SECS as u64 + 1)).await;
    assert!(store.get(&key).await.unwrap().is_none());
    assert!(registrar.list_workers().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_dropped_registration_expires() {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let reg = registrar(&store)
        .register(Duration::from_secs(1))
        .await
        .unwrap();
    let key = reg.key().to_string();
    drop(reg);

    tokio::time::sleep(Duration::from_secs(TTL_SECS as u64 + 1)).await;
    assert!(store.get(&key).await.unwrap().is_none());
}
