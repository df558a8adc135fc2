//! Master failover and ownership-loss scenarios

use bytes::Bytes;
use mastercoord::common::MasterConfig;
use mastercoord::store::{CoordinationStore, MemoryStore, SharedStore};
use mastercoord::{Error, MasterCoordinator};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const TTL_SECS: i64 = 5;

fn config() -> MasterConfig {
    MasterConfig {
        lease_ttl_secs: TTL_SECS,
        ..Default::default()
    }
}

fn spawn_master(
    store: &SharedStore,
    addr: &'static str,
) -> tokio::task::JoinHandle<mastercoord::Result<MasterCoordinator>> {
    let store = store.clone();
    tokio::spawn(async move { MasterCoordinator::new(store, &config(), addr).await })
}

#[tokio::test(start_paused = true)]
async fn test_standby_takes_over_after_master_dies() {
    let store: SharedStore = Arc::new(MemoryStore::new());

    let a = MasterCoordinator::new(store.clone(), &config(), "10.0.0.1:9000")
        .await
        .unwrap();
    a.save(b"epoch=1").await.unwrap();

    let b = spawn_master(&store, "10.0.0.2:9000");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!b.is_finished(), "standby must block while the lock is held");

    // Killed without releasing: renewal stops, the lease is left to lapse.
    let killed_at = Instant::now();
    drop(a);

    let b = b.await.unwrap().unwrap();
    assert!(killed_at.elapsed() <= Duration::from_secs(TTL_SECS as u64 + 1));

    assert_eq!(b.load().await.unwrap(), Some(Bytes::from_static(b"epoch=1")));
    let addr = store.get("/master/addr").await.unwrap().unwrap();
    assert_eq!(addr.value, Bytes::from_static(b"10.0.0.2:9000"));
}

#[tokio::test(start_paused = true)]
async fn test_save_recovers_when_lock_is_free() {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let a = MasterCoordinator::new(store.clone(), &config(), "10.0.0.1:9000")
        .await
        .unwrap();
    a.save(b"epoch=1").await.unwrap();

    // Simulate a stall long enough for the lease to lapse.
    let old_lease = a.lease().await;
    store.revoke_lease(old_lease).await.unwrap();

    a.save(b"epoch=2").await.unwrap();
    assert_ne!(a.lease().await, old_lease);
    assert_eq!(a.load().await.unwrap(), Some(Bytes::from_static(b"epoch=2")));
}

#[tokio::test(start_paused = true)]
async fn test_load_recovers_when_lock_is_free() {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let a = MasterCoordinator::new(store.clone(), &config(), "10.0.0.1:9000")
        .await
        .unwrap();
    a.save(b"epoch=1").await.unwrap();

    store.revoke_lease(a.lease().await).await.unwrap();
    assert_eq!(a.load().await.unwrap(), Some(Bytes::from_static(b"epoch=1")));
}

#[tokio::test(start_paused = true)]
async fn test_save_is_fatal_when_competitor_holds_lock() {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let a = MasterCoordinator::new(store.clone(), &config(), "10.0.0.1:9000")
        .await
        .unwrap();
    a.save(b"epoch=1").await.unwrap();

    let b = spawn_master(&store, "10.0.0.2:9000");
    tokio::time::sleep(Duration::from_millis(100)).await;
    store.revoke_lease(a.lease().await).await.unwrap();
    let b = b.await.unwrap().unwrap();

    let started = Instant::now();
    let err = a.save(b"epoch=2").await.unwrap_err();
    assert!(matches!(err, Error::LockLost { .. }));
    assert!(err.is_fatal());
    // bounded by the re-acquisition timeout
    assert!(started.elapsed() <= Duration::from_secs(6));

    // The zombie write never landed and the zombie left no contender behind.
    assert_eq!(b.load().await.unwrap(), Some(Bytes::from_static(b"epoch=1")));
    assert_eq!(store.get_prefix("/master/lock/").await.unwrap().len(), 1);

    let err = a.load().await.unwrap_err();
    assert!(err.is_fatal());
}

#[tokio::test(start_paused = true)]
async fn test_graceful_shutdown_hands_over_immediately() {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let a = MasterCoordinator::new(store.clone(), &config(), "10.0.0.1:9000")
        .await
        .unwrap();

    let b = spawn_master(&store, "10.0.0.2:9000");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let released_at = Instant::now();
    a.shutdown().await.unwrap();
    let b = b.await.unwrap().unwrap();
    assert!(released_at.elapsed() < Duration::from_secs(1));
    assert_eq!(b.load().await.unwrap(), None);
}
