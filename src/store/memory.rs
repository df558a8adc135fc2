//! In-process coordination store
//!
//! Linearizable by construction: every operation runs under one mutex and
//! bumps a single global revision, the way etcd's MVCC store does. Leases
//! expire on a background reaper driven by `tokio::time`, so tests running
//! with a paused clock see TTLs elapse instantly.

use super::{
    Compare, CoordinationStore, EventType, KeyValue, LeaseId, LeaseKeepAlive, Txn, TxnOp,
    TxnOpResponse, TxnResponse, WatchEvent, WatchStream, MAX_LEASE_TTL_SECS,
};
use crate::common::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Minimum keep-alive period, whatever the TTL
const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(100);

struct Lease {
    ttl: i64,
    deadline: Instant,
    keys: BTreeSet<String>,
}

struct Watcher {
    key: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

#[derive(Default)]
struct State {
    revision: i64,
    next_lease: LeaseId,
    kvs: BTreeMap<String, KeyValue>,
    leases: HashMap<LeaseId, Lease>,
    watchers: Vec<Watcher>,
}

impl State {
    fn range(&self, key: &str, prefix: bool) -> Vec<KeyValue> {
        if prefix {
            self.kvs
                .range(key.to_string()..)
                .take_while(|(k, _)| k.starts_with(key))
                .map(|(_, kv)| kv.clone())
                .collect()
        } else {
            self.kvs.get(key).cloned().into_iter().collect()
        }
    }

    fn compare(&self, cmp: &Compare) -> bool {
        match cmp {
            Compare::CreateRevision { key, revision } => {
                self.kvs.get(key).map_or(0, |kv| kv.create_revision) == *revision
            }
            Compare::Value { key, value } => self.kvs.get(key).is_some_and(|kv| kv.value == *value),
        }
    }

    fn publish(&mut self, event: WatchEvent) {
        self.watchers.retain(|w| {
            if w.key == event.key {
                w.tx.send(event.clone()).is_ok()
            } else {
                !w.tx.is_closed()
            }
        });
    }

    fn put(&mut self, key: &str, value: Bytes, lease: LeaseId, revision: i64) {
        let create_revision = match self.kvs.get(key) {
            Some(old) => {
                if old.lease != 0 && old.lease != lease {
                    if let Some(l) = self.leases.get_mut(&old.lease) {
                        l.keys.remove(key);
                    }
                }
                old.create_revision
            }
            None => revision,
        };
        if let Some(l) = self.leases.get_mut(&lease) {
            l.keys.insert(key.to_string());
        }
        self.kvs.insert(
            key.to_string(),
            KeyValue {
                key: key.to_string(),
                value: value.clone(),
                create_revision,
                mod_revision: revision,
                lease,
            },
        );
        self.publish(WatchEvent {
            event_type: EventType::Put,
            key: key.to_string(),
            value,
            revision,
        });
    }

    fn delete(&mut self, key: &str, revision: i64) -> bool {
        let Some(old) = self.kvs.remove(key) else {
            return false;
        };
        if let Some(l) = self.leases.get_mut(&old.lease) {
            l.keys.remove(key);
        }
        self.publish(WatchEvent {
            event_type: EventType::Delete,
            key: key.to_string(),
            value: Bytes::new(),
            revision,
        });
        true
    }

    /// Run `ops` as one revision. Lease references are checked up front so a
    /// failing op never leaves the branch half applied.
    fn execute(&mut self, ops: Vec<TxnOp>) -> Result<Vec<TxnOpResponse>> {
        for op in &ops {
            if let TxnOp::Put {
                lease: Some(lease), ..
            } = op
            {
                if *lease != 0 && !self.leases.contains_key(lease) {
                    return Err(Error::LeaseNotFound(*lease));
                }
            }
        }

        let revision = self.revision + 1;
        let mut changed = false;
        let mut responses = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                TxnOp::Put { key, value, lease } => {
                    self.put(&key, value, lease.unwrap_or(0), revision);
                    changed = true;
                    responses.push(TxnOpResponse::Put);
                }
                TxnOp::Get { key, prefix } => {
                    responses.push(TxnOpResponse::Get(self.range(&key, prefix)));
                }
                TxnOp::Delete { key } => {
                    let deleted = self.delete(&key, revision);
                    changed |= deleted;
                    responses.push(TxnOpResponse::Delete(deleted as u64));
                }
            }
        }
        if changed {
            self.revision = revision;
        }
        Ok(responses)
    }

    fn drop_lease(&mut self, id: LeaseId) -> bool {
        let Some(lease) = self.leases.remove(&id) else {
            return false;
        };
        if !lease.keys.is_empty() {
            let revision = self.revision + 1;
            for key in &lease.keys {
                self.delete(key, revision);
            }
            self.revision = revision;
        }
        true
    }

    fn refresh(&mut self, id: LeaseId, now: Instant) -> Option<i64> {
        let lease = self.leases.get_mut(&id)?;
        lease.deadline = now + Duration::from_secs(lease.ttl as u64);
        Some(lease.ttl)
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.leases.values().map(|l| l.deadline).min()
    }

    fn expire_due(&mut self, now: Instant) -> Vec<LeaseId> {
        let due: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, l)| l.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &due {
            self.drop_lease(*id);
        }
        due
    }
}

struct Inner {
    state: Mutex<State>,
    lease_changed: Notify,
}

/// In-memory [`CoordinationStore`].
///
/// Must be created inside a Tokio runtime: lease expiry runs on a spawned
/// reaper task that lives as long as the store.
pub struct MemoryStore {
    inner: Arc<Inner>,
    reaper: JoinHandle<()>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(State::default()),
            lease_changed: Notify::new(),
        });
        let reaper = tokio::spawn(reap(Arc::clone(&inner)));
        Self { inner, reaper }
    }

    /// Current store revision
    pub fn revision(&self) -> i64 {
        self.inner.state.lock().revision
    }

    /// Number of live leases
    pub fn lease_count(&self) -> usize {
        self.inner.state.lock().leases.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        self.reaper.abort();
    }
}

async fn reap(inner: Arc<Inner>) {
    loop {
        let next = inner.state.lock().next_deadline();
        match next {
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = inner.lease_changed.notified() => {}
                }
            }
            None => inner.lease_changed.notified().await,
        }
        let expired = inner.state.lock().expire_due(Instant::now());
        for lease in expired {
            tracing::debug!(lease = format_args!("{:x}", lease), "lease expired");
        }
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        Ok(self.inner.state.lock().kvs.get(key).cloned())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        Ok(self.inner.state.lock().range(prefix, true))
    }

    async fn put(&self, key: &str, value: Bytes, lease: Option<LeaseId>) -> Result<()> {
        self.inner.state.lock().execute(vec![TxnOp::Put {
            key: key.to_string(),
            value,
            lease,
        }])?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let responses = self
            .inner
            .state
            .lock()
            .execute(vec![TxnOp::delete(key)])?;
        Ok(matches!(responses.first(), Some(TxnOpResponse::Delete(n)) if *n > 0))
    }

    async fn txn(&self, txn: Txn) -> Result<TxnResponse> {
        let mut state = self.inner.state.lock();
        let succeeded = txn.compares.iter().all(|c| state.compare(c));
        let ops = if succeeded { txn.success } else { txn.failure };
        let responses = state.execute(ops)?;
        Ok(TxnResponse {
            succeeded,
            responses,
            revision: state.revision,
        })
    }

    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId> {
        if ttl_secs <= 0 || ttl_secs > MAX_LEASE_TTL_SECS {
            return Err(Error::InvalidConfig(format!(
                "lease ttl must be in 1..={}, got {}",
                MAX_LEASE_TTL_SECS, ttl_secs
            )));
        }
        let id = {
            let mut state = self.inner.state.lock();
            state.next_lease += 1;
            let id = state.next_lease;
            state.leases.insert(
                id,
                Lease {
                    ttl: ttl_secs,
                    deadline: Instant::now() + Duration::from_secs(ttl_secs as u64),
                    keys: BTreeSet::new(),
                },
            );
            id
        };
        self.inner.lease_changed.notify_one();
        Ok(id)
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        if !self.inner.state.lock().drop_lease(lease) {
            return Err(Error::LeaseNotFound(lease));
        }
        self.inner.lease_changed.notify_one();
        Ok(())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<mpsc::Receiver<LeaseKeepAlive>> {
        let ttl = self
            .inner
            .state
            .lock()
            .leases
            .get(&lease)
            .map(|l| l.ttl)
            .ok_or(Error::LeaseNotFound(lease))?;
        let interval = (Duration::from_secs(ttl as u64) / 3).max(MIN_RENEW_INTERVAL);

        let (tx, rx) = mpsc::channel(16);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                let renewed = inner.state.lock().refresh(lease, Instant::now());
                let Some(ttl) = renewed else {
                    break;
                };
                if tx.send(LeaseKeepAlive { lease, ttl }).await.is_err() {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = tx.closed() => break,
                }
            }
        });
        Ok(rx)
    }

    async fn watch(&self, key: &str) -> Result<WatchStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.state.lock().watchers.push(Watcher {
            key: key.to_string(),
            tx,
        });
        Ok(UnboundedReceiverStream::new(rx).map(Ok).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_revisions() {
        let store = MemoryStore::new();
        store.put("/a", Bytes::from_static(b"1"), None).await.unwrap();
        store.put("/a", Bytes::from_static(b"2"), None).await.unwrap();

        let kv = store.get("/a").await.unwrap().unwrap();
        assert_eq!(kv.value, Bytes::from_static(b"2"));
        assert_eq!(kv.create_revision, 1);
        assert_eq!(kv.mod_revision, 2);
        assert_eq!(store.revision(), 2);
        assert!(store.get("/missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_prefix_range_is_bounded() {
        let store = MemoryStore::new();
        for key in ["/lock/1", "/lock/2", "/lockx", "/other"] {
            store.put(key, Bytes::new(), None).await.unwrap();
        }
        let keys: Vec<String> = store
            .get_prefix("/lock/")
            .await
            .unwrap()
            .into_iter()
            .map(|kv| kv.key)
            .collect();
        assert_eq!(keys, vec!["/lock/1", "/lock/2"]);
    }

    #[tokio::test]
    async fn test_txn_compare_create_revision() {
        let store = MemoryStore::new();
        let create = || {
            Txn::new()
                .when([Compare::create_revision("/k", 0)])
                .and_then([TxnOp::put("/k", "first")])
                .or_else([TxnOp::get("/k")])
        };

        let first = store.txn(create()).await.unwrap();
        assert!(first.succeeded);
        assert_eq!(first.revision, 1);

        let second = store.txn(create()).await.unwrap();
        assert!(!second.succeeded);
        assert_eq!(second.kvs(0)[0].value, Bytes::from_static(b"first"));
        assert_eq!(second.revision, 1);
    }

    #[tokio::test]
    async fn test_put_with_unknown_lease_fails_atomically() {
        let store = MemoryStore::new();
        let txn = Txn::new().and_then([
            TxnOp::put("/a", "1"),
            TxnOp::put_with_lease("/b", "2", 42),
        ]);
        assert!(matches!(store.txn(txn).await, Err(Error::LeaseNotFound(42))));
        assert!(store.get("/a").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry_deletes_keys() {
        let store = MemoryStore::new();
        let lease = store.grant_lease(2).await.unwrap();
        store
            .put("/trainer/x", Bytes::from_static(b"10.0.0.2"), Some(lease))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(store.get("/trainer/x").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert!(store.get("/trainer/x").await.unwrap().is_none());
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_holds_lease_until_receiver_dropped() {
        let store = MemoryStore::new();
        let lease = store.grant_lease(3).await.unwrap();
        store.put("/k", Bytes::new(), Some(lease)).await.unwrap();

        let mut acks = store.keep_alive(lease).await.unwrap();
        let consumer = tokio::spawn(async move {
            let mut count = 0;
            while acks.recv().await.is_some() {
                count += 1;
                if count == 10 {
                    break;
                }
            }
        });
        consumer.await.unwrap();
        // ten acks at one-second intervals: well past the TTL
        assert!(store.get("/k").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(store.get("/k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_revoke_unknown_lease() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.revoke_lease(7).await,
            Err(Error::LeaseNotFound(7))
        ));
        assert!(matches!(
            store.keep_alive(7).await,
            Err(Error::LeaseNotFound(7))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_ttl_bounds() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.grant_lease(i64::MAX).await,
            Err(Error::InvalidConfig(_))
        ));
        assert!(store.grant_lease(0).await.is_err());

        let lease = store.grant_lease(MAX_LEASE_TTL_SECS).await.unwrap();
        let mut acks = store.keep_alive(lease).await.unwrap();
        assert_eq!(acks.recv().await.unwrap().ttl, MAX_LEASE_TTL_SECS);
    }

    #[tokio::test]
    async fn test_watch_sees_put_and_delete() {
        let store = MemoryStore::new();
        let mut events = store.watch("/w").await.unwrap();
        store.put("/other", Bytes::new(), None).await.unwrap();
        store.put("/w", Bytes::from_static(b"v"), None).await.unwrap();
        assert!(store.delete("/w").await.unwrap());
        assert!(!store.delete("/w").await.unwrap());

        let put = events.next().await.unwrap().unwrap();
        assert_eq!(put.event_type, EventType::Put);
        assert_eq!(put.value, Bytes::from_static(b"v"));
        let del = events.next().await.unwrap().unwrap();
        assert_eq!(del.event_type, EventType::Delete);
        assert!(del.value.is_empty());
    }
}
