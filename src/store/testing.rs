//! Fault injection around [`MemoryStore`] for unit tests

use super::{
    CoordinationStore, KeyValue, LeaseId, LeaseKeepAlive, MemoryStore, Txn, TxnOp, TxnResponse,
    WatchStream,
};
use crate::common::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Default)]
struct Faults {
    put_delay: Option<Duration>,
    fail_grant: bool,
    fail_keep_alive: bool,
    /// Next keep-alive stream closes after this many acknowledgements
    drop_keep_alive_after: Option<usize>,
    /// Transactions writing this key report a failed compare
    reject_writes_to: Option<String>,
}

pub(crate) struct FaultyStore {
    inner: MemoryStore,
    faults: Mutex<Faults>,
    keep_alive_calls: AtomicUsize,
}

impl FaultyStore {
    pub(crate) fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            faults: Mutex::new(Faults::default()),
            keep_alive_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn delay_puts(&self, delay: Duration) {
        self.faults.lock().put_delay = Some(delay);
    }

    pub(crate) fn fail_grant(&self) {
        self.faults.lock().fail_grant = true;
    }

    pub(crate) fn fail_keep_alive(&self) {
        self.faults.lock().fail_keep_alive = true;
    }

    pub(crate) fn drop_next_keep_alive_after(&self, acks: usize) {
        self.faults.lock().drop_keep_alive_after = Some(acks);
    }

    pub(crate) fn reject_writes_to(&self, key: &str) {
        self.faults.lock().reject_writes_to = Some(key.to_string());
    }

    pub(crate) fn keep_alive_calls(&self) -> usize {
        self.keep_alive_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn lease_count(&self) -> usize {
        self.inner.lease_count()
    }
}

#[async_trait]
impl CoordinationStore for FaultyStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        self.inner.get(key).await
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        self.inner.get_prefix(prefix).await
    }

    async fn put(&self, key: &str, value: Bytes, lease: Option<LeaseId>) -> Result<()> {
        let delay = self.faults.lock().put_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.put(key, value, lease).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.inner.delete(key).await
    }

    async fn txn(&self, txn: Txn) -> Result<TxnResponse> {
        let rejected = self.faults.lock().reject_writes_to.clone();
        if let Some(key) = rejected {
            let writes_key = txn
                .success
                .iter()
                .any(|op| matches!(op, TxnOp::Put { key: k, .. } if *k == key));
            if writes_key {
                return Ok(TxnResponse {
                    succeeded: false,
                    responses: Vec::new(),
                    revision: self.inner.revision(),
                });
            }
        }
        self.inner.txn(txn).await
    }

    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId> {
        if self.faults.lock().fail_grant {
            return Err(Error::Connection("lease grant refused".into()));
        }
        self.inner.grant_lease(ttl_secs).await
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        self.inner.revoke_lease(lease).await
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<mpsc::Receiver<LeaseKeepAlive>> {
        self.keep_alive_calls.fetch_add(1, Ordering::SeqCst);
        let (fail, drop_after) = {
            let mut faults = self.faults.lock();
            (faults.fail_keep_alive, faults.drop_keep_alive_after.take())
        };
        if fail {
            return Err(Error::Connection("keep-alive refused".into()));
        }
        let mut acks = self.inner.keep_alive(lease).await?;
        let Some(limit) = drop_after else {
            return Ok(acks);
        };

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for _ in 0..limit {
                let Some(ack) = acks.recv().await else { break };
                if tx.send(ack).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn watch(&self, key: &str) -> Result<WatchStream> {
        self.inner.watch(key).await
    }
}
