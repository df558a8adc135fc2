//! Master coordinator

use crate::common::{EtcdConfig, Error, MasterConfig, Result};
use crate::lock::DistributedLock;
use crate::store::{EtcdStore, LeaseId, SharedStore, Txn, TxnOp};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Holds the master lock and guards every state read and write with it.
///
/// Construction blocks until the lock is won, then publishes the master
/// address under the same ownership precondition. Every [`save`] and
/// [`load`] runs as a transaction conditioned on still owning the lock; when
/// the condition fails the lock is re-acquired within a bounded timeout and
/// the operation retried. Failure to re-acquire is reported as the fatal
/// [`Error::LockLost`]: another master is presumed to be serving.
///
/// [`save`]: MasterCoordinator::save
/// [`load`]: MasterCoordinator::load
pub struct MasterCoordinator {
    store: SharedStore,
    lock: Mutex<DistributedLock>,
    lock_path: String,
    state_path: String,
    addr_path: String,
    reacquire_timeout: Duration,
}

impl MasterCoordinator {
    /// Connect to etcd, then behave as [`MasterCoordinator::new`]
    pub async fn connect(etcd: &EtcdConfig, config: &MasterConfig, addr: &str) -> Result<Self> {
        let store: SharedStore = Arc::new(EtcdStore::connect(etcd).await?);
        Self::new(store, config, addr).await
    }

    pub async fn new(store: SharedStore, config: &MasterConfig, addr: &str) -> Result<Self> {
        let mut lock =
            DistributedLock::new(store.clone(), &config.lock_path, config.lease_ttl_secs).await?;
        // With several masters running (split brain from the cluster manager)
        // all but one block here until the holder's lease lapses.
        lock.acquire(None).await?;

        let publish = Txn::new()
            .when([lock.is_owner()])
            .and_then([TxnOp::put(config.addr_path.clone(), addr.to_string())]);
        if !store.txn(publish).await?.succeeded {
            tracing::error!("No longer owns the master lock {}.", config.lock_path);
            return Err(Error::OwnershipLost(config.lock_path.clone()));
        }
        tracing::info!(
            lock_path = %config.lock_path,
            addr_path = %config.addr_path,
            "master lock held, published address {}",
            addr
        );

        Ok(Self {
            store,
            lock: Mutex::new(lock),
            lock_path: config.lock_path.clone(),
            state_path: config.state_path.clone(),
            addr_path: config.addr_path.clone(),
            reacquire_timeout: config.reacquire_timeout(),
        })
    }

    pub fn lock_path(&self) -> &str {
        &self.lock_path
    }

    pub fn state_path(&self) -> &str {
        &self.state_path
    }

    pub fn addr_path(&self) -> &str {
        &self.addr_path
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Lease of the session currently backing the lock
    pub async fn lease(&self) -> LeaseId {
        self.lock.lock().await.session().lease()
    }

    /// Durably store `state`, provided this process still owns the lock
    pub async fn save(&self, state: &[u8]) -> Result<()> {
        let state = Bytes::copy_from_slice(state);
        loop {
            let owner = self.lock.lock().await.is_owner();
            let txn = Txn::new()
                .when([owner])
                .and_then([TxnOp::put(self.state_path.clone(), state.clone())]);
            if self.store.txn(txn).await?.succeeded {
                return Ok(());
            }
            tracing::error!("No longer owns the lock, trying to lock again");
            self.reacquire().await?;
        }
    }

    /// Read the last saved state; `None` if nothing was ever saved
    pub async fn load(&self) -> Result<Option<Bytes>> {
        loop {
            let owner = self.lock.lock().await.is_owner();
            let txn = Txn::new()
                .when([owner])
                .and_then([TxnOp::get(self.state_path.clone())]);
            let resp = self.store.txn(txn).await?;
            if resp.succeeded {
                return Ok(resp.kvs(0).first().map(|kv| kv.value.clone()));
            }
            tracing::error!("No longer owns the lock, trying to lock and load again");
            self.reacquire().await?;
        }
    }

    async fn reacquire(&self) -> Result<()> {
        let mut lock = self.lock.lock().await;
        if let Err(e) = lock.acquire(Some(self.reacquire_timeout)).await {
            tracing::error!("Could not acquire the lock at {}: {}.", self.lock_path, e);
            return Err(Error::LockLost {
                path: self.lock_path.clone(),
                reason: e.to_string(),
            });
        }
        tracing::info!("Successfully acquired lock at {}.", self.lock_path);
        Ok(())
    }

    /// Release the lock so a standby master takes over without waiting for
    /// the lease to lapse
    pub async fn shutdown(self) -> Result<()> {
        tracing::info!("Releasing master lock at {}", self.lock_path);
        self.lock.into_inner().release().await
    }
}
