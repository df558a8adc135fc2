//! Lease-backed sessions and the distributed lock
//!
//! The lock follows the etcd recipe: every contender creates
//! `<lock_path>/<lease>` bound to its session lease, and the contender whose
//! key has the lowest create revision owns the lock. Waiters watch only their
//! immediate predecessor, so a release wakes exactly one contender.
//!
//! Ownership is never cached as a flag. [`DistributedLock::is_owner`] returns
//! a [`Compare`] that the store evaluates atomically inside the caller's
//! transaction.

use crate::common::{join_key, Error, Result};
use crate::store::{keep_lease_alive, Compare, EventType, LeaseId, SharedStore, Txn, TxnOp};
use futures_util::StreamExt;
use std::time::Duration;
use tokio::task::JoinHandle;

/// A lease kept alive by an owned background task.
///
/// Dropping a session stops renewal without revoking the lease, which is
/// what a crashed process looks like to the store: the lease lapses after
/// its TTL. [`Session::close`] revokes it immediately.
pub struct Session {
    store: SharedStore,
    lease: LeaseId,
    ttl_secs: i64,
    keep_alive: JoinHandle<()>,
}

impl Session {
    pub async fn new(store: SharedStore, ttl_secs: i64) -> Result<Self> {
        let lease = store.grant_lease(ttl_secs).await?;
        let mut acks = match keep_lease_alive(store.clone(), lease, ttl_secs).await {
            Ok(acks) => acks,
            Err(e) => {
                let _ = store.revoke_lease(lease).await;
                return Err(e);
            }
        };
        let keep_alive = tokio::spawn(async move {
            while let Some(ack) = acks.recv().await {
                tracing::trace!(lease = format_args!("{:x}", ack.lease), ttl = ack.ttl, "session keep-alive");
            }
            tracing::warn!(lease = format_args!("{:x}", lease), "session keep-alive ended, lease will lapse");
        });
        tracing::debug!(lease = format_args!("{:x}", lease), ttl = ttl_secs, "session started");
        Ok(Self {
            store,
            lease,
            ttl_secs,
            keep_alive,
        })
    }

    pub fn lease(&self) -> LeaseId {
        self.lease
    }

    pub fn ttl_secs(&self) -> i64 {
        self.ttl_secs
    }

    /// Stop renewal and revoke the lease, releasing every key bound to it
    pub async fn close(self) -> Result<()> {
        self.keep_alive.abort();
        match self.store.revoke_lease(self.lease).await {
            Ok(()) | Err(Error::LeaseNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.keep_alive.abort();
    }
}

/// Handle on a named distributed lock.
pub struct DistributedLock {
    store: SharedStore,
    path: String,
    session: Session,
    my_key: String,
    /// Create revision of `my_key`; -1 until acquired, which no key can match
    my_rev: i64,
}

impl DistributedLock {
    pub async fn new(store: SharedStore, path: impl Into<String>, ttl_secs: i64) -> Result<Self> {
        let path = path.into();
        let session = Session::new(store.clone(), ttl_secs)
            .await
            .map_err(|e| Error::LockAcquisition {
                path: path.clone(),
                reason: format!("session setup failed: {}", e),
            })?;
        let my_key = Self::contender_key(&path, session.lease());
        Ok(Self {
            store,
            path,
            session,
            my_key,
            my_rev: -1,
        })
    }

    fn contender_key(path: &str, lease: LeaseId) -> String {
        join_key(path, &format!("{:x}", lease))
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn key(&self) -> &str {
        &self.my_key
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Transaction precondition that holds only while this handle owns the lock
    pub fn is_owner(&self) -> Compare {
        Compare::create_revision(self.my_key.clone(), self.my_rev)
    }

    /// Block until the lock is held, or until `timeout` elapses.
    ///
    /// If the session lease has lapsed (long stall, partition) a fresh session
    /// is created first. On failure the contender key is removed so it never
    /// blocks later contenders.
    pub async fn acquire(&mut self, timeout: Option<Duration>) -> Result<()> {
        tracing::debug!("Trying to acquire lock at {}.", self.path);
        let result = match timeout {
            Some(limit) => {
                let outcome = tokio::time::timeout(limit, self.acquire_renewing()).await;
                outcome.unwrap_or_else(|_| {
                    Err(Error::LockAcquisition {
                        path: self.path.clone(),
                        reason: format!("not acquired within {:?}", limit),
                    })
                })
            }
            None => self.acquire_renewing().await,
        };

        match result {
            Ok(()) => {
                tracing::debug!("Successfully acquired lock at {}.", self.path);
                Ok(())
            }
            Err(e) => {
                self.my_rev = -1;
                if let Err(cleanup) = self.store.delete(&self.my_key).await {
                    tracing::warn!(key = %self.my_key, error = %cleanup, "failed to remove lock contender key");
                }
                Err(match e {
                    Error::LockAcquisition { .. } => e,
                    other => Error::LockAcquisition {
                        path: self.path.clone(),
                        reason: other.to_string(),
                    },
                })
            }
        }
    }

    async fn acquire_renewing(&mut self) -> Result<()> {
        match self.try_acquire().await {
            Err(Error::LeaseNotFound(lease)) => {
                tracing::info!(
                    lock_path = %self.path,
                    lease = format_args!("{:x}", lease),
                    "session lease expired, starting a new session"
                );
                self.session = Session::new(self.store.clone(), self.session.ttl_secs()).await?;
                self.my_key = Self::contender_key(&self.path, self.session.lease());
                self.try_acquire().await
            }
            other => other,
        }
    }

    async fn try_acquire(&mut self) -> Result<()> {
        let prefix = join_key(&self.path, "");
        let txn = Txn::new()
            .when([Compare::create_revision(self.my_key.clone(), 0)])
            .and_then([
                TxnOp::put_with_lease(self.my_key.clone(), "", self.session.lease()),
                TxnOp::get_prefix(prefix.clone()),
            ])
            .or_else([TxnOp::get(self.my_key.clone()), TxnOp::get_prefix(prefix.clone())]);
        let resp = self.store.txn(txn).await?;

        self.my_rev = if resp.succeeded {
            resp.revision
        } else {
            resp.kvs(0)
                .first()
                .map(|kv| kv.create_revision)
                .ok_or_else(|| Error::Other(format!("contender key {} vanished", self.my_key)))?
        };

        let owner = resp.kvs(1).iter().map(|kv| kv.create_revision).min();
        if owner.is_none() || owner == Some(self.my_rev) {
            return Ok(());
        }

        self.wait_for_predecessors(&prefix).await?;

        // Our own key may have gone with an expired lease while we waited.
        match self.store.get(&self.my_key).await? {
            Some(kv) if kv.create_revision == self.my_rev => Ok(()),
            _ => Err(Error::LeaseNotFound(self.session.lease())),
        }
    }

    /// Wait until no contender with a lower create revision remains
    async fn wait_for_predecessors(&self, prefix: &str) -> Result<()> {
        loop {
            let predecessor = self
                .store
                .get_prefix(prefix)
                .await?
                .into_iter()
                .filter(|kv| kv.create_revision < self.my_rev)
                .max_by_key(|kv| kv.create_revision);
            let Some(predecessor) = predecessor else {
                return Ok(());
            };

            tracing::trace!(lock_path = %self.path, waiting_on = %predecessor.key, "waiting for lock predecessor");
            let mut events = self.store.watch(&predecessor.key).await?;
            // It may have been deleted before the watch was established.
            if self.store.get(&predecessor.key).await?.is_none() {
                continue;
            }
            loop {
                match events.next().await {
                    Some(Ok(event)) if event.event_type == EventType::Delete => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e),
                    None => {
                        return Err(Error::Watch(format!(
                            "watch on {} ended while waiting for lock",
                            predecessor.key
                        )))
                    }
                }
            }
        }
    }

    /// Release the lock and end the session
    pub async fn release(self) -> Result<()> {
        if let Err(e) = self.store.delete(&self.my_key).await {
            tracing::warn!(key = %self.my_key, error = %e, "failed to delete lock key");
        }
        self.session.close().await
    }
}
