//! Lease-backed worker registration

use super::address::{AddressResolver, ExternalIp};
use crate::common::{join_key, Error, Result, WorkerConfig};
use crate::store::{keep_lease_alive, LeaseId, LeaseKeepAlive, SharedStore};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// A live worker as seen in the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: String,
    pub address: String,
}

/// Registers worker processes under `<trainer_prefix>/<uuid>`
pub struct WorkerRegistrar {
    store: SharedStore,
    config: WorkerConfig,
    resolver: Arc<dyn AddressResolver>,
}

impl WorkerRegistrar {
    pub fn new(store: SharedStore, config: WorkerConfig) -> Self {
        Self {
            store,
            config,
            resolver: Arc::new(ExternalIp::default()),
        }
    }

    pub fn with_resolver(mut self, resolver: impl AddressResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    /// Register this process.
    ///
    /// The key is bound to a short lease renewed by a background task owned
    /// by the returned [`Registration`]. Every failure, including a write
    /// that outlasts `timeout`, is an [`Error::Registration`] and revokes the
    /// lease granted for it. Nothing here is retried.
    pub async fn register(&self, timeout: Duration) -> Result<Registration> {
        let id = Uuid::new_v4();
        let address = self
            .resolver
            .resolve()
            .map_err(|e| Error::Registration(format!("address discovery failed: {}", e)))?;

        let lease = self
            .store
            .grant_lease(self.config.lease_ttl_secs)
            .await
            .map_err(|e| Error::Registration(format!("lease grant failed: {}", e)))?;

        let key = join_key(&self.config.trainer_prefix, &id.to_string());
        let put = self
            .store
            .put(&key, Bytes::from(address.clone()), Some(lease));
        match tokio::time::timeout(timeout, put).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!("put trainer key to etcd error: {}", e);
                self.abandon(lease).await;
                return Err(Error::Registration(format!("put {} failed: {}", key, e)));
            }
            Err(_) => {
                tracing::error!("put trainer key to etcd timed out after {:?}", timeout);
                self.abandon(lease).await;
                return Err(Error::Registration(format!(
                    "put {} did not complete within {:?}",
                    key, timeout
                )));
            }
        }

        // A registration nobody renews silently expires, so this is fatal.
        let acks = match keep_lease_alive(self.store.clone(), lease, self.config.lease_ttl_secs)
            .await
        {
            Ok(acks) => acks,
            Err(e) => {
                tracing::error!("keepalive etcd node error: {}", e);
                self.abandon(lease).await;
                return Err(Error::Registration(format!("keep-alive failed: {}", e)));
            }
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(consume_keep_alive(acks, stop_rx));
        tracing::info!(key = %key, lease = format_args!("{:x}", lease), "registered worker at {}", address);

        Ok(Registration {
            id,
            key,
            address,
            lease,
            store: self.store.clone(),
            stop: Some(stop_tx),
            task: Some(task),
        })
    }

    /// Revoke a lease granted during a registration that did not complete
    async fn abandon(&self, lease: LeaseId) {
        if let Err(e) = self.store.revoke_lease(lease).await {
            tracing::warn!(
                lease = format_args!("{:x}", lease),
                error = %e,
                "failed to revoke lease of failed registration, it will expire via TTL"
            );
        }
    }

    /// Currently registered workers
    pub async fn list_workers(&self) -> Result<Vec<WorkerInfo>> {
        let prefix = join_key(&self.config.trainer_prefix, "");
        let workers = self
            .store
            .get_prefix(&prefix)
            .await?
            .into_iter()
            .map(|kv| WorkerInfo {
                id: kv.key[prefix.len()..].to_string(),
                address: String::from_utf8_lossy(&kv.value).into_owned(),
            })
            .collect();
        Ok(workers)
    }
}

async fn consume_keep_alive(
    mut acks: mpsc::Receiver<LeaseKeepAlive>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut stop => break,
            ack = acks.recv() => match ack {
                Some(ack) => tracing::debug!("keepalive: {}", ack.ttl),
                None => {
                    tracing::warn!("keep-alive stream ended, worker registration will expire");
                    break;
                }
            },
        }
    }
}

/// A worker registration and the task keeping it alive.
///
/// Dropping it stops renewal; the key then disappears once the lease lapses.
pub struct Registration {
    id: Uuid,
    key: String,
    address: String,
    lease: LeaseId,
    store: SharedStore,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Registration {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn lease(&self) -> LeaseId {
        self.lease
    }

    /// Whether the keep-alive task is still running
    pub fn is_alive(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop renewing and wait for the keep-alive task to exit. The key stays
    /// until the lease lapses.
    pub async fn stop_keep_alive(mut self) {
        self.shutdown().await;
    }

    /// Stop renewing and revoke the lease, removing the key immediately
    pub async fn deregister(mut self) -> Result<()> {
        self.shutdown().await;
        match self.store.revoke_lease(self.lease).await {
            Ok(()) | Err(Error::LeaseNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(key = %self.key, error = %e, "keep-alive task failed");
            }
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
