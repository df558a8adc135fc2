//! etcd v3 backend

use super::{
    Compare, CoordinationStore, EventType, KeyValue, LeaseId, LeaseKeepAlive, Txn, TxnOp,
    TxnOpResponse, TxnResponse, WatchEvent, WatchStream,
};
use crate::common::{EtcdConfig, Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use etcd_client::{Client, CompareOp, ConnectOptions, GetOptions, PutOptions};
use std::time::Duration;
use tokio::sync::mpsc;

const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(500);

/// [`super::CoordinationStore`] backed by an etcd cluster.
///
/// `etcd_client::Client` multiplexes over one gRPC channel and is cheap to
/// clone, so every call works on its own clone and no lock is needed.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    pub async fn connect(config: &EtcdConfig) -> Result<Self> {
        tracing::debug!("Connecting to etcd at {:?}", config.endpoints);
        let options = ConnectOptions::new().with_connect_timeout(config.dial_timeout());
        let client = tokio::time::timeout(
            config.dial_timeout(),
            Client::connect(config.endpoints.clone(), Some(options)),
        )
        .await
        .map_err(|_| {
            Error::Connection(format!(
                "timed out after {:?} connecting to {:?}",
                config.dial_timeout(),
                config.endpoints
            ))
        })?
        .map_err(|e| Error::Connection(e.to_string()))?;
        Ok(Self { client })
    }

    /// Wrap an already connected client
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    fn write_err(e: etcd_client::Error, lease: Option<LeaseId>) -> Error {
        classify_err(e.to_string(), lease, false)
    }
}

/// Map an etcd failure onto the store error taxonomy. `read_only` requests
/// report [`Error::Read`]; writes that hit their deadline report
/// [`Error::WriteTimeout`].
fn classify_err(msg: String, lease: Option<LeaseId>, read_only: bool) -> Error {
    if let Some(lease) = lease {
        if msg.contains("lease not found") {
            return Error::LeaseNotFound(lease);
        }
    }
    if read_only {
        Error::Read(msg)
    } else if msg.contains("DeadlineExceeded") || msg.contains("deadline exceeded") {
        Error::WriteTimeout(msg)
    } else {
        Error::Write(msg)
    }
}

fn convert_kv(kv: &etcd_client::KeyValue) -> KeyValue {
    KeyValue {
        key: String::from_utf8_lossy(kv.key()).into_owned(),
        value: Bytes::copy_from_slice(kv.value()),
        create_revision: kv.create_revision(),
        mod_revision: kv.mod_revision(),
        lease: kv.lease(),
    }
}

fn convert_compare(cmp: Compare) -> etcd_client::Compare {
    match cmp {
        Compare::CreateRevision { key, revision } => {
            etcd_client::Compare::create_revision(key, CompareOp::Equal, revision)
        }
        Compare::Value { key, value } => {
            etcd_client::Compare::value(key, CompareOp::Equal, value.to_vec())
        }
    }
}

fn convert_op(op: TxnOp) -> etcd_client::TxnOp {
    match op {
        TxnOp::Put { key, value, lease } => {
            let options = lease.map(|id| PutOptions::new().with_lease(id));
            etcd_client::TxnOp::put(key, value.to_vec(), options)
        }
        TxnOp::Get { key, prefix } => {
            let options = prefix.then(|| GetOptions::new().with_prefix());
            etcd_client::TxnOp::get(key, options)
        }
        TxnOp::Delete { key } => etcd_client::TxnOp::delete(key, None),
    }
}

fn convert_op_response(resp: etcd_client::TxnOpResponse) -> TxnOpResponse {
    match resp {
        etcd_client::TxnOpResponse::Put(_) => TxnOpResponse::Put,
        etcd_client::TxnOpResponse::Get(get) => {
            TxnOpResponse::Get(get.kvs().iter().map(convert_kv).collect())
        }
        etcd_client::TxnOpResponse::Delete(del) => TxnOpResponse::Delete(del.deleted() as u64),
        // nested transactions are never issued
        etcd_client::TxnOpResponse::Txn(_) => TxnOpResponse::Put,
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let mut client = self.client.clone();
        let resp = client
            .get(key, None)
            .await
            .map_err(|e| Error::Read(e.to_string()))?;
        Ok(resp.kvs().first().map(convert_kv))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| Error::Read(e.to_string()))?;
        Ok(resp.kvs().iter().map(convert_kv).collect())
    }

    async fn put(&self, key: &str, value: Bytes, lease: Option<LeaseId>) -> Result<()> {
        let mut client = self.client.clone();
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        client
            .put(key, value.to_vec(), options)
            .await
            .map_err(|e| Self::write_err(e, lease))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut client = self.client.clone();
        let resp = client
            .delete(key, None)
            .await
            .map_err(|e| Self::write_err(e, None))?;
        Ok(resp.deleted() > 0)
    }

    async fn txn(&self, txn: Txn) -> Result<TxnResponse> {
        let read_only = txn.is_read_only();
        let lease = txn
            .success
            .iter()
            .chain(txn.failure.iter())
            .find_map(|op| match op {
                TxnOp::Put { lease, .. } => *lease,
                _ => None,
            });
        let request = etcd_client::Txn::new()
            .when(txn.compares.into_iter().map(convert_compare).collect::<Vec<_>>())
            .and_then(txn.success.into_iter().map(convert_op).collect::<Vec<_>>())
            .or_else(txn.failure.into_iter().map(convert_op).collect::<Vec<_>>());

        let mut client = self.client.clone();
        let resp = client
            .txn(request)
            .await
            .map_err(|e| classify_err(e.to_string(), lease, read_only))?;
        let revision = resp.header().map_or(0, |h| h.revision());
        Ok(TxnResponse {
            succeeded: resp.succeeded(),
            responses: resp
                .op_responses()
                .into_iter()
                .map(convert_op_response)
                .collect(),
            revision,
        })
    }

    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId> {
        let mut client = self.client.clone();
        let resp = client
            .lease_grant(ttl_secs, None)
            .await
            .map_err(|e| classify_err(format!("lease grant: {}", e), None, false))?;
        Ok(resp.id())
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let mut client = self.client.clone();
        client
            .lease_revoke(lease)
            .await
            .map_err(|e| Self::write_err(e, Some(lease)))?;
        Ok(())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<mpsc::Receiver<LeaseKeepAlive>> {
        let mut client = self.client.clone();
        let (mut keeper, mut stream) = client
            .lease_keep_alive(lease)
            .await
            .map_err(|e| Self::write_err(e, Some(lease)))?;

        // First round trip tells us the TTL and whether the lease still exists.
        keeper
            .keep_alive()
            .await
            .map_err(|e| Self::write_err(e, Some(lease)))?;
        let first = stream
            .message()
            .await
            .map_err(|e| Self::write_err(e, Some(lease)))?
            .ok_or_else(|| Error::Connection("keep-alive stream closed".into()))?;
        if first.ttl() <= 0 {
            return Err(Error::LeaseNotFound(lease));
        }

        let ttl = first.ttl();
        let interval = (Duration::from_secs(ttl as u64) / 3).max(MIN_RENEW_INTERVAL);
        let (tx, rx) = mpsc::channel(16);
        // Buffer is empty, this cannot fail.
        let _ = tx.try_send(LeaseKeepAlive { lease, ttl });

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = tx.closed() => break,
                }
                if let Err(e) = keeper.keep_alive().await {
                    tracing::warn!(lease = format_args!("{:x}", lease), error = %e, "etcd lease keep-alive failed");
                    break;
                }
                match stream.message().await {
                    Ok(Some(resp)) if resp.ttl() > 0 => {
                        let ack = LeaseKeepAlive {
                            lease,
                            ttl: resp.ttl(),
                        };
                        if tx.send(ack).await.is_err() {
                            break;
                        }
                    }
                    Ok(Some(_)) => {
                        tracing::warn!(lease = format_args!("{:x}", lease), "etcd lease expired");
                        break;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(lease = format_args!("{:x}", lease), error = %e, "etcd keep-alive stream failed");
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn watch(&self, key: &str) -> Result<WatchStream> {
        let mut client = self.client.clone();
        let (watcher, mut stream) = client
            .watch(key, None)
            .await
            .map_err(|e| Error::Watch(e.to_string()))?;

        let events = async_stream::stream! {
            // Dropping the watcher cancels the subscription.
            let _watcher = watcher;
            loop {
                match stream.message().await {
                    Ok(Some(resp)) => {
                        if resp.canceled() {
                            break;
                        }
                        for event in resp.events() {
                            let Some(kv) = event.kv() else { continue };
                            let event_type = match event.event_type() {
                                etcd_client::EventType::Put => EventType::Put,
                                etcd_client::EventType::Delete => EventType::Delete,
                            };
                            let value = match event_type {
                                EventType::Put => Bytes::copy_from_slice(kv.value()),
                                EventType::Delete => Bytes::new(),
                            };
                            yield Ok(WatchEvent {
                                event_type,
                                key: String::from_utf8_lossy(kv.key()).into_owned(),
                                value,
                                revision: kv.mod_revision(),
                            });
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(Error::Watch(e.to_string()));
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(events))
    }
}
