//! Lease renewal that outlives a single keep-alive stream

use super::{LeaseId, LeaseKeepAlive, SharedStore};
use crate::common::{retry_with_backoff, Result};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

const REOPEN_DELAY: Duration = Duration::from_millis(200);

/// Renew `lease` until it is gone or the returned receiver is dropped.
///
/// Wraps [`super::CoordinationStore::keep_alive`]. When the store's stream
/// ends early (a dropped connection, a restarted member) it is reopened with
/// backoff for as long as the lease can still be alive, that is until one TTL
/// past the last acknowledgement. The returned channel closes only when the
/// lease is reported missing or that window has passed.
///
/// Failure to open the first stream is returned to the caller.
pub async fn keep_lease_alive(
    store: SharedStore,
    lease: LeaseId,
    ttl_secs: i64,
) -> Result<mpsc::Receiver<LeaseKeepAlive>> {
    let acks = store.keep_alive(lease).await?;
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(supervise(store, lease, ttl_secs, acks, tx));
    Ok(rx)
}

async fn supervise(
    store: SharedStore,
    lease: LeaseId,
    mut ttl_secs: i64,
    mut acks: mpsc::Receiver<LeaseKeepAlive>,
    tx: mpsc::Sender<LeaseKeepAlive>,
) {
    let mut last_ack = Instant::now();
    loop {
        let ack = tokio::select! {
            ack = acks.recv() => ack,
            _ = tx.closed() => return,
        };
        match ack {
            Some(ack) => {
                last_ack = Instant::now();
                ttl_secs = ack.ttl;
                if tx.send(ack).await.is_err() {
                    return;
                }
            }
            None => {
                let expires = last_ack + Duration::from_secs(ttl_secs.max(0) as u64);
                let reopened = tokio::select! {
                    reopened = reopen(&store, lease, expires) => reopened,
                    _ = tx.closed() => return,
                };
                match reopened {
                    Some(next) => acks = next,
                    None => return,
                }
            }
        }
    }
}

async fn reopen(
    store: &SharedStore,
    lease: LeaseId,
    expires: Instant,
) -> Option<mpsc::Receiver<LeaseKeepAlive>> {
    tracing::warn!(lease = format_args!("{:x}", lease), "keep-alive stream ended, reopening");
    let attempt = retry_with_backoff(
        || {
            let store = store.clone();
            async move { store.keep_alive(lease).await }
        },
        usize::MAX,
        REOPEN_DELAY,
    );
    match tokio::time::timeout_at(expires, attempt).await {
        Ok(Ok(acks)) => {
            tracing::info!(lease = format_args!("{:x}", lease), "keep-alive stream reopened");
            Some(acks)
        }
        Ok(Err(e)) => {
            tracing::warn!(lease = format_args!("{:x}", lease), error = %e, "lease can no longer be renewed");
            None
        }
        Err(_) => {
            tracing::warn!(lease = format_args!("{:x}", lease), "lease expired before keep-alive was reopened");
            None
        }
    }
}
