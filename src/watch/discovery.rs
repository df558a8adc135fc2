//! Reading published keys, e.g. finding the current master

use super::watcher::{watch_values, KeyWatcher};
use crate::common::{Error, Result};
use crate::store::SharedStore;
use std::time::Duration;
use tokio::sync::mpsc;

/// Value of `key` as a string, or `""` if the key does not exist
pub async fn get_key(store: &SharedStore, key: &str, timeout: Duration) -> Result<String> {
    let kv = tokio::time::timeout(timeout, store.get(key))
        .await
        .map_err(|_| Error::Timeout(format!("get {} exceeded {:?}", key, timeout)))??;
    Ok(kv
        .map(|kv| String::from_utf8_lossy(&kv.value).into_owned())
        .unwrap_or_default())
}

/// Current value of `key` (if set) followed by each new value.
///
/// Deletions and repeats of the last value are skipped, which suits
/// following the master address across failovers.
pub async fn follow_key(
    store: &SharedStore,
    key: &str,
) -> Result<(KeyWatcher, mpsc::UnboundedReceiver<String>)> {
    // Subscribe before reading so a change in between is not lost.
    let values = watch_values(store, key).await?;
    let current = store
        .get(key)
        .await?
        .map(|kv| String::from_utf8_lossy(&kv.value).into_owned())
        .filter(|v| !v.is_empty());
    let (tx, rx) = mpsc::unbounded_channel();
    Ok((KeyWatcher::forward(key, values, current, true, tx), rx))
}
