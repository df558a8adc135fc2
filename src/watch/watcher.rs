//! Key watcher

use crate::common::{validate_key, Result};
use crate::store::SharedStore;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Values of `key`, one per change; a deletion yields `""`.
///
/// The stream ends when the subscription is cancelled or the connection
/// fails. It is not restarted here.
pub async fn watch_values(store: &SharedStore, key: &str) -> Result<BoxStream<'static, String>> {
    validate_key(key)?;
    let key = key.to_string();
    let events = store.watch(&key).await?;
    let values = events
        .take_while(move |event| {
            let keep = match event {
                Ok(_) => true,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "watch stream failed");
                    false
                }
            };
            futures_util::future::ready(keep)
        })
        .filter_map(|event| async move {
            let event = event.ok()?;
            tracing::info!(
                "received event {:?}, {:?} : {:?}",
                event.event_type,
                event.key,
                String::from_utf8_lossy(&event.value)
            );
            Some(String::from_utf8_lossy(&event.value).into_owned())
        });
    Ok(values.boxed())
}

/// A background task republishing a key's values on a channel.
///
/// The subscription is established before [`KeyWatcher::spawn`] returns, so
/// every change made afterwards is delivered. Dropping the watcher cancels it.
pub struct KeyWatcher {
    key: String,
    task: Option<JoinHandle<()>>,
}

impl KeyWatcher {
    pub async fn spawn(
        store: &SharedStore,
        key: &str,
    ) -> Result<(KeyWatcher, mpsc::UnboundedReceiver<String>)> {
        let values = watch_values(store, key).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok((Self::forward(key, values, None, false, tx), rx))
    }

    pub(crate) fn forward(
        key: &str,
        mut values: BoxStream<'static, String>,
        initial: Option<String>,
        skip_deletes: bool,
        tx: mpsc::UnboundedSender<String>,
    ) -> KeyWatcher {
        let task = tokio::spawn(async move {
            let mut last = initial.clone();
            if let Some(value) = initial {
                if tx.send(value).is_err() {
                    return;
                }
            }
            while let Some(value) = values.next().await {
                if skip_deletes && (value.is_empty() || last.as_ref() == Some(&value)) {
                    continue;
                }
                last = Some(value.clone());
                if tx.send(value).is_err() {
                    break;
                }
            }
        });
        KeyWatcher {
            key: key.to_string(),
            task: Some(task),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Cancel the subscription and wait for the task to exit
    pub async fn cancel(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for KeyWatcher {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
