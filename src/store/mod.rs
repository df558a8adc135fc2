//! Coordination service facade
//!
//! A thin, backend-neutral view of the primitives mastercoord needs from a
//! linearizable key-value store:
//! - point and prefix reads
//! - lease-bound writes
//! - compare-and-execute transactions
//! - lease grant / revoke / keep-alive
//! - per-key watch streams
//!
//! [`etcd::EtcdStore`] talks to a real etcd cluster; [`memory::MemoryStore`]
//! implements the same semantics in process.

pub mod etcd;
pub mod keepalive;
pub mod memory;
#[cfg(test)]
pub(crate) mod testing;

use crate::common::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use etcd::EtcdStore;
pub use keepalive::keep_lease_alive;
pub use memory::MemoryStore;

/// Lease identifier
pub type LeaseId = i64;

/// Largest lease TTL etcd accepts (`MaxLeaseTTL`)
pub const MAX_LEASE_TTL_SECS: i64 = 9_000_000_000;

/// Store handle shared by every component of a process
pub type SharedStore = Arc<dyn CoordinationStore>;

/// Stream of watch notifications for a single key
pub type WatchStream = BoxStream<'static, Result<WatchEvent>>;

/// A stored key with its revision metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Bytes,
    /// Revision at which the key was created (0 when absent)
    pub create_revision: i64,
    pub mod_revision: i64,
    /// Attached lease (0 when none)
    pub lease: LeaseId,
}

/// Transaction guard, evaluated by the store at commit time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compare {
    /// `create_revision(key) == revision`. An absent key has create revision 0.
    CreateRevision { key: String, revision: i64 },
    /// `value(key) == value`. Never holds for an absent key.
    Value { key: String, value: Bytes },
}

impl Compare {
    pub fn create_revision(key: impl Into<String>, revision: i64) -> Self {
        Compare::CreateRevision {
            key: key.into(),
            revision,
        }
    }

    pub fn value(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Compare::Value {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A single operation inside a transaction branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    Put {
        key: String,
        value: Bytes,
        lease: Option<LeaseId>,
    },
    Get {
        key: String,
        prefix: bool,
    },
    Delete {
        key: String,
    },
}

impl TxnOp {
    pub fn put(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        TxnOp::Put {
            key: key.into(),
            value: value.into(),
            lease: None,
        }
    }

    pub fn put_with_lease(key: impl Into<String>, value: impl Into<Bytes>, lease: LeaseId) -> Self {
        TxnOp::Put {
            key: key.into(),
            value: value.into(),
            lease: Some(lease),
        }
    }

    pub fn get(key: impl Into<String>) -> Self {
        TxnOp::Get {
            key: key.into(),
            prefix: false,
        }
    }

    pub fn get_prefix(prefix: impl Into<String>) -> Self {
        TxnOp::Get {
            key: prefix.into(),
            prefix: true,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        TxnOp::Delete { key: key.into() }
    }
}

/// Result of one [`TxnOp`], positionally matching the executed branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOpResponse {
    Put,
    /// Matching keys, ordered by key
    Get(Vec<KeyValue>),
    /// Number of keys deleted
    Delete(u64),
}

/// Compare-then-execute transaction
#[derive(Debug, Clone, Default)]
pub struct Txn {
    pub compares: Vec<Compare>,
    pub success: Vec<TxnOp>,
    pub failure: Vec<TxnOp>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, compares: impl IntoIterator<Item = Compare>) -> Self {
        self.compares.extend(compares);
        self
    }

    pub fn and_then(mut self, ops: impl IntoIterator<Item = TxnOp>) -> Self {
        self.success.extend(ops);
        self
    }

    pub fn or_else(mut self, ops: impl IntoIterator<Item = TxnOp>) -> Self {
        self.failure.extend(ops);
        self
    }

    /// No branch modifies the store
    pub fn is_read_only(&self) -> bool {
        self.success
            .iter()
            .chain(self.failure.iter())
            .all(|op| matches!(op, TxnOp::Get { .. }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnResponse {
    /// Whether every compare held (and the success branch ran)
    pub succeeded: bool,
    pub responses: Vec<TxnOpResponse>,
    /// Store revision after the transaction
    pub revision: i64,
}

impl TxnResponse {
    /// Key-values returned by the `index`-th op, if it was a get
    pub fn kvs(&self, index: usize) -> &[KeyValue] {
        match self.responses.get(index) {
            Some(TxnOpResponse::Get(kvs)) => kvs,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Put,
    Delete,
}

/// A change observed on a watched key. Deletions carry an empty value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub event_type: EventType,
    pub key: String,
    pub value: Bytes,
    pub revision: i64,
}

/// Keep-alive acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseKeepAlive {
    pub lease: LeaseId,
    /// Remaining TTL after renewal, in seconds
    pub ttl: i64,
}

/// The coordination service primitives.
///
/// Implementations must be safe for concurrent use from many tasks without
/// external locking.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    /// All keys starting with `prefix`, ordered by key
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>>;

    async fn put(&self, key: &str, value: Bytes, lease: Option<LeaseId>) -> Result<()>;

    /// Returns whether the key existed
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn txn(&self, txn: Txn) -> Result<TxnResponse>;

    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId>;

    /// Revoke a lease, deleting every key attached to it
    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;

    /// Start renewing `lease`.
    ///
    /// Renewal continues for as long as the returned receiver is alive; the
    /// channel closes when the lease is gone or the connection fails.
    /// Callers wanting renewal across stream failures use
    /// [`keep_lease_alive`].
    async fn keep_alive(&self, lease: LeaseId) -> Result<mpsc::Receiver<LeaseKeepAlive>>;

    /// Subscribe to changes of a single key
    async fn watch(&self, key: &str) -> Result<WatchStream>;
}
