//! # mastercoord
//!
//! Fault-tolerant master coordination for a distributed training job, on top
//! of a linearizable coordination service (etcd):
//! - A lease-backed distributed lock: at most one authoritative master
//! - Master state checkpoints written and read only under lock ownership
//! - Worker registration with lease keep-alive (keys vanish with the worker)
//! - Key watches republished as value streams
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │       Coordination service (etcd)        │
//! │  /master/lock/<lease>   lock contenders  │
//! │  /master/addr           master address   │
//! │  /master/state          opaque state     │
//! │  /trainer/<uuid>        live workers     │
//! └──────┬───────────────────────────┬───────┘
//!        │ txn If(is_owner)          │ put + lease keep-alive
//! ┌──────▼──────────┐        ┌───────▼──────────┐
//! │ Master          │        │ Worker 1..N      │
//! │ (lock holder)   │        │ (registrar)      │
//! └─────────────────┘        └──────────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a master
//! ```bash
//! mastercoord-master --endpoints 10.0.0.5:2379 --addr 10.0.0.1:9000 --ttl 60
//! ```
//!
//! ### Register a worker, follow the master
//! ```bash
//! mastercoord register --endpoints 10.0.0.5:2379
//! mastercoord watch /master/addr
//! mastercoord workers
//! ```

pub mod common;
pub mod lock;
pub mod master;
pub mod store;
pub mod watch;
pub mod worker;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use lock::{DistributedLock, Session};
pub use master::MasterCoordinator;
pub use store::{CoordinationStore, EtcdStore, MemoryStore, SharedStore};
pub use watch::KeyWatcher;
pub use worker::{Registration, WorkerRegistrar};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
