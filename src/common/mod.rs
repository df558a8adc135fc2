//! Common utilities and types shared across mastercoord

pub mod config;
pub mod error;
pub mod utils;

pub use config::{Config, EtcdConfig, MasterConfig, WorkerConfig};
pub use error::{Error, Result};
pub use utils::{join_key, parse_duration, retry_with_backoff, validate_key};
