//! Configuration for mastercoord components

use crate::common::{Error, Result};
use crate::store::MAX_LEASE_TTL_SECS;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default etcd master lock path.
pub const DEFAULT_LOCK_PATH: &str = "/master/lock";
/// Default key for the master state blob.
pub const DEFAULT_STATE_PATH: &str = "/master/state";
/// Default key for the published master address.
pub const DEFAULT_ADDR_PATH: &str = "/master/addr";
/// Default trainer registration prefix.
pub const DEFAULT_TRAINER_PATH: &str = "/trainer";

/// Environment prefix, e.g. `MASTERCOORD__MASTER__LEASE_TTL_SECS=10`
const ENV_PREFIX: &str = "MASTERCOORD";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging level
    pub log_level: String,

    /// Coordination service connection
    pub etcd: EtcdConfig,

    /// Master coordinator
    pub master: MasterConfig,

    /// Worker registration
    pub worker: WorkerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            etcd: EtcdConfig::default(),
            master: MasterConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Coordination service connection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EtcdConfig {
    /// Endpoint addresses
    pub endpoints: Vec<String>,

    /// Dial timeout
    pub dial_timeout_ms: u64,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["127.0.0.1:2379".to_string()],
            dial_timeout_ms: 5_000,
        }
    }
}

impl EtcdConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}

/// Master coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Lock guarding mastership
    pub lock_path: String,

    /// Key holding the opaque master state
    pub state_path: String,

    /// Key the master publishes its address under
    pub addr_path: String,

    /// Session lease TTL. A stalled master loses the lock after this long.
    pub lease_ttl_secs: i64,

    /// Bound on re-acquiring the lock after ownership loss in save/load
    pub reacquire_timeout_ms: u64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            lock_path: DEFAULT_LOCK_PATH.to_string(),
            state_path: DEFAULT_STATE_PATH.to_string(),
            addr_path: DEFAULT_ADDR_PATH.to_string(),
            lease_ttl_secs: 60,
            reacquire_timeout_ms: 5_000,
        }
    }
}

impl MasterConfig {
    pub fn reacquire_timeout(&self) -> Duration {
        Duration::from_millis(self.reacquire_timeout_ms)
    }
}

/// Worker (trainer) registration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Registration keys live under `<trainer_prefix>/<uuid>`
    pub trainer_prefix: String,

    /// Registration lease TTL
    pub lease_ttl_secs: i64,

    /// Timeout for writing the registration key
    pub register_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            trainer_prefix: DEFAULT_TRAINER_PATH.to_string(),
            lease_ttl_secs: 5,
            register_timeout_ms: 5_000,
        }
    }
}

impl WorkerConfig {
    pub fn register_timeout(&self) -> Duration {
        Duration::from_millis(self.register_timeout_ms)
    }
}

impl Config {
    /// Load from an optional TOML file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("etcd.endpoints")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.etcd.endpoints.is_empty() {
            return Err(Error::InvalidConfig("etcd.endpoints is empty".into()));
        }
        if !(1..=MAX_LEASE_TTL_SECS).contains(&self.master.lease_ttl_secs) {
            return Err(Error::InvalidConfig(format!(
                "master.lease_ttl_secs must be in 1..={}, got {}",
                MAX_LEASE_TTL_SECS, self.master.lease_ttl_secs
            )));
        }
        if !(1..=MAX_LEASE_TTL_SECS).contains(&self.worker.lease_ttl_secs) {
            return Err(Error::InvalidConfig(format!(
                "worker.lease_ttl_secs must be in 1..={}, got {}",
                MAX_LEASE_TTL_SECS, self.worker.lease_ttl_secs
            )));
        }
        for (name, path) in [
            ("master.lock_path", &self.master.lock_path),
            ("master.state_path", &self.master.state_path),
            ("master.addr_path", &self.master.addr_path),
            ("worker.trainer_prefix", &self.worker.trainer_prefix),
        ] {
            if path.is_empty() {
                return Err(Error::InvalidConfig(format!("{} is empty", name)));
            }
        }
        Ok(())
    }
}
