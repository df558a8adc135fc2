//! Worker (trainer) registration
//!
//! Each worker process writes `<trainer_prefix>/<uuid>` → its address, bound
//! to a short lease. No explicit unregister is needed: once the process stops
//! renewing, the lease lapses and the key disappears.

pub mod address;
pub mod registrar;

pub use address::{AddressResolver, ExternalIp, StaticAddress};
pub use registrar::{Registration, WorkerInfo, WorkerRegistrar};
