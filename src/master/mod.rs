//! Master side of the job
//!
//! The master is responsible for:
//! - Winning the master lock (at most one authoritative master)
//! - Publishing its address for discovery
//! - Checkpointing its opaque state, gated on lock ownership
//!
//! ```text
//! {Unbound} --acquire lock--> {Leader} --publish addr (if owner)--> {Serving}
//! ```

pub mod coordinator;

pub use coordinator::MasterCoordinator;
