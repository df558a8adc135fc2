//! Key watches and discovery reads

pub mod discovery;
pub mod watcher;

pub use discovery::{follow_key, get_key};
pub use watcher::{watch_values, KeyWatcher};
