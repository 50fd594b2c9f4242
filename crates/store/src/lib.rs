//! Durable, crash-safe persistence for prediction tasks.
//!
//! Everything here is backed by plain files: task directories with a
//! `status.json` record, jsonl conservation-cache buckets, and advisory
//! lock files. Writers never leave a partially written document behind;
//! every update goes through a temp file followed by a single rename.

pub mod conservation_cache;
pub mod error;
pub mod fs;
pub mod lock;
pub mod task_store;

pub use conservation_cache::ConservationCache;
pub use error::{Result, StoreError};
pub use lock::TaskLock;
pub use task_store::TaskStore;
