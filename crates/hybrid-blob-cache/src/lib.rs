//! Disk-backed blob cache with single-flight production
//!
//! Blobs are addressed by hashed keys and stored in a sharded directory tree.
//! Concurrent requests for the same key share one producer run; produced
//! blobs are served from memory while a bounded background queue writes them
//! to disk. Disk usage is kept under a quota by evicting old entries, coldest
//! first, as tracked by an approximate frequency counter.

mod cleanup;
mod config;
mod engine;
mod entry;
mod error;
mod file_writer;
mod frequency;
mod locks;
mod path_builder;
pub mod store;
mod types;
mod write_queue;

pub use cleanup::{CleanupManager, ReconcileReport};
pub use config::{CleanupOptions, HybridCacheOptions};
pub use engine::{CacheData, CacheResult, CacheStatus, HybridCache, ProducedBlob};
pub use entry::{access_bucket_for, CacheEntry};
pub use error::{CacheError, Result};
pub use file_writer::{default_move_into_place, FileWriter, MoveIntoPlaceFn, WriteResult};
pub use frequency::FrequencyCounter;
pub use locks::{KeyedLockGuard, KeyedLocks};
pub use path_builder::PathBuilder;
pub use store::{MemoryMetadataStore, MetadataStore};
pub use types::{never_attempted, CacheRecord, CacheStats};
pub use write_queue::{QueueResult, QueuedWrite, WriteQueue};
