//! Metadata store contract
//!
//! The store indexes every blob the cache expects to find on disk. It is the
//! only component that must provide real atomicity: the space check and the
//! insert in [`MetadataStore::create_if_space`] happen as one step per shard.

mod memory;

pub use memory::MemoryMetadataStore;

use crate::error::Result;
use crate::types::CacheRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait MetadataStore: Send + Sync + 'static {
    /// Load persisted state and start any background work
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Stop background work and flush
    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    fn shard_count(&self) -> u32;

    fn shard_for_key(&self, relative_path: &str) -> u32;

    /// Bytes the store itself spends on one record
    fn estimate_record_disk_space(&self, content_type: &str) -> u64;

    /// Insert `record` if the shard total plus its size stays within `quota`.
    ///
    /// Returns false, changing nothing, when it would not fit. A record that
    /// already exists counts as success and is left unchanged.
    async fn create_if_space(&self, shard: u32, record: CacheRecord, quota: u64) -> Result<bool>;

    /// Up to `count` records created at or before `max_created_at` and last
    /// tried at or before `max_last_deletion_attempt`, oldest first
    async fn get_oldest_records(
        &self,
        shard: u32,
        max_last_deletion_attempt: DateTime<Utc>,
        max_created_at: DateTime<Utc>,
        count: usize,
    ) -> Result<Vec<CacheRecord>>;

    /// False if there was no such record
    async fn delete_record(&self, shard: u32, relative_path: &str) -> Result<bool>;

    async fn update_last_deletion_attempt(
        &self,
        shard: u32,
        relative_path: &str,
        when: DateTime<Utc>,
    ) -> Result<()>;

    async fn update_created_date(
        &self,
        shard: u32,
        relative_path: &str,
        when: DateTime<Utc>,
    ) -> Result<()>;

    /// Point a record at the path its file was moved aside to
    async fn replace_relative_path_and_update_last_deletion(
        &self,
        shard: u32,
        record: &CacheRecord,
        new_relative_path: String,
        when: DateTime<Utc>,
    ) -> Result<()>;

    async fn get_shard_size(&self, shard: u32) -> Result<u64>;

    async fn get_total_bytes(&self) -> Result<u64>;

    async fn get_content_type(&self, shard: u32, relative_path: &str) -> Result<Option<String>>;

    async fn record_count(&self) -> Result<usize>;
}
