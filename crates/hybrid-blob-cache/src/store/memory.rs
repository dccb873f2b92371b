//! Sharded in-memory metadata store with optional JSON snapshots

use super::MetadataStore;
use crate::error::Result;
use crate::types::CacheRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use xxhash_rust::xxh64::xxh64;

const SNAPSHOT_VERSION: u32 = 1;

/// Estimated snapshot bytes per record when persistence is enabled
const PERSISTED_RECORD_OVERHEAD: u64 = 160;

#[derive(Default)]
struct Shard {
    records: HashMap<String, CacheRecord>,
    total_bytes: u64,
}

impl Shard {
    fn insert(&mut self, record: CacheRecord) {
        self.total_bytes += record.disk_size;
        if let Some(previous) = self.records.insert(record.relative_path.clone(), record) {
            self.total_bytes -= previous.disk_size;
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    records: Vec<CacheRecord>,
}

struct StoreInner {
    shards: Vec<Mutex<Shard>>,
    snapshot_path: Option<PathBuf>,
    dirty: AtomicBool,
}

impl StoreInner {
    fn shard_for_key(&self, relative_path: &str) -> u32 {
        (xxh64(relative_path.as_bytes(), 0) % self.shards.len() as u64) as u32
    }

    fn shard(&self, shard: u32) -> &Mutex<Shard> {
        &self.shards[shard as usize % self.shards.len()]
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    fn all_records(&self) -> Vec<CacheRecord> {
        self.shards
            .iter()
            .flat_map(|shard| shard.lock().records.values().cloned().collect::<Vec<_>>())
            .collect()
    }

    async fn load_snapshot(&self) -> Result<usize> {
        let Some(path) = &self.snapshot_path else {
            return Ok(0);
        };

        let data = match fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = ?path, "No metadata snapshot found, starting empty");
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        let snapshot: Snapshot = serde_json::from_slice(&data)?;
        if snapshot.version != SNAPSHOT_VERSION {
            warn!(
                path = ?path,
                version = snapshot.version,
                "Ignoring metadata snapshot with unknown version"
            );
            return Ok(0);
        }

        let count = snapshot.records.len();
        for record in snapshot.records {
            let shard = self.shard_for_key(&record.relative_path);
            self.shard(shard).lock().insert(record);
        }
        info!(path = ?path, records = count, "Loaded metadata snapshot");
        Ok(count)
    }

    async fn write_snapshot(&self) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };

        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            records: self.all_records(),
        };
        let data = serde_json::to_vec(&snapshot)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp_path = path.with_extension(format!("tmp_{}", uuid::Uuid::new_v4().simple()));
        if let Err(e) = fs::write(&tmp_path, &data).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&tmp_path, path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        debug!(path = ?path, records = snapshot.records.len(), "Wrote metadata snapshot");
        Ok(())
    }

    async fn flush_if_dirty(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.write_snapshot().await;
        if result.is_err() {
            self.mark_dirty();
        }
        result
    }
}

/// Metadata store keeping every record in memory, split into independently
/// locked shards. With a snapshot path it survives restarts: `start` loads the
/// last snapshot and `stop` writes a final one.
pub struct MemoryMetadataStore {
    inner: Arc<StoreInner>,
    flush_interval: Duration,
    record_overhead: u64,
    flusher: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl MemoryMetadataStore {
    pub fn new(shard_count: u32) -> Self {
        Self::build(shard_count, None, Duration::from_secs(30), 0)
    }

    /// Persist records to `path`, flushing every `flush_interval` while started
    pub fn with_snapshot(shard_count: u32, path: PathBuf, flush_interval: Duration) -> Self {
        Self::build(
            shard_count,
            Some(path),
            flush_interval,
            PERSISTED_RECORD_OVERHEAD,
        )
    }

    fn build(
        shard_count: u32,
        snapshot_path: Option<PathBuf>,
        flush_interval: Duration,
        record_overhead: u64,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                shards: (0..shard_count.max(1))
                    .map(|_| Mutex::new(Shard::default()))
                    .collect(),
                snapshot_path,
                dirty: AtomicBool::new(false),
            }),
            flush_interval,
            record_overhead,
            flusher: Mutex::new(None),
        }
    }

    pub fn with_record_overhead(mut self, bytes: u64) -> Self {
        self.record_overhead = bytes;
        self
    }

    /// Write a snapshot now if anything changed since the last one
    pub async fn flush(&self) -> Result<()> {
        self.inner.flush_if_dirty().await
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn start(&self) -> Result<()> {
        self.inner.load_snapshot().await?;

        if self.inner.snapshot_path.is_none() {
            return Ok(());
        }

        let token = CancellationToken::new();
        let inner = self.inner.clone();
        let interval = self.flush_interval;
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = inner.flush_if_dirty().await {
                            warn!(error = %e, "Failed to flush metadata snapshot");
                        }
                    }
                }
            }
        });

        if let Some((old_token, _)) = self.flusher.lock().replace((token, handle)) {
            old_token.cancel();
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let flusher = self.flusher.lock().take();
        if let Some((token, handle)) = flusher {
            token.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "Metadata flush task ended abnormally");
            }
        }
        self.inner.flush_if_dirty().await
    }

    fn shard_count(&self) -> u32 {
        self.inner.shards.len() as u32
    }

    fn shard_for_key(&self, relative_path: &str) -> u32 {
        self.inner.shard_for_key(relative_path)
    }

    fn estimate_record_disk_space(&self, _content_type: &str) -> u64 {
        self.record_overhead
    }

    async fn create_if_space(&self, shard: u32, record: CacheRecord, quota: u64) -> Result<bool> {
        let mut guard = self.inner.shard(shard).lock();
        if guard.records.contains_key(&record.relative_path) {
            return Ok(true);
        }
        if guard.total_bytes + record.disk_size > quota {
            return Ok(false);
        }
        guard.insert(record);
        drop(guard);
        self.inner.mark_dirty();
        Ok(true)
    }

    async fn get_oldest_records(
        &self,
        shard: u32,
        max_last_deletion_attempt: DateTime<Utc>,
        max_created_at: DateTime<Utc>,
        count: usize,
    ) -> Result<Vec<CacheRecord>> {
        let guard = self.inner.shard(shard).lock();
        let mut candidates: Vec<&CacheRecord> = guard
            .records
            .values()
            .filter(|r| {
                r.created_at <= max_created_at
                    && r.last_deletion_attempt <= max_last_deletion_attempt
            })
            .collect();
        candidates.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.relative_path.cmp(&b.relative_path))
        });
        Ok(candidates.into_iter().take(count).cloned().collect())
    }

    async fn delete_record(&self, shard: u32, relative_path: &str) -> Result<bool> {
        let mut guard = self.inner.shard(shard).lock();
        match guard.records.remove(relative_path) {
            Some(record) => {
                guard.total_bytes -= record.disk_size;
                drop(guard);
                self.inner.mark_dirty();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn update_last_deletion_attempt(
        &self,
        shard: u32,
        relative_path: &str,
        when: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(record) = self.inner.shard(shard).lock().records.get_mut(relative_path) {
            record.last_deletion_attempt = when;
            self.inner.mark_dirty();
        }
        Ok(())
    }

    async fn update_created_date(
        &self,
        shard: u32,
        relative_path: &str,
        when: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(record) = self.inner.shard(shard).lock().records.get_mut(relative_path) {
            record.created_at = when;
            self.inner.mark_dirty();
        }
        Ok(())
    }

    async fn replace_relative_path_and_update_last_deletion(
        &self,
        shard: u32,
        record: &CacheRecord,
        new_relative_path: String,
        when: DateTime<Utc>,
    ) -> Result<()> {
        let mut guard = self.inner.shard(shard).lock();
        // A record deleted meanwhile is re-added so the moved file stays tracked
        let mut moved = match guard.records.remove(&record.relative_path) {
            Some(existing) => {
                guard.total_bytes -= existing.disk_size;
                existing
            }
            None => record.clone(),
        };
        moved.relative_path = new_relative_path;
        moved.last_deletion_attempt = when;
        guard.insert(moved);
        drop(guard);
        self.inner.mark_dirty();
        Ok(())
    }

    async fn get_shard_size(&self, shard: u32) -> Result<u64> {
        Ok(self.inner.shard(shard).lock().total_bytes)
    }

    async fn get_total_bytes(&self) -> Result<u64> {
        Ok(self
            .inner
            .shards
            .iter()
            .map(|shard| shard.lock().total_bytes)
            .sum())
    }

    async fn get_content_type(&self, shard: u32, relative_path: &str) -> Result<Option<String>> {
        Ok(self
            .inner
            .shard(shard)
            .lock()
            .records
            .get(relative_path)
            .map(|r| r.content_type.clone()))
    }

    async fn record_count(&self) -> Result<usize> {
        Ok(self.inner.shards.iter().map(|s| s.lock().records.len()).sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::tempdir;

    fn record(path: &str, size: u64, age_secs: i64) -> CacheRecord {
        CacheRecord::new(
            path,
            "image/png",
            size,
            Utc::now() - ChronoDuration::seconds(age_secs),
            path.len() as u64,
        )
    }

    #[tokio::test]
    async fn test_create_if_space_respects_quota() {
        let store = MemoryMetadataStore::new(1);

        assert!(store.create_if_space(0, record("a", 600, 0), 1000).await.unwrap());
        assert!(!store.create_if_space(0, record("b", 500, 0), 1000).await.unwrap());
        assert!(store.create_if_space(0, record("c", 400, 0), 1000).await.unwrap());

        assert_eq!(store.get_total_bytes().await.unwrap(), 1000);
        assert_eq!(store.record_count().await.unwrap(), 2);
        assert_eq!(store.get_content_type(0, "b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_existing_record_is_not_counted_twice() {
        let store = MemoryMetadataStore::new(1);
        assert!(store.create_if_space(0, record("a", 600, 0), 1000).await.unwrap());
        assert!(store.create_if_space(0, record("a", 600, 0), 1000).await.unwrap());
        assert_eq!(store.get_shard_size(0).await.unwrap(), 600);
    }

    #[tokio::test]
    async fn test_delete_record_is_idempotent() {
        let store = MemoryMetadataStore::new(1);
        store.create_if_space(0, record("a", 10, 0), 100).await.unwrap();

        assert!(store.delete_record(0, "a").await.unwrap());
        assert!(!store.delete_record(0, "a").await.unwrap());
        assert!(!store.delete_record(0, "never-existed").await.unwrap());
        assert_eq!(store.get_total_bytes().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_get_oldest_records_filters_and_orders() {
        let store = MemoryMetadataStore::new(1);
        store.create_if_space(0, record("young", 1, 1), 100).await.unwrap();
        store.create_if_space(0, record("old", 1, 300), 100).await.unwrap();
        store.create_if_space(0, record("older", 1, 600), 100).await.unwrap();
        store.create_if_space(0, record("retried", 1, 900), 100).await.unwrap();

        let now = Utc::now();
        store
            .update_last_deletion_attempt(0, "retried", now)
            .await
            .unwrap();

        let records = store
            .get_oldest_records(
                0,
                now - ChronoDuration::seconds(60),
                now - ChronoDuration::seconds(10),
                10,
            )
            .await
            .unwrap();
        let paths: Vec<&str> = records.iter().map(|r| r.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["older", "old"]);

        let limited = store
            .get_oldest_records(0, now, now, 1)
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_update_created_date() {
        let store = MemoryMetadataStore::new(1);
        store.create_if_space(0, record("a", 1, 600), 100).await.unwrap();

        let now = Utc::now();
        store.update_created_date(0, "a", now).await.unwrap();

        let old_only = store
            .get_oldest_records(0, now, now - ChronoDuration::seconds(60), 10)
            .await
            .unwrap();
        assert!(old_only.is_empty());
    }

    #[tokio::test]
    async fn test_replace_relative_path() {
        let store = MemoryMetadataStore::new(1);
        let original = record("3/05/abc", 50, 100);
        store.create_if_space(0, original.clone(), 100).await.unwrap();

        let when = Utc::now();
        store
            .replace_relative_path_and_update_last_deletion(
                0,
                &original,
                "3/05/abc1f2e".to_string(),
                when,
            )
            .await
            .unwrap();

        assert_eq!(store.get_content_type(0, "3/05/abc").await.unwrap(), None);
        assert_eq!(
            store.get_content_type(0, "3/05/abc1f2e").await.unwrap(),
            Some("image/png".to_string())
        );
        assert_eq!(store.get_total_bytes().await.unwrap(), 50);

        // Recently attempted, so not a candidate until the retry window passes
        let candidates = store
            .get_oldest_records(0, when - ChronoDuration::seconds(1), Utc::now(), 10)
            .await
            .unwrap();
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn test_shards_have_independent_totals() {
        let store = MemoryMetadataStore::new(4);
        let mut expected = [0u64; 4];
        for i in 0..40 {
            let path = format!("1/00/{:064x}", i);
            let shard = store.shard_for_key(&path);
            assert!(shard < 4);
            store.create_if_space(shard, record(&path, 10, 0), 1000).await.unwrap();
            expected[shard as usize] += 10;
        }
        for shard in 0..4 {
            assert_eq!(
                store.get_shard_size(shard).await.unwrap(),
                expected[shard as usize]
            );
        }
        assert_eq!(store.get_total_bytes().await.unwrap(), 400);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_inserts_never_exceed_quota() {
        let store = Arc::new(MemoryMetadataStore::new(1));
        let tasks: Vec<_> = (0..64)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .create_if_space(0, record(&format!("k{}", i), 37, 0), 1000)
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut accepted = 0;
        for task in tasks {
            if task.await.unwrap() {
                accepted += 1;
            }
        }

        assert_eq!(accepted, 1000 / 37);
        assert!(store.get_total_bytes().await.unwrap() <= 1000);
    }

    #[tokio::test]
    async fn test_snapshot_survives_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta").join("records.json");

        let store = MemoryMetadataStore::with_snapshot(2, path.clone(), Duration::from_secs(60));
        store.start().await.unwrap();
        let rec = record("3/05/abc", 123, 50);
        let shard = store.shard_for_key(&rec.relative_path);
        store.create_if_space(shard, rec.clone(), 1000).await.unwrap();
        store.stop().await.unwrap();
        assert!(path.exists());

        let reopened = MemoryMetadataStore::with_snapshot(2, path, Duration::from_secs(60));
        reopened.start().await.unwrap();
        assert_eq!(reopened.get_total_bytes().await.unwrap(), 123);
        assert_eq!(
            reopened.get_content_type(shard, "3/05/abc").await.unwrap(),
            Some("image/png".to_string())
        );
        reopened.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_snapshot_starts_empty() {
        let dir = tempdir().unwrap();
        let store = MemoryMetadataStore::with_snapshot(
            1,
            dir.path().join("absent.json"),
            Duration::from_secs(60),
        );
        store.start().await.unwrap();
        assert_eq!(store.record_count().await.unwrap(), 0);
        assert_eq!(store.estimate_record_disk_space("image/png"), 160);
        store.stop().await.unwrap();
    }
}
