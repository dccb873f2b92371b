//! Disk space reservation and frequency-aware eviction
//!
//! Every blob gets a metadata record before its file is written. Reserving a
//! record is where the quota is enforced: when a shard is full the oldest
//! records are fetched, the coldest of them deleted, and the reservation
//! retried.

use crate::config::CleanupOptions;
use crate::entry::{access_bucket_for, CacheEntry};
use crate::error::{CacheError, Result};
use crate::frequency::FrequencyCounter;
use crate::path_builder::PathBuilder;
use crate::store::MetadataStore;
use crate::types::CacheRecord;
use chrono::{DateTime, Utc};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAX_RESERVE_ATTEMPTS: usize = 3;

/// Recorded for files found on disk without a record
const UNKNOWN_CONTENT_TYPE: &str = "application/octet-stream";

/// What [`CleanupManager::reconcile_disk`] changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Untracked files that got a record
    pub registered: u64,
    /// Leftover `.tmp_` files from interrupted writes
    pub removed_temp: u64,
    /// Untracked files deleted because their shard was full
    pub removed_over_quota: u64,
}

/// How a failed file delete is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeleteFailure {
    /// We may never be able to delete it; just note the attempt
    Denied,
    /// Probably open elsewhere; move it aside and retry later
    InUse,
}

fn classify_delete_failure(kind: io::ErrorKind) -> DeleteFailure {
    match kind {
        io::ErrorKind::PermissionDenied => DeleteFailure::Denied,
        _ => DeleteFailure::InUse,
    }
}

pub struct CleanupManager {
    store: Arc<dyn MetadataStore>,
    access_counter: FrequencyCounter,
    path_builder: PathBuilder,
    options: CleanupOptions,
    evicted_files: AtomicU64,
    evicted_bytes: AtomicU64,
}

impl CleanupManager {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        path_builder: PathBuilder,
        options: CleanupOptions,
    ) -> Self {
        Self {
            access_counter: FrequencyCounter::new(
                options.access_tracking_bits,
                options.sparse_counter_threshold,
            ),
            store,
            path_builder,
            options,
            evicted_files: AtomicU64::new(0),
            evicted_bytes: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    pub fn notify_used(&self, entry: &CacheEntry) {
        self.access_counter.increment(entry.access_bucket);
    }

    pub fn access_count(&self, entry: &CacheEntry) -> u16 {
        self.access_counter.get(entry.access_bucket)
    }

    /// Per-shard share of the disk quota
    pub fn shard_quota(&self) -> u64 {
        self.options.max_cache_bytes / self.store.shard_count() as u64
    }

    /// Payload size rounded up to whole blocks, plus file and index overhead
    pub fn estimate_disk_size(&self, byte_count: u64, content_type: &str) -> u64 {
        let block = self.options.file_block_size.max(1);
        byte_count.div_ceil(block) * block
            + self.options.per_file_overhead
            + self.store.estimate_record_disk_space(content_type)
    }

    pub fn evicted_files(&self) -> u64 {
        self.evicted_files.load(Ordering::Relaxed)
    }

    pub fn evicted_bytes(&self) -> u64 {
        self.evicted_bytes.load(Ordering::Relaxed)
    }

    /// Create the metadata record for `entry`, evicting if allowed and needed.
    ///
    /// False means the blob must not be written to disk.
    pub async fn try_reserve_space(
        &self,
        entry: &CacheEntry,
        content_type: &str,
        byte_count: u64,
        allow_eviction: bool,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let shard = self.store.shard_for_key(&entry.relative_path);
        let disk_size = self.estimate_disk_size(byte_count, content_type);
        let quota = self.shard_quota();

        if disk_size > quota {
            debug!(
                key = %entry.string_key,
                disk_size,
                quota,
                "Blob larger than shard quota, not caching"
            );
            return Ok(false);
        }

        for _ in 0..MAX_RESERVE_ATTEMPTS {
            if cancel.is_cancelled() {
                return Err(CacheError::Cancelled);
            }

            let record = CacheRecord::new(
                entry.relative_path.clone(),
                content_type,
                disk_size,
                Utc::now(),
                entry.access_bucket,
            );
            if self.store.create_if_space(shard, record, quota).await? {
                return Ok(true);
            }
            if !allow_eviction {
                return Ok(false);
            }

            let shard_size = self.store.get_shard_size(shard).await?;
            let missing = (shard_size + disk_size).saturating_sub(quota);
            if !self.evict_space(shard, missing, cancel).await? {
                warn!(
                    key = %entry.string_key,
                    shard,
                    missing,
                    "Could not free enough space for new cache entry"
                );
                return Ok(false);
            }
        }

        Ok(false)
    }

    /// Reset the entry's age to now, once its file is complete
    pub async fn mark_created(&self, entry: &CacheEntry) -> Result<()> {
        let shard = self.store.shard_for_key(&entry.relative_path);
        self.store
            .update_created_date(shard, &entry.relative_path, Utc::now())
            .await
    }

    /// Delete old, cold entries from `shard` until at least `min_bytes` are freed.
    ///
    /// Tries to free `max(min_cleanup_bytes, min_bytes)` so eviction runs less
    /// often. Only each fetched batch is ranked by access frequency, not the
    /// whole shard.
    pub async fn evict_space(
        &self,
        shard: u32,
        min_bytes: u64,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let target = self.options.min_cleanup_bytes.max(min_bytes);
        let batch_size = self.options.cleanup_select_batch_size;
        let mut freed = 0u64;

        loop {
            if cancel.is_cancelled() {
                return Err(CacheError::Cancelled);
            }

            let now = Utc::now();
            let retry_after = chrono::Duration::from_std(self.options.retry_deletion_after)
                .unwrap_or(chrono::Duration::MAX);
            let min_age = chrono::Duration::from_std(self.options.min_age_to_delete)
                .unwrap_or(chrono::Duration::MAX);
            let records = self
                .store
                .get_oldest_records(
                    shard,
                    now.checked_sub_signed(retry_after)
                        .unwrap_or(DateTime::<Utc>::MIN_UTC),
                    now.checked_sub_signed(min_age)
                        .unwrap_or(DateTime::<Utc>::MIN_UTC),
                    batch_size,
                )
                .await?;
            let fetched = records.len();

            // Coldest first; the sort is stable so ties stay oldest first
            let mut ranked: Vec<(u16, CacheRecord)> = records
                .into_iter()
                .map(|r| (self.access_counter.get(r.access_bucket), r))
                .collect();
            ranked.sort_by_key(|(count, _)| *count);

            let freed_before = freed;
            for (_, record) in ranked {
                if freed >= target {
                    break;
                }
                if cancel.is_cancelled() {
                    return Err(CacheError::Cancelled);
                }
                freed += self.try_delete_record(shard, &record).await?;
            }

            if freed >= target {
                info!(shard, freed, target, "Evicted cache entries");
                return Ok(true);
            }
            // A short batch means there is nothing left to try
            if fetched < batch_size || freed == freed_before {
                debug!(shard, freed, min_bytes, fetched, "Eviction ran out of candidates");
                return Ok(freed >= min_bytes);
            }
        }
    }

    /// Delete a record's file and then the record. Returns the bytes freed.
    async fn try_delete_record(&self, shard: u32, record: &CacheRecord) -> Result<u64> {
        let physical = self.path_builder.physical_path(&record.relative_path);
        match fs::remove_file(&physical).await {
            Ok(()) => self.forget_record(shard, record).await,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %record.relative_path, "Cache file already gone, dropping record");
                self.forget_record(shard, record).await
            }
            Err(e) => {
                warn!(path = %record.relative_path, error = %e, "Failed to delete cache file");
                self.handle_delete_failure(shard, record, &physical, e.kind())
                    .await?;
                Ok(0)
            }
        }
    }

    async fn forget_record(&self, shard: u32, record: &CacheRecord) -> Result<u64> {
        if !self
            .store
            .delete_record(shard, &record.relative_path)
            .await?
        {
            // Someone else already freed it
            return Ok(0);
        }
        self.evicted_files.fetch_add(1, Ordering::Relaxed);
        self.evicted_bytes
            .fetch_add(record.disk_size, Ordering::Relaxed);
        Ok(record.disk_size)
    }

    /// Bring the store back in line with the files on disk.
    ///
    /// A crash loses records written since the last metadata flush while their
    /// files survive. Each such file gets a record again, or is deleted when
    /// its shard has no room left. Temp files of interrupted writes are
    /// removed. Must run before the cache serves requests.
    pub async fn reconcile_disk(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let mut entries = match fs::read_dir(self.path_builder.cache_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(e.into()),
        };

        // Only the `<bits>/...` trees belong to the cache
        let mut pending = Vec::new();
        while let Some(dirent) = entries.next_entry().await? {
            let is_tree = dirent
                .file_name()
                .to_str()
                .is_some_and(|name| name.parse::<u32>().is_ok());
            if is_tree && dirent.file_type().await?.is_dir() {
                pending.push(dirent.path());
            }
        }

        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(dirent) = entries.next_entry().await? {
                let file_type = dirent.file_type().await?;
                if file_type.is_dir() {
                    pending.push(dirent.path());
                } else if file_type.is_file() {
                    self.reconcile_file(&dirent.path(), &mut report).await?;
                }
            }
        }

        if report != ReconcileReport::default() {
            info!(
                registered = report.registered,
                removed_temp = report.removed_temp,
                removed_over_quota = report.removed_over_quota,
                "Reconciled cache directory with metadata"
            );
        }
        Ok(report)
    }

    async fn reconcile_file(&self, path: &Path, report: &mut ReconcileReport) -> Result<()> {
        let Some(relative_path) = self.path_builder.relative_path_from_physical(path) else {
            return Ok(());
        };

        if relative_path.contains(".tmp_") {
            if remove_stray_file(path).await {
                report.removed_temp += 1;
            }
            return Ok(());
        }

        let shard = self.store.shard_for_key(&relative_path);
        if self
            .store
            .get_content_type(shard, &relative_path)
            .await?
            .is_some()
        {
            return Ok(());
        }

        let metadata = fs::metadata(path).await?;
        let created_at = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        let record = CacheRecord::new(
            relative_path.clone(),
            UNKNOWN_CONTENT_TYPE,
            self.estimate_disk_size(metadata.len(), UNKNOWN_CONTENT_TYPE),
            created_at,
            access_bucket_for_file(&relative_path),
        );

        if self
            .store
            .create_if_space(shard, record, self.shard_quota())
            .await?
        {
            debug!(path = %relative_path, "Registered untracked cache file");
            report.registered += 1;
        } else {
            warn!(path = %relative_path, shard, "No room for untracked cache file, deleting it");
            if remove_stray_file(path).await {
                report.removed_over_quota += 1;
            }
        }
        Ok(())
    }

    async fn handle_delete_failure(
        &self,
        shard: u32,
        record: &CacheRecord,
        physical: &Path,
        kind: io::ErrorKind,
    ) -> Result<()> {
        let now = Utc::now();
        if classify_delete_failure(kind) == DeleteFailure::InUse {
            let moved_relative = format!(
                "{}{}",
                record.relative_path,
                &uuid::Uuid::new_v4().simple().to_string()[..8]
            );
            let moved_physical = self.path_builder.physical_path(&moved_relative);
            match fs::rename(physical, &moved_physical).await {
                Ok(()) => {
                    debug!(
                        from = %record.relative_path,
                        to = %moved_relative,
                        "Moved undeletable cache file aside"
                    );
                    return self
                        .store
                        .replace_relative_path_and_update_last_deletion(
                            shard,
                            record,
                            moved_relative,
                            now,
                        )
                        .await;
                }
                Err(e) => {
                    warn!(path = %record.relative_path, error = %e, "Failed to move cache file aside");
                }
            }
        }
        self.store
            .update_last_deletion_attempt(shard, &record.relative_path, now)
            .await
    }
}

/// Blob file names start with the hex key hash; moved-aside files carry a suffix
fn access_bucket_for_file(relative_path: &str) -> u64 {
    let name = relative_path.rsplit('/').next().unwrap_or(relative_path);
    match name.get(..64).and_then(|hash| hex::decode(hash).ok()) {
        Some(hash) => access_bucket_for(&hash),
        None => access_bucket_for(name.as_bytes()),
    }
}

async fn remove_stray_file(path: &Path) -> bool {
    match fs::remove_file(path).await {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!(path = ?path, error = %e, "Failed to remove stray cache file");
            false
        }
    }
}
