//! Get-or-create orchestration
//!
//! A request is served from disk when the blob is already there. Otherwise it
//! takes the production lock for its key, so identical requests wait for a
//! single producer and are then served from the write queue or from disk.
//! Produced blobs are persisted in the background while the write queue has
//! budget left.

use crate::cleanup::CleanupManager;
use crate::config::HybridCacheOptions;
use crate::entry::CacheEntry;
use crate::error::{CacheError, Result};
use crate::file_writer::{default_move_into_place, FileWriter, MoveIntoPlaceFn, WriteResult};
use crate::locks::KeyedLocks;
use crate::path_builder::PathBuilder;
use crate::store::MetadataStore;
use crate::types::CacheStats;
use crate::write_queue::{QueueResult, QueuedWrite, WriteQueue};
use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What a producer hands back for a cache miss
#[derive(Debug, Clone)]
pub struct ProducedBlob {
    pub content_type: String,
    pub data: Bytes,
}

impl ProducedBlob {
    pub fn new(content_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            content_type: content_type.into(),
            data: data.into(),
        }
    }
}

/// How a request was served
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CacheStatus {
    MemoryHit,
    DiskHit,
    /// Produced and written to disk before returning
    WriteSucceeded,
    /// Produced; persisted in the background or not at all
    Miss,
    /// Gave up waiting for an identical request and produced anyway
    QueueLockTimeoutAndCreated,
    /// Gave up waiting for an identical request and returned nothing
    QueueLockTimeoutAndFailed,
    FileAlreadyExists,
    CacheEvictionFailed,
    WriteTimedOut,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::MemoryHit => "MemoryHit",
            CacheStatus::DiskHit => "DiskHit",
            CacheStatus::WriteSucceeded => "WriteSucceeded",
            CacheStatus::Miss => "Miss",
            CacheStatus::QueueLockTimeoutAndCreated => "QueueLockTimeoutAndCreated",
            CacheStatus::QueueLockTimeoutAndFailed => "QueueLockTimeoutAndFailed",
            CacheStatus::FileAlreadyExists => "FileAlreadyExists",
            CacheStatus::CacheEvictionFailed => "CacheEvictionFailed",
            CacheStatus::WriteTimedOut => "WriteTimedOut",
        }
    }

    /// Whether the data came out of the cache rather than the producer
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheStatus::MemoryHit | CacheStatus::DiskHit)
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub enum CacheData {
    Bytes(Bytes),
    /// Open handle to the cached file
    File(File),
}

#[derive(Debug)]
pub struct CacheResult {
    pub status: CacheStatus,
    pub content_type: Option<String>,
    pub data: Option<CacheData>,
}

impl CacheResult {
    fn with_bytes(status: CacheStatus, content_type: &str, data: Bytes) -> Self {
        Self {
            status,
            content_type: Some(content_type.to_string()),
            data: Some(CacheData::Bytes(data)),
        }
    }
}

#[derive(Default)]
struct Counters {
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    misses: AtomicU64,
    writes_succeeded: AtomicU64,
    lock_timeouts: AtomicU64,
    eviction_failures: AtomicU64,
    write_timeouts: AtomicU64,
}

impl Counters {
    fn record(&self, status: CacheStatus) {
        let counter = match status {
            CacheStatus::MemoryHit => &self.memory_hits,
            CacheStatus::DiskHit => &self.disk_hits,
            CacheStatus::Miss => &self.misses,
            CacheStatus::WriteSucceeded => &self.writes_succeeded,
            CacheStatus::QueueLockTimeoutAndCreated | CacheStatus::QueueLockTimeoutAndFailed => {
                &self.lock_timeouts
            }
            CacheStatus::CacheEvictionFailed => &self.eviction_failures,
            CacheStatus::WriteTimedOut => &self.write_timeouts,
            CacheStatus::FileAlreadyExists => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Reserve space, write the file, commit the record
struct WritePipeline {
    writer: FileWriter,
    cleanup: CleanupManager,
    write_lock_timeout: Duration,
    counters: Arc<Counters>,
}

impl WritePipeline {
    /// Background writes may evict and recheck the filesystem before locking.
    /// Synchronous writes hold up a request, so they do neither.
    async fn persist(
        &self,
        entry: &CacheEntry,
        write: &QueuedWrite,
        background: bool,
        cancel: &CancellationToken,
    ) -> Result<CacheStatus> {
        let status = self.persist_inner(entry, write, background, cancel).await?;
        self.counters.record(status);
        Ok(status)
    }

    async fn persist_inner(
        &self,
        entry: &CacheEntry,
        write: &QueuedWrite,
        background: bool,
        cancel: &CancellationToken,
    ) -> Result<CacheStatus> {
        let reserved = self
            .cleanup
            .try_reserve_space(
                entry,
                &write.content_type,
                write.data.len() as u64,
                background,
                cancel,
            )
            .await?;
        if !reserved {
            debug!(key = %entry.string_key, "No space reserved, not writing to disk");
            return Ok(CacheStatus::CacheEvictionFailed);
        }

        let data = write.data.clone();
        let written = self
            .writer
            .try_write(
                entry,
                |mut file| async move {
                    file.write_all(&data).await?;
                    Ok::<_, io::Error>(file)
                },
                background,
                self.write_lock_timeout,
                cancel,
            )
            .await;

        match written {
            Ok(WriteResult::Created) => {
                self.cleanup.mark_created(entry).await?;
                debug!(key = %entry.string_key, size = write.data.len(), "Wrote cache entry");
                Ok(CacheStatus::WriteSucceeded)
            }
            Ok(WriteResult::AlreadyExists) => Ok(CacheStatus::FileAlreadyExists),
            Ok(WriteResult::LockTimeout) => Ok(CacheStatus::WriteTimedOut),
            Err(e) => {
                // The reservation has no file behind it
                let store = self.cleanup.store();
                let shard = store.shard_for_key(&entry.relative_path);
                if let Err(cleanup_err) = store.delete_record(shard, &entry.relative_path).await {
                    warn!(key = %entry.string_key, error = %cleanup_err, "Failed to release reservation");
                }
                Err(e)
            }
        }
    }
}

pub struct HybridCache {
    options: HybridCacheOptions,
    path_builder: PathBuilder,
    queue_locks: KeyedLocks,
    queue: WriteQueue,
    pipeline: Arc<WritePipeline>,
    store: Arc<dyn MetadataStore>,
    counters: Arc<Counters>,
}

impl HybridCache {
    pub fn new(options: HybridCacheOptions, store: Arc<dyn MetadataStore>) -> Result<Self> {
        Self::with_move_fn(options, store, default_move_into_place())
    }

    /// Use `move_fn` instead of a plain rename to put finished files in place
    pub fn with_move_fn(
        options: HybridCacheOptions,
        store: Arc<dyn MetadataStore>,
        move_fn: MoveIntoPlaceFn,
    ) -> Result<Self> {
        options.validate()?;

        let path_builder = PathBuilder::new(options.cache_dir.clone(), options.subfolders);
        let counters = Arc::new(Counters::default());
        let pipeline = Arc::new(WritePipeline {
            writer: FileWriter::new(options.move_files_into_place, move_fn),
            cleanup: CleanupManager::new(
                store.clone(),
                path_builder.clone(),
                options.cleanup.clone(),
            ),
            write_lock_timeout: options.write_lock_timeout,
            counters: counters.clone(),
        });

        Ok(Self {
            queue: WriteQueue::new(options.max_queued_bytes),
            queue_locks: KeyedLocks::new(),
            path_builder,
            pipeline,
            store,
            counters,
            options,
        })
    }

    /// Create the cache directory, start the metadata store and reconcile it
    /// with the files already on disk
    pub async fn start(&self) -> Result<()> {
        fs::create_dir_all(&self.options.cache_dir).await?;
        self.store.start().await?;
        self.pipeline.cleanup.reconcile_disk().await?;
        info!(
            cache_dir = %self.options.cache_dir.display(),
            subfolder_bits = self.path_builder.subfolder_bits(),
            shards = self.store.shard_count(),
            "Hybrid cache started"
        );
        Ok(())
    }

    /// Finish queued writes, then stop the metadata store
    pub async fn stop(&self) -> Result<()> {
        self.await_all_writes().await;
        self.store.stop().await?;
        info!("Hybrid cache stopped");
        Ok(())
    }

    pub async fn await_all_writes(&self) {
        self.queue.await_all().await;
    }

    pub fn path_builder(&self) -> &PathBuilder {
        &self.path_builder
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        let c = &self.counters;
        Ok(CacheStats {
            memory_hits: c.memory_hits.load(Ordering::Relaxed),
            disk_hits: c.disk_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            writes_succeeded: c.writes_succeeded.load(Ordering::Relaxed),
            lock_timeouts: c.lock_timeouts.load(Ordering::Relaxed),
            eviction_failures: c.eviction_failures.load(Ordering::Relaxed),
            write_timeouts: c.write_timeouts.load(Ordering::Relaxed),
            queued_writes: self.queue.len(),
            queued_bytes: self.queue.queued_bytes(),
            entries: self.store.record_count().await?,
            total_size: self.store.get_total_bytes().await?,
            evicted_files: self.pipeline.cleanup.evicted_files(),
            evicted_bytes: self.pipeline.cleanup.evicted_bytes(),
        })
    }

    /// Return the cached blob for `key`, running `producer` at most once per
    /// key at a time when it is missing.
    ///
    /// `retrieve_content_type` controls whether disk hits look up the stored
    /// content type.
    pub async fn get_or_create<F, Fut, E>(
        &self,
        key: &[u8],
        producer: F,
        cancel: &CancellationToken,
        retrieve_content_type: bool,
    ) -> Result<CacheResult>
    where
        F: FnOnce(CancellationToken) -> Fut + Send,
        Fut: Future<Output = std::result::Result<ProducedBlob, E>> + Send,
        E: std::error::Error + Send + Sync + 'static,
    {
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }

        let entry = self.path_builder.build(key);
        self.pipeline.cleanup.notify_used(&entry);

        if let Some(hit) = self
            .try_disk_hit(&entry, retrieve_content_type, cancel)
            .await?
        {
            return Ok(self.served(hit));
        }

        let guard = self
            .queue_locks
            .try_lock(
                &entry.string_key,
                self.options.wait_for_identical_requests_timeout,
                cancel,
            )
            .await?;

        let Some(_guard) = guard else {
            return self
                .after_lock_timeout(&entry, producer, cancel, retrieve_content_type)
                .await;
        };

        if let Some(hit) = self.try_memory_hit(&entry) {
            return Ok(self.served(hit));
        }
        // Another request may have finished writing while we waited
        if let Some(hit) = self
            .try_disk_hit(&entry, retrieve_content_type, cancel)
            .await?
        {
            return Ok(self.served(hit));
        }

        let blob = producer(cancel.clone())
            .await
            .map_err(CacheError::producer)?;
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }

        self.store_produced(entry, blob, cancel).await
    }

    async fn after_lock_timeout<F, Fut, E>(
        &self,
        entry: &CacheEntry,
        producer: F,
        cancel: &CancellationToken,
        retrieve_content_type: bool,
    ) -> Result<CacheResult>
    where
        F: FnOnce(CancellationToken) -> Fut + Send,
        Fut: Future<Output = std::result::Result<ProducedBlob, E>> + Send,
        E: std::error::Error + Send + Sync + 'static,
    {
        if let Some(hit) = self.try_memory_hit(entry) {
            return Ok(self.served(hit));
        }
        if let Some(hit) = self
            .try_disk_hit(entry, retrieve_content_type, cancel)
            .await?
        {
            return Ok(self.served(hit));
        }

        warn!(key = %entry.string_key, "Timed out waiting for identical request");
        if self.options.fail_requests_on_enqueue_lock_timeout {
            return Ok(self.served(CacheResult {
                status: CacheStatus::QueueLockTimeoutAndFailed,
                content_type: None,
                data: None,
            }));
        }

        let blob = producer(cancel.clone())
            .await
            .map_err(CacheError::producer)?;
        Ok(self.served(CacheResult::with_bytes(
            CacheStatus::QueueLockTimeoutAndCreated,
            &blob.content_type,
            blob.data,
        )))
    }

    async fn store_produced(
        &self,
        entry: CacheEntry,
        blob: ProducedBlob,
        cancel: &CancellationToken,
    ) -> Result<CacheResult> {
        let write = Arc::new(QueuedWrite::new(
            entry.string_key.clone(),
            blob.content_type,
            blob.data,
        ));

        let pipeline = self.pipeline.clone();
        let background_entry = entry.clone();
        let queued = self.queue.queue(write.clone(), move |write| async move {
            // Background writes outlive the request that produced them
            let cancel = CancellationToken::new();
            pipeline
                .persist(&background_entry, &write, true, &cancel)
                .await
                .map(|_| ())
        });

        match queued {
            QueueResult::Enqueued => Ok(self.served(CacheResult::with_bytes(
                CacheStatus::Miss,
                &write.content_type,
                write.data.clone(),
            ))),
            QueueResult::AlreadyPresent(existing) => Ok(self.served(CacheResult::with_bytes(
                CacheStatus::MemoryHit,
                &existing.content_type,
                existing.data.clone(),
            ))),
            QueueResult::QueueFull if self.options.write_synchronously_when_queue_full => {
                debug!(key = %entry.string_key, "Write queue full, writing synchronously");
                // The write finishes even if this request is dropped
                let pipeline = self.pipeline.clone();
                let sync_write = write.clone();
                let sync_cancel = cancel.clone();
                let status = self
                    .queue
                    .track(async move {
                        pipeline
                            .persist(&entry, &sync_write, false, &sync_cancel)
                            .await
                    })
                    .await
                    .map_err(io::Error::other)??;
                Ok(CacheResult::with_bytes(
                    status,
                    &write.content_type,
                    write.data.clone(),
                ))
            }
            QueueResult::QueueFull => {
                debug!(key = %entry.string_key, "Write queue full, not caching");
                Ok(self.served(CacheResult::with_bytes(
                    CacheStatus::Miss,
                    &write.content_type,
                    write.data.clone(),
                )))
            }
        }
    }

    fn try_memory_hit(&self, entry: &CacheEntry) -> Option<CacheResult> {
        let write = self.queue.get(&entry.string_key)?;
        Some(CacheResult::with_bytes(
            CacheStatus::MemoryHit,
            &write.content_type,
            write.data.clone(),
        ))
    }

    async fn try_disk_hit(
        &self,
        entry: &CacheEntry,
        retrieve_content_type: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<CacheResult>> {
        let Some(file) = self
            .pipeline
            .writer
            .open_finished(entry, self.options.write_lock_timeout, cancel)
            .await?
        else {
            return Ok(None);
        };

        let content_type = if retrieve_content_type {
            let shard = self.store.shard_for_key(&entry.relative_path);
            self.store
                .get_content_type(shard, &entry.relative_path)
                .await?
        } else {
            None
        };

        Ok(Some(CacheResult {
            status: CacheStatus::DiskHit,
            content_type,
            data: Some(CacheData::File(file)),
        }))
    }

    fn served(&self, result: CacheResult) -> CacheResult {
        self.counters.record(result.status);
        result
    }
}
