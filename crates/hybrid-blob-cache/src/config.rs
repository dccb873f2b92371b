//! Cache configuration

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Serde helpers storing durations as integer milliseconds
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Options for the disk cleanup and eviction manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupOptions {
    /// Disk quota across all shards
    pub max_cache_bytes: u64,
    /// Eviction tries to free at least this much at once, so it runs less often
    pub min_cleanup_bytes: u64,
    /// Entries younger than this are never evicted
    #[serde(with = "duration_ms")]
    pub min_age_to_delete: Duration,
    /// Entries whose deletion failed are skipped for this long
    #[serde(with = "duration_ms")]
    pub retry_deletion_after: Duration,
    /// Candidate batch size per eviction query
    pub cleanup_select_batch_size: usize,
    /// Width in bits of the access frequency table
    pub access_tracking_bits: u32,
    /// Number of distinct tracked buckets before switching to the dense table
    pub sparse_counter_threshold: usize,
    /// Filesystem allocation unit used for size estimates
    pub file_block_size: u64,
    /// Fixed per-file and directory entry overhead used for size estimates
    pub per_file_overhead: u64,
}

impl Default for CleanupOptions {
    fn default() -> Self {
        Self {
            max_cache_bytes: 1024 * 1024 * 1024, // 1GB
            min_cleanup_bytes: 1024 * 1024,      // 1MB
            min_age_to_delete: Duration::from_secs(10),
            retry_deletion_after: Duration::from_secs(60),
            cleanup_select_batch_size: 1000,
            access_tracking_bits: 21,
            sparse_counter_threshold: 65_536,
            file_block_size: 4096,
            per_file_overhead: 1024,
        }
    }
}

/// Options for the hybrid cache engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridCacheOptions {
    /// Root directory for cached blobs
    pub cache_dir: PathBuf,
    /// Memory budget for writes that have not reached disk yet
    pub max_queued_bytes: u64,
    /// How long an identical request waits for the producing request
    #[serde(with = "duration_ms")]
    pub wait_for_identical_requests_timeout: Duration,
    /// How long a disk write waits for the per-key write lock
    #[serde(with = "duration_ms")]
    pub write_lock_timeout: Duration,
    /// Fail instead of producing an uncached result when the production lock times out
    pub fail_requests_on_enqueue_lock_timeout: bool,
    /// Write on the request path when the queue is full instead of skipping the cache
    pub write_synchronously_when_queue_full: bool,
    /// Write to a temp file and rename it into place
    pub move_files_into_place: bool,
    /// Number of subdirectories blobs are spread over
    pub subfolders: u32,
    pub cleanup: CleanupOptions,
}

impl Default for HybridCacheOptions {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./cache/blobs"),
            max_queued_bytes: 100 * 1024 * 1024, // 100MB
            wait_for_identical_requests_timeout: Duration::from_secs(100),
            write_lock_timeout: Duration::from_secs(15),
            fail_requests_on_enqueue_lock_timeout: true,
            write_synchronously_when_queue_full: false,
            move_files_into_place: true,
            subfolders: 2048,
            cleanup: CleanupOptions::default(),
        }
    }
}

impl HybridCacheOptions {
    /// Create options with a custom cache directory
    pub fn with_cache_dir(cache_dir: PathBuf) -> Self {
        Self {
            cache_dir,
            ..Default::default()
        }
    }

    /// Reject settings the engine cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.subfolders == 0 {
            return Err(CacheError::Config(
                "subfolders must be at least 1".to_string(),
            ));
        }
        let bits = self.cleanup.access_tracking_bits;
        if !(1..=30).contains(&bits) {
            return Err(CacheError::Config(format!(
                "access_tracking_bits must be between 1 and 30, got {}",
                bits
            )));
        }
        if self.cleanup.file_block_size == 0 {
            return Err(CacheError::Config(
                "file_block_size must be greater than 0".to_string(),
            ));
        }
        if self.cleanup.max_cache_bytes == 0 {
            return Err(CacheError::Config(
                "max_cache_bytes must be greater than 0".to_string(),
            ));
        }
        if self.cleanup.cleanup_select_batch_size == 0 {
            return Err(CacheError::Config(
                "cleanup_select_batch_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = HybridCacheOptions::default();
        assert_eq!(options.cache_dir, PathBuf::from("./cache/blobs"));
        assert_eq!(options.max_queued_bytes, 100 * 1024 * 1024);
        assert_eq!(options.subfolders, 2048);
        assert!(options.move_files_into_place);
        assert!(options.fail_requests_on_enqueue_lock_timeout);
        assert_eq!(options.cleanup.access_tracking_bits, 21);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_with_cache_dir() {
        let options = HybridCacheOptions::with_cache_dir(PathBuf::from("/var/cache/blobs"));
        assert_eq!(options.cache_dir, PathBuf::from("/var/cache/blobs"));
        assert_eq!(options.subfolders, 2048);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut options = HybridCacheOptions::default();
        options.subfolders = 0;
        assert!(options.validate().is_err());

        let mut options = HybridCacheOptions::default();
        options.cleanup.access_tracking_bits = 40;
        assert!(options.validate().is_err());

        let mut options = HybridCacheOptions::default();
        options.cleanup.max_cache_bytes = 0;
        let err = options.validate().unwrap_err();
        assert!(err.to_string().contains("max_cache_bytes"));
    }

    #[test]
    fn test_deserialize_partial_json() {
        let json = r#"{
            "cache_dir": "/tmp/blobs",
            "write_lock_timeout": 2500,
            "cleanup": { "max_cache_bytes": 4096, "min_age_to_delete": 0 }
        }"#;

        let options: HybridCacheOptions = serde_json::from_str(json).unwrap();
        assert_eq!(options.cache_dir, PathBuf::from("/tmp/blobs"));
        assert_eq!(options.write_lock_timeout, Duration::from_millis(2500));
        assert_eq!(options.cleanup.max_cache_bytes, 4096);
        assert_eq!(options.cleanup.min_age_to_delete, Duration::ZERO);
        // Untouched fields keep their defaults
        assert_eq!(options.cleanup.cleanup_select_batch_size, 1000);
        assert_eq!(options.subfolders, 2048);
    }

    #[test]
    fn test_serialize_durations_as_millis() {
        let options = CleanupOptions::default();
        let json = serde_json::to_value(&options).unwrap();
        assert_eq!(json["min_age_to_delete"], 10_000);
        assert_eq!(json["retry_deletion_after"], 60_000);
    }
}
