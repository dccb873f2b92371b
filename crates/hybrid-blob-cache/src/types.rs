//! Cache types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata store row for one blob on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub relative_path: String,
    pub content_type: String,
    /// Estimated bytes on disk, including filesystem and index overhead
    pub disk_size: u64,
    pub created_at: DateTime<Utc>,
    pub last_deletion_attempt: DateTime<Utc>,
    pub access_bucket: u64,
}

impl CacheRecord {
    pub fn new(
        relative_path: impl Into<String>,
        content_type: impl Into<String>,
        disk_size: u64,
        created_at: DateTime<Utc>,
        access_bucket: u64,
    ) -> Self {
        Self {
            relative_path: relative_path.into(),
            content_type: content_type.into(),
            disk_size,
            created_at,
            last_deletion_attempt: never_attempted(),
            access_bucket,
        }
    }
}

/// Deletion-attempt timestamp for records nobody has tried to delete yet
pub fn never_attempted() -> DateTime<Utc> {
    DateTime::<Utc>::default()
}

/// Statistics about the cache
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub misses: u64,
    pub writes_succeeded: u64,
    pub lock_timeouts: u64,
    pub eviction_failures: u64,
    pub write_timeouts: u64,
    pub queued_writes: usize,
    pub queued_bytes: u64,
    pub entries: usize,
    pub total_size: u64,
    pub evicted_files: u64,
    pub evicted_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_default() {
        let stats = CacheStats::default();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.total_size, 0);
        assert_eq!(stats.disk_hits, 0);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn test_new_record_was_never_attempted() {
        let record = CacheRecord::new("3/05/abc", "image/png", 4096, Utc::now(), 7);
        assert_eq!(record.last_deletion_attempt, never_attempted());
        assert!(record.last_deletion_attempt < record.created_at);
    }

    #[test]
    fn test_cache_record_serialization() {
        let record = CacheRecord::new("3/05/abc123", "image/jpeg", 12345, Utc::now(), 99);

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("image/jpeg"));
        assert!(json.contains("12345"));

        let deserialized: CacheRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, record);
    }
}
