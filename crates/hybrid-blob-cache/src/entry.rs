//! Cache entry identity

use std::fmt;
use std::path::PathBuf;
use xxhash_rust::xxh64::xxh64;

/// Everything derived from a key: its hash, where it lives on disk, and the
/// coarse bucket used for frequency tracking
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub hash: [u8; 32],
    pub relative_path: String,
    pub physical_path: PathBuf,
    pub access_bucket: u64,
    /// Lowercase hex of `hash`; the lock and write-queue key
    pub string_key: String,
}

impl CacheEntry {
    pub(crate) fn new(hash: [u8; 32], relative_path: String, physical_path: PathBuf) -> Self {
        Self {
            hash,
            relative_path,
            physical_path,
            access_bucket: access_bucket_for(&hash),
            string_key: hex::encode(hash),
        }
    }
}

impl fmt::Display for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.relative_path)
    }
}

/// Frequency-table bucket for a hash. Uses xxh64 so the bucket is independent
/// of the bits that pick the subfolder.
pub fn access_bucket_for(hash: &[u8]) -> u64 {
    xxh64(hash, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path_builder::PathBuilder;

    #[test]
    fn test_entry_fields_are_consistent() {
        let builder = PathBuilder::new(PathBuf::from("/cache"), 16);
        let entry = builder.build(b"/images/dog.png");

        assert_eq!(entry.string_key, hex::encode(entry.hash));
        assert!(entry.relative_path.ends_with(&entry.string_key));
        assert_eq!(entry.access_bucket, access_bucket_for(&entry.hash));
        assert_eq!(entry.to_string(), entry.relative_path);
    }

    #[test]
    fn test_access_bucket_differs_between_keys() {
        let builder = PathBuilder::new(PathBuf::from("/cache"), 16);
        let a = builder.build(b"a");
        let b = builder.build(b"b");
        assert_ne!(a.access_bucket, b.access_bucket);
    }
}
