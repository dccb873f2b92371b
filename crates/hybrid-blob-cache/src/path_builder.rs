//! Content-addressed, sharded path construction
//!
//! Keys are hashed with SHA-256. The subfolder is picked from the *trailing*
//! bits of the hash; real-world keys often share long prefixes, and prefix
//! bits would pile them into the same directory. The number of subfolder bits
//! is embedded as the first path component so paths built with a different
//! subfolder count never collide and can be swept separately.

use crate::entry::CacheEntry;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct PathBuilder {
    cache_dir: PathBuf,
    subfolder_bits: u32,
}

impl PathBuilder {
    pub fn new(cache_dir: PathBuf, subfolders: u32) -> Self {
        Self {
            cache_dir,
            subfolder_bits: Self::bits_for_subfolders(subfolders),
        }
    }

    /// `ceil(log2(subfolders))`, never less than 1
    pub fn bits_for_subfolders(subfolders: u32) -> u32 {
        let bits = if subfolders <= 1 {
            0
        } else {
            32 - (subfolders - 1).leading_zeros()
        };
        bits.max(1)
    }

    pub fn subfolder_bits(&self) -> u32 {
        self.subfolder_bits
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// SHA-256 of the key bytes
    pub fn hash_key(key: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(key);
        hasher.finalize().into()
    }

    /// Build the cache entry for a key
    pub fn build(&self, key: &[u8]) -> CacheEntry {
        self.entry_for_hash(Self::hash_key(key))
    }

    pub fn entry_for_hash(&self, hash: [u8; 32]) -> CacheEntry {
        let relative_path = self.relative_path_for_hash(&hash);
        let physical_path = self.physical_path(&relative_path);
        CacheEntry::new(hash, relative_path, physical_path)
    }

    /// `<bits>/<segment>.../<hex hash>`, with `/` separators on every platform
    pub fn relative_path_for_hash(&self, hash: &[u8; 32]) -> String {
        let hex_hash = hex::encode(hash);
        let mut path = String::with_capacity(hex_hash.len() + 16);
        path.push_str(&self.subfolder_bits.to_string());
        for segment in self.subfolder_segments(hash) {
            path.push('/');
            path.push_str(&format!("{:02x}", segment));
        }
        path.push('/');
        path.push_str(&hex_hash);
        path
    }

    /// Trailing `subfolder_bits` bits of the hash, one byte per directory level,
    /// most significant level first
    fn subfolder_segments(&self, hash: &[u8; 32]) -> Vec<u8> {
        let byte_count = self.subfolder_bits.div_ceil(8) as usize;
        let start = hash.len() - byte_count;
        let mut segments = hash[start..].to_vec();

        let spare_bits = (byte_count as u32 * 8) - self.subfolder_bits;
        if spare_bits > 0 {
            segments[0] &= 0xffu8 >> spare_bits;
        }
        segments
    }

    pub fn physical_path(&self, relative_path: &str) -> PathBuf {
        let mut path = self.cache_dir.clone();
        for component in relative_path.split('/') {
            path.push(component);
        }
        path
    }

    /// Inverse of [`physical_path`](Self::physical_path) for paths under the cache dir
    pub fn relative_path_from_physical(&self, physical: &Path) -> Option<String> {
        let relative = physical.strip_prefix(&self.cache_dir).ok()?;
        let parts: Option<Vec<&str>> = relative.iter().map(|c| c.to_str()).collect();
        Some(parts?.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn test_bits_for_subfolders() {
        assert_eq!(PathBuilder::bits_for_subfolders(0), 1);
        assert_eq!(PathBuilder::bits_for_subfolders(1), 1);
        assert_eq!(PathBuilder::bits_for_subfolders(2), 1);
        assert_eq!(PathBuilder::bits_for_subfolders(3), 2);
        assert_eq!(PathBuilder::bits_for_subfolders(8), 3);
        assert_eq!(PathBuilder::bits_for_subfolders(9), 4);
        assert_eq!(PathBuilder::bits_for_subfolders(2048), 11);
    }

    #[test]
    fn test_eight_subfolders_abc() {
        let builder = PathBuilder::new(PathBuf::from("/cache"), 8);
        let entry = builder.build(b"abc");

        // 0xad = 0b1010_1101, trailing three bits are 0b101
        assert_eq!(entry.relative_path, format!("3/05/{}", ABC_SHA256));
        assert_eq!(entry.string_key, ABC_SHA256);

        let segments: Vec<&str> = entry.relative_path.split('/').collect();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0], "3");
        assert_eq!(segments[2].len(), 64);
    }

    #[test]
    fn test_multi_byte_segments() {
        let builder = PathBuilder::new(PathBuf::from("/cache"), 2048);
        let entry = builder.build(b"abc");

        // 11 bits: low 3 bits of 0x15, then all of 0xad
        assert_eq!(entry.relative_path, format!("11/05/ad/{}", ABC_SHA256));
    }

    #[test]
    fn test_path_determinism() {
        let a = PathBuilder::new(PathBuf::from("/cache"), 512);
        let b = PathBuilder::new(PathBuf::from("/other"), 512);
        for key in [&b""[..], b"x", b"/images/cat.jpg?width=100", &[0u8, 255, 7]] {
            assert_eq!(a.build(key).relative_path, a.build(key).relative_path);
            assert_eq!(a.build(key).relative_path, b.build(key).relative_path);
        }
    }

    #[test]
    fn test_shared_prefixes_spread_out() {
        let builder = PathBuilder::new(PathBuf::from("/cache"), 256);
        let folders: std::collections::HashSet<String> = (0..200)
            .map(|i| {
                let key = format!("/images/very/long/shared/prefix/photo.jpg?w={}", i);
                let path = builder.build(key.as_bytes()).relative_path;
                path.split('/').nth(1).unwrap().to_string()
            })
            .collect();
        assert!(folders.len() > 50);
    }

    #[test]
    fn test_physical_path_round_trip() {
        let builder = PathBuilder::new(PathBuf::from("/cache/root"), 8);
        let entry = builder.build(b"abc");
        assert_eq!(
            entry.physical_path,
            PathBuf::from("/cache/root/3/05").join(ABC_SHA256)
        );
        assert_eq!(
            builder.relative_path_from_physical(&entry.physical_path),
            Some(entry.relative_path.clone())
        );
        assert_eq!(
            builder.relative_path_from_physical(Path::new("/elsewhere/file")),
            None
        );
    }
}
