//! Configuration and response types for the media cache proxy

use crate::error::{ProxyError, Result};
use hybrid_blob_cache::{CacheStats, CleanupOptions, HybridCacheOptions};
use serde::Serialize;
use std::path::PathBuf;
use std::str::FromStr;

/// Configuration for the media cache proxy
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub port: u16,
    pub origin_url: String,
    pub cache_dir: PathBuf,
    pub max_cache_size: u64,
    pub max_queued_bytes: u64,
    pub subfolders: u32,
    pub metadata_shards: u32,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 3001,
            origin_url: String::new(),
            cache_dir: PathBuf::from("./cache/media"),
            max_cache_size: 1024 * 1024 * 1024, // 1GB
            max_queued_bytes: 100 * 1024 * 1024, // 100MB
            subfolders: 2048,
            metadata_shards: 16,
        }
    }
}

impl ProxyConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the config from `lookup`, falling back to defaults for unset or
    /// unparsable values. `ORIGIN_URL` is required.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let origin_url = lookup("ORIGIN_URL")
            .map(|s| s.trim_end_matches('/').to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ProxyError::Config("ORIGIN_URL must be set".to_string()))?;

        Ok(Self {
            port: parse_or(&lookup, "PORT", defaults.port),
            origin_url,
            cache_dir: lookup("CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_dir),
            max_cache_size: parse_or(&lookup, "MAX_CACHE_SIZE", defaults.max_cache_size),
            max_queued_bytes: parse_or(&lookup, "MAX_QUEUED_BYTES", defaults.max_queued_bytes),
            subfolders: parse_or(&lookup, "CACHE_SUBFOLDERS", defaults.subfolders),
            metadata_shards: defaults.metadata_shards,
        })
    }

    pub fn cache_options(&self) -> HybridCacheOptions {
        HybridCacheOptions {
            max_queued_bytes: self.max_queued_bytes,
            subfolders: self.subfolders,
            cleanup: CleanupOptions {
                max_cache_bytes: self.max_cache_size,
                ..Default::default()
            },
            ..HybridCacheOptions::with_cache_dir(self.cache_dir.clone())
        }
    }

    /// Where the metadata snapshot lives; inside the cache dir but outside
    /// any subfolder tree
    pub fn metadata_path(&self) -> PathBuf {
        self.cache_dir.join("metadata.json")
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T {
    lookup(name)
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub cache: CacheStats,
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ProxyConfig::default();
        assert_eq!(config.port, 3001);
        assert_eq!(config.cache_dir, PathBuf::from("./cache/media"));
        assert_eq!(config.max_cache_size, 1024 * 1024 * 1024);
        assert_eq!(config.max_queued_bytes, 100 * 1024 * 1024);
        assert_eq!(config.subfolders, 2048);
    }

    #[test]
    fn test_config_requires_origin() {
        let err = ProxyConfig::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(err.to_string().contains("ORIGIN_URL"));
    }

    #[test]
    fn test_config_from_lookup() {
        let config = ProxyConfig::from_lookup(lookup_from(&[
            ("ORIGIN_URL", "https://media.example.com/"),
            ("PORT", "8080"),
            ("CACHE_DIR", "/var/cache/media"),
            ("MAX_CACHE_SIZE", "5000"),
            ("CACHE_SUBFOLDERS", "not-a-number"),
        ]))
        .unwrap();

        assert_eq!(config.origin_url, "https://media.example.com");
        assert_eq!(config.port, 8080);
        assert_eq!(config.cache_dir, PathBuf::from("/var/cache/media"));
        assert_eq!(config.max_cache_size, 5000);
        assert_eq!(config.subfolders, 2048);
    }

    #[test]
    fn test_cache_options_carry_limits() {
        let config = ProxyConfig {
            max_cache_size: 42_000,
            max_queued_bytes: 1000,
            subfolders: 64,
            ..ProxyConfig::default()
        };
        let options = config.cache_options();
        assert_eq!(options.cleanup.max_cache_bytes, 42_000);
        assert_eq!(options.max_queued_bytes, 1000);
        assert_eq!(options.subfolders, 64);
        assert_eq!(options.cache_dir, config.cache_dir);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "ok".to_string(),
            uptime_secs: 3600,
            cache: CacheStats {
                entries: 100,
                disk_hits: 500,
                ..Default::default()
            },
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"status\":\"ok\""));
        assert!(json.contains("3600"));
        assert!(json.contains("\"disk_hits\":500"));
    }
}
