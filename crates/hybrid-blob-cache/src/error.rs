//! Error types for the hybrid blob cache

use std::fmt;

/// Faults that make the requested data itself unavailable.
///
/// Expected races (lock timeouts, quota pressure, files that already exist)
/// are reported through status enums instead.
#[derive(Debug)]
pub enum CacheError {
    /// Disk I/O failed while writing or reading a blob
    Io(Box<std::io::Error>),
    /// The value producer failed; the original error is preserved as the source
    Producer(Box<dyn std::error::Error + Send + Sync>),
    /// The operation was cancelled by the caller
    Cancelled,
    /// The metadata store failed
    Store(String),
    /// Invalid configuration
    Config(String),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Io(err) => write!(f, "IO error: {}", err),
            CacheError::Producer(err) => write!(f, "Producer error: {}", err),
            CacheError::Cancelled => write!(f, "Operation cancelled"),
            CacheError::Store(msg) => write!(f, "Metadata store error: {}", msg),
            CacheError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::Io(err) => Some(err.as_ref()),
            CacheError::Producer(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(Box::new(err))
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Store(err.to_string())
    }
}

impl CacheError {
    /// Wrap a producer failure without losing the original error
    pub fn producer<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        CacheError::Producer(Box::new(err))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CacheError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_io_error_display() {
        let err = CacheError::from(std::io::Error::other("disk full"));
        assert_eq!(format!("{}", err), "IO error: disk full");
        assert!(err.source().is_some());
    }

    #[test]
    fn test_producer_error_keeps_source() {
        let inner = std::io::Error::new(std::io::ErrorKind::NotFound, "upstream gone");
        let err = CacheError::producer(inner);
        assert!(format!("{}", err).contains("upstream gone"));

        let source = err.source().unwrap();
        let io = source.downcast_ref::<std::io::Error>().unwrap();
        assert_eq!(io.kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    fn test_config_error_display() {
        let err = CacheError::Config("subfolders must be at least 1".to_string());
        assert_eq!(
            format!("{}", err),
            "Configuration error: subfolders must be at least 1"
        );
    }

    #[test]
    fn test_cancelled() {
        let err = CacheError::Cancelled;
        assert!(err.is_cancelled());
        assert!(err.source().is_none());
        assert!(format!("{:?}", err).contains("Cancelled"));
    }
}
