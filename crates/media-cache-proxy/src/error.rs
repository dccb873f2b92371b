//! Error types for the media cache proxy

use axum::http::StatusCode;
use hybrid_blob_cache::CacheError;
use std::fmt;

#[derive(Debug)]
pub enum ProxyError {
    Cache(CacheError),
    /// The origin failed or answered with a non-success status
    Upstream {
        status: Option<u16>,
        message: String,
    },
    Io(Box<std::io::Error>),
    Config(String),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Cache(err) => write!(f, "Cache error: {}", err),
            ProxyError::Upstream {
                status: Some(status),
                message,
            } => write!(f, "Upstream error ({}): {}", status, message),
            ProxyError::Upstream {
                status: None,
                message,
            } => write!(f, "Upstream error: {}", message),
            ProxyError::Io(err) => write!(f, "IO error: {}", err),
            ProxyError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProxyError::Cache(err) => Some(err),
            ProxyError::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl ProxyError {
    /// HTTP status to answer a client with
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::Upstream {
                status: Some(404), ..
            } => StatusCode::NOT_FOUND,
            ProxyError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::Cache(CacheError::Producer(inner)) => inner
                .downcast_ref::<ProxyError>()
                .map(ProxyError::status_code)
                .unwrap_or(StatusCode::BAD_GATEWAY),
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<CacheError> for ProxyError {
    fn from(err: CacheError) -> Self {
        ProxyError::Cache(err)
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        ProxyError::Upstream {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::Io(Box::new(err))
    }
}

impl From<tracing_subscriber::filter::ParseError> for ProxyError {
    fn from(err: tracing_subscriber::filter::ParseError) -> Self {
        ProxyError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn upstream(status: Option<u16>) -> ProxyError {
        ProxyError::Upstream {
            status,
            message: "origin said no".to_string(),
        }
    }

    #[test]
    fn test_upstream_error_display() {
        assert_eq!(
            upstream(Some(500)).to_string(),
            "Upstream error (500): origin said no"
        );
        assert_eq!(upstream(None).to_string(), "Upstream error: origin said no");
    }

    #[test]
    fn test_config_error_display() {
        let err = ProxyError::Config("missing ORIGIN_URL".to_string());
        assert_eq!(format!("{}", err), "Configuration error: missing ORIGIN_URL");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(upstream(Some(404)).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(upstream(Some(503)).status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(upstream(None).status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            ProxyError::Cache(CacheError::Store("broken".to_string())).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_producer_error_keeps_upstream_status() {
        let err = ProxyError::Cache(CacheError::producer(upstream(Some(404))));
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

        let err = ProxyError::Cache(CacheError::producer(upstream(Some(500))));
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_cache_error_source() {
        use std::error::Error;
        let err = ProxyError::from(CacheError::Cancelled);
        assert!(err.source().is_some());
    }
}
