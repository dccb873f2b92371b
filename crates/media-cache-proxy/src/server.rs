//! HTTP server for media proxy endpoints
//!
//! Provides /health and /media/{*path} endpoints.

use crate::error::ProxyError;
use crate::proxy::OriginFetcher;
use crate::types::{ErrorResponse, HealthResponse};
use axum::{
    body::Body,
    extract::{Path, RawQuery, State},
    http::{header, HeaderName, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use hybrid_blob_cache::{CacheData, CacheResult, HybridCache};
use std::future::Future;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

const CACHE_CONTROL: &str = "public, max-age=86400";
const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

/// Shared state for the HTTP server
pub struct ServerState {
    pub cache: HybridCache,
    pub fetcher: OriginFetcher,
    pub started_at: DateTime<Utc>,
}

impl ServerState {
    pub fn new(cache: HybridCache, fetcher: OriginFetcher) -> Self {
        Self {
            cache,
            fetcher,
            started_at: Utc::now(),
        }
    }
}

pub type SharedState = Arc<ServerState>;

/// Create the HTTP router
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/media/{*path}", get(get_media))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` resolves
pub async fn start_server(
    state: SharedState,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let router = create_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

/// Health check endpoint
async fn health(State(state): State<SharedState>) -> Response {
    let uptime_secs = (Utc::now() - state.started_at).num_seconds().max(0) as u64;

    match state.cache.stats().await {
        Ok(cache) => Json(HealthResponse {
            status: "ok".to_string(),
            uptime_secs,
            cache,
        })
        .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to read cache stats");
            error_response(StatusCode::SERVICE_UNAVAILABLE, "Cache unavailable")
        }
    }
}

/// The cache key: the proxied path plus its raw query
fn cache_key(path: &str, query: Option<&str>) -> String {
    match query {
        Some(query) if !query.is_empty() => format!("{}?{}", path, query),
        _ => path.to_string(),
    }
}

/// Get a media file, from cache or from the origin
async fn get_media(
    State(state): State<SharedState>,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
) -> Response {
    let key = cache_key(&path, query.as_deref());
    let cancel = CancellationToken::new();
    let fetcher = &state.fetcher;

    let result = state
        .cache
        .get_or_create(
            key.as_bytes(),
            |_| fetcher.fetch(&path, query.as_deref()),
            &cancel,
            true,
        )
        .await;

    match result {
        Ok(result) => cached_response(result),
        Err(e) => {
            let err = ProxyError::from(e);
            let status = err.status_code();
            warn!(path = %path, status = %status, error = %err, "Failed to serve media");
            let message = if status == StatusCode::NOT_FOUND {
                "Media not found"
            } else if status == StatusCode::BAD_GATEWAY {
                "Origin request failed"
            } else {
                "Internal error"
            };
            error_response(status, message)
        }
    }
}

fn cached_response(result: CacheResult) -> Response {
    let status = result.status;
    let Some(data) = result.data else {
        // Only a lock timeout with fail-fast leaves us without data
        let mut response = error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Timed out waiting for an identical request",
        );
        response
            .headers_mut()
            .insert(X_CACHE, header::HeaderValue::from_static(status.as_str()));
        return response;
    };

    let body = match data {
        CacheData::Bytes(bytes) => Body::from(bytes),
        CacheData::File(file) => Body::from_stream(ReaderStream::new(file)),
    };
    let content_type = result
        .content_type
        .unwrap_or_else(|| "application/octet-stream".to_string());

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, CACHE_CONTROL.to_string()),
            (X_CACHE, status.as_str().to_string()),
        ],
        body,
    )
        .into_response()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}
