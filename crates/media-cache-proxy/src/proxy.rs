//! Upstream origin fetching

use crate::error::{ProxyError, Result};
use hybrid_blob_cache::ProducedBlob;
use reqwest::Client;
use tracing::{debug, warn};

/// HTTP client for fetching media from the origin server
pub struct OriginFetcher {
    client: Client,
    origin_url: String,
}

impl OriginFetcher {
    pub fn new(origin_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            origin_url: origin_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Origin URL for a proxied path and optional raw query string
    pub fn url_for(&self, path: &str, query: Option<&str>) -> String {
        let path = path.trim_start_matches('/');
        match query {
            Some(query) if !query.is_empty() => {
                format!("{}/{}?{}", self.origin_url, path, query)
            }
            _ => format!("{}/{}", self.origin_url, path),
        }
    }

    /// Fetch a blob from the origin
    pub async fn fetch(&self, path: &str, query: Option<&str>) -> Result<ProducedBlob> {
        let url = self.url_for(path, query);
        debug!(url = %url, "Fetching from origin");

        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            warn!(status = %response.status(), url = %url, "Origin returned an error");
            return Err(ProxyError::Upstream {
                status: Some(response.status().as_u16()),
                message: format!("origin returned status {}", response.status()),
            });
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        let data = response.bytes().await?;

        debug!(
            size = data.len(),
            content_type = %content_type,
            "Fetched from origin"
        );

        Ok(ProducedBlob::new(content_type, data))
    }
}
