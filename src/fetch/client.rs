//! HTTP fetcher
//!
//! Performs the network leg of an asset request with a bounded timeout.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use tracing::{debug, info};

use super::errors::FetchError;
use super::types::{AssetRequest, AssetResponse};

/// Default HTTP client timeout
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Performs network requests on behalf of the asset cache
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch `request`. Non-success statuses are returned as responses;
    /// only network-level failures are errors.
    async fn fetch(&self, request: &AssetRequest) -> Result<AssetResponse, FetchError>;
}

/// reqwest-backed fetcher
#[derive(Clone)]
pub struct HttpFetcher {
    http_client: Client,
}

impl HttpFetcher {
    /// Create a fetcher whose requests give up after `timeout`
    pub fn with_timeout(timeout: Duration) -> Result<Self, FetchError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Request(format!("Failed to create HTTP client: {}", e)))?;

        info!(timeout_secs = timeout.as_secs(), "HTTP fetcher ready");
        Ok(Self { http_client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &AssetRequest) -> Result<AssetResponse, FetchError> {
        let url = request.parsed_url()?;
        let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|e| FetchError::Request(format!("Invalid method {}: {}", request.method, e)))?;

        debug!(method = %method, url = %url, "Fetching from network");

        let response = self
            .http_client
            .request(method, url)
            .send()
            .await
            .map_err(FetchError::from_reqwest)?;

        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();

        let body = response.bytes().await.map_err(FetchError::from_reqwest)?;

        debug!(status = status, size = body.len(), url = %request.url, "Fetched from network");
        Ok(AssetResponse {
            status,
            headers,
            body,
        })
    }
}
