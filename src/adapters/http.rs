//! HTTP fetcher for fonts, remote stylesheets and migration payloads.

use crate::error::OptimizeError;
use crate::migration::fetch::{AssetFetcher, FetchedAsset};
use async_trait::async_trait;
use reqwest::{Client, ClientBuilder};
use std::time::Duration;
use tracing::debug;

const USER_AGENT: &str = concat!("site-optimizer/", env!("CARGO_PKG_VERSION"));

pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, OptimizeError> {
        let client = ClientBuilder::new()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .gzip(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| OptimizeError::Fetch { url: String::new(), message: format!("Failed to create HTTP client: {}", e) })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl AssetFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedAsset, OptimizeError> {
        let fetch_err = |message: String| OptimizeError::Fetch { url: url.to_string(), message };

        debug!("🌐 GET {}", url);
        let response = self.client.get(url).send().await.map_err(|e| fetch_err(e.to_string()))?;
        if !response.status().is_success() {
            return Err(fetch_err(format!(
                "HTTP {} {}",
                response.status().as_u16(),
                response.status().canonical_reason().unwrap_or("Unknown")
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());
        let bytes = response.bytes().await.map_err(|e| fetch_err(e.to_string()))?;
        Ok(FetchedAsset::new(url, bytes.to_vec(), content_type.as_deref()))
    }
}
