//! # Asset Fetching
//!
//! Collaboratore per scaricare font, fogli di stile remoti e payload da migrare,
//! più una cache per-build così lo stesso URL viene scaricato una sola volta
//! anche quando compare in più pagine.

use crate::error::OptimizeError;
use crate::queue::backoff::RetryPolicy;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Downloaded payload
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedAsset {
    pub url: String,
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

impl FetchedAsset {
    pub fn new(url: &str, bytes: Vec<u8>, content_type: Option<&str>) -> Self {
        Self {
            url: url.to_string(),
            bytes,
            content_type: content_type.map(|c| c.to_string()),
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    /// Content type header, or a guess from the URL extension
    pub fn mime(&self) -> String {
        self.content_type
            .clone()
            .unwrap_or_else(|| guess_content_type(&self.url).to_string())
    }
}

/// Fetch collaborator. Transient failures should map to `OptimizeError::Fetch`.
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedAsset, OptimizeError>;
}

pub fn guess_content_type(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    let ext = path.rsplit('.').next().unwrap_or("");
    match ext {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "avif" => "image/avif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "woff2" => "font/woff2",
        "woff" => "font/woff",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "css" => "text/css",
        "js" | "mjs" => "application/javascript",
        "html" | "htm" => "text/html",
        _ => "application/octet-stream",
    }
}

/// Per-build memo of fetched payloads
#[derive(Default)]
pub struct FetchCache {
    entries: Mutex<HashMap<String, Arc<FetchedAsset>>>,
}

impl FetchCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached payload or a fresh fetch with retries
    pub async fn get_or_fetch(
        &self,
        url: &str,
        fetcher: &dyn AssetFetcher,
        retry: &RetryPolicy,
    ) -> Result<Arc<FetchedAsset>, OptimizeError> {
        if let Some(hit) = self.entries.lock().await.get(url) {
            debug!("Fetch cache hit: {}", url);
            return Ok(hit.clone());
        }
        let asset = Arc::new(retry.run(url, || fetcher.fetch(url)).await?);
        self.entries.lock().await.insert(url.to_string(), asset.clone());
        Ok(asset)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingFetcher {
        calls: AtomicU32,
    }

    #[async_trait]
    impl AssetFetcher for CountingFetcher {
        async fn fetch(&self, url: &str) -> Result<FetchedAsset, OptimizeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(FetchedAsset::new(url, b"body".to_vec(), None))
        }
    }

    #[tokio::test]
    async fn test_cache_fetches_once() {
        let fetcher = CountingFetcher { calls: AtomicU32::new(0) };
        let cache = FetchCache::new();
        let retry = RetryPolicy::immediate(1);
        for _ in 0..3 {
            let asset = cache.get_or_fetch("https://a/x.woff2", &fetcher, &retry).await.unwrap();
            assert_eq!(asset.mime(), "font/woff2");
        }
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len().await, 1);
    }

    #[test]
    fn test_guess_content_type() {
        assert_eq!(guess_content_type("https://x/a.JPG?v=1"), "image/jpeg");
        assert_eq!(guess_content_type("/icons/favicon.ico"), "image/x-icon");
        assert_eq!(guess_content_type("/blob"), "application/octet-stream");
    }
}
