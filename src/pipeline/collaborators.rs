//! Collaboratori esterni della pipeline: crawl e deploy.

use crate::error::OptimizeError;
use crate::pipeline::build::BuildScope;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    pub id: String,
    /// Public origin of the live site, used to resolve absolute references
    pub base_url: String,
}

impl Site {
    pub fn new(id: &str, base_url: &str) -> Self {
        Self { id: id.to_string(), base_url: base_url.to_string() }
    }

    pub fn host(&self) -> Option<String> {
        url::Url::parse(&self.base_url).ok()?.host_str().map(str::to_string)
    }

    /// Absolute URL of a site path
    pub fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }
}

/// Non-page file served alongside the pages
#[derive(Debug, Clone, PartialEq)]
pub struct CrawledAsset {
    pub path: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CrawledPage {
    /// Site path, e.g. `blog/index.html`
    pub path: String,
    pub html: String,
    pub assets: Vec<CrawledAsset>,
}

#[async_trait]
pub trait CrawlSource: Send + Sync {
    async fn crawl(&self, site: &Site, scope: &BuildScope) -> Result<Vec<CrawledPage>, OptimizeError>;
}

#[async_trait]
pub trait Deployer: Send + Sync {
    /// Publish the finalized tree, returns the public edge URL
    async fn deploy(&self, site: &Site, tree_root: &Path) -> Result<String, OptimizeError>;
}
