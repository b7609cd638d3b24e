//! # Asset Migration
//!
//! Sposta ogni immagine referenziata nel content store.
//!
//! ## Responsabilità:
//! - Deduplica per URL prima di qualsiasi I/O
//! - Upload concorrenti limitati (`upload_concurrency`)
//! - Retry con backoff esponenziale per fetch e upload
//! - Idempotenza: chiave content-addressed + controllo `exists` prima del fetch
//! - Dimensioni naturali lette dal payload quando decodificabile

use crate::migration::fetch::{AssetFetcher, FetchedAsset};
use crate::migration::scan::{unique_urls, ImageRecord};
use crate::migration::store::{store_key, ContentStore, Variant};
use crate::migration::MigrationError;
use crate::queue::backoff::RetryPolicy;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Migrated,
    Existing,
    Skipped,
    Failed,
}

/// Outcome for one unique URL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationResult {
    pub url: String,
    pub status: MigrationStatus,
    pub delivery_url: Option<String>,
    /// Delivery URL per variant name
    #[serde(default)]
    pub variants: BTreeMap<Variant, String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub error: Option<String>,
}

impl MigrationResult {
    fn without_delivery(url: &str, status: MigrationStatus, error: Option<String>) -> Self {
        Self {
            url: url.to_string(),
            status,
            delivery_url: None,
            variants: BTreeMap::new(),
            width: None,
            height: None,
            error,
        }
    }

    /// Migrated now or in an earlier run
    pub fn is_success(&self) -> bool {
        matches!(self.status, MigrationStatus::Migrated | MigrationStatus::Existing) && self.delivery_url.is_some()
    }

    /// URL for `variant`, falling back to the public delivery URL
    pub fn url_for(&self, variant: Variant) -> Option<&str> {
        self.variants
            .get(&variant)
            .map(String::as_str)
            .or(self.delivery_url.as_deref())
    }
}

/// Every attempted URL failed; a stage-fatal condition
pub fn is_total_failure(results: &[MigrationResult]) -> bool {
    let attempted: Vec<&MigrationResult> = results.iter().filter(|r| r.status != MigrationStatus::Skipped).collect();
    !attempted.is_empty() && attempted.iter().all(|r| r.status == MigrationStatus::Failed)
}

fn dimensions(bytes: &[u8]) -> (Option<u32>, Option<u32>) {
    match image::load_from_memory(bytes) {
        Ok(img) => (Some(img.width()), Some(img.height())),
        Err(_) => (None, None),
    }
}

pub struct Migrator {
    store: Arc<dyn ContentStore>,
    fetcher: Arc<dyn AssetFetcher>,
    retry: RetryPolicy,
}

impl Migrator {
    pub fn new(store: Arc<dyn ContentStore>, fetcher: Arc<dyn AssetFetcher>, retry: RetryPolicy) -> Self {
        Self { store, fetcher, retry }
    }

    fn with_variants(&self, mut result: MigrationResult) -> MigrationResult {
        if let Some(delivery) = &result.delivery_url {
            result.variants = Variant::ALL
                .iter()
                .map(|v| (*v, self.store.variant_url(delivery, *v)))
                .collect();
        }
        result
    }

    /// Migrate one URL; errors are folded into the result
    pub async fn migrate_one(&self, url: &str) -> MigrationResult {
        match self.try_migrate(url).await {
            Ok(result) => self.with_variants(result),
            Err(MigrationError::NotAnImage { content_type, .. }) => {
                debug!("⏭️  Skipping {} ({})", url, content_type);
                MigrationResult::without_delivery(url, MigrationStatus::Skipped, None)
            }
            Err(e) => {
                warn!("⚠️  Migration failed for {}: {}", url, e);
                MigrationResult::without_delivery(url, MigrationStatus::Failed, Some(e.to_string()))
            }
        }
    }

    async fn try_migrate(&self, url: &str) -> Result<MigrationResult, MigrationError> {
        let key = store_key(url);
        let store = &self.store;

        let exists = self
            .retry
            .run(&format!("exists {}", key), || store.exists(&key))
            .await
            .map_err(|source| MigrationError::Upload { key: key.clone(), source })?;
        if exists {
            let mut result = MigrationResult::without_delivery(url, MigrationStatus::Existing, None);
            result.delivery_url = Some(store.delivery_url(&key));
            return Ok(result);
        }

        let fetcher = &self.fetcher;
        let asset: FetchedAsset = self
            .retry
            .run(&format!("fetch {}", url), || fetcher.fetch(url))
            .await
            .map_err(|source| MigrationError::Fetch { url: url.to_string(), source })?;

        let content_type = asset.mime();
        if !content_type.starts_with("image/") || asset.bytes.is_empty() {
            return Err(MigrationError::NotAnImage { url: url.to_string(), content_type });
        }

        let (width, height) = dimensions(&asset.bytes);
        let delivery = self
            .retry
            .run(&format!("upload {}", key), || store.put(&key, asset.bytes.clone(), &content_type))
            .await
            .map_err(|source| MigrationError::Upload { key: key.clone(), source })?;

        let mut result = MigrationResult::without_delivery(url, MigrationStatus::Migrated, None);
        result.delivery_url = Some(delivery);
        result.width = width;
        result.height = height;
        Ok(result)
    }

    /// Dedupe, then migrate with at most `concurrency` uploads in flight.
    /// Results come back in first-seen URL order.
    pub async fn migrate_all(&self, records: &[ImageRecord], concurrency: usize) -> Vec<MigrationResult> {
        let urls = unique_urls(records);
        info!("☁️  Migrating {} unique images ({} references)", urls.len(), records.len());

        let mut indexed: Vec<(usize, MigrationResult)> = stream::iter(urls.into_iter().enumerate())
            .map(|(index, url)| async move { (index, self.migrate_one(&url).await) })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;
        indexed.sort_by_key(|(index, _)| *index);
        let results: Vec<MigrationResult> = indexed.into_iter().map(|(_, r)| r).collect();

        let count = |status: MigrationStatus| results.iter().filter(|r| r.status == status).count();
        info!(
            "✅ Migration done: {} migrated, {} existing, {} skipped, {} failed",
            count(MigrationStatus::Migrated),
            count(MigrationStatus::Existing),
            count(MigrationStatus::Skipped),
            count(MigrationStatus::Failed)
        );
        results
    }
}

/// Attach payload dimensions to records that did not declare them
pub fn attach_dimensions(records: &mut [ImageRecord], results: &[MigrationResult]) {
    for record in records.iter_mut() {
        if record.width.is_some() && record.height.is_some() {
            continue;
        }
        if let Some(result) = results.iter().find(|r| r.url == record.url) {
            if let (Some(w), Some(h)) = (result.width, result.height) {
                record.width = Some(w);
                record.height = Some(h);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MemoryStore;
    use crate::error::OptimizeError;
    use crate::migration::scan::scan;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(width, height, image::Rgb([200, 30, 30]));
        let mut out = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut out, image::ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    struct Origin {
        files: HashMap<String, (Vec<u8>, &'static str)>,
        calls: AtomicUsize,
        flaky_once: bool,
    }

    #[async_trait]
    impl AssetFetcher for Origin {
        async fn fetch(&self, url: &str) -> Result<FetchedAsset, OptimizeError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.flaky_once && call == 0 {
                return Err(OptimizeError::Fetch { url: url.into(), message: "503".into() });
            }
            match self.files.get(url) {
                Some((bytes, mime)) => Ok(FetchedAsset::new(url, bytes.clone(), Some(mime))),
                None => Err(OptimizeError::Fetch { url: url.into(), message: "404".into() }),
            }
        }
    }

    fn origin(flaky_once: bool) -> Arc<Origin> {
        let mut files = HashMap::new();
        files.insert("https://acme.test/a.png".to_string(), (png(40, 20), "image/png"));
        files.insert("https://acme.test/b.png".to_string(), (png(8, 8), "image/png"));
        files.insert("https://acme.test/page.html".to_string(), (b"<html>".to_vec(), "text/html"));
        Arc::new(Origin { files, calls: AtomicUsize::new(0), flaky_once })
    }

    const PAGE: &str = r#"<img src="/a.png"><img src="/a.png" srcset="/b.png 1x"><img src="/missing.png"><img src="/page.html">"#;

    #[tokio::test]
    async fn test_migrate_all_dedupes_and_reports() {
        let store = Arc::new(MemoryStore::new());
        let migrator = Migrator::new(store.clone(), origin(false), RetryPolicy::immediate(2));
        let records = scan(PAGE, "https://acme.test/");
        let results = migrator.migrate_all(&records, 2).await;

        let statuses: Vec<MigrationStatus> = results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![MigrationStatus::Migrated, MigrationStatus::Migrated, MigrationStatus::Failed, MigrationStatus::Skipped]
        );
        assert_eq!((results[0].width, results[0].height), (Some(40), Some(20)));
        assert!(results[0].url_for(Variant::Thumbnail).unwrap().ends_with("/thumbnail"));
        assert!(results[2].error.as_deref().unwrap().contains("404"));
        assert_eq!(store.put_count(), 2);
        assert!(!is_total_failure(&results));
    }

    #[tokio::test]
    async fn test_second_run_is_existing_and_never_reuploads() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = origin(false);
        let migrator = Migrator::new(store.clone(), fetcher.clone(), RetryPolicy::immediate(2));
        let records = scan(PAGE, "https://acme.test/");

        let first = migrator.migrate_all(&records, 4).await;
        let second = migrator.migrate_all(&records, 4).await;
        for (a, b) in first.iter().zip(&second) {
            if a.status == MigrationStatus::Migrated {
                assert_eq!(b.status, MigrationStatus::Existing);
                assert_eq!(a.delivery_url, b.delivery_url);
            }
        }
        assert_eq!(store.put_count(), 2);
    }

    #[tokio::test]
    async fn test_migrate_all_runs_on_a_spawned_task() {
        let store = Arc::new(MemoryStore::new());
        let migrator = Arc::new(Migrator::new(store.clone(), origin(false), RetryPolicy::immediate(2)));
        let records = scan(PAGE, "https://acme.test/");

        let task = {
            let migrator = migrator.clone();
            tokio::spawn(async move { migrator.migrate_all(&records, 2).await })
        };
        let results = task.await.unwrap();
        assert_eq!(results.len(), 4);
        assert_eq!(store.put_count(), 2);
    }

    #[tokio::test]
    async fn test_transient_fetch_is_retried() {
        let store = Arc::new(MemoryStore::new());
        let migrator = Migrator::new(store, origin(true), RetryPolicy::immediate(3));
        let result = migrator.migrate_one("https://acme.test/b.png").await;
        assert_eq!(result.status, MigrationStatus::Migrated);
    }

    #[test]
    fn test_total_failure_ignores_skipped() {
        let failed = MigrationResult::without_delivery("a", MigrationStatus::Failed, Some("x".into()));
        let skipped = MigrationResult::without_delivery("b", MigrationStatus::Skipped, None);
        assert!(is_total_failure(&[failed.clone(), skipped.clone()]));
        assert!(!is_total_failure(&[skipped]));
        assert!(!is_total_failure(&[]));
    }
}
