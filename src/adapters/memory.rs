//! # In-Memory Adapters
//!
//! Un solo `MemoryStore` che implementa tutte le persistenze: settings,
//! build e content store. Usato dai test e dalla CLI quando non serve
//! sopravvivere al processo.

use crate::error::OptimizeError;
use crate::migration::store::ContentStore;
use crate::pipeline::build::{Build, BuildRepository};
use crate::settings::resolver::AssetOverride;
use crate::settings::store::{SettingsRepository, SiteSettingsRecord};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

const DELIVERY_ACCOUNT: &str = "local";

#[derive(Default)]
pub struct MemoryStore {
    settings: RwLock<HashMap<String, SiteSettingsRecord>>,
    builds: RwLock<HashMap<Uuid, Build>>,
    objects: RwLock<HashMap<String, (Vec<u8>, String)>>,
    puts: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of uploads accepted so far
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub async fn object(&self, key: &str) -> Option<(Vec<u8>, String)> {
        self.objects.read().await.get(key).cloned()
    }
}

#[async_trait]
impl SettingsRepository for MemoryStore {
    async fn load(&self, site_id: &str) -> Result<Option<SiteSettingsRecord>> {
        Ok(self.settings.read().await.get(site_id).cloned())
    }

    async fn replace_override(&self, site_id: &str, next: Value, reason: &str) -> Result<SiteSettingsRecord> {
        let mut settings = self.settings.write().await;
        let record = settings.entry(site_id.to_string()).or_default();
        record.swap(next, reason);
        Ok(record.clone())
    }

    async fn save_asset_overrides(&self, site_id: &str, overrides: Vec<AssetOverride>) -> Result<()> {
        let mut settings = self.settings.write().await;
        settings.entry(site_id.to_string()).or_default().asset_overrides = overrides;
        Ok(())
    }

    async fn delete(&self, site_id: &str) -> Result<()> {
        self.settings.write().await.remove(site_id);
        Ok(())
    }
}

#[async_trait]
impl BuildRepository for MemoryStore {
    async fn insert(&self, build: &Build) -> Result<()> {
        self.builds.write().await.insert(build.id, build.clone());
        Ok(())
    }

    async fn update(&self, build: &Build) -> Result<()> {
        let mut builds = self.builds.write().await;
        match builds.get_mut(&build.id) {
            Some(existing) => {
                *existing = build.clone();
                Ok(())
            }
            None => anyhow::bail!("unknown build {}", build.id),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<Build>> {
        Ok(self.builds.read().await.get(&id).cloned())
    }

    async fn list_for_site(&self, site_id: &str) -> Result<Vec<Build>> {
        let mut builds: Vec<Build> = self
            .builds
            .read()
            .await
            .values()
            .filter(|b| b.site_id == site_id)
            .cloned()
            .collect();
        builds.sort_by_key(|b| b.created_at);
        Ok(builds)
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn exists(&self, key: &str) -> Result<bool, OptimizeError> {
        Ok(self.objects.read().await.contains_key(key))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String, OptimizeError> {
        self.objects
            .write()
            .await
            .insert(key.to_string(), (bytes, content_type.to_string()));
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(self.delivery_url(key))
    }

    fn delivery_url(&self, key: &str) -> String {
        format!("https://imagedelivery.net/{}/{}/public", DELIVERY_ACCOUNT, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::build::{BuildScope, BuildStatus};

    #[tokio::test]
    async fn test_update_requires_insert() {
        let store = MemoryStore::new();
        let mut build = Build::new("acme", BuildScope::Full);
        assert!(store.update(&build).await.is_err());

        store.insert(&build).await.unwrap();
        build.transition(BuildStatus::Crawling).unwrap();
        store.update(&build).await.unwrap();
        let loaded = store.get(build.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, BuildStatus::Crawling);
    }

    #[tokio::test]
    async fn test_list_for_site_filters_and_orders() {
        let store = MemoryStore::new();
        let first = Build::new("acme", BuildScope::Full);
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let other = Build::new("other", BuildScope::Full);
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let second = Build::new("acme", BuildScope::SinglePage { path: "index.html".into() });
        for build in [&second, &other, &first] {
            store.insert(build).await.unwrap();
        }
        let ids: Vec<Uuid> = store.list_for_site("acme").await.unwrap().iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn test_content_store_counts_puts() {
        let store = MemoryStore::new();
        let url = store.put("k.png", vec![1, 2], "image/png").await.unwrap();
        assert_eq!(url, "https://imagedelivery.net/local/k.png/public");
        assert!(store.exists("k.png").await.unwrap());
        assert_eq!(store.put_count(), 1);
        assert_eq!(store.object("k.png").await.unwrap().1, "image/png");
    }
}
