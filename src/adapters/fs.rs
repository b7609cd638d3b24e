//! # Filesystem Adapters
//!
//! Implementazioni su disco dei collaboratori della pipeline.
//!
//! ## Responsabilità:
//! - Settings e build persistiti come JSON sotto la state directory
//! - Crawl di una directory già scaricata (walkdir)
//! - Content store su filesystem con URL di delivery per variante
//! - Deploy come copia dell'albero finale in una directory di output
//! - Fetcher che serve dal disco gli URL del sito prima di andare in rete
//!
//! Tutte le scritture JSON passano da file temporaneo + rename.

use crate::error::OptimizeError;
use crate::migration::fetch::{guess_content_type, AssetFetcher, FetchedAsset};
use crate::migration::store::ContentStore;
use crate::pipeline::build::{Build, BuildRepository, BuildScope};
use crate::pipeline::collaborators::{CrawlSource, CrawledAsset, CrawledPage, Deployer, Site};
use crate::pipeline::workspace::FileKind;
use crate::settings::resolver::AssetOverride;
use crate::settings::store::{SettingsRepository, SiteSettingsRecord};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;
use walkdir::WalkDir;

fn stem_for(site_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(site_id.as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await
}

/// Relative, `/`-separated site path of a file under `root`
fn site_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

fn files_under(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}

/// Site settings as `state_dir/settings/<hash>.json`
pub struct JsonSettingsRepository {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonSettingsRepository {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.join("settings"),
            write_lock: Mutex::new(()),
        }
    }

    fn path_for(&self, site_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", stem_for(site_id)))
    }

    async fn read(&self, site_id: &str) -> Result<Option<SiteSettingsRecord>> {
        let path = self.path_for(site_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let record = serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(record))
    }

    async fn write(&self, site_id: &str, record: &SiteSettingsRecord) -> Result<()> {
        let path = self.path_for(site_id);
        let content = serde_json::to_vec_pretty(record)?;
        write_atomic(&path, &content)
            .await
            .with_context(|| format!("writing {}", path.display()))
    }
}

#[async_trait]
impl SettingsRepository for JsonSettingsRepository {
    async fn load(&self, site_id: &str) -> Result<Option<SiteSettingsRecord>> {
        self.read(site_id).await
    }

    async fn replace_override(&self, site_id: &str, next: Value, reason: &str) -> Result<SiteSettingsRecord> {
        let _guard = self.write_lock.lock().await;
        let mut record = self.read(site_id).await?.unwrap_or_default();
        record.swap(next, reason);
        self.write(site_id, &record).await?;
        Ok(record)
    }

    async fn save_asset_overrides(&self, site_id: &str, overrides: Vec<AssetOverride>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut record = self.read(site_id).await?.unwrap_or_default();
        record.asset_overrides = overrides;
        self.write(site_id, &record).await
    }

    async fn delete(&self, site_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(site_id);
        if path.exists() {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }
}

/// One JSON file per build under `state_dir/builds`
pub struct JsonBuildRepository {
    dir: PathBuf,
}

impl JsonBuildRepository {
    pub fn new(state_dir: &Path) -> Self {
        Self { dir: state_dir.join("builds") }
    }

    fn path_for(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    async fn write(&self, build: &Build) -> Result<()> {
        let content = serde_json::to_vec_pretty(build)?;
        write_atomic(&self.path_for(build.id), &content)
            .await
            .with_context(|| format!("writing build {}", build.id))
    }
}

#[async_trait]
impl BuildRepository for JsonBuildRepository {
    async fn insert(&self, build: &Build) -> Result<()> {
        self.write(build).await
    }

    async fn update(&self, build: &Build) -> Result<()> {
        if !self.path_for(build.id).exists() {
            anyhow::bail!("unknown build {}", build.id);
        }
        self.write(build).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<Build>> {
        let path = self.path_for(id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).await?;
        Ok(Some(serde_json::from_str(&content).with_context(|| format!("parsing build {}", id))?))
    }

    async fn list_for_site(&self, site_id: &str) -> Result<Vec<Build>> {
        let mut builds = Vec::new();
        if !self.dir.exists() {
            return Ok(builds);
        }
        for path in files_under(&self.dir) {
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(&path).await?;
            let build: Build = serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
            if build.site_id == site_id {
                builds.push(build);
            }
        }
        builds.sort_by_key(|b| b.created_at);
        Ok(builds)
    }
}

/// Crawl source over a site already mirrored on disk
pub struct DirectoryCrawlSource {
    root: PathBuf,
}

impl DirectoryCrawlSource {
    pub fn new(root: &Path) -> Self {
        Self { root: root.to_path_buf() }
    }
}

#[async_trait]
impl CrawlSource for DirectoryCrawlSource {
    async fn crawl(&self, site: &Site, scope: &BuildScope) -> Result<Vec<CrawledPage>, OptimizeError> {
        if !self.root.is_dir() {
            return Err(OptimizeError::Crawl(format!("{} is not a directory", self.root.display())));
        }
        info!("🔍 Scanning {} for {}", self.root.display(), site.id);

        let mut pages = Vec::new();
        let mut assets = Vec::new();
        for path in files_under(&self.root) {
            let Some(site_path) = site_path(&self.root, &path) else {
                continue;
            };
            let bytes = fs::read(&path).await?;
            if FileKind::of(&site_path) == FileKind::Page {
                if scope.includes(&site_path) {
                    pages.push(CrawledPage {
                        path: site_path,
                        html: String::from_utf8_lossy(&bytes).into_owned(),
                        assets: Vec::new(),
                    });
                }
            } else {
                assets.push(CrawledAsset { path: site_path, bytes });
            }
        }

        // gli asset statici viaggiano con la prima pagina inclusa
        if let Some(first) = pages.first_mut() {
            first.assets = assets;
        }
        debug!("Found {} pages", pages.len());
        Ok(pages)
    }
}

/// Content store writing objects under `root/<key>`
pub struct DirectoryContentStore {
    root: PathBuf,
    public_base: String,
}

impl DirectoryContentStore {
    pub fn new(root: &Path, public_base: &str) -> Self {
        Self {
            root: root.to_path_buf(),
            public_base: public_base.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ContentStore for DirectoryContentStore {
    async fn exists(&self, key: &str) -> Result<bool, OptimizeError> {
        Ok(fs::try_exists(self.root.join(key)).await?)
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String, OptimizeError> {
        fs::create_dir_all(&self.root).await?;
        fs::write(self.root.join(key), bytes)
            .await
            .map_err(|e| OptimizeError::Store(format!("{}: {}", key, e)))?;
        debug!("Stored {} ({})", key, content_type);
        Ok(self.delivery_url(key))
    }

    fn delivery_url(&self, key: &str) -> String {
        format!("{}/{}/public", self.public_base, key)
    }
}

/// Deploys by copying the finalized tree into an output directory
pub struct DirectoryDeployer {
    output: PathBuf,
}

impl DirectoryDeployer {
    pub fn new(output: &Path) -> Self {
        Self { output: output.to_path_buf() }
    }
}

#[async_trait]
impl Deployer for DirectoryDeployer {
    async fn deploy(&self, site: &Site, tree_root: &Path) -> Result<String, OptimizeError> {
        let deploy_err = |e: std::io::Error| OptimizeError::Deploy(e.to_string());
        let files = files_under(tree_root);
        fs::create_dir_all(&self.output).await.map_err(deploy_err)?;
        for path in &files {
            let Some(relative) = site_path(tree_root, path) else {
                continue;
            };
            if relative.ends_with(".tmp") {
                continue;
            }
            let target = self.output.join(&relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).await.map_err(deploy_err)?;
            }
            fs::copy(path, &target).await.map_err(deploy_err)?;
        }
        info!("🚀 Deployed {} files for {} to {}", files.len(), site.id, self.output.display());

        let output = fs::canonicalize(&self.output).await.map_err(deploy_err)?;
        url::Url::from_directory_path(&output)
            .map(|u| u.to_string())
            .map_err(|_| OptimizeError::Deploy(format!("{} is not an absolute path", output.display())))
    }
}

/// Serves URLs under the site origin from the crawl directory, the rest from `fallback`
pub struct LocalFirstFetcher {
    site_base: String,
    root: PathBuf,
    fallback: Arc<dyn AssetFetcher>,
}

impl LocalFirstFetcher {
    pub fn new(site_base: &str, root: &Path, fallback: Arc<dyn AssetFetcher>) -> Self {
        Self {
            site_base: site_base.trim_end_matches('/').to_string(),
            root: root.to_path_buf(),
            fallback,
        }
    }

    fn local_path(&self, url: &str) -> Option<PathBuf> {
        let rest = url.strip_prefix(&self.site_base)?;
        let rest = rest.split(['?', '#']).next().unwrap_or(rest).trim_start_matches('/');
        if rest.is_empty() || rest.split('/').any(|segment| segment == "..") {
            return None;
        }
        Some(self.root.join(rest))
    }
}

#[async_trait]
impl AssetFetcher for LocalFirstFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedAsset, OptimizeError> {
        if let Some(path) = self.local_path(url) {
            if path.is_file() {
                let bytes = fs::read(&path).await?;
                return Ok(FetchedAsset::new(url, bytes, Some(guess_content_type(url))));
            }
        }
        self.fallback.fetch(url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::build::BuildStatus;
    use serde_json::json;
    use tempfile::TempDir;

    struct Offline;

    #[async_trait]
    impl AssetFetcher for Offline {
        async fn fetch(&self, url: &str) -> Result<FetchedAsset, OptimizeError> {
            Err(OptimizeError::Fetch { url: url.into(), message: "offline".into() })
        }
    }

    #[tokio::test]
    async fn test_settings_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let repo = JsonSettingsRepository::new(dir.path());
        repo.replace_override("acme", json!({"css": {"purge": false}}), "first").await.unwrap();
        repo.replace_override("acme", json!({"css": {"minify": false}}), "second").await.unwrap();

        let reopened = JsonSettingsRepository::new(dir.path());
        let record = reopened.load("acme").await.unwrap().unwrap();
        assert_eq!(record.site_override, json!({"css": {"minify": false}}));
        assert_eq!(record.history.len(), 2);

        reopened.delete("acme").await.unwrap();
        assert!(reopened.load("acme").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_builds_round_trip_on_disk() {
        let dir = TempDir::new().unwrap();
        let repo = JsonBuildRepository::new(dir.path());
        let mut build = Build::new("acme", BuildScope::Full);
        repo.insert(&build).await.unwrap();
        build.transition(BuildStatus::Crawling).unwrap();
        repo.update(&build).await.unwrap();

        assert_eq!(repo.get(build.id).await.unwrap().unwrap().status, BuildStatus::Crawling);
        assert_eq!(repo.list_for_site("acme").await.unwrap().len(), 1);
        assert!(repo.list_for_site("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_directory_crawl_respects_scope() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("blog")).unwrap();
        std::fs::write(dir.path().join("index.html"), "<html></html>").unwrap();
        std::fs::write(dir.path().join("blog/post.html"), "<p>post</p>").unwrap();
        std::fs::write(dir.path().join("site.css"), "body{}").unwrap();

        let source = DirectoryCrawlSource::new(dir.path());
        let site = Site::new("acme", "https://acme.test");

        let all = source.crawl(&site, &BuildScope::Full).await.unwrap();
        let paths: Vec<&str> = all.iter().map(|p| p.path.as_str()).collect();
        assert_eq!(paths, vec!["blog/post.html", "index.html"]);
        assert_eq!(all[0].assets.len(), 1);
        assert_eq!(all[0].assets[0].path, "site.css");

        let single = source
            .crawl(&site, &BuildScope::SinglePage { path: "index.html".into() })
            .await
            .unwrap();
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].assets.len(), 1);
    }

    #[tokio::test]
    async fn test_local_first_fetcher() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("logo.png"), [1u8, 2, 3]).unwrap();
        let fetcher = LocalFirstFetcher::new("https://acme.test/", dir.path(), Arc::new(Offline));

        let local = fetcher.fetch("https://acme.test/logo.png?v=1").await.unwrap();
        assert_eq!(local.bytes, vec![1, 2, 3]);
        assert!(fetcher.fetch("https://acme.test/../etc/passwd").await.is_err());
        assert!(fetcher.fetch("https://cdn.test/logo.png").await.is_err());
    }

    #[tokio::test]
    async fn test_deployer_copies_tree() {
        let tree = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        std::fs::create_dir_all(tree.path().join("css")).unwrap();
        std::fs::write(tree.path().join("index.html"), "<html></html>").unwrap();
        std::fs::write(tree.path().join("css/site.1a2b3c4d.css"), "body{}").unwrap();

        let deployer = DirectoryDeployer::new(&out.path().join("public"));
        let url = deployer.deploy(&Site::new("acme", "https://acme.test"), tree.path()).await.unwrap();
        assert!(url.starts_with("file://"));
        assert!(out.path().join("public/css/site.1a2b3c4d.css").exists());
    }
}
