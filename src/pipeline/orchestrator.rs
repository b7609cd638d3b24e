//! # Build Orchestrator
//!
//! Orchestratore principale che esegue una build dall'inizio alla fine,
//! delegando il lavoro per singolo item a `page_task`.
//!
//! ## Responsabilità:
//! - Crawl nel workspace (fatale se fallisce o non restituisce pagine)
//! - Snapshot delle settings congelato una sola volta per build
//! - Stage in ordine fisso, item in parallelo limitato da `stage_concurrency`
//! - Checkpoint atomico dopo ogni item e ogni stage, ripresa senza rifare lavoro
//! - Migrazione degli asset: fallimento totale = build fallita
//! - Deploy, stato terminale, evento `Completed` e chiusura del topic
//!
//! ## Cancellazione:
//! Controllata tra un item e l'altro; la cancellazione di un sito lascia la
//! build `failed` con messaggio `"Site deleted"`. Prima di ogni stage lo stato
//! salvato viene riletto: una build già chiusa altrove si ferma anche senza segnale.

use crate::config::Config;
use crate::error::OptimizeError;
use crate::migration::{
    is_total_failure, scan_stylesheet, scan_with, AssetFetcher, ContentStore, FetchCache, MigrationError,
    MigrationStatus, Migrator, ScanOptions,
};
use crate::optimizer::css::UsedSelectors;
use crate::pipeline::build::{Build, BuildRepository, BuildScope, BuildStatus, LogLevel, SITE_DELETED};
use crate::pipeline::checkpoint::{Checkpoint, CheckpointStore};
use crate::pipeline::collaborators::{CrawlSource, Deployer, Site};
use crate::pipeline::events::{BuildEventKind, EventHub};
use crate::pipeline::page_task::{process_item, work_passes, ImageConcurrency, ItemOutcome, StageContext, WorkItem};
use crate::pipeline::stage::Stage;
use crate::pipeline::workspace::{FileKind, WorkspaceLease, WorkspaceManager};
use crate::queue::backoff::RetryPolicy;
use crate::settings::{SettingsSnapshot, SettingsStore};
use anyhow::{anyhow, Result};
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Why an in-flight build is being stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    SiteDeleted,
    Requested,
}

pub type CancelReceiver = watch::Receiver<Option<CancelReason>>;

/// Collaborators a build needs
#[derive(Clone)]
pub struct PipelineDeps {
    pub crawler: Arc<dyn CrawlSource>,
    pub fetcher: Arc<dyn AssetFetcher>,
    /// Migration is skipped without a content store
    pub content_store: Option<Arc<dyn ContentStore>>,
    pub deployer: Arc<dyn Deployer>,
    pub builds: Arc<dyn BuildRepository>,
    pub settings: Arc<SettingsStore>,
    pub events: Arc<EventHub>,
}

fn check_cancelled(cancel: &CancelReceiver) -> Result<(), OptimizeError> {
    match *cancel.borrow() {
        Some(CancelReason::SiteDeleted) => Err(OptimizeError::Cancelled(SITE_DELETED.to_string())),
        Some(CancelReason::Requested) => Err(OptimizeError::Cancelled("Build cancelled".to_string())),
        None => Ok(()),
    }
}

/// Per-build helpers that live for the whole run
struct RunState<'a> {
    site: &'a Site,
    lease: &'a WorkspaceLease,
    snapshot: SettingsSnapshot,
    cancel: &'a CancelReceiver,
    font_cache: FetchCache,
    retry: RetryPolicy,
    scan_options: ScanOptions,
}

pub struct BuildOrchestrator {
    deps: PipelineDeps,
    config: Config,
    workspaces: WorkspaceManager,
    checkpoints: CheckpointStore,
    images: ImageConcurrency,
}

impl BuildOrchestrator {
    pub fn new(deps: PipelineDeps, config: Config) -> Self {
        let workspaces = WorkspaceManager::new(&config.workspace_root);
        let checkpoints = CheckpointStore::new(&config.state_dir, config.checkpoint_max_age());
        let images = ImageConcurrency::new(config.stage_concurrency);
        Self {
            deps,
            config,
            workspaces,
            checkpoints,
            images,
        }
    }

    pub fn deps(&self) -> &PipelineDeps {
        &self.deps
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Persist a new `queued` build
    pub async fn create_build(&self, site_id: &str, scope: BuildScope) -> Result<Build> {
        let build = Build::new(site_id, scope);
        self.deps.builds.insert(&build).await?;
        self.deps.events.publish(
            build.id,
            BuildEventKind::PhaseChanged { status: BuildStatus::Queued, stage: None },
        );
        info!("📥 Build {} queued for {}", build.id, site_id);
        Ok(build)
    }

    /// Create and run a build right away, outside the queue
    pub async fn execute(&self, site: &Site, scope: BuildScope) -> Result<Build> {
        let build = self.create_build(&site.id, scope).await?;
        let lease = self
            .workspaces
            .try_acquire(&site.id)
            .ok_or_else(|| OptimizeError::Workspace(format!("workspace for {} is busy", site.id)))?;
        let (_cancel_tx, cancel_rx) = watch::channel(None);
        self.run_build(build.id, site, lease, cancel_rx).await
    }

    /// Run `build_id` to a terminal state while holding the site's workspace
    pub async fn run_build(&self, build_id: Uuid, site: &Site, lease: WorkspaceLease, cancel: CancelReceiver) -> Result<Build> {
        let mut build = self
            .deps
            .builds
            .get(build_id)
            .await?
            .ok_or_else(|| anyhow!("Build {} not found", build_id))?;
        if build.status.is_terminal() {
            info!("⏭️  Build {} already {}, nothing to do", build_id, build.status);
            self.deps.events.close(build_id);
            return Ok(build);
        }

        let start_time = Instant::now();
        build.attempts += 1;
        let outcome = self.execute_stages(&mut build, site, &lease, &cancel).await;

        match outcome {
            Ok(deploy_url) => {
                build.deploy_url = Some(deploy_url);
                build.transition(BuildStatus::Success)?;
                self.checkpoints.clear(&site.id).await?;
                info!(
                    "✅ Build {} succeeded in {:.1}s | {}",
                    build.id,
                    start_time.elapsed().as_secs_f64(),
                    build.stats.format_summary()
                );
            }
            Err(e) => {
                let message = e.to_string();
                let requested = matches!(*cancel.borrow(), Some(CancelReason::Requested));
                let cancelled = matches!(e.downcast_ref::<OptimizeError>(), Some(OptimizeError::Cancelled(_)));
                if build.status.is_terminal() {
                    debug!("Build {} already terminal after error: {}", build.id, message);
                } else if cancelled && requested {
                    build.transition(BuildStatus::Cancelled)?;
                    build.error = Some(message.clone());
                } else {
                    build.fail(&message)?;
                }
                error!("❌ Build {} {}: {}", build.id, build.status, message);
            }
        }

        self.deps.builds.update(&build).await?;
        self.deps.events.publish(
            build.id,
            BuildEventKind::Completed {
                status: build.status,
                error: build.error.clone(),
                deploy_url: build.deploy_url.clone(),
                stats: build.stats.clone(),
            },
        );
        self.deps.events.close(build.id);
        drop(lease);
        Ok(build)
    }

    async fn set_phase(&self, build: &mut Build, status: BuildStatus) -> Result<()> {
        build.transition(status)?;
        self.deps.builds.update(build).await?;
        self.deps
            .events
            .publish(build.id, BuildEventKind::PhaseChanged { status, stage: None });
        Ok(())
    }

    /// Stop when the stored build was already ended by someone else
    async fn check_stored_status(&self, build: &mut Build) -> Result<()> {
        let Some(stored) = self.deps.builds.get(build.id).await? else {
            return Ok(());
        };
        if !stored.status.is_terminal() {
            return Ok(());
        }
        let message = stored.error.clone().unwrap_or_else(|| format!("Build {}", stored.status));
        *build = stored;
        Err(OptimizeError::Cancelled(message).into())
    }

    fn log(&self, build: &mut Build, level: LogLevel, stage: Option<Stage>, message: &str) {
        match level {
            LogLevel::Debug => debug!("{}", message),
            LogLevel::Info => info!("{}", message),
            LogLevel::Warn => warn!("⚠️  {}", message),
            LogLevel::Error => error!("{}", message),
        }
        build.push_log(level, stage, message);
        self.deps.events.publish(
            build.id,
            BuildEventKind::Log { level, stage, message: message.to_string() },
        );
    }

    async fn execute_stages(
        &self,
        build: &mut Build,
        site: &Site,
        lease: &WorkspaceLease,
        cancel: &CancelReceiver,
    ) -> Result<String> {
        self.set_phase(build, BuildStatus::Crawling).await?;
        if build.settings.is_none() {
            build.settings = Some(self.deps.settings.snapshot(&build.site_id).await?);
        }
        let run = RunState {
            site,
            lease,
            snapshot: build.settings.clone().unwrap_or_default(),
            cancel,
            font_cache: FetchCache::new(),
            retry: RetryPolicy::for_fetches(&self.config),
            scan_options: ScanOptions { skip_hosts: self.config.skip_hosts.clone() },
        };

        let mut checkpoint = match self.checkpoints.load_valid(&site.id, build.id).await? {
            Some(checkpoint) => {
                let message = format!(
                    "🔄 Resuming build {} after {}",
                    build.id,
                    checkpoint.last_completed.map(|s| s.as_str()).unwrap_or("crawl")
                );
                self.log(build, LogLevel::Info, None, &message);
                checkpoint
            }
            None => {
                self.crawl_into(build, &run).await?;
                let mut checkpoint = Checkpoint::new(build.id, &site.id);
                checkpoint.stats.pages = lease.files_of(FileKind::Page).len() as u32;
                self.checkpoints.save(&mut checkpoint).await?;
                checkpoint
            }
        };
        build.stats = checkpoint.stats.clone();
        check_cancelled(cancel)?;
        self.check_stored_status(build).await?;

        self.set_phase(build, BuildStatus::Optimizing).await?;
        for stage in Stage::remaining_after(checkpoint.last_completed) {
            check_cancelled(cancel)?;
            self.check_stored_status(build).await?;
            self.deps.events.publish(
                build.id,
                BuildEventKind::PhaseChanged { status: BuildStatus::Optimizing, stage: Some(stage) },
            );
            checkpoint.begin_stage(stage);
            self.run_stage(stage, build, &run, &mut checkpoint).await?;
            checkpoint.complete_stage(stage);
            self.checkpoints.save(&mut checkpoint).await?;
            build.stats = checkpoint.stats.clone();
            self.deps.builds.update(build).await?;
            debug!("Stage {} done for build {}", stage, build.id);
        }

        check_cancelled(cancel)?;
        self.check_stored_status(build).await?;
        self.set_phase(build, BuildStatus::Deploying).await?;
        let url = self.deps.deployer.deploy(site, lease.dir()).await?;
        self.log(build, LogLevel::Info, None, &format!("🚀 Deployed to {}", url));
        Ok(url)
    }

    async fn crawl_into(&self, build: &mut Build, run: &RunState<'_>) -> Result<(), OptimizeError> {
        info!("🕷️  Crawling {} ({:?})", run.site.base_url, build.scope);
        let pages = self.deps.crawler.crawl(run.site, &build.scope).await?;
        let pages: Vec<_> = pages.into_iter().filter(|p| build.scope.includes(&p.path)).collect();
        if pages.is_empty() {
            return Err(OptimizeError::Crawl("crawler returned no pages".to_string()));
        }

        run.lease.reset().await?;
        let mut written = HashSet::new();
        for page in &pages {
            run.lease.write(&page.path, page.html.as_bytes()).await?;
            for asset in &page.assets {
                if written.insert(asset.path.clone()) {
                    run.lease.write(&asset.path, &asset.bytes).await?;
                }
            }
        }
        let message = format!("🕷️  Crawled {} pages and {} assets", pages.len(), written.len());
        self.log(build, LogLevel::Info, None, &message);
        Ok(())
    }

    async fn collect_used_selectors(&self, lease: &WorkspaceLease) -> Result<UsedSelectors, OptimizeError> {
        let mut used = UsedSelectors::default();
        for page in lease.files_of(FileKind::Page) {
            used.add_html(&lease.read_string(&page).await?);
        }
        for script in lease.files_of(FileKind::Script) {
            used.add_script(&lease.read_string(&script).await?);
        }
        Ok(used)
    }

    /// Migrate every collected image reference once per build
    async fn migrate_assets(&self, build: &mut Build, run: &RunState<'_>, checkpoint: &mut Checkpoint) -> Result<(), OptimizeError> {
        if !checkpoint.migration.is_empty() || !checkpoint.completed_items.is_empty() {
            return Ok(());
        }
        if !run.snapshot.site.images.migrate {
            return Ok(());
        }
        let Some(store) = &self.deps.content_store else {
            debug!("No content store configured, skipping migration");
            return Ok(());
        };

        let mut records = Vec::new();
        for page in run.lease.files_of(FileKind::Page) {
            let html = run.lease.read_string(&page).await?;
            records.extend(scan_with(&html, &run.site.url_for(&page), &run.scan_options));
        }
        for sheet in run.lease.files_of(FileKind::Stylesheet) {
            let css = run.lease.read_string(&sheet).await?;
            records.extend(scan_stylesheet(&css, &run.site.url_for(&sheet)));
        }
        if records.is_empty() {
            return Ok(());
        }

        let migrator = Migrator::new(store.clone(), self.deps.fetcher.clone(), run.retry);
        let results = migrator.migrate_all(&records, self.config.upload_concurrency).await;
        if is_total_failure(&results) {
            let attempted = results.iter().filter(|r| r.status != MigrationStatus::Skipped).count();
            return Err(MigrationError::TotalFailure(attempted).into());
        }

        for failed in results.iter().filter(|r| r.status == MigrationStatus::Failed) {
            let message = format!(
                "{}: migration failed, original URL kept ({})",
                failed.url,
                failed.error.as_deref().unwrap_or("unknown error")
            );
            checkpoint.stats.warnings += 1;
            self.log(build, LogLevel::Warn, Some(Stage::Migration), &message);
        }
        checkpoint.stats.images_migrated = results.iter().filter(|r| r.is_success()).count() as u32;
        checkpoint.migration = results;
        self.checkpoints.save(checkpoint).await?;
        Ok(())
    }

    async fn run_stage(
        &self,
        stage: Stage,
        build: &mut Build,
        run: &RunState<'_>,
        checkpoint: &mut Checkpoint,
    ) -> Result<(), OptimizeError> {
        let used_selectors = if stage == Stage::Css {
            self.collect_used_selectors(run.lease).await?
        } else {
            UsedSelectors::default()
        };
        if stage == Stage::Migration {
            self.migrate_assets(build, run, checkpoint).await?;
        }

        let passes = work_passes(stage, run.lease, checkpoint).await?;
        let total: usize = passes.iter().map(Vec::len).sum();
        let mut done = passes
            .iter()
            .flatten()
            .filter(|item| checkpoint.is_item_done(stage, &item.key))
            .count();

        for pass in passes {
            let ctx = StageContext {
                site: run.site,
                snapshot: &run.snapshot,
                workspace: run.lease,
                fetcher: self.deps.fetcher.as_ref(),
                retry: &run.retry,
                font_cache: &run.font_cache,
                images: &self.images,
                scan_options: &run.scan_options,
                used_selectors: used_selectors.clone(),
                removed_scripts: checkpoint.removed_scripts.iter().cloned().collect(),
                document_write: checkpoint.document_write.iter().cloned().collect(),
                webp_variants: checkpoint.webp_variants.clone(),
                rename_map: checkpoint.rename_map.clone(),
                migration: checkpoint.migration.clone(),
            };
            let pending: Vec<WorkItem> = pass
                .into_iter()
                .filter(|item| !checkpoint.is_item_done(stage, &item.key))
                .collect();

            let ctx = &ctx;
            let mut results = stream::iter(pending)
                .map(|item| async move {
                    let result = process_item(ctx, stage, &item).await;
                    (item, result)
                })
                .buffer_unordered(self.config.stage_concurrency.max(1));

            while let Some((item, result)) = results.next().await {
                let outcome = result?;
                self.fold(stage, build, checkpoint, outcome);
                checkpoint.complete_item(&item.key);
                self.checkpoints.save(checkpoint).await?;
                done += 1;
                self.deps.events.publish(
                    build.id,
                    BuildEventKind::AssetProgress { stage, item: item.path.clone(), done, total },
                );
                check_cancelled(run.cancel)?;
            }
        }
        Ok(())
    }

    /// Merge one item's contribution into the checkpoint
    fn fold(&self, stage: Stage, build: &mut Build, checkpoint: &mut Checkpoint, outcome: ItemOutcome) {
        let stats = &mut checkpoint.stats;
        match stage {
            Stage::Css => stats.css.add(outcome.original_bytes, outcome.optimized_bytes),
            Stage::Js => stats.js.add(outcome.original_bytes, outcome.optimized_bytes),
            Stage::Images => stats.images.add(outcome.original_bytes, outcome.optimized_bytes),
            _ => {}
        }
        stats.facades_applied += outcome.facades_applied;
        stats.scripts_removed += outcome.scripts_removed;
        stats.warnings += outcome.warnings.len() as u32;

        if let Some((from, to)) = outcome.renamed {
            checkpoint.rename_map.insert(from, to);
        }
        if let Some(path) = outcome.removed_script {
            checkpoint.removed_scripts.insert(path);
        }
        if let Some(path) = outcome.document_write {
            checkpoint.document_write.insert(path);
        }
        if let Some((original, variant)) = outcome.webp {
            checkpoint.webp_variants.insert(original, variant);
        }

        for note in &outcome.notes {
            self.log(build, LogLevel::Info, Some(stage), note);
        }
        for warning in &outcome.warnings {
            self.log(build, LogLevel::Warn, Some(stage), warning);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::fs::DirectoryDeployer;
    use crate::adapters::memory::MemoryStore;
    use crate::migration::FetchedAsset;
    use crate::pipeline::collaborators::{CrawledAsset, CrawledPage};
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    const PAGE: &str = r#"<html><head><title>Acme</title><link rel="stylesheet" href="/css/site.css"></head><body><p class="used">hi</p><img src="/img/a.jpg" alt="a"></body></html>"#;

    struct Pages {
        result: Result<Vec<CrawledPage>, String>,
        calls: AtomicU32,
    }

    impl Pages {
        fn site() -> Self {
            let assets = vec![
                CrawledAsset { path: "css/site.css".into(), bytes: b".used { color: red }\n".to_vec() },
                // non è un JPEG valido: l'ottimizzatore fallisce
                CrawledAsset { path: "img/a.jpg".into(), bytes: b"not really a jpeg".to_vec() },
            ];
            Self::returning(Ok(vec![CrawledPage { path: "index.html".into(), html: PAGE.into(), assets }]))
        }

        fn returning(result: Result<Vec<CrawledPage>, String>) -> Self {
            Self { result, calls: AtomicU32::new(0) }
        }
    }

    #[async_trait]
    impl CrawlSource for Pages {
        async fn crawl(&self, _site: &Site, _scope: &BuildScope) -> Result<Vec<CrawledPage>, OptimizeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.result {
                Ok(pages) => Ok(pages.clone()),
                Err(message) => Err(OptimizeError::Crawl(message.clone())),
            }
        }
    }

    /// Fails every open build of the site from outside, then crawls
    struct DeletesSite {
        store: Arc<MemoryStore>,
        pages: Pages,
    }

    #[async_trait]
    impl CrawlSource for DeletesSite {
        async fn crawl(&self, site: &Site, scope: &BuildScope) -> Result<Vec<CrawledPage>, OptimizeError> {
            for mut build in self.store.list_for_site(&site.id).await.map_err(|e| OptimizeError::Store(e.to_string()))? {
                if !build.status.is_terminal() {
                    build.fail(SITE_DELETED)?;
                    self.store.update(&build).await.map_err(|e| OptimizeError::Store(e.to_string()))?;
                }
            }
            self.pages.crawl(site, scope).await
        }
    }

    struct Origin {
        online: bool,
    }

    #[async_trait]
    impl AssetFetcher for Origin {
        async fn fetch(&self, url: &str) -> Result<FetchedAsset, OptimizeError> {
            if self.online {
                Ok(FetchedAsset::new(url, vec![0xff, 0xd8, 0xff, 0xe0], Some("image/jpeg")))
            } else {
                Err(OptimizeError::Fetch { url: url.into(), message: "connection refused".into() })
            }
        }
    }

    /// Hangs on the first deploy, then writes to a directory
    struct StuckOnce {
        calls: AtomicU32,
        inner: DirectoryDeployer,
    }

    #[async_trait]
    impl Deployer for StuckOnce {
        async fn deploy(&self, site: &Site, tree_root: &Path) -> Result<String, OptimizeError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                std::future::pending::<()>().await;
            }
            self.inner.deploy(site, tree_root).await
        }
    }

    struct Harness {
        orchestrator: Arc<BuildOrchestrator>,
        store: Arc<MemoryStore>,
        output: PathBuf,
    }

    fn harness(
        dir: &TempDir,
        crawler: Arc<dyn CrawlSource>,
        fetcher: Origin,
        with_store: bool,
        deployer: Option<Arc<dyn Deployer>>,
    ) -> Harness {
        harness_on(dir, Arc::new(MemoryStore::new()), crawler, fetcher, with_store, deployer)
    }

    fn harness_on(
        dir: &TempDir,
        store: Arc<MemoryStore>,
        crawler: Arc<dyn CrawlSource>,
        fetcher: Origin,
        with_store: bool,
        deployer: Option<Arc<dyn Deployer>>,
    ) -> Harness {
        let output = dir.path().join("public");
        let config = Config {
            backoff_base_ms: 1,
            backoff_cap_ms: 5,
            fetch_retries: 2,
            state_dir: dir.path().join("state"),
            workspace_root: dir.path().join("workspaces"),
            ..Config::default()
        };
        let deps = PipelineDeps {
            crawler,
            fetcher: Arc::new(fetcher),
            content_store: with_store.then(|| store.clone() as Arc<dyn ContentStore>),
            deployer: deployer.unwrap_or_else(|| Arc::new(DirectoryDeployer::new(&output))),
            builds: store.clone(),
            settings: Arc::new(SettingsStore::new(store.clone())),
            events: Arc::new(EventHub::new()),
        };
        Harness { orchestrator: Arc::new(BuildOrchestrator::new(deps, config)), store, output }
    }

    fn site() -> Site {
        Site::new("acme", "https://acme.test")
    }

    #[tokio::test]
    async fn test_failed_optimizer_keeps_original_and_build_succeeds() {
        let dir = TempDir::new().unwrap();
        let h = harness(&dir, Arc::new(Pages::site()), Origin { online: true }, false, None);

        let build = h.orchestrator.execute(&site(), BuildScope::Full).await.unwrap();

        assert_eq!(build.status, BuildStatus::Success, "{:?}", build.error);
        assert!(build.stats.warnings >= 1);
        assert!(build
            .log
            .iter()
            .any(|entry| entry.level == LogLevel::Warn && entry.stage == Some(Stage::Images) && entry.message.contains("img/a.jpg")));
        let deployed = std::fs::read(h.output.join("img/a.jpg")).unwrap();
        assert_eq!(deployed, b"not really a jpeg");
        // checkpoint rimosso dopo il successo
        assert!(h.orchestrator.checkpoints().load("acme").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_crawl_error_is_fatal() {
        let dir = TempDir::new().unwrap();
        let crawler = Arc::new(Pages::returning(Err("origin returned 503".into())));
        let h = harness(&dir, crawler, Origin { online: true }, false, None);

        let build = h.orchestrator.execute(&site(), BuildScope::Full).await.unwrap();

        assert_eq!(build.status, BuildStatus::Failed);
        assert_eq!(build.failed_phase.as_deref(), Some("crawling"));
        assert_eq!(build.error.as_deref(), Some("Crawl failed: origin returned 503"));
        assert!(!h.output.exists());
    }

    #[tokio::test]
    async fn test_every_migration_failing_fails_the_build() {
        let dir = TempDir::new().unwrap();
        let h = harness(&dir, Arc::new(Pages::site()), Origin { online: false }, true, None);

        let build = h.orchestrator.execute(&site(), BuildScope::Full).await.unwrap();

        assert_eq!(build.status, BuildStatus::Failed);
        assert_eq!(build.failed_phase.as_deref(), Some("optimizing"));
        assert!(build.error.unwrap().contains("failed to migrate"));
        assert!(!h.output.exists());
        let stored = h.store.get(build.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BuildStatus::Failed);
    }

    #[tokio::test]
    async fn test_requested_cancel_ends_cancelled() {
        let dir = TempDir::new().unwrap();
        let h = harness(&dir, Arc::new(Pages::site()), Origin { online: true }, false, None);
        let build = h.orchestrator.create_build("acme", BuildScope::Full).await.unwrap();
        let lease = h.orchestrator.workspaces().try_acquire("acme").unwrap();
        let (cancel_tx, cancel_rx) = watch::channel(None);
        cancel_tx.send(Some(CancelReason::Requested)).unwrap();

        let build = h.orchestrator.run_build(build.id, &site(), lease, cancel_rx).await.unwrap();

        assert_eq!(build.status, BuildStatus::Cancelled);
        assert_eq!(build.error.as_deref(), Some("Build cancelled"));
        assert!(!h.output.exists());
    }

    #[tokio::test]
    async fn test_build_closed_elsewhere_stops_before_next_stage() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        // il sito viene eliminato durante il crawl, senza segnale alla build
        let crawler = Arc::new(DeletesSite { store: store.clone(), pages: Pages::site() });
        let h = harness_on(&dir, store, crawler, Origin { online: true }, false, None);

        let build = h.orchestrator.execute(&site(), BuildScope::Full).await.unwrap();

        assert_eq!(build.status, BuildStatus::Failed);
        assert_eq!(build.error.as_deref(), Some(SITE_DELETED));
        assert_eq!(build.stats.css.original, 0);
        assert!(!h.output.exists());
        let stored = h.store.get(build.id).await.unwrap().unwrap();
        assert_eq!(stored.error.as_deref(), Some(SITE_DELETED));
    }

    #[tokio::test]
    async fn test_interrupted_build_resumes_without_redoing_stages() {
        let dir = TempDir::new().unwrap();
        let crawler = Arc::new(Pages::site());
        let deployer = Arc::new(StuckOnce {
            calls: AtomicU32::new(0),
            inner: DirectoryDeployer::new(&dir.path().join("public")),
        });
        let h = harness(&dir, crawler.clone(), Origin { online: true }, false, Some(deployer.clone()));
        let build = h.orchestrator.create_build("acme", BuildScope::Full).await.unwrap();

        let first = {
            let orchestrator = h.orchestrator.clone();
            let lease = h.orchestrator.workspaces().try_acquire("acme").unwrap();
            let (_, cancel_rx) = watch::channel(None);
            let id = build.id;
            tokio::spawn(async move { orchestrator.run_build(id, &site(), lease, cancel_rx).await })
        };
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while h.store.get(build.id).await.unwrap().unwrap().status != BuildStatus::Deploying {
            assert!(tokio::time::Instant::now() < deadline, "build never reached deploy");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        first.abort();
        assert!(first.await.unwrap_err().is_cancelled());

        let saved = h.orchestrator.checkpoints().load("acme").await.unwrap().unwrap();
        assert_eq!(saved.last_completed, Some(Stage::Finalize));
        let hashed_css = saved.rename_map.get("css/site.css").cloned().unwrap();

        // rimessa in coda dopo l'interruzione
        let mut stored = h.store.get(build.id).await.unwrap().unwrap();
        stored.transition(BuildStatus::Queued).unwrap();
        h.store.update(&stored).await.unwrap();

        let lease = h.orchestrator.workspaces().try_acquire("acme").unwrap();
        let (_cancel_tx, cancel_rx) = watch::channel(None);
        let resumed = h.orchestrator.run_build(build.id, &site(), lease, cancel_rx).await.unwrap();

        assert_eq!(resumed.status, BuildStatus::Success, "{:?}", resumed.error);
        assert_eq!(crawler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(deployer.calls.load(Ordering::SeqCst), 2);
        assert_eq!(resumed.attempts, 2);
        assert_eq!(resumed.stats.pages, 1);
        assert!(resumed.log.iter().any(|entry| entry.message.contains("Resuming build")));
        let index = std::fs::read_to_string(h.output.join("index.html")).unwrap();
        assert!(index.contains(&format!("/{}", hashed_css)));
        assert!(h.output.join(&hashed_css).exists());
    }
}
