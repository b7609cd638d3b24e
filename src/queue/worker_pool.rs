//! # Worker Pool
//!
//! Pool limitato di worker che consumano la `BuildQueue`.
//!
//! ## Responsabilità:
//! - N worker (default 2), ciascuno esegue una build alla volta
//! - Ogni build gira in un task separato: un panic non uccide il worker
//! - Il worker rinnova il lock solo finché il task è vivo e produce eventi;
//!   una build in crash o bloccata smette di rinnovarlo e il lock scade
//! - Supervisore: recupera i lock scaduti, rimette in coda o chiude la build
//! - Errori di infrastruttura: job rimesso in coda con ritardo fino a `max_attempts`
//! - Attesa con backoff esponenziale quando la coda non ha lavoro pronto

use crate::pipeline::build::{Build, BuildStatus, LogLevel};
use crate::pipeline::events::BuildEventKind;
use crate::pipeline::orchestrator::{BuildOrchestrator, CancelReason};
use crate::queue::backoff::RetryPolicy;
use crate::queue::build_queue::{BuildQueue, Claim, Job, ReapOutcome};
use crate::queue::QueueError;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const MAX_IDLE_WAIT: Duration = Duration::from_secs(1);
const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

/// How the wait on a build task ended
enum JobEnd {
    Finished(Result<anyhow::Result<Build>, JoinError>),
    /// The lock is gone: reaped after a stall, or taken over
    Abandoned(QueueError),
}

struct PoolShared {
    queue: Arc<BuildQueue>,
    orchestrator: Arc<BuildOrchestrator>,
    retry: RetryPolicy,
    heartbeat: Duration,
    stall_timeout: Duration,
}

impl PoolShared {
    async fn run_job(&self, worker: usize, claim: Claim) {
        let Claim { job, lease, cancel } = claim;
        info!("👷 Worker {} running build {} for {} (attempt {})", worker, job.build_id, job.site.id, job.attempts);

        // sottoscritto prima dello spawn per non perdere il primo evento
        let mut progress = self.orchestrator.deps().events.subscribe(job.build_id);
        let mut task: JoinHandle<anyhow::Result<Build>> = {
            let orchestrator = self.orchestrator.clone();
            let site = job.site.clone();
            let build_id = job.build_id;
            tokio::spawn(async move { orchestrator.run_build(build_id, &site, lease, cancel).await })
        };

        let mut ticker = tokio::time::interval(self.heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_progress = Instant::now();
        let mut listening = true;
        let mut stalled = false;

        let end = loop {
            tokio::select! {
                joined = &mut task => break JobEnd::Finished(joined),
                event = progress.recv(), if listening => match event {
                    Ok(_) | Err(RecvError::Lagged(_)) => {
                        last_progress = Instant::now();
                        stalled = false;
                    }
                    Err(RecvError::Closed) => listening = false,
                },
                _ = ticker.tick() => {
                    if last_progress.elapsed() < self.stall_timeout {
                        if let Err(e) = self.queue.heartbeat(job.id, worker) {
                            break JobEnd::Abandoned(e);
                        }
                    } else if !stalled {
                        stalled = true;
                        warn!(
                            "⏰ Build {} silent for {:?}, no longer renewing its lock",
                            job.build_id,
                            last_progress.elapsed()
                        );
                    } else if !self.queue.holds(job.id, worker) {
                        break JobEnd::Abandoned(QueueError::UnknownJob(job.id));
                    }
                }
            }
        };

        match end {
            JobEnd::Finished(Ok(result)) => self.finish_job(worker, &job, result).await,
            JobEnd::Finished(Err(e)) => {
                // il lock non viene più rinnovato: il reaper lo troverà scaduto
                error!("💥 Build {} crashed on worker {}: {}", job.build_id, worker, e);
            }
            JobEnd::Abandoned(reason) => {
                warn!("🪦 Worker {} abandons build {}: {}", worker, job.build_id, reason);
                task.abort();
                // attende il drop del future, che rilascia il workspace
                if let Err(e) = task.await {
                    debug!("Build task {} stopped: {}", job.build_id, e);
                }
            }
        }
    }

    async fn finish_job(&self, worker: usize, job: &Job, result: anyhow::Result<Build>) {
        match result {
            Ok(build) => {
                self.queue.complete(job.id, worker);
                debug!("Worker {} finished build {} as {}", worker, build.id, build.status);
            }
            Err(e) => {
                warn!("🔁 Build {} hit an infrastructure error: {:#}", job.build_id, e);
                let delay = self.retry.delay_for(job.attempts);
                match self.queue.retry_later(job.id, worker, delay) {
                    Ok(_) => self.requeue_build(job.build_id, &format!("Retrying after error: {}", e)).await,
                    Err(QueueError::Exhausted { attempts, .. }) => {
                        let message = format!("Gave up after {} attempts: {}", attempts, e);
                        self.fail_build(job.build_id, &message).await;
                    }
                    Err(other) => debug!("Job {} no longer ours: {}", job.id, other),
                }
            }
        }
    }

    /// Put a non-terminal build back to `queued`
    async fn requeue_build(&self, build_id: Uuid, reason: &str) {
        let deps = self.orchestrator.deps();
        let result: anyhow::Result<()> = async {
            let Some(mut build) = deps.builds.get(build_id).await? else {
                return Ok(());
            };
            if build.status.is_terminal() || build.status == BuildStatus::Queued {
                return Ok(());
            }
            build.transition(BuildStatus::Queued)?;
            build.push_log(LogLevel::Warn, None, reason);
            deps.builds.update(&build).await?;
            deps.events
                .publish(build_id, BuildEventKind::PhaseChanged { status: BuildStatus::Queued, stage: None });
            Ok(())
        }
        .await;
        if let Err(e) = result {
            error!("❌ Could not requeue build {}: {:#}", build_id, e);
        }
    }

    /// Leave a build `failed` with `message`
    async fn fail_build(&self, build_id: Uuid, message: &str) {
        let deps = self.orchestrator.deps();
        let result: anyhow::Result<()> = async {
            let Some(mut build) = deps.builds.get(build_id).await? else {
                return Ok(());
            };
            if build.status.is_terminal() {
                return Ok(());
            }
            build.fail(message)?;
            deps.builds.update(&build).await?;
            deps.events.publish(
                build_id,
                BuildEventKind::Completed {
                    status: build.status,
                    error: build.error.clone(),
                    deploy_url: None,
                    stats: build.stats.clone(),
                },
            );
            deps.events.close(build_id);
            Ok(())
        }
        .await;
        if let Err(e) = result {
            error!("❌ Could not mark build {} failed: {:#}", build_id, e);
        }
    }

    /// Recover jobs whose lock expired
    async fn supervise(&self) {
        for outcome in self.queue.reap_expired() {
            match outcome {
                ReapOutcome::Retry(job) => {
                    // stato aggiornato prima che un worker possa riprenderlo
                    let build_id = job.build_id;
                    self.requeue_build(build_id, "Worker lock expired, job requeued").await;
                    if let Err(e) = self.queue.requeue(job) {
                        debug!("Build {} not requeued: {}", build_id, e);
                    }
                }
                ReapOutcome::Exhausted(job) => {
                    let message = format!("Worker lock expired after {} attempts", job.attempts);
                    self.fail_build(job.build_id, &message).await;
                }
            }
        }
    }
}

pub struct WorkerPool {
    shared: Arc<PoolShared>,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(queue: Arc<BuildQueue>, orchestrator: Arc<BuildOrchestrator>) -> Self {
        let config = orchestrator.config();
        let retry = RetryPolicy::for_jobs(config);
        // almeno due rinnovi per periodo di lock
        let heartbeat = config.heartbeat_interval().min(queue.lock_timeout() / 2).max(MIN_HEARTBEAT);
        let stall_timeout = config.stall_timeout();
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(PoolShared {
                queue,
                orchestrator,
                retry,
                heartbeat,
                stall_timeout,
            }),
            shutdown,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn queue(&self) -> &Arc<BuildQueue> {
        &self.shared.queue
    }

    pub fn orchestrator(&self) -> &Arc<BuildOrchestrator> {
        &self.shared.orchestrator
    }

    /// Spawn the workers and the supervisor
    pub fn start(&self) {
        let workers = self.shared.orchestrator.config().workers;
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        if !handles.is_empty() {
            return;
        }

        for worker in 0..workers {
            let shared = self.shared.clone();
            let shutdown = self.shutdown.subscribe();
            handles.push(tokio::spawn(worker_loop(shared, worker, shutdown)));
        }

        let shared = self.shared.clone();
        let mut shutdown = self.shutdown.subscribe();
        let period = self.shared.heartbeat;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => shared.supervise().await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }));
        info!("🚦 Worker pool started with {} workers", workers);
    }

    /// Signal a claimed build; false when no worker holds it
    pub fn cancel(&self, build_id: Uuid, reason: CancelReason) -> bool {
        self.shared.queue.cancel(build_id, reason)
    }

    pub fn running_builds(&self) -> Vec<Uuid> {
        self.shared.queue.active_builds()
    }

    /// Stop accepting jobs and wait for in-flight builds
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.shared.queue.close();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            if let Err(e) = handle.await {
                error!("❌ Worker task ended abnormally: {}", e);
            }
        }
        info!("🛑 Worker pool stopped");
    }
}

async fn worker_loop(shared: Arc<PoolShared>, worker: usize, mut shutdown: watch::Receiver<bool>) {
    let mut idle_rounds = 0u32;
    loop {
        if *shutdown.borrow() || shared.queue.is_closed() {
            break;
        }
        match shared.queue.claim(worker, shared.orchestrator.workspaces()) {
            Some(claim) => {
                idle_rounds = 0;
                shared.run_job(worker, claim).await;
            }
            None => {
                idle_rounds = idle_rounds.saturating_add(1);
                let wait = shared.retry.delay_for(idle_rounds).min(MAX_IDLE_WAIT);
                tokio::select! {
                    _ = shared.queue.notified() => {}
                    _ = tokio::time::sleep(wait) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
    debug!("Worker {} exiting", worker);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MemoryStore;
    use crate::config::Config;
    use crate::error::OptimizeError;
    use crate::migration::fetch::{AssetFetcher, FetchedAsset};
    use crate::pipeline::build::{BuildRepository, BuildScope};
    use crate::pipeline::collaborators::{CrawlSource, CrawledPage, Deployer, Site};
    use crate::pipeline::events::EventHub;
    use crate::pipeline::orchestrator::PipelineDeps;
    use crate::settings::SettingsStore;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    struct OnePage;

    #[async_trait]
    impl CrawlSource for OnePage {
        async fn crawl(&self, _site: &Site, _scope: &BuildScope) -> Result<Vec<CrawledPage>, OptimizeError> {
            Ok(vec![CrawledPage {
                path: "index.html".into(),
                html: "<html><head><title>Hi</title></head><body><p>hi</p></body></html>".into(),
                assets: Vec::new(),
            }])
        }
    }

    struct Offline;

    #[async_trait]
    impl AssetFetcher for Offline {
        async fn fetch(&self, url: &str) -> Result<FetchedAsset, OptimizeError> {
            Err(OptimizeError::Fetch { url: url.into(), message: "offline".into() })
        }
    }

    struct Edge;

    #[async_trait]
    impl Deployer for Edge {
        async fn deploy(&self, site: &Site, _tree_root: &Path) -> Result<String, OptimizeError> {
            Ok(format!("https://{}.edge.test", site.id))
        }
    }

    /// Panics on the first crawl, then behaves
    struct CrashOnce {
        calls: AtomicU32,
    }

    #[async_trait]
    impl CrawlSource for CrashOnce {
        async fn crawl(&self, site: &Site, scope: &BuildScope) -> Result<Vec<CrawledPage>, OptimizeError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("crawler crashed");
            }
            OnePage.crawl(site, scope).await
        }
    }

    struct Hangs;

    #[async_trait]
    impl CrawlSource for Hangs {
        async fn crawl(&self, _site: &Site, _scope: &BuildScope) -> Result<Vec<CrawledPage>, OptimizeError> {
            std::future::pending().await
        }
    }

    fn config(dir: &TempDir, workers: usize) -> Config {
        Config {
            workers,
            backoff_base_ms: 5,
            backoff_cap_ms: 20,
            heartbeat_secs: 1,
            lock_timeout_secs: 30,
            state_dir: dir.path().join("state"),
            workspace_root: dir.path().join("workspaces"),
            ..Config::default()
        }
    }

    fn pool_with(config: Config, crawler: Arc<dyn CrawlSource>, queue: BuildQueue) -> (WorkerPool, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let deps = PipelineDeps {
            crawler,
            fetcher: Arc::new(Offline),
            content_store: None,
            deployer: Arc::new(Edge),
            builds: store.clone(),
            settings: Arc::new(SettingsStore::new(store.clone())),
            events: Arc::new(EventHub::new()),
        };
        let orchestrator = Arc::new(BuildOrchestrator::new(deps, config));
        (WorkerPool::new(Arc::new(queue), orchestrator), store)
    }

    fn pool(dir: &TempDir) -> (WorkerPool, Arc<MemoryStore>) {
        let config = config(dir, 2);
        let queue = BuildQueue::from_config(&config);
        pool_with(config, Arc::new(OnePage), queue)
    }

    /// Short locks and a one second stall window
    fn fragile_pool(dir: &TempDir, crawler: Arc<dyn CrawlSource>) -> (WorkerPool, Arc<MemoryStore>) {
        let config = Config { stall_timeout_secs: 1, ..config(dir, 1) };
        pool_with(config, crawler, BuildQueue::new(Duration::from_millis(300), 2))
    }

    async fn submit(pool: &WorkerPool, site: &str) -> Uuid {
        let build = pool.orchestrator().create_build(site, BuildScope::Full).await.unwrap();
        pool.queue().enqueue(build.id, Site::new(site, &format!("https://{}.test", site))).unwrap();
        build.id
    }

    async fn wait_terminal(store: &MemoryStore, id: Uuid, limit: Duration) -> Build {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let build = store.get(id).await.unwrap().unwrap();
            if build.status.is_terminal() || tokio::time::Instant::now() > deadline {
                return build;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_pool_runs_queued_builds_to_success() {
        let dir = TempDir::new().unwrap();
        let (pool, store) = pool(&dir);
        pool.start();

        let mut ids = Vec::new();
        for site in ["acme", "globex"] {
            let build = pool.orchestrator().create_build(site, BuildScope::Full).await.unwrap();
            pool.queue().enqueue(build.id, Site::new(site, &format!("https://{}.test", site))).unwrap();
            ids.push(build.id);
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
        loop {
            let mut done = 0;
            for id in &ids {
                if store.get(*id).await.unwrap().unwrap().status.is_terminal() {
                    done += 1;
                }
            }
            if done == ids.len() || tokio::time::Instant::now() > deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        pool.shutdown().await;

        for id in ids {
            let build = store.get(id).await.unwrap().unwrap();
            assert_eq!(build.status, BuildStatus::Success, "{:?}", build.error);
            assert!(build.deploy_url.unwrap().ends_with(".edge.test"));
            assert_eq!(build.attempts, 1);
        }
        assert_eq!(pool.queue().active_len(), 0);
    }

    #[tokio::test]
    async fn test_cancel_unknown_build_is_false() {
        let dir = TempDir::new().unwrap();
        let (pool, _) = pool(&dir);
        assert!(!pool.cancel(Uuid::new_v4(), CancelReason::Requested));
        assert!(pool.running_builds().is_empty());
    }

    #[tokio::test]
    async fn test_crashed_build_is_requeued_and_worker_survives() {
        let dir = TempDir::new().unwrap();
        let crawler = Arc::new(CrashOnce { calls: AtomicU32::new(0) });
        let (pool, store) = fragile_pool(&dir, crawler.clone());
        pool.start();

        let id = submit(&pool, "acme").await;
        let build = wait_terminal(&store, id, Duration::from_secs(15)).await;

        assert_eq!(build.status, BuildStatus::Success, "{:?}", build.error);
        assert_eq!(build.attempts, 2);
        assert_eq!(crawler.calls.load(Ordering::SeqCst), 2);
        assert!(build.log.iter().any(|entry| entry.message.contains("lock expired")));

        // lo stesso worker prende ancora lavoro
        let next = submit(&pool, "globex").await;
        let next = wait_terminal(&store, next, Duration::from_secs(15)).await;
        assert_eq!(next.status, BuildStatus::Success, "{:?}", next.error);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_silent_build_stops_renewing_and_fails_when_exhausted() {
        let dir = TempDir::new().unwrap();
        let (pool, store) = fragile_pool(&dir, Arc::new(Hangs));
        pool.start();

        let id = submit(&pool, "acme").await;
        let build = wait_terminal(&store, id, Duration::from_secs(20)).await;

        assert_eq!(build.status, BuildStatus::Failed);
        assert!(build.error.as_deref().unwrap_or_default().contains("lock expired"), "{:?}", build.error);
        assert_eq!(build.attempts, 2);
        assert!(pool.running_builds().is_empty());
        // il workspace è stato rilasciato dal task interrotto
        assert!(pool.orchestrator().workspaces().try_acquire("acme").is_some());
        pool.shutdown().await;
    }
}
