//! # Site Service
//!
//! Facciata usata dalle superfici esterne (CLI, API): mette in coda le build,
//! le cancella, gestisce le settings e la cancellazione di un sito.
//!
//! ## Cancellazione di un sito:
//! 1. Rimuove i job non ancora partiti
//! 2. Porta a `failed` ("Site deleted") ogni build non terminale
//! 3. Segnala la cancellazione alle build in esecuzione
//! 4. Attende il rilascio del workspace
//! 5. Ricontrolla che nessuna build sia rimasta non terminale
//! 6. Rimuove workspace, checkpoint e settings

use crate::error::OptimizeError;
use crate::pipeline::build::{Build, BuildScope, BuildStatus, SITE_DELETED};
use crate::pipeline::collaborators::Site;
use crate::pipeline::events::{BuildEvent, BuildEventKind};
use crate::pipeline::orchestrator::{BuildOrchestrator, CancelReason, PipelineDeps};
use crate::queue::WorkerPool;
use crate::settings::{diff_revisions, AssetOverride, ResolvedSettings, SettingsDiff, SettingsRevision, SiteSettingsRecord};
use anyhow::{anyhow, Result};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

/// What a site deletion touched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SiteDeletion {
    pub removed_jobs: usize,
    pub failed_builds: Vec<Uuid>,
    pub cancelled_in_flight: usize,
}

pub struct SiteService {
    pool: Arc<WorkerPool>,
}

impl SiteService {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self { pool }
    }

    fn orchestrator(&self) -> &BuildOrchestrator {
        self.pool.orchestrator()
    }

    fn deps(&self) -> &PipelineDeps {
        self.orchestrator().deps()
    }

    fn publish_completed(&self, build: &Build) {
        let events = &self.deps().events;
        events.publish(
            build.id,
            BuildEventKind::Completed {
                status: build.status,
                error: build.error.clone(),
                deploy_url: build.deploy_url.clone(),
                stats: build.stats.clone(),
            },
        );
        events.close(build.id);
    }

    /// Create a `queued` build and hand it to the workers
    pub async fn submit_build(&self, site: &Site, scope: BuildScope) -> Result<Build> {
        let mut build = self.orchestrator().create_build(&site.id, scope).await?;
        if let Err(e) = self.pool.queue().enqueue(build.id, site.clone()) {
            build.fail(&e.to_string())?;
            self.deps().builds.update(&build).await?;
            self.publish_completed(&build);
            return Err(e.into());
        }
        Ok(build)
    }

    /// Cancel a queued or running build
    pub async fn cancel_build(&self, build_id: Uuid) -> Result<Build> {
        let mut build = self
            .deps()
            .builds
            .get(build_id)
            .await?
            .ok_or_else(|| anyhow!("Build {} not found", build_id))?;
        if build.status.is_terminal() {
            return Ok(build);
        }

        let never_started = self.pool.queue().remove_pending_build(build_id).is_some();
        if !never_started && self.pool.cancel(build_id, CancelReason::Requested) {
            info!("🛑 Cancellation requested for build {}", build_id);
            return Ok(build);
        }
        if never_started || build.status == BuildStatus::Queued {
            build.transition(BuildStatus::Cancelled)?;
            build.error = Some("Build cancelled".to_string());
            self.deps().builds.update(&build).await?;
            self.publish_completed(&build);
            info!("🛑 Build {} cancelled before start", build_id);
        }
        Ok(build)
    }

    pub async fn build(&self, build_id: Uuid) -> Result<Option<Build>> {
        self.deps().builds.get(build_id).await
    }

    pub async fn builds_for_site(&self, site_id: &str) -> Result<Vec<Build>> {
        self.deps().builds.list_for_site(site_id).await
    }

    /// Live events of one build; the topic closes when the build ends
    pub fn subscribe(&self, build_id: Uuid) -> broadcast::Receiver<BuildEvent> {
        self.deps().events.subscribe(build_id)
    }

    pub async fn update_settings(&self, site_id: &str, payload: Value, reason: &str) -> Result<SiteSettingsRecord> {
        self.deps().settings.update_site(site_id, payload, reason).await
    }

    pub async fn set_asset_overrides(&self, site_id: &str, overrides: Vec<AssetOverride>) -> Result<()> {
        self.deps().settings.set_asset_overrides(site_id, overrides).await
    }

    pub async fn resolved_settings(&self, site_id: &str) -> Result<ResolvedSettings> {
        self.deps().settings.resolved(site_id).await
    }

    pub async fn settings_history(&self, site_id: &str) -> Result<Vec<SettingsRevision>> {
        self.deps().settings.history(site_id).await
    }

    /// What changed from `revision` to the current override
    pub async fn settings_diff(&self, site_id: &str, revision: u32) -> Result<SettingsDiff> {
        let record = self.deps().settings.record(site_id).await?;
        let before = record
            .history
            .iter()
            .find(|r| r.revision == revision)
            .ok_or_else(|| OptimizeError::Validation(format!("Unknown settings revision {} for site {}", revision, site_id)))?;
        Ok(diff_revisions(&before.settings, &record.site_override))
    }

    pub async fn rollback_settings(&self, site_id: &str, revision: u32) -> Result<SiteSettingsRecord> {
        self.deps().settings.rollback(site_id, revision).await
    }

    pub async fn delete_site(&self, site_id: &str) -> Result<SiteDeletion> {
        info!("🗑️  Deleting site {}", site_id);
        let queue = self.pool.queue();
        let deps = self.deps();
        let mut deletion = SiteDeletion {
            removed_jobs: queue.remove_pending_for_site(site_id).len(),
            ..SiteDeletion::default()
        };

        let in_flight: HashSet<Uuid> = queue.active_builds_for_site(site_id).into_iter().collect();
        for mut build in deps.builds.list_for_site(site_id).await? {
            if build.status.is_terminal() {
                continue;
            }
            build.fail(SITE_DELETED)?;
            deps.builds.update(&build).await?;
            deletion.failed_builds.push(build.id);

            let signalled = in_flight.contains(&build.id) && self.pool.cancel(build.id, CancelReason::SiteDeleted);
            if signalled {
                deletion.cancelled_in_flight += 1;
            } else {
                self.publish_completed(&build);
            }
        }

        let workspaces = self.orchestrator().workspaces();
        let timeout = self.orchestrator().config().lock_timeout();
        if tokio::time::timeout(timeout, workspaces.wait_released(site_id)).await.is_err() {
            return Err(OptimizeError::Workspace(format!("workspace for {} still busy after {:?}", site_id, timeout)).into());
        }

        // la build interrotta può aver scritto uno stato intermedio dopo il fail
        for mut build in deps.builds.list_for_site(site_id).await? {
            if !build.status.is_terminal() {
                build.fail(SITE_DELETED)?;
                deps.builds.update(&build).await?;
                self.publish_completed(&build);
            } else if deletion.failed_builds.contains(&build.id) && build.status != BuildStatus::Failed {
                warn!("⚠️  Build {} finished as {} before the deletion reached it", build.id, build.status);
            }
        }

        workspaces.remove(site_id).await?;
        self.orchestrator().checkpoints().clear(site_id).await?;
        deps.settings.delete_site(site_id).await?;
        info!(
            "🗑️  Site {} deleted: {} queued jobs removed, {} builds failed",
            site_id,
            deletion.removed_jobs,
            deletion.failed_builds.len()
        );
        Ok(deletion)
    }
}
