//! # Settings Store
//!
//! Cache esplicita + persistenza degli override di un sito.
//!
//! ## Responsabilità:
//! - Valida ogni scrittura prima di toccare la persistenza (mai applicata a metà)
//! - Mantiene la history append-only degli override precedenti
//! - Rollback non distruttivo: lo stato corrente finisce in history prima di applicare quello vecchio
//! - Produce lo snapshot congelato letto una sola volta all'avvio di una build
//! - `invalidate(site_id)` esplicito al posto di cache globali

use crate::error::{OptimizeError, SettingsIssue, SettingsValidationError};
use crate::settings::resolver::{self, AssetOverride};
use crate::settings::schema::ResolvedSettings;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// One entry of the append-only override history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsRevision {
    pub revision: u32,
    pub settings: Value,
    pub recorded_at: DateTime<Utc>,
    pub reason: String,
}

/// Everything persisted about a site's settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteSettingsRecord {
    pub site_override: Value,
    #[serde(default)]
    pub asset_overrides: Vec<AssetOverride>,
    #[serde(default)]
    pub history: Vec<SettingsRevision>,
}

impl Default for SiteSettingsRecord {
    fn default() -> Self {
        Self {
            site_override: Value::Object(Map::new()),
            asset_overrides: Vec::new(),
            history: Vec::new(),
        }
    }
}

impl SiteSettingsRecord {
    /// Push the current override to history, then install `next`.
    /// Repositories call this while holding their write lock.
    pub fn swap(&mut self, next: Value, reason: &str) {
        let previous = std::mem::replace(&mut self.site_override, next);
        let revision = self.history.len() as u32 + 1;
        self.history.push(SettingsRevision {
            revision,
            settings: previous,
            recorded_at: Utc::now(),
            reason: reason.to_string(),
        });
    }
}

/// Persistence collaborator for settings
#[async_trait]
pub trait SettingsRepository: Send + Sync {
    async fn load(&self, site_id: &str) -> Result<Option<SiteSettingsRecord>>;

    /// Atomically read the current override, keep it in history, write `next`
    async fn replace_override(&self, site_id: &str, next: Value, reason: &str) -> Result<SiteSettingsRecord>;

    async fn save_asset_overrides(&self, site_id: &str, overrides: Vec<AssetOverride>) -> Result<()>;

    async fn delete(&self, site_id: &str) -> Result<()>;
}

/// Frozen settings for one build: site level plus the asset overrides
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsSnapshot {
    pub site: ResolvedSettings,
    pub site_override: Value,
    pub asset_overrides: Vec<AssetOverride>,
}

impl SettingsSnapshot {
    pub fn from_record(record: &SiteSettingsRecord) -> Self {
        Self {
            site: resolver::resolve(&record.site_override, &[]),
            site_override: record.site_override.clone(),
            asset_overrides: record.asset_overrides.clone(),
        }
    }

    /// Settings for a specific asset URL; site level when nothing matches
    pub fn for_url(&self, url: &str) -> ResolvedSettings {
        if self.asset_overrides.iter().any(|o| o.matches(url)) {
            resolver::resolve_for_url(&self.site_override, &self.asset_overrides, url)
        } else {
            self.site.clone()
        }
    }
}

impl Default for SettingsSnapshot {
    fn default() -> Self {
        Self::from_record(&SiteSettingsRecord::default())
    }
}

/// Cached access to site settings
pub struct SettingsStore {
    repository: Arc<dyn SettingsRepository>,
    cache: RwLock<HashMap<String, SiteSettingsRecord>>,
}

impl SettingsStore {
    pub fn new(repository: Arc<dyn SettingsRepository>) -> Self {
        Self {
            repository,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Current record, from cache when possible
    pub async fn record(&self, site_id: &str) -> Result<SiteSettingsRecord> {
        if let Some(record) = self.cache.read().await.get(site_id) {
            return Ok(record.clone());
        }

        let record = self.repository.load(site_id).await?.unwrap_or_default();
        self.cache.write().await.insert(site_id.to_string(), record.clone());
        debug!("Loaded settings for site {} into cache", site_id);
        Ok(record)
    }

    /// Snapshot frozen at build start; later edits never reach it
    pub async fn snapshot(&self, site_id: &str) -> Result<SettingsSnapshot> {
        Ok(SettingsSnapshot::from_record(&self.record(site_id).await?))
    }

    pub async fn resolved(&self, site_id: &str) -> Result<ResolvedSettings> {
        Ok(self.snapshot(site_id).await?.site)
    }

    /// Validate and replace the site override, keeping the old one in history
    pub async fn update_site(&self, site_id: &str, payload: Value, reason: &str) -> Result<SiteSettingsRecord> {
        resolver::validate(&payload).map_err(OptimizeError::from)?;
        let record = self.repository.replace_override(site_id, payload, reason).await?;
        self.invalidate(site_id).await;
        info!("⚙️ Settings updated for site {} ({} revisions in history)", site_id, record.history.len());
        Ok(record)
    }

    /// Validate every asset override; issues are reported with their index
    pub async fn set_asset_overrides(&self, site_id: &str, overrides: Vec<AssetOverride>) -> Result<()> {
        let mut issues = Vec::new();
        for (index, item) in overrides.iter().enumerate() {
            if let Err(err) = resolver::validate(&item.settings) {
                issues.extend(err.issues.into_iter().map(|issue| SettingsIssue {
                    path: format!("asset_overrides[{}].{}", index, issue.path),
                    problem: issue.problem,
                }));
            }
        }
        if !issues.is_empty() {
            return Err(OptimizeError::from(SettingsValidationError { issues }).into());
        }

        self.repository.save_asset_overrides(site_id, overrides).await?;
        self.invalidate(site_id).await;
        Ok(())
    }

    pub async fn history(&self, site_id: &str) -> Result<Vec<SettingsRevision>> {
        Ok(self.record(site_id).await?.history)
    }

    /// Restore an older revision. The current override is recorded first,
    /// so no revision is ever lost.
    pub async fn rollback(&self, site_id: &str, revision: u32) -> Result<SiteSettingsRecord> {
        let record = self.record(site_id).await?;
        let target = record
            .history
            .iter()
            .find(|r| r.revision == revision)
            .ok_or_else(|| OptimizeError::Validation(format!("Unknown settings revision {} for site {}", revision, site_id)))?;

        let restored = self
            .repository
            .replace_override(site_id, target.settings.clone(), &format!("rollback to revision {}", revision))
            .await?;
        self.invalidate(site_id).await;
        info!("⏪ Site {} rolled back to settings revision {}", site_id, revision);
        Ok(restored)
    }

    pub async fn invalidate(&self, site_id: &str) {
        self.cache.write().await.remove(site_id);
    }

    pub async fn delete_site(&self, site_id: &str) -> Result<()> {
        self.repository.delete(site_id).await?;
        self.invalidate(site_id).await;
        Ok(())
    }
}
