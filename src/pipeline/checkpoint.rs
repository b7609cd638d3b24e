//! # Checkpoint Module
//!
//! Questo modulo persiste l'avanzamento di una build per poterla riprendere
//! dopo un crash del worker senza rifare il lavoro già completato.
//!
//! ## Responsabilità:
//! - Registra l'ultimo stage completato e gli item finiti dello stage in corso
//! - Conserva statistiche, rename map e risultati di migrazione accumulati
//! - Salvataggio atomico (file temporaneo + rename) dopo ogni stage e ogni pagina
//! - Scarta checkpoint troppo vecchi o appartenenti a un'altra build
//!
//! ## Strategia di persistence:
//! - Un file JSON per sito (basato su hash dell'id)
//! - Salvataggio in `<state_dir>/checkpoints/checkpoint_<hash>.json`
//! - Il checkpoint sopravvive a un fallimento, per la diagnosi
//!
//! ## Esempio struttura checkpoint:
//! ```json
//! {
//!   "build_id": "6f1c…",
//!   "site_id": "acme",
//!   "last_completed": "js",
//!   "in_flight": "fonts",
//!   "completed_items": ["index.html"],
//!   "rename_map": { "css/site.css": "css/site.1a2b3c4d.css" }
//! }
//! ```

use crate::error::OptimizeError;
use crate::migration::MigrationResult;
use crate::pipeline::build::BuildStats;
use crate::pipeline::stage::Stage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Durable progress marker of one build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub build_id: Uuid,
    pub site_id: String,
    pub saved_at: DateTime<Utc>,
    pub last_completed: Option<Stage>,
    pub in_flight: Option<Stage>,
    /// Items of `in_flight` already written to the workspace
    #[serde(default)]
    pub completed_items: BTreeSet<String>,
    #[serde(default)]
    pub stats: BuildStats,
    /// Original site path → content-hashed site path
    #[serde(default)]
    pub rename_map: BTreeMap<String, String>,
    #[serde(default)]
    pub removed_scripts: BTreeSet<String>,
    #[serde(default)]
    pub document_write: BTreeSet<String>,
    /// Original image site path → WebP variant site path
    #[serde(default)]
    pub webp_variants: BTreeMap<String, String>,
    #[serde(default)]
    pub migration: Vec<MigrationResult>,
}

impl Checkpoint {
    pub fn new(build_id: Uuid, site_id: &str) -> Self {
        Self {
            build_id,
            site_id: site_id.to_string(),
            saved_at: Utc::now(),
            last_completed: None,
            in_flight: None,
            completed_items: BTreeSet::new(),
            stats: BuildStats::default(),
            rename_map: BTreeMap::new(),
            removed_scripts: BTreeSet::new(),
            document_write: BTreeSet::new(),
            webp_variants: BTreeMap::new(),
            migration: Vec::new(),
        }
    }

    pub fn begin_stage(&mut self, stage: Stage) {
        if self.in_flight != Some(stage) {
            self.in_flight = Some(stage);
            self.completed_items.clear();
        }
    }

    pub fn is_item_done(&self, stage: Stage, item: &str) -> bool {
        self.in_flight == Some(stage) && self.completed_items.contains(item)
    }

    pub fn complete_item(&mut self, item: &str) {
        self.completed_items.insert(item.to_string());
    }

    pub fn complete_stage(&mut self, stage: Stage) {
        self.last_completed = Some(stage);
        self.in_flight = None;
        self.completed_items.clear();
    }

    pub fn is_stale(&self, max_age: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.saved_at);
        age.to_std().map(|age| age > max_age).unwrap_or(false)
    }
}

/// Reads and writes checkpoints under the state directory
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    max_age: Duration,
}

impl CheckpointStore {
    pub fn new(state_dir: &Path, max_age: Duration) -> Self {
        Self {
            dir: state_dir.join("checkpoints"),
            max_age,
        }
    }

    fn path_for(&self, site_id: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(site_id.as_bytes());
        let hash = hex::encode(hasher.finalize())[..16].to_string();
        self.dir.join(format!("checkpoint_{}.json", hash))
    }

    /// Atomic write: temp file in the same directory, then rename
    pub async fn save(&self, checkpoint: &mut Checkpoint) -> Result<(), OptimizeError> {
        checkpoint.saved_at = Utc::now();
        fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&checkpoint.site_id);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_vec_pretty(checkpoint)?;
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| OptimizeError::Checkpoint(format!("{}: {}", path.display(), e)))?;
        debug!("💾 Checkpoint saved for {} ({:?})", checkpoint.site_id, checkpoint.last_completed);
        Ok(())
    }

    pub async fn load(&self, site_id: &str) -> Result<Option<Checkpoint>, OptimizeError> {
        let path = self.path_for(site_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).await?;
        match serde_json::from_str(&content) {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(e) => {
                warn!("⚠️  Unreadable checkpoint {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    /// Checkpoint to resume `build_id` from; stale or foreign ones are discarded
    pub async fn load_valid(&self, site_id: &str, build_id: Uuid) -> Result<Option<Checkpoint>, OptimizeError> {
        let Some(checkpoint) = self.load(site_id).await? else {
            return Ok(None);
        };
        if checkpoint.build_id != build_id {
            info!("🗑️  Discarding checkpoint of build {} for {}", checkpoint.build_id, site_id);
            self.clear(site_id).await?;
            return Ok(None);
        }
        if checkpoint.is_stale(self.max_age) {
            info!("🗑️  Discarding stale checkpoint for {} (saved {})", site_id, checkpoint.saved_at);
            self.clear(site_id).await?;
            return Ok(None);
        }
        Ok(Some(checkpoint))
    }

    pub async fn clear(&self, site_id: &str) -> Result<(), OptimizeError> {
        let path = self.path_for(site_id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> CheckpointStore {
        CheckpointStore::new(dir.path(), Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn test_save_and_resume_same_build() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let build_id = Uuid::new_v4();

        let mut checkpoint = Checkpoint::new(build_id, "acme");
        checkpoint.complete_stage(Stage::Css);
        checkpoint.begin_stage(Stage::Js);
        checkpoint.complete_item("index.html");
        checkpoint.rename_map.insert("css/site.css".into(), "css/site.1a2b3c4d.css".into());
        store.save(&mut checkpoint).await.unwrap();

        let loaded = store.load_valid("acme", build_id).await.unwrap().unwrap();
        assert_eq!(loaded.last_completed, Some(Stage::Css));
        assert!(loaded.is_item_done(Stage::Js, "index.html"));
        assert!(!loaded.is_item_done(Stage::Fonts, "index.html"));
        assert_eq!(loaded.rename_map.len(), 1);
        assert!(!store.path_for("acme").with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_foreign_build_is_discarded() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut checkpoint = Checkpoint::new(Uuid::new_v4(), "acme");
        store.save(&mut checkpoint).await.unwrap();

        assert!(store.load_valid("acme", Uuid::new_v4()).await.unwrap().is_none());
        assert!(store.load("acme").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_checkpoint_is_discarded() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path(), Duration::from_secs(60));
        let build_id = Uuid::new_v4();
        let mut checkpoint = Checkpoint::new(build_id, "acme");
        store.save(&mut checkpoint).await.unwrap();

        // Retrodata il file a mano
        let path = store.path_for("acme");
        let mut old: Checkpoint = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        old.saved_at = Utc::now() - chrono::Duration::hours(2);
        std::fs::write(&path, serde_json::to_string(&old).unwrap()).unwrap();

        assert!(store.load_valid("acme", build_id).await.unwrap().is_none());
    }

    #[test]
    fn test_begin_stage_resets_items_only_on_change() {
        let mut checkpoint = Checkpoint::new(Uuid::new_v4(), "acme");
        checkpoint.begin_stage(Stage::Fonts);
        checkpoint.complete_item("a.html");
        checkpoint.begin_stage(Stage::Fonts);
        assert!(checkpoint.is_item_done(Stage::Fonts, "a.html"));
        checkpoint.begin_stage(Stage::Images);
        assert!(checkpoint.completed_items.is_empty());
    }
}
