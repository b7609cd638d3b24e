//! # Build Model
//!
//! Una build attraversa una macchina a stati fissa:
//!
//! ```text
//! queued → crawling → optimizing → deploying → success
//!    └────────┴───────────┴────────────┴──────→ failed | cancelled
//! ```
//!
//! ## Invarianti:
//! - `started_at` si imposta una sola volta, alla prima uscita da `queued`
//! - `completed_at` si imposta esattamente una volta, sulla transizione terminale
//! - Uno stato terminale non si lascia più
//! - Un job in stallo torna `queued` (stessa build, tentativo successivo)
//! - Il log strutturato è append-only

use crate::error::OptimizeError;
use crate::pipeline::stage::Stage;
use crate::settings::SettingsSnapshot;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Error text recorded when a site disappears under a build
pub const SITE_DELETED: &str = "Site deleted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Queued,
    Crawling,
    Optimizing,
    Deploying,
    Success,
    Failed,
    Cancelled,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }

    /// Forward moves, failure or cancellation from any live state, requeue after a stall
    pub fn can_transition_to(&self, next: BuildStatus) -> bool {
        use BuildStatus::*;
        if self.is_terminal() {
            return false;
        }
        match next {
            Failed | Cancelled => true,
            Queued => *self != Queued,
            Crawling => *self == Queued,
            Optimizing => *self == Crawling,
            Deploying => *self == Optimizing,
            Success => *self == Deploying,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Crawling => "crawling",
            Self::Optimizing => "optimizing",
            Self::Deploying => "deploying",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which pages a build covers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildScope {
    Full,
    Partial { paths: Vec<String> },
    SinglePage { path: String },
}

impl BuildScope {
    /// Site path filter; a full build keeps everything
    pub fn includes(&self, page_path: &str) -> bool {
        let page_path = page_path.trim_start_matches('/');
        match self {
            Self::Full => true,
            Self::Partial { paths } => paths.iter().any(|p| {
                let p = p.trim_start_matches('/');
                page_path == p || (p.ends_with('/') && page_path.starts_with(p))
            }),
            Self::SinglePage { path } => page_path == path.trim_start_matches('/'),
        }
    }
}

/// Original and optimized bytes for one asset family
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteCounters {
    pub original: u64,
    pub optimized: u64,
}

impl ByteCounters {
    pub fn add(&mut self, original: u64, optimized: u64) {
        self.original += original;
        self.optimized += optimized;
    }

    pub fn saved(&self) -> u64 {
        self.original.saturating_sub(self.optimized)
    }

    pub fn reduction_percent(&self) -> f64 {
        if self.original == 0 {
            0.0
        } else {
            (self.saved() as f64 / self.original as f64) * 100.0
        }
    }
}

/// Counters reported at the end of a build
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildStats {
    pub js: ByteCounters,
    pub css: ByteCounters,
    pub images: ByteCounters,
    pub facades_applied: u32,
    pub scripts_removed: u32,
    pub pages: u32,
    pub images_migrated: u32,
    /// Per-file optimizer failures that kept the original
    pub warnings: u32,
}

impl BuildStats {
    pub fn total_saved(&self) -> u64 {
        self.js.saved() + self.css.saved() + self.images.saved()
    }

    pub fn format_summary(&self) -> String {
        format!(
            "Pages: {} | CSS: -{:.1}% | JS: -{:.1}% | Images: -{:.1}% | Scripts removed: {} | Facades: {} | Saved: {}",
            self.pages,
            self.css.reduction_percent(),
            self.js.reduction_percent(),
            self.images.reduction_percent(),
            self.scripts_removed,
            self.facades_applied,
            crate::pipeline::workspace::format_size(self.total_saved())
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One line of the per-build structured log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildLogEntry {
    pub at: DateTime<Utc>,
    pub level: LogLevel,
    pub stage: Option<Stage>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: Uuid,
    pub site_id: String,
    pub scope: BuildScope,
    pub status: BuildStatus,
    pub stats: BuildStats,
    /// Frozen when the build starts, never re-read
    pub settings: Option<SettingsSnapshot>,
    pub log: Vec<BuildLogEntry>,
    pub error: Option<String>,
    /// Phase reached when the build failed
    pub failed_phase: Option<String>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub deploy_url: Option<String>,
}

impl Build {
    pub fn new(site_id: &str, scope: BuildScope) -> Self {
        Self {
            id: Uuid::new_v4(),
            site_id: site_id.to_string(),
            scope,
            status: BuildStatus::Queued,
            stats: BuildStats::default(),
            settings: None,
            log: Vec::new(),
            error: None,
            failed_phase: None,
            attempts: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            deploy_url: None,
        }
    }

    pub fn transition(&mut self, next: BuildStatus) -> Result<(), OptimizeError> {
        if !self.status.can_transition_to(next) {
            return Err(OptimizeError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        if self.started_at.is_none() && self.status == BuildStatus::Queued && next != BuildStatus::Queued {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        self.status = next;
        Ok(())
    }

    /// Terminal failure, keeping the phase that was running
    pub fn fail(&mut self, message: &str) -> Result<(), OptimizeError> {
        let phase = self.status;
        self.transition(BuildStatus::Failed)?;
        self.error = Some(message.to_string());
        self.failed_phase = Some(phase.to_string());
        self.push_log(LogLevel::Error, None, message);
        Ok(())
    }

    pub fn push_log(&mut self, level: LogLevel, stage: Option<Stage>, message: &str) {
        self.log.push(BuildLogEntry {
            at: Utc::now(),
            level,
            stage,
            message: message.to_string(),
        });
    }
}

/// Persistence collaborator for builds
#[async_trait]
pub trait BuildRepository: Send + Sync {
    async fn insert(&self, build: &Build) -> Result<()>;

    async fn update(&self, build: &Build) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<Build>>;

    async fn list_for_site(&self, site_id: &str) -> Result<Vec<Build>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_sets_timestamps_once() {
        let mut build = Build::new("site", BuildScope::Full);
        build.transition(BuildStatus::Crawling).unwrap();
        let started = build.started_at.unwrap();
        build.transition(BuildStatus::Optimizing).unwrap();
        build.transition(BuildStatus::Deploying).unwrap();
        build.transition(BuildStatus::Success).unwrap();

        assert_eq!(build.started_at, Some(started));
        assert!(build.completed_at.is_some());
        assert!(build.transition(BuildStatus::Failed).is_err());
    }

    #[test]
    fn test_illegal_jumps_are_rejected() {
        let mut build = Build::new("site", BuildScope::Full);
        assert!(matches!(
            build.transition(BuildStatus::Deploying),
            Err(OptimizeError::InvalidTransition { .. })
        ));
        assert_eq!(build.status, BuildStatus::Queued);
        assert!(build.started_at.is_none());
    }

    #[test]
    fn test_requeue_keeps_started_at() {
        let mut build = Build::new("site", BuildScope::Full);
        build.transition(BuildStatus::Crawling).unwrap();
        let started = build.started_at;
        build.transition(BuildStatus::Queued).unwrap();
        build.transition(BuildStatus::Crawling).unwrap();
        assert_eq!(build.started_at, started);
        assert!(build.completed_at.is_none());
    }

    #[test]
    fn test_fail_records_phase_and_message() {
        let mut build = Build::new("site", BuildScope::Full);
        build.transition(BuildStatus::Crawling).unwrap();
        build.fail("crawler returned no pages").unwrap();
        assert_eq!(build.status, BuildStatus::Failed);
        assert_eq!(build.failed_phase.as_deref(), Some("crawling"));
        assert_eq!(build.error.as_deref(), Some("crawler returned no pages"));
        assert_eq!(build.log.last().unwrap().level, LogLevel::Error);
    }

    #[test]
    fn test_scope_filter() {
        assert!(BuildScope::Full.includes("anything.html"));
        let partial = BuildScope::Partial { paths: vec!["/blog/".into(), "about.html".into()] };
        assert!(partial.includes("blog/post.html"));
        assert!(partial.includes("/about.html"));
        assert!(!partial.includes("index.html"));
        let single = BuildScope::SinglePage { path: "/index.html".into() };
        assert!(single.includes("index.html"));
        assert!(!single.includes("about.html"));
    }
}
