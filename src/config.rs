//! # Configuration Management Module
//!
//! Questo modulo gestisce la configurazione *operativa* del servizio (worker,
//! retry, lock, concorrenza). Le opzioni di ottimizzazione per sito vivono
//! invece nel modulo `settings`.
//!
//! ## Responsabilità:
//! - Definisce la struct `Config` con tutti i parametri di runtime
//! - Validazione che riporta tutti i campi non validi in una volta
//! - Caricamento/salvataggio da/verso file JSON
//! - Default sensati (2 worker, 5 tentativi, lock da 60s)
//!
//! ## Esempio:
//! ```rust
//! # use site_optimizer::config::Config;
//! let config = Config {
//!     workers: 4,
//!     upload_concurrency: 8,
//!     ..Default::default()
//! };
//! config.validate()?;
//! # Ok::<(), anyhow::Error>(())
//! ```

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime configuration for queue, pipeline and adapters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of builds executed in parallel
    pub workers: usize,
    /// Attempts per job before the build is left failed
    pub max_attempts: u32,
    /// First retry delay, doubled on every attempt
    pub backoff_base_ms: u64,
    /// Upper bound for a single retry delay
    pub backoff_cap_ms: u64,
    /// Lock held by a worker on an in-flight job
    pub lock_timeout_secs: u64,
    /// How often a worker renews its lock
    pub heartbeat_secs: u64,
    /// A build silent for this long stops renewing its lock and gets reaped
    pub stall_timeout_secs: u64,
    /// Checkpoints older than this are discarded
    pub checkpoint_max_age_secs: u64,
    /// Pages/assets processed in parallel within a stage
    pub stage_concurrency: usize,
    /// Concurrent uploads during migration
    pub upload_concurrency: usize,
    /// Attempts for a single font or image fetch
    pub fetch_retries: u32,
    /// Extra hosts never migrated (analytics, existing CDNs)
    pub skip_hosts: Vec<String>,
    /// Root of the per-site workspaces
    pub workspace_root: PathBuf,
    /// Checkpoints and JSON stores
    pub state_dir: PathBuf,
    /// Output progress and status as JSON for programmatic use
    pub json_output: bool,
}

impl Default for Config {
    fn default() -> Self {
        let state_dir = dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(".site-optimizer");
        Self {
            workers: 2,
            max_attempts: 5,
            backoff_base_ms: 500,
            backoff_cap_ms: 30_000,
            lock_timeout_secs: 60,
            heartbeat_secs: 15,
            stall_timeout_secs: 15 * 60,
            checkpoint_max_age_secs: 6 * 60 * 60,
            stage_concurrency: 8,
            upload_concurrency: 4,
            fetch_retries: 3,
            skip_hosts: Vec::new(),
            workspace_root: state_dir.join("workspaces"),
            state_dir,
            json_output: false,
        }
    }
}

impl Config {
    /// Validate every field, reporting all problems together
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.workers == 0 {
            problems.push("workers must be greater than 0".to_string());
        }
        if self.max_attempts == 0 {
            problems.push("max_attempts must be greater than 0".to_string());
        }
        if self.backoff_base_ms == 0 || self.backoff_base_ms > self.backoff_cap_ms {
            problems.push("backoff_base_ms must be > 0 and <= backoff_cap_ms".to_string());
        }
        if self.heartbeat_secs == 0 || self.heartbeat_secs >= self.lock_timeout_secs {
            problems.push("heartbeat_secs must be > 0 and shorter than lock_timeout_secs".to_string());
        }
        if self.stall_timeout_secs == 0 {
            problems.push("stall_timeout_secs must be greater than 0".to_string());
        }
        if self.stage_concurrency == 0 {
            problems.push("stage_concurrency must be greater than 0".to_string());
        }
        if self.upload_concurrency == 0 {
            problems.push("upload_concurrency must be greater than 0".to_string());
        }
        if self.fetch_retries == 0 {
            problems.push("fetch_retries must be greater than 0".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!("Invalid configuration: {}", problems.join("; ")))
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn checkpoint_max_age(&self) -> Duration {
        Duration::from_secs(self.checkpoint_max_age_secs)
    }

    /// Load configuration from file, defaults when the file is missing
    pub async fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path).await?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_validation_reports_every_field() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.workers = 0;
        config.heartbeat_secs = config.lock_timeout_secs;
        config.stall_timeout_secs = 0;
        let message = config.validate().unwrap_err().to_string();
        assert!(message.contains("workers"));
        assert!(message.contains("heartbeat_secs"));
        assert!(message.contains("stall_timeout_secs"));
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.workers, 2);
        assert_eq!(config.max_attempts, 5);
        assert!(config.state_dir.ends_with(".site-optimizer"));
        assert!(config.workspace_root.starts_with(&config.state_dir));
        assert!(!config.json_output);
    }

    #[tokio::test]
    async fn test_config_save_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.json");

        let original_config = Config {
            workers: 3,
            upload_concurrency: 9,
            skip_hosts: vec!["cdn.example.net".to_string()],
            ..Default::default()
        };
        original_config.save_to_file(&config_path).await.unwrap();

        let loaded_config = Config::from_file(&config_path).await.unwrap();
        assert_eq!(loaded_config.workers, 3);
        assert_eq!(loaded_config.upload_concurrency, 9);
        assert_eq!(loaded_config.skip_hosts, vec!["cdn.example.net"]);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = tokio_test::block_on(Config::from_file(&temp_dir.path().join("nope.json"))).unwrap();
        assert_eq!(config.workers, 2);
    }
}
