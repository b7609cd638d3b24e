//! # Error Types Module
//!
//! Questo modulo definisce tutti i tipi di errore custom della pipeline.
//!
//! ## Responsabilità:
//! - Definisce `OptimizeError` per categorizzare gli errori di build
//! - Definisce `SettingsValidationError`, che riporta TUTTI i campi non validi
//! - Classifica gli errori in transitori, fatali per lo stage, o per singolo file
//!
//! ## Tassonomia:
//! - **Configurazione**: payload di settings non valido (sincrono, mai applicato a metà)
//! - **I/O transitorio**: fetch di font/immagini, ritentati e poi degradati
//! - **Ottimizzatore**: un singolo file fallisce, si tiene l'originale
//! - **Fatale per lo stage**: crawl, migrazione totale, workspace non disponibile
//! - **Infrastruttura worker**: lock scaduto, job riaccodato
//!
//! ## Esempio:
//! ```rust
//! # use site_optimizer::error::OptimizeError;
//! # fn check(pages: Vec<String>) -> Result<(), OptimizeError> {
//! if pages.is_empty() {
//!     return Err(OptimizeError::Crawl("crawler returned no pages".to_string()));
//! }
//! # Ok(())
//! # }
//! ```

use serde::Serialize;
use std::fmt;

/// Custom error types for the build pipeline
#[derive(thiserror::Error, Debug)]
pub enum OptimizeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Settings(#[from] SettingsValidationError),

    #[error("Crawl failed: {0}")]
    Crawl(String),

    #[error("Asset migration failed: {0}")]
    Migration(String),

    #[error("Workspace unavailable: {0}")]
    Workspace(String),

    #[error("Fetch failed for {url}: {message}")]
    Fetch { url: String, message: String },

    #[error("Content store error: {0}")]
    Store(String),

    #[error("Deployment failed: {0}")]
    Deploy(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Invalid build transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("{0}")]
    Cancelled(String),

    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl OptimizeError {
    /// Errors that abort the whole build instead of a single file
    pub fn is_stage_fatal(&self) -> bool {
        matches!(
            self,
            Self::Crawl(_)
                | Self::Migration(_)
                | Self::Workspace(_)
                | Self::Deploy(_)
                | Self::Cancelled(_)
        )
    }

    /// Errors worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Fetch { .. } | Self::Store(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

/// What is wrong with a single settings leaf
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SettingsProblem {
    UnknownKey,
    WrongType { expected: String, found: String },
    OutOfRange { min: u64, max: u64 },
    UnknownVariant { allowed: Vec<String> },
}

impl fmt::Display for SettingsProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownKey => write!(f, "unknown key"),
            Self::WrongType { expected, found } => write!(f, "expected {}, found {}", expected, found),
            Self::OutOfRange { min, max } => write!(f, "must be between {} and {}", min, max),
            Self::UnknownVariant { allowed } => write!(f, "must be one of: {}", allowed.join(", ")),
        }
    }
}

/// One offending path in a settings payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettingsIssue {
    pub path: String,
    pub problem: SettingsProblem,
}

/// Rejected settings payload, with every offending path collected
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettingsValidationError {
    pub issues: Vec<SettingsIssue>,
}

impl SettingsValidationError {
    pub fn paths(&self) -> Vec<&str> {
        self.issues.iter().map(|i| i.path.as_str()).collect()
    }
}

impl fmt::Display for SettingsValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid settings ({} issue(s))", self.issues.len())?;
        for issue in &self.issues {
            write!(f, "; {}: {}", issue.path, issue.problem)?;
        }
        Ok(())
    }
}

impl std::error::Error for SettingsValidationError {}
