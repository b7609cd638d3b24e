//! # JSON Output Module
//!
//! Questo modulo gestisce l'output strutturato in JSON per l'uso programmatico della CLI.
//!
//! ## Responsabilità:
//! - Traduce gli eventi di build in una riga JSON ciascuno su stdout
//! - Fornisce interfaccia standardizzata per comunicazione inter-processo
//!
//! ## Tipi di messaggi:
//! - `start`: Inizio della build (sito, directory di input e output)
//! - `phase`: Cambio di stato o di stage
//! - `progress`: Item completato all'interno di uno stage
//! - `log`: Riga del log strutturato della build
//! - `complete`: Fine build con stato, errore e statistiche finali
//! - `error`: Errore prima che la build possa partire

use crate::pipeline::build::{BuildStats, BuildStatus, LogLevel};
use crate::pipeline::events::{BuildEvent, BuildEventKind};
use crate::pipeline::stage::Stage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Tipo di messaggio JSON
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum JsonMessage {
    /// Inizio della build
    #[serde(rename = "start")]
    Start {
        site_id: String,
        input_dir: PathBuf,
        output_dir: PathBuf,
    },

    /// Cambio di stato o di stage
    #[serde(rename = "phase")]
    Phase {
        build_id: Uuid,
        sequence: u64,
        status: BuildStatus,
        stage: Option<Stage>,
    },

    /// Progresso corrente dello stage
    #[serde(rename = "progress")]
    Progress {
        build_id: Uuid,
        sequence: u64,
        stage: Stage,
        item: String,
        current: usize,
        total: usize,
        percentage: f64,
    },

    /// Riga di log della build
    #[serde(rename = "log")]
    Log {
        build_id: Uuid,
        sequence: u64,
        level: LogLevel,
        stage: Option<Stage>,
        message: String,
    },

    /// Build terminata
    #[serde(rename = "complete")]
    Complete {
        build_id: Uuid,
        sequence: u64,
        status: BuildStatus,
        error: Option<String>,
        deploy_url: Option<String>,
        stats: BuildStats,
        total_bytes_saved: u64,
    },

    /// Errore generale
    #[serde(rename = "error")]
    Error {
        message: String,
        details: Option<String>,
    },
}

impl JsonMessage {
    /// Emette il messaggio JSON su stdout
    pub fn emit(&self) {
        if let Ok(json) = serde_json::to_string(self) {
            println!("{}", json);
        }
    }

    /// Crea un messaggio di inizio
    pub fn start(site_id: &str, input_dir: PathBuf, output_dir: PathBuf) -> Self {
        Self::Start {
            site_id: site_id.to_string(),
            input_dir,
            output_dir,
        }
    }

    /// Crea un messaggio di errore
    pub fn error(message: String, details: Option<String>) -> Self {
        Self::Error { message, details }
    }
}

impl From<&BuildEvent> for JsonMessage {
    fn from(event: &BuildEvent) -> Self {
        let build_id = event.build_id;
        let sequence = event.sequence;
        match &event.kind {
            BuildEventKind::PhaseChanged { status, stage } => Self::Phase {
                build_id,
                sequence,
                status: *status,
                stage: *stage,
            },
            BuildEventKind::AssetProgress { stage, item, done, total } => {
                let percentage = if *total > 0 {
                    (*done as f64 / *total as f64) * 100.0
                } else {
                    0.0
                };
                Self::Progress {
                    build_id,
                    sequence,
                    stage: *stage,
                    item: item.clone(),
                    current: *done,
                    total: *total,
                    percentage,
                }
            }
            BuildEventKind::Log { level, stage, message } => Self::Log {
                build_id,
                sequence,
                level: *level,
                stage: *stage,
                message: message.clone(),
            },
            BuildEventKind::Completed { status, error, deploy_url, stats } => Self::Complete {
                build_id,
                sequence,
                status: *status,
                error: error.clone(),
                deploy_url: deploy_url.clone(),
                total_bytes_saved: stats.total_saved(),
                stats: stats.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_progress_message_has_percentage() {
        let event = BuildEvent {
            build_id: Uuid::nil(),
            sequence: 7,
            at: Utc::now(),
            kind: BuildEventKind::AssetProgress { stage: Stage::Images, item: "img/a.png".into(), done: 1, total: 4 },
        };
        let json = serde_json::to_value(JsonMessage::from(&event)).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["percentage"], 25.0);
        assert_eq!(json["stage"], "images");
    }

    #[test]
    fn test_complete_message_carries_error() {
        let event = BuildEvent {
            build_id: Uuid::nil(),
            sequence: 9,
            at: Utc::now(),
            kind: BuildEventKind::Completed {
                status: BuildStatus::Failed,
                error: Some("Site deleted".into()),
                deploy_url: None,
                stats: BuildStats::default(),
            },
        };
        let json = serde_json::to_value(JsonMessage::from(&event)).unwrap();
        assert_eq!(json["type"], "complete");
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"], "Site deleted");
    }
}
