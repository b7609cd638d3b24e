//! # Build Events
//!
//! Flusso ordinato di eventi tipizzati per ogni build.
//!
//! ## Responsabilità:
//! - Numero di sequenza monotono per build, assegnato alla pubblicazione
//! - Un topic `broadcast` per build, chiuso al completamento
//! - Inoltro verso sink sincroni (progress bar, output JSON)

use crate::pipeline::build::{BuildStats, BuildStatus, LogLevel};
use crate::pipeline::stage::Stage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use uuid::Uuid;

const TOPIC_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BuildEventKind {
    PhaseChanged {
        status: BuildStatus,
        stage: Option<Stage>,
    },
    AssetProgress {
        stage: Stage,
        item: String,
        done: usize,
        total: usize,
    },
    Log {
        level: LogLevel,
        stage: Option<Stage>,
        message: String,
    },
    Completed {
        status: BuildStatus,
        error: Option<String>,
        deploy_url: Option<String>,
        stats: BuildStats,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildEvent {
    pub build_id: Uuid,
    pub sequence: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: BuildEventKind,
}

/// Synchronous consumer of published events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &BuildEvent);
}

struct Topic {
    sender: broadcast::Sender<BuildEvent>,
    next_sequence: u64,
}

impl Topic {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(TOPIC_CAPACITY);
        Self { sender, next_sequence: 0 }
    }
}

/// Per-build typed topics
#[derive(Default)]
pub struct EventHub {
    topics: Mutex<HashMap<Uuid, Topic>>,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirror every event to `sink` as well
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Receiver for events published from now on
    pub fn subscribe(&self, build_id: Uuid) -> broadcast::Receiver<BuildEvent> {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics.entry(build_id).or_insert_with(Topic::new).sender.subscribe()
    }

    /// Stamp and publish; returns the event as delivered
    pub fn publish(&self, build_id: Uuid, kind: BuildEventKind) -> BuildEvent {
        let event = {
            let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
            let topic = topics.entry(build_id).or_insert_with(Topic::new);
            let event = BuildEvent {
                build_id,
                sequence: topic.next_sequence,
                at: Utc::now(),
                kind,
            };
            topic.next_sequence += 1;
            // Nessun subscriber non è un errore
            let _ = topic.sender.send(event.clone());
            event
        };
        for sink in &self.sinks {
            sink.emit(&event);
        }
        event
    }

    /// Tear down the topic; subscribers drain what is buffered, then see `Closed`
    pub fn close(&self, build_id: Uuid) {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics.remove(&build_id);
    }

    pub fn topic_count(&self) -> usize {
        self.topics.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
