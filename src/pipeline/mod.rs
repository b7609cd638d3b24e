//! # Pipeline Orchestrator
//!
//! - `build`: modello della build e macchina a stati
//! - `stage`: ordine fisso degli stage
//! - `events`: eventi tipizzati e topic per build
//! - `checkpoint`: persistenza dell'avanzamento per la ripresa
//! - `workspace`: albero di lavoro esclusivo per sito
//! - `page_task`: lavoro per singolo item di uno stage
//! - `orchestrator`: esecuzione di una build end-to-end
//! - `progress_tracker`: sink di eventi per la CLI
//! - `collaborators`: crawl e deploy

pub mod build;
pub mod checkpoint;
pub mod collaborators;
pub mod events;
pub mod orchestrator;
pub mod page_task;
pub mod progress_tracker;
pub mod stage;
pub mod workspace;

pub use build::{Build, BuildLogEntry, BuildRepository, BuildScope, BuildStats, BuildStatus, ByteCounters, LogLevel, SITE_DELETED};
pub use checkpoint::{Checkpoint, CheckpointStore};
pub use collaborators::{CrawlSource, CrawledAsset, CrawledPage, Deployer, Site};
pub use events::{BuildEvent, BuildEventKind, EventHub, EventSink};
pub use orchestrator::{BuildOrchestrator, CancelReason, CancelReceiver, PipelineDeps};
pub use progress_tracker::ProgressTracker;
pub use stage::Stage;
pub use workspace::{format_size, FileKind, WorkspaceLease, WorkspaceManager};
