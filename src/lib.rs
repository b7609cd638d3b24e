//! # Site Optimizer Library
//!
//! Questo è il modulo principale della libreria che espone tutte le API pubbliche.
//!
//! ## Responsabilità:
//! - Definisce la struttura modulare dell'applicazione
//! - Espone i tipi e le funzioni principali tramite re-exports
//! - Fornisce un'interfaccia pulita per il main.rs e per altri consumatori
//!
//! ## Architettura dei moduli:
//! - `config`: Configurazione runtime (worker, retry, lock, directory)
//! - `error`: Tipi di errore custom per le diverse operazioni
//! - `settings`: Override gerarchici, risoluzione, history e rollback
//! - `classify`: Classificatori euristici (video, widget, LCP, above-fold)
//! - `markup`: Tokenizer leggero per riscrivere HTML e CSS senza riformattarli
//! - `optimizer`: Ottimizzatori per tipo di asset (CSS, JS, font, immagini, SVG, facade, SEO, hint)
//! - `migration`: Scansione, upload e riscrittura delle immagini verso il content store
//! - `pipeline`: Orchestratore della build a stage con checkpoint
//! - `queue`: Coda delle build, worker pool, coda seriale e scheduler
//! - `adapters`: Implementazioni di riferimento dei collaboratori
//! - `service`: Facciata per le superfici esterne
//! - `progress` / `json_output`: Feedback per la CLI
//!
//! ## Utilizzo:
//! ```rust,ignore
//! use site_optimizer::{BuildOrchestrator, BuildScope, Config, Site};
//!
//! let orchestrator = BuildOrchestrator::new(deps, Config::default());
//! let build = orchestrator.execute(&Site::new("acme", "https://acme.test"), BuildScope::Full).await?;
//! ```

pub mod adapters;
pub mod classify;
pub mod config;
pub mod error;
pub mod json_output;
pub mod markup;
pub mod migration;
pub mod optimizer;
pub mod pipeline;
pub mod progress;
pub mod queue;
pub mod service;
pub mod settings;

pub use config::Config;
pub use error::OptimizeError;
pub use pipeline::{Build, BuildOrchestrator, BuildScope, BuildStatus, EventHub, PipelineDeps, Site, Stage};
pub use queue::{BuildQueue, WorkerPool};
pub use service::SiteService;
pub use settings::{ResolvedSettings, SettingsStore};
