//! # Asset Identity & Migration
//!
//! ## Responsabilità:
//! - `scan`: trova i riferimenti alle immagini nelle dieci forme supportate
//! - `migrate`: deduplica, carica nel content store, idempotente
//! - `rewrite`: punta ogni riferimento alla variante di delivery giusta
//! - `fetch`: collaboratore per il download dei payload, con cache per-build
//! - `store`: collaboratore content store e varianti di delivery

pub mod fetch;
pub mod migrate;
pub mod rewrite;
pub mod scan;
pub mod store;

use crate::error::OptimizeError;

pub use fetch::{AssetFetcher, FetchCache, FetchedAsset};
pub use migrate::{attach_dimensions, is_total_failure, MigrationResult, MigrationStatus, Migrator};
pub use rewrite::{apply_loading_hints, replace_all_urls, replace_stylesheet_urls};
pub use scan::{scan, scan_stylesheet, scan_with, ImageRecord, ReferenceShape, ScanOptions};
pub use store::{ContentStore, Variant};

/// Why a single asset could not be migrated
#[derive(thiserror::Error, Debug)]
pub enum MigrationError {
    #[error("fetch of {url} failed: {source}")]
    Fetch { url: String, source: OptimizeError },

    #[error("upload of {key} failed: {source}")]
    Upload { key: String, source: OptimizeError },

    #[error("{url} is not an image ({content_type})")]
    NotAnImage { url: String, content_type: String },

    #[error("all {0} images failed to migrate")]
    TotalFailure(usize),
}

impl From<MigrationError> for OptimizeError {
    fn from(error: MigrationError) -> Self {
        OptimizeError::Migration(error.to_string())
    }
}
