//! # Adapters
//!
//! Implementazioni di riferimento dei collaboratori:
//! - `memory`: persistenze in memoria (test, esecuzioni one-shot)
//! - `fs`: JSON sotto la state directory, crawl/deploy su directory
//! - `http`: fetcher `reqwest`

pub mod fs;
pub mod http;
pub mod memory;

pub use fs::{
    DirectoryContentStore, DirectoryCrawlSource, DirectoryDeployer, JsonBuildRepository, JsonSettingsRepository,
    LocalFirstFetcher,
};
pub use http::HttpFetcher;
pub use memory::MemoryStore;
