//! # Site Optimizer - Main Entry Point
//!
//! Questo è il punto di ingresso principale dell'applicazione.
//!
//! ## Responsabilità:
//! - Parsing degli argomenti della command line con `clap`
//! - Inizializzazione del sistema di logging con `tracing`
//! - Validazione degli input dell'utente
//! - Montaggio dei collaboratori (crawl da directory, deploy su directory)
//! - Invio della build alla coda e attesa dello stato terminale
//!
//! ## Flusso di esecuzione:
//! 1. Parsa gli argomenti CLI (directory, output, settings, scope, etc.)
//! 2. Configura il logging (INFO o DEBUG a seconda del flag verbose, `RUST_LOG` vince)
//! 3. Valida che la directory del sito esista
//! 4. Applica eventuali settings del sito dal file JSON
//! 5. Avvia il worker pool, mette in coda la build e attende che termini
//!
//! ## Esempio di utilizzo:
//! ```bash
//! site-optimizer ./mirror -o ./dist --base-url https://acme.test --purge-test-mode --verbose
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use site_optimizer::adapters::{
    DirectoryContentStore, DirectoryCrawlSource, DirectoryDeployer, HttpFetcher, JsonBuildRepository,
    JsonSettingsRepository, LocalFirstFetcher, MemoryStore,
};
use site_optimizer::json_output::JsonMessage;
use site_optimizer::migration::ContentStore;
use site_optimizer::pipeline::{BuildRepository, ProgressTracker};
use site_optimizer::settings::SettingsRepository;
use site_optimizer::{
    BuildOrchestrator, BuildQueue, BuildScope, BuildStatus, Config, EventHub, PipelineDeps, SettingsStore, Site,
    SiteService, WorkerPool,
};

#[derive(Parser)]
#[command(name = "site-optimizer")]
#[command(about = "Optimize a crawled website into a deployable static copy")]
struct Args {
    /// Directory containing the crawled site
    site_directory: PathBuf,

    /// Output directory for the optimized site
    #[arg(short, long)]
    output: PathBuf,

    /// Public origin of the site, used to resolve absolute references
    #[arg(short, long, default_value = "https://example.com")]
    base_url: String,

    /// Site identifier (defaults to the directory name)
    #[arg(long)]
    site_id: Option<String>,

    /// JSON file with the site settings override
    #[arg(short, long)]
    settings: Option<PathBuf>,

    /// JSON configuration file (workers, retries, directories)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Only rebuild these pages (repeatable); a trailing `/` selects a directory
    #[arg(short, long)]
    page: Vec<String>,

    /// Report what CSS purge would remove without removing it
    #[arg(long)]
    purge_test_mode: bool,

    /// Migrate images into this directory acting as content store
    #[arg(long)]
    migrate_to: Option<PathBuf>,

    /// Public base URL of the migrated images
    #[arg(long, default_value = "/media")]
    media_base_url: String,

    /// Number of parallel workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Keep settings and builds under the state directory
    #[arg(long)]
    persist: bool,

    /// Output progress and status as JSON for programmatic use
    #[arg(long)]
    json: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn scope_from(pages: &[String]) -> BuildScope {
    match pages {
        [] => BuildScope::Full,
        [single] if !single.ends_with('/') => BuildScope::SinglePage { path: single.clone() },
        many => BuildScope::Partial { paths: many.to_vec() },
    }
}

fn with_purge_test_mode(mut settings: Value) -> Value {
    if !settings.is_object() {
        settings = json!({});
    }
    if let Some(root) = settings.as_object_mut() {
        let css = root.entry("css").or_insert_with(|| json!({}));
        if let Some(css) = css.as_object_mut() {
            css.insert("purge_test_mode".to_string(), Value::Bool(true));
        }
    }
    settings
}

async fn run(args: Args) -> Result<()> {
    if !args.site_directory.is_dir() {
        return Err(anyhow::anyhow!("Site directory does not exist: {}", args.site_directory.display()));
    }

    let mut config = match &args.config {
        Some(path) => Config::from_file(path).await?,
        None => Config::default(),
    };
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    config.json_output = args.json;
    config.validate()?;

    let site_id = args.site_id.clone().unwrap_or_else(|| {
        args.site_directory
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "site".to_string())
    });
    let site = Site::new(&site_id, &args.base_url);

    if config.json_output {
        JsonMessage::start(&site_id, args.site_directory.clone(), args.output.clone()).emit();
    }

    let (settings_repo, builds): (Arc<dyn SettingsRepository>, Arc<dyn BuildRepository>) = if args.persist {
        (
            Arc::new(JsonSettingsRepository::new(&config.state_dir)),
            Arc::new(JsonBuildRepository::new(&config.state_dir)),
        )
    } else {
        let memory = Arc::new(MemoryStore::new());
        (memory.clone(), memory)
    };
    let settings = Arc::new(SettingsStore::new(settings_repo));

    let override_value = match &args.settings {
        Some(path) => {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading settings file {}", path.display()))?;
            Some(serde_json::from_str::<Value>(&content).context("parsing settings file")?)
        }
        None => None,
    };
    let override_value = match (override_value, args.purge_test_mode) {
        (Some(value), true) => Some(with_purge_test_mode(value)),
        (None, true) => Some(with_purge_test_mode(json!({}))),
        (value, false) => value,
    };
    if let Some(value) = override_value {
        settings.update_site(&site_id, value, "cli").await?;
    }

    let http = Arc::new(HttpFetcher::new(Duration::from_secs(30))?);
    let content_store: Option<Arc<dyn ContentStore>> = args
        .migrate_to
        .as_ref()
        .map(|dir| Arc::new(DirectoryContentStore::new(dir, &args.media_base_url)) as Arc<dyn ContentStore>);

    let events = Arc::new(EventHub::new().with_sink(Arc::new(ProgressTracker::new(config.json_output))));
    let deps = PipelineDeps {
        crawler: Arc::new(DirectoryCrawlSource::new(&args.site_directory)),
        fetcher: Arc::new(LocalFirstFetcher::new(&args.base_url, &args.site_directory, http)),
        content_store,
        deployer: Arc::new(DirectoryDeployer::new(&args.output)),
        builds,
        settings,
        events,
    };

    let queue = Arc::new(BuildQueue::from_config(&config));
    let orchestrator = Arc::new(BuildOrchestrator::new(deps, config));
    let pool = Arc::new(WorkerPool::new(queue, orchestrator));
    pool.start();

    let service = SiteService::new(pool.clone());
    let build = service.submit_build(&site, scope_from(&args.page)).await?;
    info!("🚀 Build {} submitted for {}", build.id, site_id);

    let build = loop {
        match service.build(build.id).await? {
            Some(current) if current.status.is_terminal() => break current,
            Some(_) => tokio::time::sleep(Duration::from_millis(200)).await,
            None => return Err(anyhow::anyhow!("Build {} disappeared", build.id)),
        }
    };
    pool.shutdown().await;

    match build.status {
        BuildStatus::Success => {
            info!("✅ {} | deployed to {}", build.stats.format_summary(), build.deploy_url.unwrap_or_default());
            Ok(())
        }
        status => Err(anyhow::anyhow!(
            "Build {} ended {}: {}",
            build.id,
            status,
            build.error.unwrap_or_default()
        )),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let json = args.json;
    let result = run(args).await;
    if let Err(e) = &result {
        if json {
            JsonMessage::error(e.to_string(), Some(format!("{:#}", e))).emit();
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_from_pages() {
        assert_eq!(scope_from(&[]), BuildScope::Full);
        assert_eq!(
            scope_from(&["index.html".to_string()]),
            BuildScope::SinglePage { path: "index.html".into() }
        );
        assert_eq!(
            scope_from(&["blog/".to_string()]),
            BuildScope::Partial { paths: vec!["blog/".into()] }
        );
    }

    #[test]
    fn test_purge_test_mode_is_merged() {
        let merged = with_purge_test_mode(json!({"css": {"minify": false}, "js": {}}));
        assert_eq!(merged["css"]["purge_test_mode"], true);
        assert_eq!(merged["css"]["minify"], false);
        assert_eq!(with_purge_test_mode(Value::Null)["css"]["purge_test_mode"], true);
    }
}
