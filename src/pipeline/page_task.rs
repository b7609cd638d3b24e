//! # Page Task Module
//!
//! Worker per l'elaborazione di un singolo item (pagina o asset) di uno stage.
//! Separato dall'orchestratore per maggiore modularità.
//!
//! ## Responsabilità:
//! - Elenca gli item di ogni stage, in passate ordinate (prima gli asset, poi le pagine)
//! - In `finalize` i fogli di stile ricevono il nome hash del contenuto finale,
//!   a strati: un foglio importato viene rinominato prima di chi lo importa
//! - Applica l'ottimizzatore giusto leggendo e scrivendo nel workspace
//! - Un ottimizzatore che fallisce non ferma lo stage: si tiene l'originale
//! - Concorrenza delle immagini per classe di dimensione, con timeout
//!
//! Gli errori restituiti sono solo quelli del workspace (fatali per lo stage).

use crate::error::OptimizeError;
use crate::markup::{self, css_urls, rewrite_css_urls, rewrite_open_tags};
use crate::migration::{
    apply_loading_hints, attach_dimensions, replace_all_urls, replace_stylesheet_urls, scan_with, AssetFetcher,
    FetchCache, MigrationResult, ScanOptions,
};
use crate::optimizer::css::{optimize_css, CssContext, UsedSelectors};
use crate::optimizer::facades::{apply_video_facades, apply_widget_facades};
use crate::optimizer::fonts::self_host_fonts;
use crate::optimizer::hints::inject_resource_hints;
use crate::optimizer::images::{optimize_image, webp_path, wrap_in_picture, ProcessedImage};
use crate::optimizer::js::{dead_script_category, optimize_js, optimize_script_tags, uses_document_write, ScriptPageContext};
use crate::optimizer::seo::inject_seo;
use crate::optimizer::svg::build_sprites;
use crate::optimizer::{hashed_filename, resolve_site_path, OptimizeOutcome, OptimizeStats};
use crate::pipeline::checkpoint::Checkpoint;
use crate::pipeline::collaborators::Site;
use crate::pipeline::stage::Stage;
use crate::pipeline::workspace::{FileKind, WorkspaceLease};
use crate::queue::backoff::RetryPolicy;
use crate::settings::{ImageSettings, ResolvedSettings, SettingsSnapshot};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Asset,
    Page,
}

/// One unit of work inside a stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    /// Checkpoint key, unique within the stage
    pub key: String,
    pub path: String,
    pub kind: ItemKind,
}

impl WorkItem {
    pub fn asset(path: &str) -> Self {
        Self { key: format!("asset:{}", path), path: path.to_string(), kind: ItemKind::Asset }
    }

    pub fn page(path: &str) -> Self {
        Self { key: format!("page:{}", path), path: path.to_string(), kind: ItemKind::Page }
    }
}

/// Ordered passes for `stage`; a pass starts only after the previous one finished
pub async fn work_passes(
    stage: Stage,
    workspace: &WorkspaceLease,
    checkpoint: &Checkpoint,
) -> Result<Vec<Vec<WorkItem>>, OptimizeError> {
    let hashed: HashSet<&String> = checkpoint.rename_map.values().collect();
    let webp: HashSet<&String> = checkpoint.webp_variants.values().collect();
    let files = workspace.list_files();
    let of_kind = |kind: FileKind| -> Vec<&String> { files.iter().filter(|p| FileKind::of(p) == kind).collect() };

    let pages: Vec<WorkItem> = of_kind(FileKind::Page).into_iter().map(|p| WorkItem::page(p)).collect();
    // I file già rinominati con hash appartengono a un item completato
    let fresh = |kind: FileKind| -> Vec<WorkItem> {
        of_kind(kind)
            .into_iter()
            .filter(|p| !hashed.contains(p) && !webp.contains(p))
            .map(|p| WorkItem::asset(p))
            .collect()
    };
    let stylesheets: Vec<WorkItem> = of_kind(FileKind::Stylesheet).into_iter().map(|p| WorkItem::asset(p)).collect();

    let passes = match stage {
        Stage::Css => vec![fresh(FileKind::Stylesheet)],
        Stage::Js => vec![fresh(FileKind::Script), pages],
        Stage::Images => vec![fresh(FileKind::Image), pages],
        Stage::Migration => vec![stylesheets, pages],
        Stage::Finalize => {
            let mut passes = stylesheet_layers(workspace, &checkpoint.rename_map).await?;
            passes.push(pages);
            passes
        }
        Stage::Fonts
        | Stage::VideoFacades
        | Stage::WidgetFacades
        | Stage::Seo
        | Stage::ResourceHints => vec![pages],
    };
    Ok(passes)
}

/// Stylesheets grouped so every sheet comes after the local sheets it references
async fn stylesheet_layers(
    workspace: &WorkspaceLease,
    rename_map: &BTreeMap<String, String>,
) -> Result<Vec<Vec<WorkItem>>, OptimizeError> {
    let sheets = workspace.files_of(FileKind::Stylesheet);
    let current: HashSet<&String> = sheets.iter().collect();
    // nome originale o attuale → file presente nel workspace
    let mut names: HashMap<&str, &str> = sheets.iter().map(|s| (s.as_str(), s.as_str())).collect();
    for (original, hashed) in rename_map {
        if current.contains(hashed) {
            names.insert(original.as_str(), hashed.as_str());
        }
    }

    let mut deps: BTreeMap<&str, HashSet<&str>> = BTreeMap::new();
    for sheet in &sheets {
        let css = workspace.read_string(sheet).await?;
        let imports = css_urls(&css)
            .iter()
            .filter_map(|reference| resolve_site_path(sheet, reference))
            .filter_map(|target| names.get(target.as_str()).copied())
            .filter(|target| *target != sheet.as_str())
            .collect();
        deps.insert(sheet.as_str(), imports);
    }

    let mut layers = Vec::new();
    while !deps.is_empty() {
        let mut ready: Vec<&str> = deps
            .iter()
            .filter(|(_, imports)| imports.iter().all(|i| !deps.contains_key(i)))
            .map(|(sheet, _)| *sheet)
            .collect();
        if ready.is_empty() {
            // ciclo di import: il resto va in un'unica passata
            ready = deps.keys().copied().collect();
        }
        for sheet in &ready {
            deps.remove(sheet);
        }
        layers.push(ready.into_iter().map(WorkItem::asset).collect());
    }
    Ok(layers)
}

/// What one item contributed to the build
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemOutcome {
    pub original_bytes: u64,
    pub optimized_bytes: u64,
    pub renamed: Option<(String, String)>,
    pub removed_script: Option<String>,
    pub document_write: Option<String>,
    pub webp: Option<(String, String)>,
    pub facades_applied: u32,
    pub scripts_removed: u32,
    pub notes: Vec<String>,
    /// Optimizer failures; the original content was kept
    pub warnings: Vec<String>,
}

impl ItemOutcome {
    fn from_stats(path: &str, stats: &OptimizeStats) -> Self {
        let mut outcome = Self {
            original_bytes: stats.original_bytes,
            optimized_bytes: stats.optimized_bytes,
            facades_applied: stats.facades_applied,
            scripts_removed: stats.scripts_removed,
            ..Default::default()
        };
        outcome.notes.extend(stats.notes.iter().map(|n| format!("{}: {}", path, n)));
        if !stats.would_remove.is_empty() {
            outcome.notes.push(format!(
                "{}: purge test mode, would remove {}",
                path,
                stats.would_remove.join(", ")
            ));
        }
        if !stats.removed.is_empty() {
            outcome.notes.push(format!("{}: removed {}", path, stats.removed.len()));
        }
        outcome
    }
}

/// Classificazione dei file per dimensione per gestire la concorrenza
#[derive(Debug, Clone, Copy, PartialEq)]
enum FileSize {
    Small,  // < 5MB
    Medium, // 5MB - 20MB
    Large,  // > 20MB
}

impl FileSize {
    fn classify(size_bytes: usize) -> Self {
        const MB_5: usize = 5 * 1024 * 1024;
        const MB_20: usize = 20 * 1024 * 1024;

        if size_bytes < MB_5 {
            Self::Small
        } else if size_bytes < MB_20 {
            Self::Medium
        } else {
            Self::Large
        }
    }

    fn timeout(&self) -> Duration {
        match self {
            Self::Small => Duration::from_secs(120),
            Self::Medium => Duration::from_secs(300),
            Self::Large => Duration::from_secs(1200),
        }
    }
}

/// CPU-bound image work: one semaphore per size class, decoding on the blocking pool
pub struct ImageConcurrency {
    small: Arc<Semaphore>,
    medium: Arc<Semaphore>,
    large: Arc<Semaphore>,
}

impl ImageConcurrency {
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        debug!(
            "🔧 Image concurrency: {} small, {} medium, 1 large",
            max_workers,
            (max_workers / 2).max(1)
        );
        Self {
            small: Arc::new(Semaphore::new(max_workers)),
            medium: Arc::new(Semaphore::new((max_workers / 2).max(1))),
            large: Arc::new(Semaphore::new(1)),
        }
    }

    /// Optimize on the blocking pool; the error text is what gets logged as a warning
    pub async fn optimize(&self, bytes: Vec<u8>, path: &str, settings: ImageSettings) -> Result<ProcessedImage, String> {
        let size_class = FileSize::classify(bytes.len());
        let semaphore = match size_class {
            FileSize::Small => &self.small,
            FileSize::Medium => &self.medium,
            FileSize::Large => {
                info!("🔒 Large image {} - processing alone", path);
                &self.large
            }
        };
        let permit = semaphore.clone().acquire_owned().await.map_err(|e| e.to_string())?;

        let owned_path = path.to_string();
        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            optimize_image(&bytes, &owned_path, &settings)
        });

        match tokio::time::timeout(size_class.timeout(), task).await {
            Ok(Ok(Ok(processed))) => Ok(processed),
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Err(join)) => Err(format!("image task panicked: {}", join)),
            Err(_) => {
                error!("Image processing timed out after {:?}: {}", size_class.timeout(), path);
                Err("processing timeout".to_string())
            }
        }
    }
}

/// Inputs shared by every item of one pass
pub struct StageContext<'a> {
    pub site: &'a Site,
    pub snapshot: &'a SettingsSnapshot,
    pub workspace: &'a WorkspaceLease,
    pub fetcher: &'a dyn AssetFetcher,
    pub retry: &'a RetryPolicy,
    pub font_cache: &'a FetchCache,
    pub images: &'a ImageConcurrency,
    pub scan_options: &'a ScanOptions,
    pub used_selectors: UsedSelectors,
    pub removed_scripts: HashSet<String>,
    pub document_write: HashSet<String>,
    pub webp_variants: BTreeMap<String, String>,
    pub rename_map: BTreeMap<String, String>,
    pub migration: Vec<MigrationResult>,
}

impl StageContext<'_> {
    fn settings_for(&self, path: &str) -> ResolvedSettings {
        self.snapshot.for_url(&self.site.url_for(path))
    }

    /// Read a page, run `transform`, write it back when it changed
    async fn rewrite_page<F>(&self, path: &str, transform: F) -> Result<ItemOutcome, OptimizeError>
    where
        F: FnOnce(&str, &ResolvedSettings) -> OptimizeOutcome,
    {
        let html = self.workspace.read_string(path).await?;
        let settings = self.settings_for(path);
        let outcome = transform(&html, &settings);
        if outcome.content != html {
            self.workspace.write(path, outcome.content.as_bytes()).await?;
        }
        let mut item = ItemOutcome::from_stats(path, &outcome.stats);
        // I byte delle pagine non entrano nei contatori per tipo di asset
        item.original_bytes = 0;
        item.optimized_bytes = 0;
        Ok(item)
    }

    /// Write `content` under its content-hashed name, dropping the original
    async fn write_hashed(&self, path: &str, content: &[u8], item: &mut ItemOutcome) -> Result<(), OptimizeError> {
        let hashed = hashed_filename(path, content);
        self.workspace.write(&hashed, content).await?;
        if hashed != path {
            self.workspace.remove(path).await?;
            item.renamed = Some((path.to_string(), hashed));
        }
        Ok(())
    }
}

/// Run one item of `stage`
pub async fn process_item(ctx: &StageContext<'_>, stage: Stage, item: &WorkItem) -> Result<ItemOutcome, OptimizeError> {
    let path = item.path.as_str();
    match (stage, item.kind) {
        (Stage::Css, ItemKind::Asset) => stylesheet(ctx, path).await,
        (Stage::Js, ItemKind::Asset) => script_file(ctx, path).await,
        (Stage::Js, ItemKind::Page) => {
            ctx.rewrite_page(path, |html, settings| {
                let page = ScriptPageContext {
                    page_path: path,
                    removed: &ctx.removed_scripts,
                    document_write: &ctx.document_write,
                };
                optimize_script_tags(html, &page, &settings.js)
            })
            .await
        }
        (Stage::Fonts, ItemKind::Page) => fonts(ctx, path).await,
        (Stage::Images, ItemKind::Asset) => image_file(ctx, path).await,
        (Stage::Images, ItemKind::Page) => {
            ctx.rewrite_page(path, |html, settings| {
                let pictures = if settings.images.enabled {
                    wrap_in_picture(html, path, &ctx.webp_variants)
                } else {
                    OptimizeOutcome::unchanged(html)
                };
                let mut sprites = build_sprites(&pictures.content, settings.images.svg_sprites);
                sprites.stats.notes.extend(pictures.stats.notes);
                sprites
            })
            .await
        }
        (Stage::VideoFacades, ItemKind::Page) => {
            ctx.rewrite_page(path, |html, settings| apply_video_facades(html, &settings.video)).await
        }
        (Stage::WidgetFacades, ItemKind::Page) => {
            ctx.rewrite_page(path, |html, settings| apply_widget_facades(html, &settings.widgets)).await
        }
        (Stage::Seo, ItemKind::Page) => {
            let page_url = canonical_url(ctx.site, path);
            ctx.rewrite_page(path, |html, settings| inject_seo(html, Some(&page_url), &settings.seo))
                .await
        }
        (Stage::ResourceHints, ItemKind::Page) => {
            let host = ctx.site.host();
            ctx.rewrite_page(path, |html, settings| {
                inject_resource_hints(html, host.as_deref(), &settings.resource_hints)
            })
            .await
        }
        (Stage::Migration, ItemKind::Page) => migrate_page(ctx, path).await,
        (Stage::Migration, ItemKind::Asset) => {
            if ctx.migration.is_empty() {
                return Ok(ItemOutcome::default());
            }
            let css = ctx.workspace.read_string(path).await?;
            let rewritten = replace_stylesheet_urls(&css, &ctx.site.url_for(path), &ctx.migration);
            if rewritten != css {
                ctx.workspace.write(path, rewritten.as_bytes()).await?;
            }
            Ok(ItemOutcome::default())
        }
        (Stage::Finalize, ItemKind::Page) => {
            ctx.rewrite_page(path, |html, _| {
                let content = rewrite_open_tags(html, |tag| {
                    let mut changed = false;
                    for attr in ["href", "src"] {
                        let Some(value) = tag.get(attr).map(markup::decode_attr) else { continue };
                        if let Some(renamed) = renamed_reference(path, &value, &ctx.rename_map) {
                            tag.set(attr, &renamed);
                            changed = true;
                        }
                    }
                    changed
                });
                OptimizeOutcome { stats: OptimizeStats::sized(html.len(), content.len()), content }
            })
            .await
        }
        (Stage::Finalize, ItemKind::Asset) => finalize_stylesheet(ctx, path).await,
        _ => Ok(ItemOutcome::default()),
    }
}

/// `index.html` pages are canonical at their directory URL
fn canonical_url(site: &Site, path: &str) -> String {
    let path = path.trim_start_matches('/');
    match path.strip_suffix("index.html") {
        Some(dir) => site.url_for(dir),
        None => site.url_for(path),
    }
}

/// `reference` with its file name swapped for the hashed one, when `from` points at a renamed file
pub fn renamed_reference(from: &str, reference: &str, rename_map: &BTreeMap<String, String>) -> Option<String> {
    let site_path = resolve_site_path(from, reference)?;
    let renamed = rename_map.get(&site_path)?;
    let new_name = renamed.rsplit('/').next()?;
    let split = reference.find(['?', '#']).unwrap_or(reference.len());
    let (file, suffix) = reference.split_at(split);
    let prefix = match file.rfind('/') {
        Some(slash) => &file[..=slash],
        None => "",
    };
    Some(format!("{}{}{}", prefix, new_name, suffix))
}

async fn stylesheet(ctx: &StageContext<'_>, path: &str) -> Result<ItemOutcome, OptimizeError> {
    let css = ctx.workspace.read_string(path).await?;
    let settings = ctx.settings_for(path);
    let outcome = optimize_css(&css, &CssContext { used: &ctx.used_selectors }, &settings.css);
    let mut item = ItemOutcome::from_stats(path, &outcome.stats);
    if settings.css.enabled {
        ctx.write_hashed(path, outcome.content.as_bytes(), &mut item).await?;
    }
    Ok(item)
}

/// Point `url()` references at renamed files; a hashed sheet whose bytes changed
/// since it was named gets the hash of its final content
async fn finalize_stylesheet(ctx: &StageContext<'_>, path: &str) -> Result<ItemOutcome, OptimizeError> {
    let css = ctx.workspace.read_string(path).await?;
    let rewritten = rewrite_css_urls(&css, |reference| renamed_reference(path, reference, &ctx.rename_map));
    let mut item = ItemOutcome::default();

    let original = ctx
        .rename_map
        .iter()
        .find(|(_, hashed)| hashed.as_str() == path)
        .map(|(original, _)| original.clone());
    let Some(original) = original else {
        if rewritten != css {
            ctx.workspace.write(path, rewritten.as_bytes()).await?;
        }
        return Ok(item);
    };

    let final_name = hashed_filename(&original, rewritten.as_bytes());
    if final_name != path {
        ctx.workspace.write(&final_name, rewritten.as_bytes()).await?;
        ctx.workspace.remove(path).await?;
        debug!("Re-hashed {} as {}", path, final_name);
        item.renamed = Some((original, final_name));
    }
    Ok(item)
}

async fn script_file(ctx: &StageContext<'_>, path: &str) -> Result<ItemOutcome, OptimizeError> {
    let settings = ctx.settings_for(path).js;
    let source = ctx.workspace.read_string(path).await?;
    if !settings.enabled {
        return Ok(ItemOutcome::from_stats(path, &OptimizeStats::sized(source.len(), source.len())));
    }

    if let Some(category) = dead_script_category(path, &settings.remove) {
        ctx.workspace.remove(path).await?;
        let mut item = ItemOutcome::from_stats(path, &OptimizeStats::sized(source.len(), 0));
        item.removed_script = Some(path.to_string());
        item.notes.push(format!("{}: removed ({:?})", path, category));
        return Ok(item);
    }

    let outcome = optimize_js(&source, &settings);
    let mut item = ItemOutcome::from_stats(path, &outcome.stats);
    if uses_document_write(&source) {
        item.document_write = Some(path.to_string());
    }
    ctx.write_hashed(path, outcome.content.as_bytes(), &mut item).await?;
    Ok(item)
}

async fn fonts(ctx: &StageContext<'_>, path: &str) -> Result<ItemOutcome, OptimizeError> {
    let html = ctx.workspace.read_string(path).await?;
    let settings = ctx.settings_for(path);
    let hosted = self_host_fonts(&html, ctx.fetcher, ctx.retry, ctx.font_cache, &settings.fonts).await;
    for file in &hosted.files {
        if !ctx.workspace.exists(&file.path) {
            ctx.workspace.write(&file.path, &file.bytes).await?;
        }
    }
    if hosted.content != html {
        ctx.workspace.write(path, hosted.content.as_bytes()).await?;
    }
    let mut item = ItemOutcome::from_stats(path, &hosted.stats);
    item.original_bytes = 0;
    item.optimized_bytes = 0;
    Ok(item)
}

async fn image_file(ctx: &StageContext<'_>, path: &str) -> Result<ItemOutcome, OptimizeError> {
    let bytes = ctx.workspace.read(path).await?;
    let settings = ctx.settings_for(path).images;
    let original_len = bytes.len();

    match ctx.images.optimize(bytes.clone(), path, settings).await {
        Ok(processed) => {
            let mut item = ItemOutcome::from_stats(path, &processed.stats);
            if processed.bytes != bytes {
                ctx.workspace.write(path, &processed.bytes).await?;
            }
            if let Some(webp) = &processed.webp {
                let variant = webp_path(path);
                ctx.workspace.write(&variant, webp).await?;
                item.webp = Some((path.to_string(), variant));
            }
            Ok(item)
        }
        Err(message) => {
            let mut item = ItemOutcome::from_stats(path, &OptimizeStats::sized(original_len, original_len));
            item.warnings.push(format!("{}: {}, original kept", path, message));
            Ok(item)
        }
    }
}

async fn migrate_page(ctx: &StageContext<'_>, path: &str) -> Result<ItemOutcome, OptimizeError> {
    let page_url = ctx.site.url_for(path);
    let scan_options = ctx.scan_options;
    let migration = &ctx.migration;
    ctx.rewrite_page(path, |html, settings| {
        let mut records = scan_with(html, &page_url, scan_options);
        attach_dimensions(&mut records, migration);
        let migrated = if migration.is_empty() {
            html.to_string()
        } else {
            replace_all_urls(html, &page_url, &records, migration)
        };
        let content = apply_loading_hints(&migrated, &records, &settings.images);
        OptimizeOutcome { stats: OptimizeStats::sized(html.len(), content.len()), content }
    })
    .await
}
