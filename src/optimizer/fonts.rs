//! # Font Self-Hosting
//!
//! ## Responsabilità:
//! - Individua i fogli di stile di Google Fonts / Bunny Fonts linkati nella pagina
//! - Scarica foglio di stile e file dei font (con retry e cache per-build)
//! - Riscrive i `@font-face` verso `/fonts/...`, inietta `font-display`
//! - Sostituisce il primo `<link>` con un blocco `<style>` inline, rimuove gli altri
//!   e le preconnect ormai inutili
//! - Genera al massimo `preload_count` preload (woff2, latin, peso 400 per primi)
//!
//! Se un foglio di stile o uno dei suoi file non si scarica, quel `<link>` resta
//! com'è: il font remoto funziona ancora, semplicemente non è self-hosted.

use crate::error::OptimizeError;
use crate::markup::{self, elements, splice, Element};
use crate::migration::fetch::{AssetFetcher, FetchCache};
use crate::optimizer::css::apply_font_display;
use crate::optimizer::{content_hash, OptimizeStats};
use crate::queue::backoff::RetryPolicy;
use crate::settings::FontSettings;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::{debug, warn};

pub const FONT_HOSTS: &[&str] = &["fonts.googleapis.com", "fonts.bunny.net"];
/// Hosts serving the font files themselves
const FONT_FILE_HOSTS: &[&str] = &["fonts.gstatic.com", "fonts.googleapis.com", "fonts.bunny.net"];

/// One `@font-face` rule of a font stylesheet
#[derive(Debug, Clone, PartialEq)]
pub struct FontFace {
    pub family: String,
    pub weight: String,
    pub style: String,
    /// Subset label from the `/* latin */` comment Google emits
    pub subset: Option<String>,
    pub src_url: String,
    pub format: Option<String>,
}

impl FontFace {
    fn preload_rank(&self) -> (u8, u8, u8, u8) {
        let woff2 = self.format.as_deref() == Some("woff2") || self.src_url.ends_with(".woff2");
        (
            if woff2 { 0 } else { 1 },
            if self.subset.as_deref() == Some("latin") { 0 } else { 1 },
            if self.weight == "400" || self.weight == "normal" { 0 } else { 1 },
            if self.style == "normal" { 0 } else { 1 },
        )
    }
}

/// A file to be written into the site tree
#[derive(Debug, Clone, PartialEq)]
pub struct FontFile {
    pub path: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelfHostedFonts {
    pub content: String,
    pub files: Vec<FontFile>,
    pub stats: OptimizeStats,
}

fn font_face_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)(?:/\*\s*([\w\-\[\]. ]+?)\s*\*/\s*)?@font-face\s*\{([^}]*)\}").expect("static font-face regex")
    })
}

fn declaration(block: &str, property: &str) -> Option<String> {
    block.split(';').find_map(|decl| {
        let (name, value) = decl.split_once(':')?;
        if name.trim().eq_ignore_ascii_case(property) {
            Some(value.trim().trim_matches(|c| c == '\'' || c == '"').to_string())
        } else {
            None
        }
    })
}

pub fn parse_font_faces(css: &str) -> Vec<FontFace> {
    font_face_regex()
        .captures_iter(css)
        .filter_map(|caps| {
            let block = caps.get(2)?.as_str();
            let src = declaration(block, "src")?;
            let src_url = markup::css_urls(&src).into_iter().next()?;
            let format = Regex::new(r#"format\(\s*['"]?([\w-]+)"#)
                .ok()
                .and_then(|re| re.captures(&src).map(|c| c[1].to_string()));
            Some(FontFace {
                family: declaration(block, "font-family").unwrap_or_default(),
                weight: declaration(block, "font-weight").unwrap_or_else(|| "400".to_string()),
                style: declaration(block, "font-style").unwrap_or_else(|| "normal".to_string()),
                subset: caps.get(1).map(|m| m.as_str().to_string()),
                src_url,
                format,
            })
        })
        .collect()
}

fn normalize_href(href: &str) -> String {
    let href = markup::decode_attr(href.trim());
    if let Some(rest) = href.strip_prefix("//") {
        format!("https://{}", rest)
    } else {
        href
    }
}

fn host_of(href: &str) -> Option<String> {
    url::Url::parse(&normalize_href(href)).ok()?.host_str().map(|h| h.to_ascii_lowercase())
}

/// `<link rel=stylesheet>` elements pointing at a font service
pub fn font_stylesheet_links(html: &str) -> Vec<(Element, String)> {
    elements(html, "link")
        .into_iter()
        .filter(|link| {
            link.tag
                .get("rel")
                .map(|r| r.split_whitespace().any(|t| t.eq_ignore_ascii_case("stylesheet")))
                .unwrap_or(false)
        })
        .filter_map(|link| {
            let href = link.tag.get("href")?.to_string();
            let host = host_of(&href)?;
            FONT_HOSTS.contains(&host.as_str()).then(|| (link, normalize_href(&href)))
        })
        .collect()
}

/// `fonts/<hash8>-<basename>` for a remote font file
pub fn local_font_path(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let base = path.rsplit('/').next().filter(|b| !b.is_empty()).unwrap_or("font");
    format!("fonts/{}-{}", &content_hash(url.as_bytes())[..8], base)
}

fn font_mime(face: &FontFace) -> &'static str {
    match face.format.as_deref() {
        Some("woff2") => "font/woff2",
        Some("woff") => "font/woff",
        Some("truetype") => "font/ttf",
        Some("opentype") => "font/otf",
        _ if face.src_url.ends_with(".woff") => "font/woff",
        _ => "font/woff2",
    }
}

struct HostedSheet {
    css: String,
    faces: Vec<FontFace>,
    files: Vec<FontFile>,
}

async fn host_stylesheet(
    href: &str,
    fetcher: &dyn AssetFetcher,
    retry: &RetryPolicy,
    cache: &FetchCache,
    settings: &FontSettings,
) -> Result<HostedSheet, OptimizeError> {
    let sheet = cache.get_or_fetch(href, fetcher, retry).await?;
    let css = sheet.text();
    let faces = parse_font_faces(&css);

    let mut local: HashMap<String, String> = HashMap::new();
    let mut files = Vec::new();
    for face in &faces {
        let remote = normalize_href(&face.src_url);
        if local.contains_key(&face.src_url) {
            continue;
        }
        let payload = cache.get_or_fetch(&remote, fetcher, retry).await?;
        let path = local_font_path(&remote);
        files.push(FontFile { path: path.clone(), bytes: payload.bytes.clone() });
        local.insert(face.src_url.clone(), format!("/{}", path));
    }

    let rewritten = markup::rewrite_css_urls(&css, |reference| local.get(reference).cloned());
    let css = apply_font_display(&rewritten, settings.font_display);
    let faces = faces
        .into_iter()
        .map(|mut face| {
            if let Some(path) = local.get(&face.src_url) {
                face.src_url = path.clone();
            }
            face
        })
        .collect();
    Ok(HostedSheet { css, faces, files })
}

fn is_font_hint(link: &Element) -> bool {
    let rel = link.tag.get("rel").unwrap_or("").to_ascii_lowercase();
    if !rel.split_whitespace().any(|r| r == "preconnect" || r == "dns-prefetch") {
        return false;
    }
    link.tag
        .get("href")
        .and_then(host_of)
        .map(|h| FONT_FILE_HOSTS.contains(&h.as_str()))
        .unwrap_or(false)
}

/// Self-host every font stylesheet of the page
pub async fn self_host_fonts(
    html: &str,
    fetcher: &dyn AssetFetcher,
    retry: &RetryPolicy,
    cache: &FetchCache,
    settings: &FontSettings,
) -> SelfHostedFonts {
    let untouched = || SelfHostedFonts {
        content: html.to_string(),
        files: Vec::new(),
        stats: OptimizeStats::sized(html.len(), html.len()),
    };
    if !settings.self_host {
        return untouched();
    }
    let links = font_stylesheet_links(html);
    if links.is_empty() {
        return untouched();
    }

    let mut stats = OptimizeStats::default();
    let mut hosted_css = Vec::new();
    let mut faces = Vec::new();
    let mut files: Vec<FontFile> = Vec::new();
    let mut hosted_links = Vec::new();

    for (link, href) in &links {
        match host_stylesheet(href, fetcher, retry, cache, settings).await {
            Ok(sheet) => {
                debug!("🔤 Self-hosted {} ({} faces)", href, sheet.faces.len());
                hosted_css.push(sheet.css);
                faces.extend(sheet.faces);
                for file in sheet.files {
                    if !files.iter().any(|f| f.path == file.path) {
                        files.push(file);
                    }
                }
                hosted_links.push(link.clone());
                stats.removed.push(href.clone());
            }
            Err(e) => {
                warn!("⚠️  Keeping remote fonts for {}: {}", href, e);
                stats.notes.push(format!("font stylesheet kept remote: {}", href));
            }
        }
    }

    if hosted_links.is_empty() {
        let mut outcome = untouched();
        outcome.stats.notes = stats.notes;
        return outcome;
    }

    faces.sort_by_key(|f| f.preload_rank());
    let mut preloaded: Vec<&str> = Vec::new();
    let mut preloads = String::new();
    for face in &faces {
        if preloaded.len() >= settings.preload_count as usize {
            break;
        }
        if !face.src_url.starts_with("/fonts/") || preloaded.contains(&face.src_url.as_str()) {
            continue;
        }
        preloaded.push(&face.src_url);
        preloads.push_str(&format!(
            r#"<link rel="preload" href="{}" as="font" type="{}" crossorigin>"#,
            face.src_url,
            font_mime(face)
        ));
    }

    let block = format!("{}<style data-so-fonts>{}</style>", preloads, hosted_css.join("\n"));
    let mut edits = Vec::new();
    for (index, link) in hosted_links.iter().enumerate() {
        let replacement = if index == 0 { block.clone() } else { String::new() };
        edits.push((link.outer.clone(), replacement));
    }
    // le preconnect servono ancora se qualche foglio è rimasto remoto
    if hosted_links.len() == links.len() {
        for hint in elements(html, "link").into_iter().filter(is_font_hint) {
            edits.push((hint.outer.clone(), String::new()));
        }
    }

    let content = splice(html, edits);
    stats.original_bytes = html.len() as u64;
    stats.optimized_bytes = content.len() as u64;
    stats.notes.push(format!("{} font files self-hosted", files.len()));
    SelfHostedFonts { content, files, stats }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::fetch::FetchedAsset;
    use crate::settings::FontDisplay;
    use async_trait::async_trait;

    const GOOGLE_CSS: &str = "/* cyrillic */\n@font-face {\n  font-family: 'Roboto';\n  font-style: normal;\n  font-weight: 400;\n  src: url(https://fonts.gstatic.com/s/roboto/v30/cyr.woff2) format('woff2');\n}\n/* latin */\n@font-face {\n  font-family: 'Roboto';\n  font-style: normal;\n  font-weight: 700;\n  src: url(https://fonts.gstatic.com/s/roboto/v30/bold.woff2) format('woff2');\n}\n/* latin */\n@font-face {\n  font-family: 'Roboto';\n  font-style: normal;\n  font-weight: 400;\n  src: url(https://fonts.gstatic.com/s/roboto/v30/regular.woff2) format('woff2');\n}\n";

    struct FontServer;

    #[async_trait]
    impl AssetFetcher for FontServer {
        async fn fetch(&self, url: &str) -> Result<FetchedAsset, OptimizeError> {
            if url.contains("fonts.googleapis.com") {
                Ok(FetchedAsset::new(url, GOOGLE_CSS.as_bytes().to_vec(), Some("text/css")))
            } else if url.contains("fonts.gstatic.com") {
                Ok(FetchedAsset::new(url, vec![0x77, 0x4f, 0x46, 0x32], Some("font/woff2")))
            } else {
                Err(OptimizeError::Fetch { url: url.to_string(), message: "404".into() })
            }
        }
    }

    const PAGE: &str = r#"<html><head><link rel="preconnect" href="https://fonts.gstatic.com" crossorigin><link href="https://fonts.googleapis.com/css2?family=Roboto:wght@400;700&amp;display=swap" rel="stylesheet"></head><body></body></html>"#;

    #[test]
    fn test_parse_font_faces_with_subsets() {
        let faces = parse_font_faces(GOOGLE_CSS);
        assert_eq!(faces.len(), 3);
        assert_eq!(faces[0].subset.as_deref(), Some("cyrillic"));
        assert_eq!(faces[1].weight, "700");
        assert_eq!(faces[2].format.as_deref(), Some("woff2"));
        assert_eq!(faces[2].family, "Roboto");
    }

    #[test]
    fn test_local_font_path_is_stable() {
        let a = local_font_path("https://fonts.gstatic.com/s/roboto/v30/regular.woff2");
        assert!(a.starts_with("fonts/"));
        assert!(a.ends_with("-regular.woff2"));
        assert_eq!(a, local_font_path("https://fonts.gstatic.com/s/roboto/v30/regular.woff2"));
    }

    #[tokio::test]
    async fn test_self_host_replaces_link_with_inline_style() {
        let cache = FetchCache::new();
        let out = self_host_fonts(PAGE, &FontServer, &RetryPolicy::immediate(1), &cache, &FontSettings::default()).await;

        assert!(!out.content.contains("fonts.googleapis.com"));
        assert!(!out.content.contains("fonts.gstatic.com"));
        assert!(out.content.contains("<style data-so-fonts>"));
        assert_eq!(out.content.matches("font-display: swap").count(), 3);
        assert_eq!(out.files.len(), 3);
        assert!(out.files.iter().all(|f| f.path.starts_with("fonts/")));

        // latin regular prima del bold, massimo due preload
        assert_eq!(out.content.matches(r#"rel="preload""#).count(), 2);
        let regular = out.content.find("-regular.woff2\" as=\"font\"").unwrap();
        let bold = out.content.find("-bold.woff2\" as=\"font\"").unwrap();
        assert!(regular < bold);
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_link() {
        let html = r#"<head><link rel="stylesheet" href="https://fonts.bunny.net/css?family=x"><link rel="preconnect" href="https://fonts.bunny.net"></head>"#;
        let cache = FetchCache::new();
        let out = self_host_fonts(html, &FontServer, &RetryPolicy::immediate(2), &cache, &FontSettings::default()).await;
        assert_eq!(out.content, html);
        assert!(out.files.is_empty());
        assert_eq!(out.stats.notes.len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_and_custom_display() {
        let cache = FetchCache::new();
        let off = FontSettings { self_host: false, ..Default::default() };
        let out = self_host_fonts(PAGE, &FontServer, &RetryPolicy::immediate(1), &cache, &off).await;
        assert_eq!(out.content, PAGE);

        let optional = FontSettings { font_display: FontDisplay::Optional, preload_count: 0, ..Default::default() };
        let out = self_host_fonts(PAGE, &FontServer, &RetryPolicy::immediate(1), &cache, &optional).await;
        assert!(out.content.contains("font-display: optional"));
        assert!(!out.content.contains("preload"));
    }
}
