//! # Optimizer Module
//!
//! Ottimizzatori per tipo di asset. Ogni ottimizzatore è una funzione pura
//! `(contenuto, contesto, settings) -> OptimizeOutcome` senza stato condiviso,
//! quindi file indipendenti possono essere elaborati in parallelo.
//!
//! - `css`: purge, font-display, minify
//! - `js`: script morti, minify, strategia di caricamento, spostamento inline
//! - `fonts`: self-hosting di Google Fonts / Bunny Fonts
//! - `images`: resize, ricodifica, varianti WebP, cleanup SVG
//! - `svg`: deduplicazione delle SVG inline in uno sprite
//! - `facades`: facade per video e widget di terze parti
//! - `seo`: meta tag mancanti
//! - `hints`: preconnect, dns-prefetch, preload LCP

pub mod css;
pub mod facades;
pub mod fonts;
pub mod hints;
pub mod images;
pub mod js;
pub mod seo;
pub mod svg;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// Placeholder origin used to resolve relative references inside the workspace
const WORKSPACE_ORIGIN: &str = "https://workspace.invalid/";

/// Counters produced by one optimizer invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizeStats {
    pub original_bytes: u64,
    pub optimized_bytes: u64,
    /// Selectors, scripts or tags actually removed
    pub removed: Vec<String>,
    /// Purge test mode: what would have been removed
    pub would_remove: Vec<String>,
    pub facades_applied: u32,
    pub scripts_removed: u32,
    pub notes: Vec<String>,
}

impl OptimizeStats {
    pub fn sized(original: usize, optimized: usize) -> Self {
        Self {
            original_bytes: original as u64,
            optimized_bytes: optimized as u64,
            ..Default::default()
        }
    }

    pub fn bytes_saved(&self) -> u64 {
        self.original_bytes.saturating_sub(self.optimized_bytes)
    }
}

/// Optimized content plus what happened to it
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizeOutcome<T = String> {
    pub content: T,
    pub stats: OptimizeStats,
}

impl OptimizeOutcome<String> {
    /// Content untouched, sizes equal
    pub fn unchanged(content: &str) -> Self {
        Self {
            content: content.to_string(),
            stats: OptimizeStats::sized(content.len(), content.len()),
        }
    }

    pub fn changed(&self) -> bool {
        self.stats.original_bytes != self.stats.optimized_bytes || !self.stats.removed.is_empty()
    }
}

/// Full hex SHA-256 of a payload
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// `css/site.css` + content → `css/site.1a2b3c4d.css`
pub fn hashed_filename(path: &str, content: &[u8]) -> String {
    let hash = &content_hash(content)[..8];
    let (dir, file) = match path.rfind('/') {
        Some(i) => (&path[..=i], &path[i + 1..]),
        None => ("", path),
    };
    match file.rfind('.') {
        Some(dot) if dot > 0 => format!("{}{}.{}{}", dir, &file[..dot], hash, &file[dot..]),
        _ => format!("{}{}.{}", dir, file, hash),
    }
}

/// Site path (no leading slash) of `reference` as seen from `page_path`;
/// `None` for data URIs, fragments and other hosts
pub fn resolve_site_path(page_path: &str, reference: &str) -> Option<String> {
    resolve_against(None, page_path, reference)
}

/// Like `resolve_site_path`, also accepting absolute URLs on `origin`
pub fn resolve_against(origin: Option<&Url>, page_path: &str, reference: &str) -> Option<String> {
    let reference = reference.trim();
    if reference.is_empty() || reference.starts_with('#') || reference.starts_with("data:") {
        return None;
    }
    let root = match origin {
        Some(origin) => origin.join("/").ok()?,
        None => Url::parse(WORKSPACE_ORIGIN).ok()?,
    };
    let resolved = root.join(page_path).ok()?.join(reference).ok()?;
    if resolved.host_str() != root.host_str() || !matches!(resolved.scheme(), "http" | "https") {
        return None;
    }
    let path = resolved.path().trim_start_matches('/');
    if path.is_empty() || path.ends_with('/') {
        Some(format!("{}index.html", path))
    } else {
        Some(path.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_site_path() {
        assert_eq!(resolve_site_path("blog/post.html", "../css/a.css").as_deref(), Some("css/a.css"));
        assert_eq!(resolve_site_path("blog/post.html", "/js/app.js?v=2").as_deref(), Some("js/app.js"));
        assert_eq!(resolve_site_path("blog/post.html", "img/x.png").as_deref(), Some("blog/img/x.png"));
        assert_eq!(resolve_site_path("index.html", "https://cdn.example.net/a.js"), None);
        assert_eq!(resolve_site_path("index.html", "data:image/png;base64,AAA"), None);

        let origin = Url::parse("https://www.example.com").unwrap();
        assert_eq!(
            resolve_against(Some(&origin), "index.html", "https://www.example.com/about/").as_deref(),
            Some("about/index.html")
        );
        assert_eq!(resolve_against(Some(&origin), "index.html", "https://other.com/x.png"), None);
    }

    #[test]
    fn test_hashed_filename_is_content_addressed() {
        let a = hashed_filename("css/site.css", b"body{}");
        let b = hashed_filename("css/site.css", b"body{}");
        let c = hashed_filename("css/site.css", b"p{}");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("css/site."));
        assert!(a.ends_with(".css"));
        assert_eq!(a.len(), "css/site.".len() + 8 + ".css".len());
        assert!(hashed_filename("LICENSE", b"x").starts_with("LICENSE."));
    }

    #[test]
    fn test_stats_saved_never_underflows() {
        assert_eq!(OptimizeStats::sized(10, 20).bytes_saved(), 0);
        assert_eq!(OptimizeStats::sized(20, 5).bytes_saved(), 15);
    }
}
