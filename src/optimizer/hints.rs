//! # Resource Hints
//!
//! Analizza le origini di terze parti referenziate dalla pagina e aggiunge in
//! testa all'`<head>`:
//! - `preconnect` per le origini più usate (fino a `max_preconnect`)
//! - `dns-prefetch` per le restanti
//! - `preload` dell'immagine candidata LCP con `fetchpriority="high"`
//!
//! Gli hint già presenti non vengono duplicati.

use crate::classify::lcp_candidate;
use crate::markup::{self, open_tags};
use crate::optimizer::{OptimizeOutcome, OptimizeStats};
use crate::settings::ResourceHintSettings;
use std::collections::HashMap;
use url::Url;

/// Element/attribute pairs that make the browser contact an origin
const ORIGIN_ATTRS: &[(&str, &str)] = &[
    ("script", "src"),
    ("img", "src"),
    ("iframe", "src"),
    ("source", "src"),
    ("video", "src"),
    ("audio", "src"),
    ("video", "poster"),
];

fn origin_of(reference: &str) -> Option<String> {
    let reference = reference.trim();
    let absolute = if let Some(rest) = reference.strip_prefix("//") {
        format!("https://{}", rest)
    } else {
        reference.to_string()
    };
    let url = Url::parse(&absolute).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    })
}

fn host_of(origin: &str) -> &str {
    let without_scheme = origin.split("://").nth(1).unwrap_or(origin);
    without_scheme.split(':').next().unwrap_or(without_scheme)
}

/// Third-party origins ordered by reference count, then first appearance
pub fn third_party_origins(html: &str, site_host: Option<&str>) -> Vec<(String, usize)> {
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    for (position, (tag, _)) in open_tags(html).into_iter().enumerate() {
        let mut references: Vec<&str> = ORIGIN_ATTRS
            .iter()
            .filter(|(name, _)| *name == tag.name)
            .filter_map(|(_, attr)| tag.get(attr))
            .collect();
        if tag.name == "link" {
            let rel = tag.get("rel").unwrap_or("").to_ascii_lowercase();
            if rel.split_whitespace().any(|r| r == "stylesheet" || r == "preload" || r == "modulepreload") {
                references.extend(tag.get("href"));
            }
        }
        for reference in references {
            let Some(origin) = origin_of(reference) else { continue };
            let host = host_of(&origin);
            if site_host.map(|s| s.eq_ignore_ascii_case(host)).unwrap_or(false) {
                continue;
            }
            let entry = counts.entry(origin).or_insert((0, position));
            entry.0 += 1;
        }
    }

    let mut ranked: Vec<(String, (usize, usize))> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then(a.1 .1.cmp(&b.1 .1)));
    ranked.into_iter().map(|(origin, (count, _))| (origin, count)).collect()
}

fn existing_hints(html: &str) -> (Vec<String>, Vec<String>) {
    let mut hinted = Vec::new();
    let mut preloaded = Vec::new();
    for (tag, _) in open_tags(html) {
        if tag.name != "link" {
            continue;
        }
        let rel = tag.get("rel").unwrap_or("").to_ascii_lowercase();
        let Some(href) = tag.get("href") else { continue };
        if rel.contains("preconnect") || rel.contains("dns-prefetch") {
            hinted.extend(origin_of(href));
        }
        if rel.split_whitespace().any(|r| r == "preload") {
            preloaded.push(href.to_string());
        }
    }
    (hinted, preloaded)
}

/// Add preconnect/dns-prefetch/LCP preload right after `<head>`
pub fn inject_resource_hints(html: &str, site_host: Option<&str>, settings: &ResourceHintSettings) -> OptimizeOutcome {
    if !settings.enabled || markup::first_element(html, "head").is_none() {
        return OptimizeOutcome::unchanged(html);
    }
    let (hinted, preloaded) = existing_hints(html);
    let mut snippet = String::new();
    let mut notes = Vec::new();

    let fresh: Vec<String> = third_party_origins(html, site_host)
        .into_iter()
        .map(|(origin, _)| origin)
        .filter(|origin| !hinted.contains(origin))
        .collect();

    let mut preconnects = 0u32;
    let mut prefetches = 0usize;
    for origin in &fresh {
        if preconnects < settings.max_preconnect {
            snippet.push_str(&format!(r#"<link rel="preconnect" href="{}" crossorigin>"#, origin));
            preconnects += 1;
        } else if settings.dns_prefetch {
            snippet.push_str(&format!(r#"<link rel="dns-prefetch" href="{}">"#, origin));
            prefetches += 1;
        }
    }
    if preconnects > 0 || prefetches > 0 {
        notes.push(format!("{} preconnect, {} dns-prefetch", preconnects, prefetches));
    }

    if settings.preload_lcp {
        if let Some(lcp) = lcp_candidate(html) {
            if !preloaded.iter().any(|p| *p == lcp.url) {
                let srcset = lcp
                    .srcset
                    .as_deref()
                    .map(|s| format!(r#" imagesrcset="{}""#, s))
                    .unwrap_or_default();
                snippet.push_str(&format!(
                    r#"<link rel="preload" as="image" href="{}" fetchpriority="high"{}>"#,
                    lcp.url, srcset
                ));
                notes.push(format!("preload {}", lcp.url));
            }
        }
    }

    if snippet.is_empty() {
        return OptimizeOutcome::unchanged(html);
    }
    let content = markup::insert_after_open(html, "head", &snippet);
    let mut stats = OptimizeStats::sized(html.len(), content.len());
    stats.notes = notes;
    OptimizeOutcome { content, stats }
}
