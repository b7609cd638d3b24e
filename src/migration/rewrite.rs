//! # Reference Rewriting
//!
//! Dopo la migrazione ogni riferimento viene puntato alla variante di delivery
//! adatta al contesto in cui compare, in una sola passata su tutte le forme.
//! Uno sweep finale garantisce che nessun URL assoluto migrato sopravviva.
//!
//! Qui vivono anche gli hint di caricamento (`loading`, `fetchpriority`,
//! dimensioni esplicite) che dipendono dagli stessi `ImageRecord`.

use crate::migration::migrate::MigrationResult;
use crate::migration::scan::{resolve_reference, ImageRecord, ReferenceShape};
use crate::migration::store::Variant;
use crate::markup::{self, decode_attr, format_srcset, parse_srcset, Tag};
use crate::settings::ImageSettings;
use std::collections::HashMap;
use url::Url;

/// srcset candidates at or below this width get the thumbnail variant
pub const THUMBNAIL_MAX_WIDTH: u32 = 480;

const SRC_ATTRS: &[&str] = &["src", "data-src", "data-lazy-src", "data-original", "data-lazy"];
const SRCSET_ATTRS: &[&str] = &["srcset", "data-srcset", "data-lazy-srcset"];
const BUILDER_ATTRS: &[&str] = &[
    "data-bg",
    "data-background",
    "data-background-image",
    "data-bg-image",
    "data-image-src",
    "data-vc-parallax-image",
];
const META_IMAGE_KEYS: &[&str] = &["og:image", "og:image:url", "og:image:secure_url", "twitter:image"];

struct Rewriter<'a> {
    base: Option<Url>,
    migrated: HashMap<&'a str, &'a MigrationResult>,
}

impl<'a> Rewriter<'a> {
    fn new(base_url: &str, results: &'a [MigrationResult]) -> Self {
        Self {
            base: Url::parse(base_url).ok(),
            migrated: results.iter().filter(|r| r.is_success()).map(|r| (r.url.as_str(), r)).collect(),
        }
    }

    fn lookup(&self, raw: &str, variant: Variant) -> Option<String> {
        let url = resolve_reference(self.base.as_ref(), &decode_attr(raw))?;
        self.migrated
            .get(url.as_str())
            .and_then(|r| r.url_for(variant))
            .map(|u| u.to_string())
    }

    fn srcset(&self, srcset: &str) -> Option<String> {
        let mut changed = false;
        let candidates: Vec<_> = parse_srcset(srcset)
            .into_iter()
            .map(|mut candidate| {
                let small = candidate.width().map(|w| w <= THUMBNAIL_MAX_WIDTH).unwrap_or(false)
                    || candidate.density().map(|d| d <= 1.0).unwrap_or(false);
                let variant = if small { Variant::Thumbnail } else { Variant::Public };
                if let Some(delivery) = self.lookup(&candidate.url, variant) {
                    candidate.url = delivery;
                    changed = true;
                }
                candidate
            })
            .collect();
        changed.then(|| format_srcset(&candidates))
    }

    fn css(&self, css: &str) -> String {
        markup::rewrite_css_urls(css, |reference| self.lookup(reference, Variant::Public))
    }

    fn tag(&self, tag: &mut Tag) -> bool {
        let mut changed = false;
        let mut set = |tag: &mut Tag, name: &str, value: Option<String>| {
            if let Some(value) = value {
                tag.set(name, &value);
                changed = true;
            }
        };

        match tag.name.as_str() {
            "meta" => {
                let key = tag.get("property").or_else(|| tag.get("name")).unwrap_or("").to_ascii_lowercase();
                if META_IMAGE_KEYS.contains(&key.as_str()) {
                    let value = tag.get("content").and_then(|c| self.lookup(c, Variant::Social));
                    set(tag, "content", value);
                }
            }
            "link" => {
                let rel = tag.get("rel").unwrap_or("").to_ascii_lowercase();
                if rel.split_whitespace().any(|r| r.contains("icon")) {
                    let value = tag.get("href").and_then(|h| self.lookup(h, Variant::Icon));
                    set(tag, "href", value);
                }
            }
            "img" | "source" => {
                for attr in SRC_ATTRS {
                    let value = tag.get(attr).and_then(|v| self.lookup(v, Variant::Public));
                    set(tag, *attr, value);
                }
                for attr in SRCSET_ATTRS {
                    let value = tag.get(attr).and_then(|v| self.srcset(v));
                    set(tag, *attr, value);
                }
            }
            _ => {}
        }

        for attr in BUILDER_ATTRS {
            let value = tag.get(attr).and_then(|v| {
                if v.contains("url(") {
                    let rewritten = self.css(v);
                    (rewritten != v).then_some(rewritten)
                } else {
                    self.lookup(v, Variant::Public)
                }
            });
            set(tag, *attr, value);
        }
        if let Some(style) = tag.get("style").filter(|s| s.contains("url(")) {
            let rewritten = self.css(style);
            if rewritten != style {
                set(tag, "style", Some(rewritten));
            }
        }
        changed
    }
}

/// Point every migrated reference at its delivery variant
pub fn replace_all_urls(html: &str, base_url: &str, records: &[ImageRecord], results: &[MigrationResult]) -> String {
    let rewriter = Rewriter::new(base_url, results);
    if rewriter.migrated.is_empty() {
        return html.to_string();
    }

    let mut content = markup::rewrite_open_tags(html, |tag| rewriter.tag(tag));

    let blocks: Vec<(std::ops::Range<usize>, String)> = markup::elements(&content, "style")
        .into_iter()
        .filter_map(|block| {
            let css = block.inner_html(&content);
            let rewritten = rewriter.css(css);
            (rewritten != css).then(|| (block.inner.clone(), rewritten))
        })
        .collect();
    if !blocks.is_empty() {
        content = markup::splice(&content, blocks);
    }

    sweep(&content, records, results)
}

/// Rewrite a crawled stylesheet
pub fn replace_stylesheet_urls(css: &str, base_url: &str, results: &[MigrationResult]) -> String {
    Rewriter::new(base_url, results).css(css)
}

/// Last line of defence: absolute URLs in scripts, JSON blobs or odd attributes
fn sweep(html: &str, records: &[ImageRecord], results: &[MigrationResult]) -> String {
    let mut needles: Vec<(String, &str)> = Vec::new();
    for result in results.iter().filter(|r| r.is_success()) {
        let Some(delivery) = result.url_for(Variant::Public) else { continue };
        needles.push((result.url.clone(), delivery));
        needles.push((result.url.replace('&', "&amp;"), delivery));
        if let Some(rest) = result.url.strip_prefix("https:").or_else(|| result.url.strip_prefix("http:")) {
            needles.push((rest.to_string(), delivery));
        }
        for record in records.iter().filter(|r| r.url == result.url) {
            let raw = record.raw.as_str();
            if raw.starts_with("http://") || raw.starts_with("https://") || raw.starts_with("//") {
                needles.push((raw.to_string(), delivery));
            }
        }
    }
    // il più lungo prima, così un URL che è prefisso di un altro non lo spezza
    needles.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
    needles.dedup_by(|a, b| a.0 == b.0);

    let mut out = html.to_string();
    for (needle, delivery) in needles {
        if out.contains(&needle) {
            out = out.replace(&needle, delivery);
        }
    }
    out
}

/// Width/height attributes and eager/lazy loading per image placement.
/// Only `<img>` elements; ordinals match `scan`'s document order.
pub fn apply_loading_hints(html: &str, records: &[ImageRecord], settings: &ImageSettings) -> String {
    let by_ordinal: HashMap<usize, &ImageRecord> = records
        .iter()
        .filter(|r| matches!(r.shape, ReferenceShape::Src | ReferenceShape::Srcset | ReferenceShape::LazyData))
        .filter_map(|r| r.ordinal.map(|o| (o, r)))
        .fold(HashMap::new(), |mut map, (ordinal, record)| {
            let entry = map.entry(ordinal).or_insert(record);
            if entry.width.is_none() && record.width.is_some() {
                *entry = record;
            }
            map
        });

    let mut ordinal = 0usize;
    markup::rewrite_open_tags(html, |tag| {
        if tag.name != "img" {
            return false;
        }
        let current = ordinal;
        ordinal += 1;
        let record = by_ordinal.get(&current);
        let before = tag.clone();

        if settings.add_dimensions && !(tag.has("width") && tag.has("height")) {
            if let Some((w, h)) = record.and_then(|r| Some((r.width?, r.height?))) {
                tag.set("width", &w.to_string());
                tag.set("height", &h.to_string());
            }
        }

        if settings.lazy_load {
            let above_fold = record
                .map(|r| r.above_fold)
                .unwrap_or(current < crate::classify::EAGER_IMAGE_COUNT);
            if above_fold {
                tag.set("loading", "eager");
                tag.set("fetchpriority", "high");
            } else if !tag.has("loading") {
                tag.set("loading", "lazy");
                if !tag.has("decoding") {
                    tag.set("decoding", "async");
                }
            }
        }

        *tag != before
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::migrate::MigrationStatus;
    use crate::migration::scan::scan;
    use std::collections::BTreeMap;

    fn migrated(url: &str, id: &str) -> MigrationResult {
        let base = format!("https://imagedelivery.net/acc/{}", id);
        let variants: BTreeMap<Variant, String> =
            Variant::ALL.iter().map(|v| (*v, format!("{}/{}", base, v))).collect();
        MigrationResult {
            url: url.to_string(),
            status: MigrationStatus::Migrated,
            delivery_url: Some(format!("{}/public", base)),
            variants,
            width: Some(800),
            height: Some(600),
            error: None,
        }
    }

    const BASE: &str = "https://acme.test/";

    #[test]
    fn test_variants_per_context() {
        let html = r#"<html><head><meta property="og:image" content="/img/a.jpg"><link rel="icon" href="/fav.png">
            <style>.x{background:url(/img/a.jpg)}</style></head>
            <body><img src="/img/a.jpg" srcset="/img/a.jpg 480w, /img/b.jpg 1200w">
            <div style="background:url('/img/b.jpg')"></div></body></html>"#;
        let records = scan(html, BASE);
        let results = vec![
            migrated("https://acme.test/img/a.jpg", "A"),
            migrated("https://acme.test/img/b.jpg", "B"),
            migrated("https://acme.test/fav.png", "F"),
        ];
        let out = replace_all_urls(html, BASE, &records, &results);

        assert!(out.contains(r#"content="https://imagedelivery.net/acc/A/social""#));
        assert!(out.contains(r#"href="https://imagedelivery.net/acc/F/icon""#));
        assert!(out.contains(r#"src="https://imagedelivery.net/acc/A/public""#));
        assert!(out.contains("https://imagedelivery.net/acc/A/thumbnail 480w, https://imagedelivery.net/acc/B/public 1200w"));
        assert!(out.contains(r#"url("https://imagedelivery.net/acc/A/public")"#));
        assert!(out.contains(r#"url("https://imagedelivery.net/acc/B/public")"#));
        assert!(!out.contains("/img/a.jpg\""));
    }

    #[test]
    fn test_no_migrated_absolute_url_survives() {
        let html = r#"<img src="https://acme.test/img/a.jpg?x=1&amp;y=2">
            <script>var gallery = ["https://acme.test/img/a.jpg?x=1&y=2", "//acme.test/img/c.png"];</script>
            <a data-full="https://acme.test/img/c.png">zoom</a>"#;
        let records = scan(html, BASE);
        let results = vec![
            migrated("https://acme.test/img/a.jpg?x=1&y=2", "A"),
            migrated("https://acme.test/img/c.png", "C"),
        ];
        let out = replace_all_urls(html, BASE, &records, &results);
        for result in &results {
            assert!(!out.contains(&result.url), "{} survived in {}", result.url, out);
        }
        assert!(!out.contains("//acme.test/img/c.png"));
        assert!(!out.contains("acme.test/img/a.jpg"));
    }

    #[test]
    fn test_failed_results_leave_references_alone() {
        let html = r#"<img src="/img/a.jpg">"#;
        let records = scan(html, BASE);
        let mut failed = migrated("https://acme.test/img/a.jpg", "A");
        failed.status = MigrationStatus::Failed;
        failed.delivery_url = None;
        assert_eq!(replace_all_urls(html, BASE, &records, &[failed]), html);
    }

    #[test]
    fn test_loading_hints() {
        let html = r#"<main><img src="/1.jpg"><img src="/2.jpg"><img src="/3.jpg" loading="lazy"><img src="/4.jpg"><img src="/5.jpg" loading="eager"></main>"#;
        let mut records = scan(html, BASE);
        records[3].width = Some(640);
        records[3].height = Some(480);
        let out = apply_loading_hints(html, &records, &ImageSettings::default());

        assert!(out.contains(r#"<img src="/1.jpg" loading="eager" fetchpriority="high">"#));
        assert!(out.contains(r#"<img src="/3.jpg" loading="eager" fetchpriority="high">"#));
        assert!(out.contains(r#"<img src="/4.jpg" width="640" height="480" loading="lazy" decoding="async">"#));
        assert!(out.contains(r#"<img src="/5.jpg" loading="eager">"#));
    }

    #[test]
    fn test_landmark_images_are_eager() {
        let html = r#"<p><img src="/1.jpg"><img src="/2.jpg"><img src="/3.jpg"></p><header class="site-header"><img src="/logo.png"></header>"#;
        let records = scan(html, BASE);
        let out = apply_loading_hints(html, &records, &ImageSettings::default());
        assert!(out.contains(r#"<img src="/logo.png" loading="eager" fetchpriority="high">"#));
    }
}
