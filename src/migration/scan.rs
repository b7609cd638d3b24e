//! # Image Reference Scanner
//!
//! Trova ogni riferimento a un'immagine in una pagina, in tutte le forme in cui
//! un sito reale le scrive: `src`, `srcset`, `<picture><source>`, attributi
//! lazy-load, stili inline, blocchi `<style>`, meta social, favicon e sfondi
//! dei page builder. Gli URL relativi vengono risolti rispetto alla pagina.
//!
//! Vengono scartati: host di analytics, host CDN già migrati, `data:` e `blob:`.

use crate::classify::{in_landmark, is_above_fold, is_critical};
use crate::markup::{css_urls, parse_srcset};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use url::Url;

/// Tracking pixels and beacons, never worth migrating
pub const ANALYTICS_HOSTS: &[&str] = &[
    "google-analytics.com",
    "googletagmanager.com",
    "doubleclick.net",
    "facebook.com",
    "bat.bing.com",
    "analytics.twitter.com",
    "px.ads.linkedin.com",
    "stats.wp.com",
    "pixel.wp.com",
    "hotjar.com",
];

/// Delivery hosts of the content store; already migrated
pub const CDN_HOSTS: &[&str] = &["imagedelivery.net"];

const LAZY_ATTRS: &[&str] = &["data-src", "data-lazy-src", "data-original", "data-lazy"];
const LAZY_SRCSET_ATTRS: &[&str] = &["data-srcset", "data-lazy-srcset"];
const BUILDER_ATTRS: &[&str] = &[
    "data-bg",
    "data-background",
    "data-background-image",
    "data-bg-image",
    "data-image-src",
    "data-vc-parallax-image",
];
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "avif", "svg", "ico"];

/// Where a reference was written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceShape {
    Src,
    Srcset,
    InlineStyle,
    StyleBlock,
    LazyData,
    Meta,
    IconLink,
    PictureSource,
    CssContent,
    BuilderBackground,
}

/// One image reference found in a page or stylesheet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Absolute URL after resolution
    pub url: String,
    /// Reference text as written
    pub raw: String,
    pub shape: ReferenceShape,
    /// srcset descriptor (`480w`, `2x`)
    pub descriptor: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub above_fold: bool,
    pub critical: bool,
    /// Document-order index of the owning `<img>`
    pub ordinal: Option<usize>,
}

impl ImageRecord {
    fn new(url: Url, raw: &str, shape: ReferenceShape) -> Self {
        Self {
            url: url.to_string(),
            raw: raw.to_string(),
            shape,
            descriptor: None,
            width: None,
            height: None,
            above_fold: false,
            critical: false,
            ordinal: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Extra hosts to leave alone (suffix match)
    pub skip_hosts: Vec<String>,
}

/// Resolve a reference against the page; `None` for inline payloads and non-http schemes
pub fn resolve_reference(base: Option<&Url>, raw: &str) -> Option<Url> {
    let reference = raw.trim();
    let lower = reference.to_ascii_lowercase();
    if reference.is_empty()
        || reference.starts_with('#')
        || ["data:", "blob:", "javascript:", "about:", "mailto:"].iter().any(|p| lower.starts_with(p))
    {
        return None;
    }
    let url = match base {
        Some(base) => base.join(reference).ok()?,
        None if reference.starts_with("//") => Url::parse(&format!("https:{}", reference)).ok()?,
        None => Url::parse(reference).ok()?,
    };
    matches!(url.scheme(), "http" | "https").then_some(url)
}

fn host_matches(host: &str, list: &[&str]) -> bool {
    list.iter().any(|h| host == *h || host.ends_with(&format!(".{}", h)))
}

fn is_skipped(url: &Url, options: &ScanOptions) -> bool {
    let host = url.host_str().unwrap_or("").to_ascii_lowercase();
    host_matches(&host, ANALYTICS_HOSTS)
        || host_matches(&host, CDN_HOSTS)
        || options.skip_hosts.iter().any(|h| host == *h || host.ends_with(&format!(".{}", h)))
}

/// CSS `url()` also points at fonts and cursors; only keep image extensions
fn looks_like_image(url: &Url) -> bool {
    let path = url.path().to_ascii_lowercase();
    path.rsplit('.').next().map(|ext| IMAGE_EXTENSIONS.contains(&ext)).unwrap_or(false)
}

struct Scanner<'a> {
    base: Option<Url>,
    options: &'a ScanOptions,
    records: Vec<ImageRecord>,
}

impl<'a> Scanner<'a> {
    fn push(&mut self, raw: &str, shape: ReferenceShape) -> Option<&mut ImageRecord> {
        let url = resolve_reference(self.base.as_ref(), raw)?;
        if is_skipped(&url, self.options) {
            return None;
        }
        let css_derived = matches!(
            shape,
            ReferenceShape::InlineStyle | ReferenceShape::StyleBlock | ReferenceShape::CssContent
        );
        if css_derived && !looks_like_image(&url) {
            return None;
        }
        self.records.push(ImageRecord::new(url, raw.trim(), shape));
        self.records.last_mut()
    }

    fn push_srcset(&mut self, srcset: &str, shape: ReferenceShape, placement: Placement) {
        for candidate in parse_srcset(srcset) {
            if let Some(record) = self.push(&candidate.url, shape) {
                record.descriptor = candidate.descriptor.clone();
                placement.apply(record);
            }
        }
    }

    fn push_css(&mut self, css: &str, shape: ReferenceShape, placement: Placement) {
        for reference in css_urls(css) {
            if let Some(record) = self.push(&reference, shape) {
                placement.apply(record);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Placement {
    above_fold: bool,
    critical: bool,
    ordinal: Option<usize>,
    width: Option<u32>,
    height: Option<u32>,
}

impl Placement {
    fn of_img(img: &ElementRef, ordinal: usize) -> Self {
        Self {
            above_fold: is_above_fold(img, Some(ordinal)),
            critical: is_critical(img),
            ordinal: Some(ordinal),
            width: dimension(img, "width"),
            height: dimension(img, "height"),
        }
    }

    fn of_container(element: &ElementRef) -> Self {
        let landmark = in_landmark(element);
        Self { above_fold: landmark, critical: landmark, ..Default::default() }
    }

    fn apply(&self, record: &mut ImageRecord) {
        record.above_fold = self.above_fold;
        record.critical = self.critical;
        record.ordinal = self.ordinal;
        record.width = self.width;
        record.height = self.height;
    }
}

fn dimension(element: &ElementRef, name: &str) -> Option<u32> {
    element.value().attr(name)?.trim().trim_end_matches("px").parse().ok()
}

fn select<'d>(document: &'d Html, selector: &str) -> Vec<ElementRef<'d>> {
    match Selector::parse(selector) {
        Ok(selector) => document.select(&selector).collect(),
        Err(_) => Vec::new(),
    }
}

fn page_base(base_url: &str) -> Option<Url> {
    Url::parse(base_url).ok()
}

/// Every image reference in a page
pub fn scan(html: &str, base_url: &str) -> Vec<ImageRecord> {
    scan_with(html, base_url, &ScanOptions::default())
}

pub fn scan_with(html: &str, base_url: &str, options: &ScanOptions) -> Vec<ImageRecord> {
    let document = Html::parse_document(html);
    let mut scanner = Scanner { base: page_base(base_url), options, records: Vec::new() };

    // <img>: src, srcset e varianti lazy, con placement per ordinale
    for (ordinal, img) in select(&document, "img").into_iter().enumerate() {
        let placement = Placement::of_img(&img, ordinal);
        let element = img.value();
        if let Some(src) = element.attr("src") {
            if let Some(record) = scanner.push(src, ReferenceShape::Src) {
                placement.apply(record);
            }
        }
        if let Some(srcset) = element.attr("srcset") {
            scanner.push_srcset(srcset, ReferenceShape::Srcset, placement);
        }
        for attr in LAZY_ATTRS {
            if let Some(value) = element.attr(attr) {
                if let Some(record) = scanner.push(value, ReferenceShape::LazyData) {
                    placement.apply(record);
                }
            }
        }
        for attr in LAZY_SRCSET_ATTRS {
            if let Some(value) = element.attr(attr) {
                scanner.push_srcset(value, ReferenceShape::LazyData, placement);
            }
        }
    }

    for source in select(&document, "picture source") {
        let placement = Placement::of_container(&source);
        let element = source.value();
        if let Some(srcset) = element.attr("srcset").or_else(|| element.attr("data-srcset")) {
            scanner.push_srcset(srcset, ReferenceShape::PictureSource, placement);
        }
        if let Some(src) = element.attr("src") {
            if let Some(record) = scanner.push(src, ReferenceShape::PictureSource) {
                placement.apply(record);
            }
        }
    }

    for styled in select(&document, "[style]") {
        if let Some(style) = styled.value().attr("style") {
            scanner.push_css(style, ReferenceShape::InlineStyle, Placement::of_container(&styled));
        }
    }

    for block in select(&document, "style") {
        let css: String = block.text().collect();
        scanner.push_css(&css, ReferenceShape::StyleBlock, Placement::default());
    }

    let builder_selector = BUILDER_ATTRS.iter().map(|a| format!("[{}]", a)).collect::<Vec<_>>().join(", ");
    for element in select(&document, &builder_selector) {
        let placement = Placement::of_container(&element);
        for attr in BUILDER_ATTRS {
            if let Some(value) = element.value().attr(attr) {
                let reference = css_urls(value).into_iter().next().unwrap_or_else(|| value.to_string());
                if let Some(record) = scanner.push(&reference, ReferenceShape::BuilderBackground) {
                    placement.apply(record);
                }
            }
        }
    }

    let meta_selector = r#"meta[property="og:image"], meta[property="og:image:url"], meta[property="og:image:secure_url"], meta[name="twitter:image"], meta[property="twitter:image"]"#;
    for meta in select(&document, meta_selector) {
        if let Some(content) = meta.value().attr("content") {
            scanner.push(content, ReferenceShape::Meta);
        }
    }

    for link in select(&document, "link[rel][href]") {
        let element = link.value();
        let rel = element.attr("rel").unwrap_or("").to_ascii_lowercase();
        if rel.split_whitespace().any(|r| r.contains("icon")) {
            if let Some(href) = element.attr("href") {
                scanner.push(href, ReferenceShape::IconLink);
            }
        }
    }

    scanner.records
}

/// Image references inside a crawled stylesheet, resolved against its own URL
pub fn scan_stylesheet(css: &str, base_url: &str) -> Vec<ImageRecord> {
    let options = ScanOptions::default();
    let mut scanner = Scanner { base: page_base(base_url), options: &options, records: Vec::new() };
    scanner.push_css(css, ReferenceShape::CssContent, Placement::default());
    scanner.records
}

/// Unique URLs in first-seen order
pub fn unique_urls(records: &[ImageRecord]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    records
        .iter()
        .filter(|r| seen.insert(r.url.clone()))
        .map(|r| r.url.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "https://acme.test/blog/post/";

    fn shapes(records: &[ImageRecord]) -> Vec<(ReferenceShape, &str)> {
        records.iter().map(|r| (r.shape, r.url.as_str())).collect()
    }

    #[test]
    fn test_every_shape_is_found() {
        let html = r#"<html><head>
            <meta property="og:image" content="/img/social.jpg">
            <link rel="shortcut icon" href="/favicon.ico">
            <style>.hero{background:url(../../img/bg.jpg)} @font-face{src:url(/f.woff2)}</style>
            </head><body>
            <img src="a.jpg" srcset="a-480.jpg 480w, a-1200.jpg 1200w" width="1200" height="800">
            <img data-src="/img/lazy.png">
            <picture><source srcset="/img/p.webp" type="image/webp"><img src="/img/p.jpg"></picture>
            <div style="background-image: url('/img/inline.png')"></div>
            <section data-vc-parallax-image="https://acme.test/img/parallax.jpg"></section>
            </body></html>"#;
        let records = scan(html, BASE);
        let found = shapes(&records);

        assert!(found.contains(&(ReferenceShape::Meta, "https://acme.test/img/social.jpg")));
        assert!(found.contains(&(ReferenceShape::IconLink, "https://acme.test/favicon.ico")));
        assert!(found.contains(&(ReferenceShape::StyleBlock, "https://acme.test/img/bg.jpg")));
        assert!(found.contains(&(ReferenceShape::Src, "https://acme.test/blog/post/a.jpg")));
        assert!(found.contains(&(ReferenceShape::Srcset, "https://acme.test/blog/post/a-480.jpg")));
        assert!(found.contains(&(ReferenceShape::LazyData, "https://acme.test/img/lazy.png")));
        assert!(found.contains(&(ReferenceShape::PictureSource, "https://acme.test/img/p.webp")));
        assert!(found.contains(&(ReferenceShape::InlineStyle, "https://acme.test/img/inline.png")));
        assert!(found.contains(&(ReferenceShape::BuilderBackground, "https://acme.test/img/parallax.jpg")));
        // i font in url() non sono immagini
        assert!(!records.iter().any(|r| r.url.ends_with(".woff2")));

        let srcset = records.iter().find(|r| r.url.ends_with("a-480.jpg")).unwrap();
        assert_eq!(srcset.descriptor.as_deref(), Some("480w"));
        assert_eq!(srcset.ordinal, Some(0));
        assert_eq!(srcset.width, Some(1200));
    }

    #[test]
    fn test_skipped_references() {
        let html = r#"<img src="data:image/png;base64,AAAA"><img src="blob:https://acme.test/x">
            <img src="https://www.google-analytics.com/collect?v=1"><img src="https://www.facebook.com/tr?id=1">
            <img src="https://imagedelivery.net/acc/abc/public"><img src="https://static.partner.com/a.png">"#;
        let options = ScanOptions { skip_hosts: vec!["partner.com".into()] };
        assert!(scan_with(html, BASE, &options).is_empty());
    }

    #[test]
    fn test_placement_flags() {
        let html = r#"<header><img src="/logo.svg" class="logo"></header>
            <main><img src="/1.jpg"><img src="/2.jpg"><img src="/3.jpg"><img src="/4.jpg"></main>"#;
        let records = scan(html, BASE);
        let flags: Vec<(bool, Option<usize>)> = records.iter().map(|r| (r.above_fold, r.ordinal)).collect();
        assert_eq!(
            flags,
            vec![(true, Some(0)), (true, Some(1)), (true, Some(2)), (false, Some(3)), (false, Some(4))]
        );
        assert!(records[0].critical);
        assert!(!records[4].critical);
    }

    #[test]
    fn test_stylesheet_resolves_against_its_own_url() {
        let css = ".a{background:url(../img/a.png)} .b{background:url(data:image/gif;base64,R0l)}";
        let records = scan_stylesheet(css, "https://acme.test/assets/css/site.css");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].url, "https://acme.test/assets/img/a.png");
        assert_eq!(records[0].shape, ReferenceShape::CssContent);
    }

    #[test]
    fn test_unique_urls_keep_first_seen_order() {
        let html = r#"<img src="/b.jpg"><img src="/a.jpg"><img src="/b.jpg">"#;
        let urls = unique_urls(&scan(html, BASE));
        assert_eq!(urls, vec!["https://acme.test/b.jpg", "https://acme.test/a.jpg"]);
    }
}
