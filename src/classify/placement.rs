//! # Placement Heuristics
//!
//! Flag euristici per le immagini: *above-fold* (visibile senza scroll) e
//! *critical* (logo, hero, identità del brand), più la scelta del candidato LCP.

use crate::classify::dom::DomElement;
use scraper::{ElementRef, Html, Selector};

/// Images loaded eagerly regardless of where they sit
pub const EAGER_IMAGE_COUNT: usize = 3;

const LANDMARK_HINTS: &[&str] = &["hero", "banner", "masthead", "site-header", "page-header", "jumbotron"];
const LOGO_HINTS: &[&str] = &["logo", "brand"];
const LANDMARK_DEPTH: usize = 8;
/// Declared dimensions below this are icons, never LCP
const MIN_LCP_DIMENSION: u32 = 100;

/// Inside `<header>`, `role="banner"` or a hero-like container
pub fn in_landmark<E: DomElement>(element: &E) -> bool {
    std::iter::once(element)
        .chain(element.ancestors_up_to(LANDMARK_DEPTH).iter())
        .any(|e| is_landmark(e))
}

fn is_landmark<E: DomElement>(element: &E) -> bool {
    if element.name() == "header" || element.attr("role").as_deref() == Some("banner") {
        return true;
    }
    let id = element.attr("id").unwrap_or_default().to_ascii_lowercase();
    element
        .classes()
        .iter()
        .map(String::as_str)
        .chain(std::iter::once(id.as_str()))
        .any(|token| LANDMARK_HINTS.iter().any(|h| token.contains(h)))
}

/// Visible without scrolling: one of the first images or inside a landmark
pub fn is_above_fold<E: DomElement>(element: &E, ordinal: Option<usize>) -> bool {
    ordinal.map(|o| o < EAGER_IMAGE_COUNT).unwrap_or(false) || in_landmark(element)
}

/// Logo/brand imagery, or anything in a hero landmark
pub fn is_critical<E: DomElement>(element: &E) -> bool {
    let mentions_logo = |e: &E| {
        let haystack = format!(
            "{} {} {} {}",
            e.attr("class").unwrap_or_default(),
            e.attr("id").unwrap_or_default(),
            e.attr("alt").unwrap_or_default(),
            e.attr("src").unwrap_or_default()
        )
        .to_ascii_lowercase();
        LOGO_HINTS.iter().any(|h| haystack.contains(h))
    };
    mentions_logo(element) || element.ancestors_up_to(2).iter().any(mentions_logo) || in_landmark(element)
}

/// Image most likely to be the Largest Contentful Paint element
#[derive(Debug, Clone, PartialEq)]
pub struct LcpCandidate {
    pub url: String,
    /// Document-order index among `<img>` elements
    pub ordinal: usize,
    pub srcset: Option<String>,
}

/// Prefer a hero image, otherwise the largest declared image among the first few
pub fn lcp_candidate(html: &str) -> Option<LcpCandidate> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("img").ok()?;
    let images: Vec<(usize, ElementRef)> = document.select(&selector).enumerate().collect();

    let eligible: Vec<&(usize, ElementRef)> = images
        .iter()
        .filter(|(_, img)| {
            let src = img.attr("src").unwrap_or_default();
            !src.is_empty() && !src.starts_with("data:") && !is_tiny(img) && !looks_like_logo(img)
        })
        .collect();

    let chosen = eligible
        .iter()
        .find(|(_, img)| in_landmark(img))
        .or_else(|| {
            eligible
                .iter()
                .take(EAGER_IMAGE_COUNT + 2)
                .max_by_key(|(ordinal, img)| (declared_area(img), std::cmp::Reverse(*ordinal)))
        })?;

    let (ordinal, img) = chosen;
    Some(LcpCandidate {
        url: DomElement::attr(img, "src").unwrap_or_default(),
        ordinal: *ordinal,
        srcset: DomElement::attr(img, "srcset"),
    })
}

fn declared(element: &ElementRef, name: &str) -> Option<u32> {
    DomElement::attr(element, name)?.trim().trim_end_matches("px").parse().ok()
}

fn declared_area(element: &ElementRef) -> u64 {
    match (declared(element, "width"), declared(element, "height")) {
        (Some(w), Some(h)) => w as u64 * h as u64,
        (Some(w), None) => w as u64 * w as u64,
        _ => 0,
    }
}

fn is_tiny(element: &ElementRef) -> bool {
    let width = declared(element, "width");
    let height = declared(element, "height");
    width.map(|w| w < MIN_LCP_DIMENSION).unwrap_or(false) || height.map(|h| h < MIN_LCP_DIMENSION).unwrap_or(false)
}

fn looks_like_logo(element: &ElementRef) -> bool {
    let text = format!(
        "{} {}",
        DomElement::attr(element, "class").unwrap_or_default(),
        DomElement::attr(element, "src").unwrap_or_default()
    )
    .to_ascii_lowercase();
    text.contains("logo")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nth_img(doc: &Html, n: usize) -> ElementRef<'_> {
        doc.select(&Selector::parse("img").unwrap()).nth(n).unwrap()
    }

    #[test]
    fn test_landmark_detection() {
        let doc = Html::parse_document(
            r#"<header><img src="a.png"></header><div class="page-hero"><div><img src="b.png"></div></div><main><img src="c.png"></main>"#,
        );
        assert!(in_landmark(&nth_img(&doc, 0)));
        assert!(in_landmark(&nth_img(&doc, 1)));
        assert!(!in_landmark(&nth_img(&doc, 2)));
    }

    #[test]
    fn test_above_fold_by_ordinal() {
        let doc = Html::parse_document(r#"<main><img src="c.png"></main>"#);
        let img = nth_img(&doc, 0);
        assert!(is_above_fold(&img, Some(2)));
        assert!(!is_above_fold(&img, Some(3)));
        assert!(!is_above_fold(&img, None));
    }

    #[test]
    fn test_logo_is_critical() {
        let doc = Html::parse_document(r#"<main><a class="brand"><img src="/img/x.svg"></a><img src="/img/photo.jpg"></main>"#);
        assert!(is_critical(&nth_img(&doc, 0)));
        assert!(!is_critical(&nth_img(&doc, 1)));
    }

    #[test]
    fn test_lcp_prefers_hero_then_size() {
        let html = r#"<img src="logo.png" width="200" height="60"><img src="icon.png" width="32" height="32">
            <img src="small.jpg" width="400" height="300"><img src="big.jpg" width="1200" height="800">"#;
        let lcp = lcp_candidate(html).unwrap();
        assert_eq!(lcp.url, "big.jpg");
        assert_eq!(lcp.ordinal, 3);

        let html = r#"<img src="big.jpg" width="1200" height="800"><section class="hero"><img src="hero.jpg"></section>"#;
        assert_eq!(lcp_candidate(html).unwrap().url, "hero.jpg");
    }

    #[test]
    fn test_lcp_none_without_images() {
        assert!(lcp_candidate("<p>text only</p>").is_none());
    }
}
