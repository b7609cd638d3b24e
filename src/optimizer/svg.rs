//! # SVG Sprite Deduplication
//!
//! Le icone SVG inline ripetute (stesso viewBox, stesso contenuto) diventano un
//! unico `<symbol>` in uno sprite nascosto subito dopo `<body>`, e ogni copia
//! diventa un `<svg><use href="#..."/></svg>` che conserva classi, dimensioni e
//! attributi di accessibilità dell'originale.
//!
//! Solo gruppi con almeno `MIN_SPRITE_GROUP` copie. Le SVG con `<script>` o
//! `<foreignObject>` non vengono mai toccate.

use crate::markup::{self, elements, Element, Tag};
use crate::optimizer::{content_hash, OptimizeOutcome, OptimizeStats};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

pub const MIN_SPRITE_GROUP: usize = 3;
pub const SPRITE_ID_PREFIX: &str = "so-icon-";
const SPRITE_MARKER: &str = "data-so-sprite";

/// Outer attributes that only describe the document, not the drawing
const DROPPED_ATTRS: &[&str] = &["xmlns", "xmlns:xlink", "version", "xml:space"];

fn whitespace() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("static whitespace regex"))
}

fn normalize(inner: &str) -> String {
    whitespace().replace_all(inner.trim(), " ").replace("> <", "><")
}

/// Top-level inline svgs; nested ones belong to their parent
fn top_level_svgs(html: &str) -> Vec<Element> {
    let mut out: Vec<Element> = Vec::new();
    for svg in elements(html, "svg") {
        if out.last().map(|prev| svg.outer.start < prev.outer.end).unwrap_or(false) {
            continue;
        }
        out.push(svg);
    }
    out
}

fn spriteable(svg: &Element, html: &str) -> bool {
    let inner = svg.inner_html(html).to_ascii_lowercase();
    !inner.is_empty() && !inner.contains("<script") && !inner.contains("foreignobject") && !svg.tag.has(SPRITE_MARKER)
}

fn reference_tag(original: &Tag) -> Tag {
    let mut tag = original.clone();
    tag.self_closing = false;
    for attr in DROPPED_ATTRS {
        tag.remove(attr);
    }
    tag
}

/// Replace repeated inline svgs with `<use>` references into a sprite
pub fn build_sprites(html: &str, enabled: bool) -> OptimizeOutcome {
    if !enabled || html.contains(SPRITE_MARKER) {
        return OptimizeOutcome::unchanged(html);
    }

    let candidates: Vec<Element> = top_level_svgs(html).into_iter().filter(|svg| spriteable(svg, html)).collect();

    // chiave: viewBox + contenuto normalizzato
    let mut groups: BTreeMap<String, Vec<&Element>> = BTreeMap::new();
    for svg in &candidates {
        let key = format!("{}|{}", svg.tag.get("viewbox").unwrap_or(""), normalize(svg.inner_html(html)));
        groups.entry(content_hash(key.as_bytes())).or_default().push(svg);
    }

    let mut symbols = String::new();
    let mut edits = Vec::new();
    let mut replaced = 0usize;
    let mut group_count = 0usize;

    for (hash, members) in &groups {
        if members.len() < MIN_SPRITE_GROUP {
            continue;
        }
        group_count += 1;
        let id = format!("{}{}", SPRITE_ID_PREFIX, &hash[..8]);
        let first = members[0];
        let view_box = first
            .tag
            .get("viewbox")
            .map(|v| format!(r#" viewBox="{}""#, v))
            .unwrap_or_default();
        symbols.push_str(&format!(
            r#"<symbol id="{}"{}>{}</symbol>"#,
            id,
            view_box,
            normalize(first.inner_html(html))
        ));

        for member in members {
            let tag = reference_tag(&member.tag);
            edits.push((member.outer.clone(), format!(r##"{}<use href="#{}"/></svg>"##, tag.to_html(), id)));
            replaced += 1;
        }
    }

    if edits.is_empty() {
        return OptimizeOutcome::unchanged(html);
    }

    let spliced = markup::splice(html, edits);
    let sprite = format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" style="display:none" aria-hidden="true" {}>{}</svg>"#,
        SPRITE_MARKER, symbols
    );
    let content = markup::insert_after_open(&spliced, "body", &sprite);

    let mut stats = OptimizeStats::sized(html.len(), content.len());
    stats.notes.push(format!("{} inline svgs folded into {} symbols", replaced, group_count));
    OptimizeOutcome { content, stats }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ICON: &str = r#"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 24 24" class="icon" width="24" height="24" aria-hidden="true"><path d="M12 2C6.48 2 2 6.48 2 12s4.48 10 10 10 10-4.48 10-10S17.52 2 12 2zm0 18c-4.41 0-8-3.59-8-8s3.59-8 8-8 8 3.59 8 8-3.59 8-8 8z"/></svg>"#;

    fn page(body: &str) -> String {
        format!("<html><head></head><body>{}</body></html>", body)
    }

    #[test]
    fn test_four_copies_become_one_symbol() {
        let html = page(&format!("<p>{}</p><p>{}</p><p>{}</p><p>{}</p>", ICON, ICON, ICON, ICON));
        let out = build_sprites(&html, true);

        assert_eq!(out.content.matches("<symbol").count(), 1);
        assert_eq!(out.content.matches("<use href=").count(), 4);
        assert!(out.content.contains(r#"<body><svg xmlns="http://www.w3.org/2000/svg" style="display:none""#));

        let reference = out.content.split("<p>").nth(1).unwrap().split("</p>").next().unwrap();
        assert!(reference.contains(r#"class="icon""#));
        assert!(reference.contains(r#"width="24""#));
        assert!(reference.len() * 4 < ICON.len() * 4);
    }

    #[test]
    fn test_small_groups_and_unsafe_svgs_untouched() {
        let unsafe_svg = r#"<svg viewBox="0 0 1 1"><foreignObject><div>x</div></foreignObject></svg>"#;
        let html = page(&format!("{}{}{}{}{}", ICON, ICON, unsafe_svg, unsafe_svg, unsafe_svg));
        let out = build_sprites(&html, true);
        assert_eq!(out.content, html);
    }

    #[test]
    fn test_whitespace_differences_still_group() {
        let spaced = ICON.replace("><path", ">\n   <path").replace("/></svg>", "/>\n</svg>");
        let html = page(&format!("{}{}{}", ICON, spaced, ICON));
        let out = build_sprites(&html, true);
        assert_eq!(out.content.matches("<use href=").count(), 3);
    }

    #[test]
    fn test_idempotent_and_disabled() {
        let html = page(&ICON.repeat(3));
        let once = build_sprites(&html, true).content;
        let twice = build_sprites(&once, true).content;
        assert_eq!(once, twice);
        assert_eq!(build_sprites(&html, false).content, html);
    }
}
