//! SEO/meta injection: only adds what is missing, never overwrites authored tags.

use crate::markup::{self, open_tags, Tag};
use crate::optimizer::{OptimizeOutcome, OptimizeStats};
use crate::settings::SeoSettings;
use scraper::{Html, Selector};

/// Search engines truncate descriptions around this length
pub const DESCRIPTION_MAX_CHARS: usize = 155;

const VIEWPORT: &str = r#"<meta name="viewport" content="width=device-width, initial-scale=1">"#;

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Cut on a word boundary, appending an ellipsis when shortened
pub fn truncate_description(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    let cut: String = collapsed.chars().take(max_chars.saturating_sub(1)).collect();
    let trimmed = match cut.rfind(' ') {
        Some(space) if space > max_chars / 2 => &cut[..space],
        _ => cut.as_str(),
    };
    format!("{}…", trimmed.trim_end_matches([',', ';', ':', '.', ' ']))
}

struct ExistingMeta {
    names: Vec<String>,
    properties: Vec<String>,
    canonical: bool,
}

fn existing_meta(html: &str) -> ExistingMeta {
    let mut existing = ExistingMeta { names: Vec::new(), properties: Vec::new(), canonical: false };
    for (tag, _) in open_tags(html) {
        match tag.name.as_str() {
            "meta" => {
                if let Some(name) = tag.get("name") {
                    existing.names.push(name.to_ascii_lowercase());
                }
                if let Some(property) = tag.get("property") {
                    existing.properties.push(property.to_ascii_lowercase());
                }
            }
            "link" => {
                let rel = tag.get("rel").unwrap_or("").to_ascii_lowercase();
                if rel.split_whitespace().any(|r| r == "canonical") {
                    existing.canonical = true;
                }
            }
            _ => {}
        }
    }
    existing
}

fn document_text(html: &str, selector: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse(selector).ok()?;
    document
        .select(&selector)
        .map(|e| e.text().collect::<String>().split_whitespace().collect::<Vec<_>>().join(" "))
        .find(|t| !t.is_empty())
}

fn meta_content(html: &str, name: &str) -> Option<String> {
    open_tags(html)
        .into_iter()
        .find(|(tag, _)| tag.name == "meta" && tag.get("name").map(|n| n.eq_ignore_ascii_case(name)).unwrap_or(false))
        .and_then(|(tag, _)| tag.get("content").map(|c| c.to_string()))
}

/// Add missing lang, viewport, description, canonical and Open Graph tags.
/// `page_url` is the public URL of the page, needed for canonical and `og:url`.
pub fn inject_seo(html: &str, page_url: Option<&str>, settings: &SeoSettings) -> OptimizeOutcome {
    if !settings.enabled || markup::first_element(html, "head").is_none() {
        return OptimizeOutcome::unchanged(html);
    }
    let existing = existing_meta(html);
    let mut added: Vec<String> = Vec::new();
    let mut head = String::new();

    if !existing.names.iter().any(|n| n == "viewport") {
        head.push_str(VIEWPORT);
        added.push("viewport".to_string());
    }

    let description = meta_content(html, "description").filter(|d| !d.trim().is_empty()).or_else(|| {
        let fallback = if settings.default_description.trim().is_empty() {
            document_text(html, "main p, article p, p")?
        } else {
            settings.default_description.clone()
        };
        let text = truncate_description(&fallback, DESCRIPTION_MAX_CHARS);
        head.push_str(&format!(r#"<meta name="description" content="{}">"#, escape_attr(&text)));
        added.push("description".to_string());
        Some(text)
    });

    if settings.canonical && !existing.canonical {
        if let Some(url) = page_url {
            head.push_str(&format!(r#"<link rel="canonical" href="{}">"#, escape_attr(url)));
            added.push("canonical".to_string());
        }
    }

    if settings.open_graph {
        let has = |p: &str| existing.properties.iter().any(|e| e == p);
        if !has("og:type") {
            head.push_str(r#"<meta property="og:type" content="website">"#);
            added.push("og:type".to_string());
        }
        if !has("og:title") {
            if let Some(title) = document_text(html, "title") {
                head.push_str(&format!(r#"<meta property="og:title" content="{}">"#, escape_attr(&title)));
                added.push("og:title".to_string());
            }
        }
        if !has("og:description") {
            if let Some(text) = &description {
                head.push_str(&format!(r#"<meta property="og:description" content="{}">"#, escape_attr(text)));
                added.push("og:description".to_string());
            }
        }
        if !has("og:url") {
            if let Some(url) = page_url {
                head.push_str(&format!(r#"<meta property="og:url" content="{}">"#, escape_attr(url)));
                added.push("og:url".to_string());
            }
        }
    }

    let mut content = if head.is_empty() { html.to_string() } else { markup::insert_before_close(html, "head", &head) };

    if !settings.lang.is_empty() {
        let mut lang_added = false;
        content = markup::rewrite_open_tags(&content, |tag: &mut Tag| {
            if tag.name == "html" && !tag.has("lang") && !lang_added {
                tag.set("lang", &settings.lang);
                lang_added = true;
                return true;
            }
            false
        });
        if lang_added {
            added.push("lang".to_string());
        }
    }

    let mut stats = OptimizeStats::sized(html.len(), content.len());
    stats.notes = added.into_iter().map(|a| format!("added {}", a)).collect();
    OptimizeOutcome { content, stats }
}
