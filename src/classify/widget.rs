//! # Widget Classifier
//!
//! Registro dichiarativo degli embed di terze parti (chat, social, scheduling,
//! mappe). Ogni voce contiene selettori, sottostringhe degli URL di script,
//! firme regex per script inline e il template della facade sostitutiva.

use crate::classify::dom::DomElement;
use regex::Regex;
use scraper::{Html, Selector};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WidgetCategory {
    Chat,
    Social,
    Scheduling,
    Map,
}

/// One registry entry
#[derive(Debug)]
pub struct WidgetDefinition {
    pub name: &'static str,
    pub category: WidgetCategory,
    pub selectors: &'static [&'static str],
    pub script_substrings: &'static [&'static str],
    pub inline_signatures: &'static [&'static str],
    /// Placeholder markup; `{name}` and `{label}` are filled at substitution time
    pub facade: &'static str,
    pub label: &'static str,
}

const CHAT_FACADE: &str = r#"<button type="button" class="so-facade so-facade-chat" data-so-widget="{name}" aria-label="{label}" style="position:fixed;right:20px;bottom:20px;width:60px;height:60px;border-radius:50%;border:0;background:#1f2937;color:#fff;cursor:pointer;z-index:2147483000">&#128172;</button>"#;
const EMBED_FACADE: &str = r#"<div class="so-facade so-facade-embed" data-so-widget="{name}" role="button" tabindex="0" style="min-height:120px;display:flex;align-items:center;justify-content:center;border:1px solid #e5e7eb;cursor:pointer">{label}</div>"#;
const MAP_FACADE: &str = r#"<div class="so-facade so-facade-map" data-so-widget="{name}" role="button" tabindex="0" style="min-height:300px;display:flex;align-items:center;justify-content:center;background:#e5e7eb;cursor:pointer">{label}</div>"#;

pub const WIDGET_REGISTRY: &[WidgetDefinition] = &[
    WidgetDefinition {
        name: "intercom",
        category: WidgetCategory::Chat,
        selectors: &["#intercom-container", ".intercom-lightweight-app"],
        script_substrings: &["widget.intercom.io", "js.intercomcdn.com"],
        inline_signatures: &[r"window\.intercomSettings", r"Intercom\(\s*['\x22]boot"],
        facade: CHAT_FACADE,
        label: "Open chat",
    },
    WidgetDefinition {
        name: "drift",
        category: WidgetCategory::Chat,
        selectors: &["#drift-widget", "#drift-frame-controller"],
        script_substrings: &["js.driftt.com", "drift.com/include"],
        inline_signatures: &[r"drift\.load\(", r"window\.drift\s*="],
        facade: CHAT_FACADE,
        label: "Open chat",
    },
    WidgetDefinition {
        name: "crisp",
        category: WidgetCategory::Chat,
        selectors: &[".crisp-client"],
        script_substrings: &["client.crisp.chat"],
        inline_signatures: &[r"CRISP_WEBSITE_ID"],
        facade: CHAT_FACADE,
        label: "Open chat",
    },
    WidgetDefinition {
        name: "tawk",
        category: WidgetCategory::Chat,
        selectors: &["#tawkchat-container"],
        script_substrings: &["embed.tawk.to"],
        inline_signatures: &[r"Tawk_API"],
        facade: CHAT_FACADE,
        label: "Open chat",
    },
    WidgetDefinition {
        name: "zendesk",
        category: WidgetCategory::Chat,
        selectors: &["#launcher", "iframe#webWidget"],
        script_substrings: &["static.zdassets.com", "zopim.com"],
        inline_signatures: &[r"zE\(\s*['\x22]", r"\$zopim"],
        facade: CHAT_FACADE,
        label: "Open support chat",
    },
    WidgetDefinition {
        name: "hubspot_chat",
        category: WidgetCategory::Chat,
        selectors: &["#hubspot-messages-iframe-container"],
        script_substrings: &["js.hs-scripts.com", "js.usemessages.com"],
        inline_signatures: &[r"HubSpotConversations"],
        facade: CHAT_FACADE,
        label: "Open chat",
    },
    WidgetDefinition {
        name: "livechat",
        category: WidgetCategory::Chat,
        selectors: &["#chat-widget-container"],
        script_substrings: &["cdn.livechatinc.com"],
        inline_signatures: &[r"__lc\.license"],
        facade: CHAT_FACADE,
        label: "Open chat",
    },
    WidgetDefinition {
        name: "twitter",
        category: WidgetCategory::Social,
        selectors: &["blockquote.twitter-tweet", "a.twitter-timeline"],
        script_substrings: &["platform.twitter.com/widgets.js"],
        inline_signatures: &[r"twttr\.widgets"],
        facade: EMBED_FACADE,
        label: "Load post",
    },
    WidgetDefinition {
        name: "instagram",
        category: WidgetCategory::Social,
        selectors: &["blockquote.instagram-media"],
        script_substrings: &["instagram.com/embed.js"],
        inline_signatures: &[r"instgrm\.Embeds"],
        facade: EMBED_FACADE,
        label: "Load post",
    },
    WidgetDefinition {
        name: "facebook",
        category: WidgetCategory::Social,
        selectors: &[".fb-page", ".fb-post", ".fb-comments"],
        script_substrings: &["connect.facebook.net"],
        inline_signatures: &[r"FB\.init\("],
        facade: EMBED_FACADE,
        label: "Load Facebook content",
    },
    WidgetDefinition {
        name: "calendly",
        category: WidgetCategory::Scheduling,
        selectors: &[".calendly-inline-widget", ".calendly-badge-widget"],
        script_substrings: &["assets.calendly.com", "calendly.com/assets/external/widget.js"],
        inline_signatures: &[r"Calendly\.init"],
        facade: EMBED_FACADE,
        label: "Load scheduling",
    },
    WidgetDefinition {
        name: "google_maps",
        category: WidgetCategory::Map,
        selectors: &["iframe[src*=\"google.com/maps\"]"],
        script_substrings: &["google.com/maps/embed", "maps.googleapis.com/maps/api/js"],
        inline_signatures: &[r"new\s+google\.maps\.Map\("],
        facade: MAP_FACADE,
        label: "Load map",
    },
];

/// Weight of each kind of match; combined and capped at 1.0
const SCRIPT_URL_WEIGHT: f32 = 0.9;
const INLINE_SIGNATURE_WEIGHT: f32 = 0.8;
const SELECTOR_WEIGHT: f32 = 0.6;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WidgetClassification {
    pub name: &'static str,
    pub category: WidgetCategory,
    pub confidence: f32,
    pub signals: Vec<String>,
}

impl WidgetDefinition {
    pub fn render_facade(&self) -> String {
        self.facade.replace("{name}", self.name).replace("{label}", self.label)
    }
}

pub fn widget_by_name(name: &str) -> Option<&'static WidgetDefinition> {
    WIDGET_REGISTRY.iter().find(|w| w.name == name)
}

fn signature_regexes() -> &'static HashMap<&'static str, Vec<Regex>> {
    static RE: OnceLock<HashMap<&'static str, Vec<Regex>>> = OnceLock::new();
    RE.get_or_init(|| {
        WIDGET_REGISTRY
            .iter()
            .map(|w| {
                let compiled = w.inline_signatures.iter().filter_map(|p| Regex::new(p).ok()).collect();
                (w.name, compiled)
            })
            .collect()
    })
}

/// Match a single element against the registry; best match wins
pub fn classify_widget<E: DomElement>(element: &E) -> Option<WidgetClassification> {
    let name = element.name();
    let src = match name.as_str() {
        "script" | "iframe" => element.attr("src").or_else(|| element.attr("data-src")).unwrap_or_default(),
        _ => String::new(),
    };
    let inline = if name == "script" && src.is_empty() { element.text_content() } else { String::new() };

    let mut best: Option<WidgetClassification> = None;
    for widget in WIDGET_REGISTRY {
        let mut signals = Vec::new();
        let mut score = 0.0f32;

        if !src.is_empty() && widget.script_substrings.iter().any(|s| src.contains(s)) {
            signals.push("script_url".to_string());
            score += SCRIPT_URL_WEIGHT;
        }
        if !inline.is_empty() {
            if let Some(regexes) = signature_regexes().get(widget.name) {
                if regexes.iter().any(|r| r.is_match(&inline)) {
                    signals.push("inline_signature".to_string());
                    score += INLINE_SIGNATURE_WEIGHT;
                }
            }
        }
        if widget.selectors.iter().any(|s| element.matches_selector(s)) {
            signals.push("selector".to_string());
            score += SELECTOR_WEIGHT;
        }

        if signals.is_empty() {
            continue;
        }
        let confidence = score.min(1.0);
        if best.as_ref().map(|b| confidence > b.confidence).unwrap_or(true) {
            best = Some(WidgetClassification {
                name: widget.name,
                category: widget.category,
                confidence,
                signals,
            });
        }
    }
    best
}

/// Widgets present anywhere in a document, one entry per registry name
pub fn detect_widgets(html: &str) -> Vec<WidgetClassification> {
    let document = Html::parse_document(html);
    let mut found: Vec<WidgetClassification> = Vec::new();

    let mut record = |classification: WidgetClassification| {
        match found.iter_mut().find(|f| f.name == classification.name) {
            Some(existing) => {
                for signal in classification.signals {
                    if !existing.signals.contains(&signal) {
                        existing.signals.push(signal);
                    }
                }
                existing.confidence = existing.confidence.max(classification.confidence);
            }
            None => found.push(classification),
        }
    };

    if let Ok(candidates) = Selector::parse("script, iframe") {
        for element in document.select(&candidates) {
            if let Some(classification) = classify_widget(&element) {
                record(classification);
            }
        }
    }

    for widget in WIDGET_REGISTRY {
        for raw in widget.selectors {
            let Ok(selector) = Selector::parse(raw) else { continue };
            if document.select(&selector).next().is_some() {
                record(WidgetClassification {
                    name: widget.name,
                    category: widget.category,
                    confidence: SELECTOR_WEIGHT,
                    signals: vec!["selector".to_string()],
                });
            }
        }
    }

    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markup::Tag;

    #[test]
    fn test_registry_is_well_formed() {
        let mut names = std::collections::HashSet::new();
        for widget in WIDGET_REGISTRY {
            assert!(names.insert(widget.name), "duplicate {}", widget.name);
            assert!(!widget.script_substrings.is_empty());
            for selector in widget.selectors {
                assert!(Selector::parse(selector).is_ok(), "bad selector {}", selector);
            }
            assert_eq!(signature_regexes()[widget.name].len(), widget.inline_signatures.len());
            assert!(widget.render_facade().contains(widget.name));
        }
    }

    #[test]
    fn test_script_url_match() {
        let tag = Tag::parse(r#"<script async src="https://widget.intercom.io/widget/abc123">"#).unwrap();
        let result = classify_widget(&tag).unwrap();
        assert_eq!(result.name, "intercom");
        assert_eq!(result.category, WidgetCategory::Chat);
        assert_eq!(result.signals, vec!["script_url"]);
    }

    #[test]
    fn test_detect_widgets_in_document() {
        let html = r#"<html><body>
            <blockquote class="twitter-tweet"><a href="https://twitter.com/x/status/1">t</a></blockquote>
            <iframe src="https://www.google.com/maps/embed?pb=123"></iframe>
            <script>window.intercomSettings = { app_id: "x" };</script>
            <script src="/js/app.js"></script>
        </body></html>"#;
        let widgets = detect_widgets(html);
        let names: Vec<_> = widgets.iter().map(|w| w.name).collect();
        assert_eq!(names.len(), 3);
        assert!(names.contains(&"twitter"));
        assert!(names.contains(&"google_maps"));
        assert!(names.contains(&"intercom"));

        let maps = widgets.iter().find(|w| w.name == "google_maps").unwrap();
        assert_eq!(maps.confidence, 1.0);
    }

    #[test]
    fn test_unknown_script_is_not_a_widget() {
        let tag = Tag::parse(r#"<script src="/assets/main.js">"#).unwrap();
        assert!(classify_widget(&tag).is_none());
    }
}
