//! # Settings Schema
//!
//! Albero tipizzato delle opzioni di ottimizzazione, una sezione per tipo di asset.
//! Ogni foglia ha un default documentato: `ResolvedSettings::default()` è la base
//! su cui vengono applicati gli override sparsi.

use serde::{Deserialize, Serialize};

/// How aggressively unreferenced CSS selectors are removed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PurgeAggressiveness {
    /// Largest safelist, only obviously dead rules go
    #[default]
    Safe,
    Moderate,
    /// Smallest safelist
    Aggressive,
}

/// Value injected into `@font-face` blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FontDisplay {
    Auto,
    Block,
    #[default]
    Swap,
    Fallback,
    Optional,
}

impl FontDisplay {
    pub fn as_css(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Block => "block",
            Self::Swap => "swap",
            Self::Fallback => "fallback",
            Self::Optional => "optional",
        }
    }
}

/// Loading attribute applied to external script tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadingStrategy {
    #[default]
    Defer,
    Async,
    Module,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CssSettings {
    pub enabled: bool,
    pub purge: bool,
    /// Report what would be purged without removing it
    pub purge_test_mode: bool,
    pub aggressiveness: PurgeAggressiveness,
    /// User regex patterns for class/id names that must never be purged
    pub safelist: Vec<String>,
    pub font_display: FontDisplay,
    pub minify: bool,
}

impl Default for CssSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            purge: true,
            purge_test_mode: false,
            aggressiveness: PurgeAggressiveness::Safe,
            safelist: Vec::new(),
            font_display: FontDisplay::Swap,
            minify: true,
        }
    }
}

/// Individually toggleable dead-script categories
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadScriptToggles {
    pub tracking_pixels: bool,
    pub legacy_polyfills: bool,
    pub emoji: bool,
    pub comment_widgets: bool,
    pub social_share: bool,
    pub jquery_migrate: bool,
}

impl Default for DeadScriptToggles {
    fn default() -> Self {
        Self {
            tracking_pixels: true,
            legacy_polyfills: true,
            emoji: true,
            comment_widgets: false,
            social_share: false,
            jquery_migrate: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JsSettings {
    pub enabled: bool,
    pub minify: bool,
    pub loading: LoadingStrategy,
    /// Relocate head inline scripts to the end of body
    pub move_to_body: bool,
    pub remove: DeadScriptToggles,
    /// Extra global identifiers the minifier must never touch
    pub reserved_globals: Vec<String>,
}

impl Default for JsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            minify: true,
            loading: LoadingStrategy::Defer,
            move_to_body: false,
            remove: DeadScriptToggles::default(),
            reserved_globals: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageSettings {
    pub enabled: bool,
    pub max_width: u32,
    pub jpeg_quality: u8,
    pub generate_webp: bool,
    pub svg_cleanup: bool,
    pub svg_sprites: bool,
    pub lazy_load: bool,
    pub add_dimensions: bool,
    /// Move every referenced image to the content store
    pub migrate: bool,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_width: 1920,
            jpeg_quality: 82,
            generate_webp: true,
            svg_cleanup: true,
            svg_sprites: true,
            lazy_load: true,
            add_dimensions: true,
            migrate: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FontSettings {
    pub self_host: bool,
    pub font_display: FontDisplay,
    pub preload_count: u32,
}

impl Default for FontSettings {
    fn default() -> Self {
        Self {
            self_host: true,
            font_display: FontDisplay::Swap,
            preload_count: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoSettings {
    pub facades: bool,
    /// Keep classified background videos autoplaying (muted, inline)
    pub background_autoplay: bool,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            facades: true,
            background_autoplay: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WidgetSettings {
    pub facades: bool,
    /// Registry names that must be left untouched
    pub excluded: Vec<String>,
}

impl Default for WidgetSettings {
    fn default() -> Self {
        Self {
            facades: true,
            excluded: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeoSettings {
    pub enabled: bool,
    pub canonical: bool,
    pub open_graph: bool,
    pub default_description: String,
    pub lang: String,
}

impl Default for SeoSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            canonical: true,
            open_graph: true,
            default_description: String::new(),
            lang: "en".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceHintSettings {
    pub enabled: bool,
    pub max_preconnect: u32,
    pub dns_prefetch: bool,
    pub preload_lcp: bool,
}

impl Default for ResourceHintSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_preconnect: 4,
            dns_prefetch: true,
            preload_lcp: true,
        }
    }
}

/// Fully populated settings tree, every leaf present
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ResolvedSettings {
    pub css: CssSettings,
    pub js: JsSettings,
    pub images: ImageSettings,
    pub fonts: FontSettings,
    pub video: VideoSettings,
    pub widgets: WidgetSettings,
    pub seo: SeoSettings,
    pub resource_hints: ResourceHintSettings,
}

/// Allowed string values for enum-typed leaves
pub(crate) const ENUM_LEAVES: &[(&str, &[&str])] = &[
    ("css.aggressiveness", &["safe", "moderate", "aggressive"]),
    ("css.font_display", &["auto", "block", "swap", "fallback", "optional"]),
    ("fonts.font_display", &["auto", "block", "swap", "fallback", "optional"]),
    ("js.loading", &["defer", "async", "module", "none"]),
];

/// Inclusive numeric bounds for integer leaves
pub(crate) const RANGE_LEAVES: &[(&str, u64, u64)] = &[
    ("images.max_width", 16, 10_000),
    ("images.jpeg_quality", 1, 100),
    ("fonts.preload_count", 0, 10),
    ("resource_hints.max_preconnect", 0, 16),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_serialize_every_section() {
        let value = serde_json::to_value(ResolvedSettings::default()).unwrap();
        for section in ["css", "js", "images", "fonts", "video", "widgets", "seo", "resource_hints"] {
            assert!(value.get(section).is_some(), "missing section {}", section);
        }
        assert_eq!(value["css"]["aggressiveness"], "safe");
        assert_eq!(value["js"]["loading"], "defer");
    }

    #[test]
    fn test_constraint_tables_point_at_real_leaves() {
        let value = serde_json::to_value(ResolvedSettings::default()).unwrap();
        for (path, _) in ENUM_LEAVES {
            assert!(value.pointer(&format!("/{}", path.replace('.', "/"))).is_some(), "{}", path);
        }
        for (path, _, _) in RANGE_LEAVES {
            assert!(value.pointer(&format!("/{}", path.replace('.', "/"))).is_some(), "{}", path);
        }
    }
}
