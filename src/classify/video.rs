//! # Video Classifier
//!
//! Decide se un `<video>` o un `<iframe>` di embed è un video di sfondo
//! (muto, in loop, decorativo) oppure un player click-to-play.
//!
//! ## Responsabilità:
//! - Raccoglie i segnali indipendenti dal DOM (attributi, classi, stile inline,
//!   antenati page-builder, fratelli sovrapposti, parametri dell'URL di embed)
//! - Delega il punteggio a `signals::decide`, che conosce solo la tabella pesi
//! - Riconosce gli embed YouTube/Vimeo e ne estrae l'id per le facade

use crate::classify::dom::DomElement;
use crate::classify::signals::{decide, VideoClassification, VideoSignal};
use crate::markup::decode_attr;
use url::Url;

const BACKGROUND_DATA_ATTRS: &[&str] = &["data-background-video", "data-bg-video", "data-video-background"];
const BACKGROUND_CLASS_HINTS: &[&str] = &["bg-video", "video-bg", "background-video", "video-background", "hero-video"];
const PLAYER_CLASS_HINTS: &[&str] = &["video-player", "player", "plyr", "video-js", "vjs-", "mejs", "jwplayer"];

/// Ancestor class names used by page builders for background videos
const PAGE_BUILDER_CONTAINERS: &[&str] = &[
    "elementor-background-video-container",
    "elementor-background-video-embed",
    "et_pb_section_video_bg",
    "et_pb_preload",
    "wp-block-cover__video-background",
    "fl-bg-video",
    "vc_video-bg",
    "jarallax-video",
];

/// How far up the tree ancestor-based signals look
const ANCESTOR_DEPTH: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedPlatform {
    YouTube,
    Vimeo,
}

/// A recognised platform embed
#[derive(Debug, Clone, PartialEq)]
pub struct EmbedInfo {
    pub platform: EmbedPlatform,
    pub video_id: String,
    pub params: Vec<(String, String)>,
}

impl EmbedInfo {
    fn param(&self, name: &str) -> Option<&str> {
        self.params.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    fn flag(&self, name: &str) -> bool {
        matches!(self.param(name), Some("1") | Some("true"))
    }

    /// Poster image served by the platform
    pub fn thumbnail_url(&self) -> String {
        match self.platform {
            EmbedPlatform::YouTube => format!("https://i.ytimg.com/vi/{}/hqdefault.jpg", self.video_id),
            EmbedPlatform::Vimeo => format!("https://vumbnail.com/{}.jpg", self.video_id),
        }
    }

    /// Player URL that starts playback immediately, used after the facade click
    pub fn autoplay_url(&self) -> String {
        match self.platform {
            EmbedPlatform::YouTube => format!("https://www.youtube-nocookie.com/embed/{}?autoplay=1", self.video_id),
            EmbedPlatform::Vimeo => format!("https://player.vimeo.com/video/{}?autoplay=1", self.video_id),
        }
    }
}

/// Recognise YouTube and Vimeo embed URLs (protocol-relative URLs included)
pub fn parse_embed(src: &str) -> Option<EmbedInfo> {
    let src = decode_attr(src.trim());
    let absolute = if src.starts_with("//") { format!("https:{}", src) } else { src };
    let url = Url::parse(&absolute).ok()?;
    let host = url.host_str()?.trim_start_matches("www.").to_ascii_lowercase();
    let segments: Vec<&str> = url.path_segments().map(|s| s.filter(|p| !p.is_empty()).collect()).unwrap_or_default();

    let (platform, video_id) = match host.as_str() {
        "youtube.com" | "youtube-nocookie.com" | "m.youtube.com" => match segments.as_slice() {
            ["embed", id, ..] => (EmbedPlatform::YouTube, id.to_string()),
            _ => return None,
        },
        "player.vimeo.com" => match segments.as_slice() {
            ["video", id, ..] => (EmbedPlatform::Vimeo, id.to_string()),
            _ => return None,
        },
        _ => return None,
    };

    if video_id.is_empty() || !video_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return None;
    }

    let params = url.query_pairs().map(|(k, v)| (k.to_ascii_lowercase(), v.into_owned())).collect();
    Some(EmbedInfo { platform, video_id, params })
}

/// Classify a `<video>` or embed `<iframe>` element
pub fn classify_video<E: DomElement>(element: &E) -> VideoClassification {
    let mut signals = Vec::new();
    let ancestors = element.ancestors_up_to(ANCESTOR_DEPTH);

    let has_background_attr = |e: &E| BACKGROUND_DATA_ATTRS.iter().any(|a| e.has_attr(a));
    if has_background_attr(element) || ancestors.iter().any(has_background_attr) {
        signals.push(VideoSignal::BackgroundDataAttribute);
    }

    let own_classes = element.classes();
    let nearby_classes: Vec<String> = own_classes
        .iter()
        .cloned()
        .chain(ancestors.iter().take(2).flat_map(|a| a.classes()))
        .collect();
    if nearby_classes.iter().any(|c| BACKGROUND_CLASS_HINTS.iter().any(|h| c.contains(h))) {
        signals.push(VideoSignal::BackgroundClassName);
    }
    if own_classes.iter().any(|c| PLAYER_CLASS_HINTS.iter().any(|h| c.contains(h))) {
        signals.push(VideoSignal::PlayerClassName);
    }

    let style = element.compact_style();
    if is_full_bleed(&style) {
        signals.push(VideoSignal::FullBleedPositioning);
    }
    if style.contains("object-fit:cover") {
        signals.push(VideoSignal::CoverObjectFit);
    }
    let parent_style = ancestors.first().map(|p| p.compact_style()).unwrap_or_default();
    if has_negative_z_index(&style) || has_negative_z_index(&parent_style) {
        signals.push(VideoSignal::NegativeZIndex);
    }

    if element
        .next_sibling_elements()
        .iter()
        .any(|s| is_layered_above(&s.compact_style(), &s.classes()))
    {
        signals.push(VideoSignal::LayeredSibling);
    }

    let all_classes: Vec<String> = own_classes.iter().cloned().chain(ancestors.iter().flat_map(|a| a.classes())).collect();
    if all_classes.iter().any(|c| PAGE_BUILDER_CONTAINERS.contains(&c.as_str())) {
        signals.push(VideoSignal::PageBuilderBackground);
    }

    match element.name().as_str() {
        "video" => {
            let autoplay = element.has_attr("autoplay");
            let muted = element.has_attr("muted");
            let looped = element.has_attr("loop");
            let controls = element.has_attr("controls");
            if autoplay && muted && looped && !controls {
                signals.push(VideoSignal::AutoplayMutedLoop);
            }
            if controls {
                signals.push(VideoSignal::ControlsAttribute);
            }
            if element.has_attr("poster") && !autoplay {
                signals.push(VideoSignal::PosterAttribute);
            }
        }
        "iframe" => {
            let src = element.attr("src").or_else(|| element.attr("data-src")).unwrap_or_default();
            if let Some(embed) = parse_embed(&src) {
                signals.extend(embed_signals(&embed));
            }
        }
        _ => {}
    }

    decide(signals)
}

fn embed_signals(embed: &EmbedInfo) -> Vec<VideoSignal> {
    let mut signals = Vec::new();
    if embed.platform == EmbedPlatform::Vimeo && embed.flag("background") {
        signals.push(VideoSignal::EmbedBackgroundParam);
    }
    let autoplay = embed.flag("autoplay");
    let muted = embed.flag("mute") || embed.flag("muted");
    if autoplay && muted && embed.flag("loop") {
        signals.push(VideoSignal::EmbedAutoplayMutedLoop);
    }
    if embed.param("controls") == Some("0") {
        signals.push(VideoSignal::EmbedControlsHidden);
    }
    if !autoplay && !embed.flag("background") {
        signals.push(VideoSignal::PlainEmbed);
    }
    signals
}

fn is_full_bleed(style: &str) -> bool {
    let positioned = style.contains("position:absolute") || style.contains("position:fixed");
    let covers = style.contains("width:100%")
        || style.contains("min-width:100%")
        || style.contains("inset:0")
        || (style.contains("top:0") && style.contains("left:0"));
    positioned && covers
}

fn has_negative_z_index(style: &str) -> bool {
    style.contains("z-index:-")
}

fn is_layered_above(style: &str, classes: &[String]) -> bool {
    let positioned = style.contains("position:absolute") || style.contains("position:relative");
    let raised = style.split(';').any(|decl| {
        decl.strip_prefix("z-index:")
            .and_then(|v| v.parse::<i32>().ok())
            .map(|z| z > 0)
            .unwrap_or(false)
    });
    (positioned && raised) || classes.iter().any(|c| c.contains("overlay"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::signals::VideoKind;
    use scraper::{ElementRef, Html, Selector};

    fn first<'a>(doc: &'a Html, selector: &str) -> ElementRef<'a> {
        doc.select(&Selector::parse(selector).unwrap()).next().unwrap()
    }

    #[test]
    fn test_parse_embed_urls() {
        let yt = parse_embed("https://www.youtube.com/embed/dQw4w9WgXcQ?rel=0&amp;autoplay=1").unwrap();
        assert_eq!(yt.platform, EmbedPlatform::YouTube);
        assert_eq!(yt.video_id, "dQw4w9WgXcQ");
        assert!(yt.flag("autoplay"));

        let vimeo = parse_embed("//player.vimeo.com/video/76979871?background=1").unwrap();
        assert_eq!(vimeo.platform, EmbedPlatform::Vimeo);
        assert_eq!(vimeo.thumbnail_url(), "https://vumbnail.com/76979871.jpg");

        assert!(parse_embed("https://example.com/embed/x").is_none());
        assert!(parse_embed("not a url").is_none());
    }

    #[test]
    fn test_hero_background_video() {
        let doc = Html::parse_document(
            r#"<div class="elementor-background-video-container"><video autoplay muted loop playsinline style="position:absolute; top:0; left:0; object-fit:cover"></video></div>"#,
        );
        let result = classify_video(&first(&doc, "video"));
        assert_eq!(result.kind, VideoKind::Background);
        assert!(result.signals.contains(&VideoSignal::PageBuilderBackground));
        assert!(result.confidence > 0.9);
    }

    #[test]
    fn test_player_with_controls() {
        let doc = Html::parse_document(r#"<video class="video-player" controls poster="p.jpg" src="a.mp4"></video>"#);
        let result = classify_video(&first(&doc, "video"));
        assert_eq!(result.kind, VideoKind::ClickToPlay);
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn test_bare_video_defaults_to_click_to_play() {
        let doc = Html::parse_document(r#"<video src="a.mp4"></video>"#);
        let result = classify_video(&first(&doc, "video"));
        assert_eq!(result.kind, VideoKind::ClickToPlay);
        assert!(result.signals.is_empty());
    }

    #[test]
    fn test_vimeo_background_embed() {
        let doc = Html::parse_document(
            r#"<section><iframe src="https://player.vimeo.com/video/123?background=1&autoplay=1&muted=1&loop=1"></iframe><div class="hero-overlay"></div></section>"#,
        );
        let result = classify_video(&first(&doc, "iframe"));
        assert_eq!(result.kind, VideoKind::Background);
        assert!(result.signals.contains(&VideoSignal::LayeredSibling));
    }

    #[test]
    fn test_plain_youtube_embed() {
        let doc = Html::parse_document(r#"<iframe src="https://www.youtube.com/embed/abc123" allowfullscreen></iframe>"#);
        let result = classify_video(&first(&doc, "iframe"));
        assert_eq!(result.kind, VideoKind::ClickToPlay);
        assert_eq!(result.signals, vec![VideoSignal::PlainEmbed]);
    }

    #[test]
    fn test_markup_tag_without_document() {
        let tag = crate::markup::Tag::parse(r#"<video autoplay muted loop data-bg-video>"#).unwrap();
        assert_eq!(classify_video(&tag).kind, VideoKind::Background);
    }
}
