//! # Facade Substitution
//!
//! ## Responsabilità:
//! - Iframe YouTube/Vimeo click-to-play → miniatura + pulsante play, l'iframe vero
//!   viene creato solo al click (script loader iniettato una volta per pagina)
//! - `<video>` di sfondo → `muted playsinline loop` (+ `autoplay` se abilitato)
//! - `<video>` click-to-play → `preload="none"`
//! - Script/iframe di widget noti → spostati in `<template data-so-widget>`,
//!   attivati alla prima interazione o al click sulla facade del registro
//!
//! La classificazione usa `scraper` (antenati, fratelli, selettori), la riscrittura
//! usa gli span di `markup`: i due elenchi vengono accoppiati per ordinale, e se
//! i conteggi non coincidono lo stage lascia la pagina com'è.

use crate::classify::{classify_video, classify_widget, parse_embed, widget_by_name, VideoKind, WidgetCategory};
use crate::markup::{self, elements, Element};
use crate::optimizer::{OptimizeOutcome, OptimizeStats};
use crate::settings::{VideoSettings, WidgetSettings};
use scraper::{ElementRef, Html, Selector};
use std::collections::BTreeSet;
use tracing::debug;

/// Minimum widget confidence before its scripts are deferred
pub const WIDGET_FACADE_THRESHOLD: f32 = 0.6;

const VIDEO_LOADER: &str = r#"<script data-so-video-loader>(function(){function play(el){var f=document.createElement('iframe');f.src=el.getAttribute('data-so-video');f.allow='accelerometer; autoplay; encrypted-media; gyroscope; picture-in-picture; fullscreen';f.allowFullscreen=true;f.setAttribute('style','position:absolute;inset:0;width:100%;height:100%;border:0');el.innerHTML='';el.appendChild(f)}function pick(e){var el=e.target.closest&&e.target.closest('.so-video-facade');return el&&!el.querySelector('iframe')?el:null}document.addEventListener('click',function(e){var el=pick(e);if(el)play(el)});document.addEventListener('keydown',function(e){if(e.key!=='Enter'&&e.key!==' ')return;var el=pick(e);if(el){e.preventDefault();play(el)}})})();</script>"#;

const WIDGET_LOADER: &str = r#"<script data-so-widget-loader>(function(){var done={};function load(n){if(done[n])return;done[n]=1;document.querySelectorAll('template[data-so-widget="'+n+'"]').forEach(function(t){var f=t.content.cloneNode(true);f.querySelectorAll('script').forEach(function(o){var s=document.createElement('script');for(var i=0;i<o.attributes.length;i++){s.setAttribute(o.attributes[i].name,o.attributes[i].value)}s.text=o.text;o.replaceWith(s)});t.replaceWith(f)});document.querySelectorAll('.so-facade[data-so-widget="'+n+'"]').forEach(function(b){b.remove()})}function all(){document.querySelectorAll('template[data-so-widget]').forEach(function(t){load(t.getAttribute('data-so-widget'))})}document.addEventListener('click',function(e){var b=e.target.closest&&e.target.closest('.so-facade[data-so-widget]');if(b)load(b.getAttribute('data-so-widget'))});['pointerdown','keydown','touchstart','scroll'].forEach(function(ev){window.addEventListener(ev,all,{once:true,passive:true})})})();</script>"#;

/// Scraper and span views of the same elements, matched by document order
fn paired<'a>(document: &'a Html, html: &str, name: &str) -> Option<Vec<(ElementRef<'a>, Element)>> {
    let selector = Selector::parse(name).ok()?;
    let semantic: Vec<ElementRef<'a>> = document.select(&selector).collect();
    let spans = elements(html, name);
    if semantic.len() != spans.len() {
        debug!("Element count mismatch for <{}>: {} vs {}", name, semantic.len(), spans.len());
        return None;
    }
    Some(semantic.into_iter().zip(spans).collect())
}

fn escape_attr(value: &str) -> String {
    value.replace('&', "&amp;").replace('"', "&quot;").replace('<', "&lt;")
}

fn video_facade(element: &Element, autoplay_url: &str, thumbnail: &str) -> String {
    let dimension = |name: &str| element.tag.get(name).and_then(|v| v.trim_end_matches("px").parse::<u32>().ok());
    let (ratio, max_width) = match (dimension("width"), dimension("height")) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (format!("{}/{}", w, h), format!("max-width:{}px;", w)),
        _ => ("16/9".to_string(), String::new()),
    };
    let label = match element.tag.get("title") {
        Some(title) if !title.trim().is_empty() => format!("Play video: {}", title.trim()),
        _ => "Play video".to_string(),
    };
    format!(
        r#"<div class="so-video-facade" data-so-video="{src}" role="button" tabindex="0" aria-label="{label}" style="position:relative;width:100%;{max}aspect-ratio:{ratio};background:#000 url('{thumb}') center/cover no-repeat;cursor:pointer"><button type="button" class="so-play" aria-hidden="true" tabindex="-1" style="position:absolute;top:50%;left:50%;transform:translate(-50%,-50%);width:68px;height:48px;border:0;border-radius:12px;background:rgba(0,0,0,.7);color:#fff;font-size:20px;cursor:pointer">&#9654;</button></div>"#,
        src = escape_attr(autoplay_url),
        label = escape_attr(&label),
        max = max_width,
        ratio = ratio,
        thumb = escape_attr(thumbnail),
    )
}

/// Video iframes to facades, `<video>` attributes normalized by classification
pub fn apply_video_facades(html: &str, settings: &VideoSettings) -> OptimizeOutcome {
    if !settings.facades {
        return OptimizeOutcome::unchanged(html);
    }
    let document = Html::parse_document(html);
    let mut stats = OptimizeStats::default();
    let mut edits = Vec::new();

    if let Some(iframes) = paired(&document, html, "iframe") {
        for (semantic, span) in iframes {
            let src = span.tag.get("src").or_else(|| span.tag.get("data-src")).unwrap_or("");
            let Some(embed) = parse_embed(src) else { continue };
            let classification = classify_video(&semantic);
            if classification.kind != VideoKind::ClickToPlay {
                continue;
            }
            edits.push((span.outer.clone(), video_facade(&span, &embed.autoplay_url(), &embed.thumbnail_url())));
            stats.facades_applied += 1;
            stats.removed.push(src.to_string());
        }
    } else {
        stats.notes.push("iframe facades skipped: markup mismatch".to_string());
    }

    if let Some(videos) = paired(&document, html, "video") {
        for (semantic, span) in videos {
            let classification = classify_video(&semantic);
            let mut tag = span.tag.clone();
            match classification.kind {
                VideoKind::Background => {
                    tag.set_flag("muted");
                    tag.set_flag("playsinline");
                    tag.set_flag("loop");
                    if settings.background_autoplay {
                        tag.set_flag("autoplay");
                    } else {
                        tag.remove("autoplay");
                        tag.set("preload", "metadata");
                    }
                }
                VideoKind::ClickToPlay => {
                    if !tag.has("autoplay") && !tag.has("preload") {
                        tag.set("preload", "none");
                    }
                }
            }
            if tag != span.tag {
                edits.push((span.open.clone(), tag.to_html()));
            }
        }
    } else {
        stats.notes.push("video normalization skipped: markup mismatch".to_string());
    }

    if edits.is_empty() {
        let mut outcome = OptimizeOutcome::unchanged(html);
        outcome.stats.notes = stats.notes;
        return outcome;
    }

    let mut content = markup::splice(html, edits);
    if stats.facades_applied > 0 && !content.contains("data-so-video-loader") {
        content = markup::insert_before_close(&content, "body", VIDEO_LOADER);
    }
    stats.original_bytes = html.len() as u64;
    stats.optimized_bytes = content.len() as u64;
    OptimizeOutcome { content, stats }
}

/// Defer known third-party widgets behind their registry facade
pub fn apply_widget_facades(html: &str, settings: &WidgetSettings) -> OptimizeOutcome {
    if !settings.facades {
        return OptimizeOutcome::unchanged(html);
    }
    let document = Html::parse_document(html);
    let mut stats = OptimizeStats::default();
    let mut edits = Vec::new();
    let mut deferred: BTreeSet<&'static str> = BTreeSet::new();
    let mut chat_buttons = String::new();

    for name in ["script", "iframe"] {
        let Some(pairs) = paired(&document, html, name) else {
            stats.notes.push(format!("{} widgets skipped: markup mismatch", name));
            continue;
        };
        for (semantic, span) in pairs {
            let Some(classification) = classify_widget(&semantic) else { continue };
            if classification.confidence < WIDGET_FACADE_THRESHOLD
                || settings.excluded.iter().any(|e| e == classification.name)
            {
                continue;
            }
            let Some(widget) = widget_by_name(classification.name) else { continue };

            let template = format!(
                r#"<template data-so-widget="{}">{}</template>"#,
                widget.name,
                span.outer_html(html)
            );
            let first_of_kind = deferred.insert(widget.name);
            let replacement = match widget.category {
                WidgetCategory::Chat => {
                    if first_of_kind {
                        chat_buttons.push_str(&widget.render_facade());
                    }
                    template
                }
                WidgetCategory::Map => format!("{}{}", template, widget.render_facade()),
                WidgetCategory::Social | WidgetCategory::Scheduling => {
                    if first_of_kind {
                        format!("{}{}", template, widget.render_facade())
                    } else {
                        template
                    }
                }
            };
            edits.push((span.outer.clone(), replacement));
            stats.removed.push(format!("{}:{}", widget.name, name));
        }
    }

    if edits.is_empty() {
        let mut outcome = OptimizeOutcome::unchanged(html);
        outcome.stats.notes = stats.notes;
        return outcome;
    }

    let mut content = markup::splice(html, edits);
    let mut tail = chat_buttons;
    if !content.contains("data-so-widget-loader") {
        tail.push_str(WIDGET_LOADER);
    }
    content = markup::insert_before_close(&content, "body", &tail);

    stats.facades_applied = deferred.len() as u32;
    stats.notes.extend(deferred.iter().map(|n| format!("widget deferred: {}", n)));
    stats.original_bytes = html.len() as u64;
    stats.optimized_bytes = content.len() as u64;
    OptimizeOutcome { content, stats }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_youtube_iframe_becomes_facade() {
        let html = r#"<html><body><iframe width="560" height="315" src="https://www.youtube.com/embed/dQw4w9WgXcQ" title="Demo" allowfullscreen></iframe></body></html>"#;
        let out = apply_video_facades(html, &VideoSettings::default());

        assert_eq!(out.stats.facades_applied, 1);
        assert!(!out.content.contains("<iframe"));
        assert!(out.content.contains(r#"data-so-video="https://www.youtube-nocookie.com/embed/dQw4w9WgXcQ?autoplay=1""#));
        assert!(out.content.contains("https://i.ytimg.com/vi/dQw4w9WgXcQ/hqdefault.jpg"));
        assert!(out.content.contains("aspect-ratio:560/315"));
        assert!(out.content.contains(r#"aria-label="Play video: Demo""#));
        assert_eq!(out.content.matches("data-so-video-loader").count(), 1);
    }

    #[test]
    fn test_background_embed_left_alone() {
        let html = r#"<body><iframe src="https://player.vimeo.com/video/12345?background=1&amp;autoplay=1&amp;muted=1&amp;loop=1"></iframe></body>"#;
        let out = apply_video_facades(html, &VideoSettings::default());
        assert_eq!(out.content, html);
        assert_eq!(out.stats.facades_applied, 0);
    }

    #[test]
    fn test_video_elements_normalized() {
        let html = r#"<body><div class="hero"><video class="bg-video" autoplay loop muted style="position:absolute;inset:0;object-fit:cover" src="a.mp4"></video></div><video controls poster="p.jpg" src="b.mp4"></video></body>"#;
        let out = apply_video_facades(html, &VideoSettings::default());
        assert!(out.content.contains("playsinline"));
        assert!(out.content.contains(r#"<video controls poster="p.jpg" src="b.mp4" preload="none">"#));

        let paused = VideoSettings { background_autoplay: false, ..Default::default() };
        let out = apply_video_facades(html, &paused);
        let first = out.content.split("</video>").next().unwrap();
        assert!(!first.contains("autoplay"));
        assert!(first.contains(r#"preload="metadata""#));
    }

    #[test]
    fn test_chat_widget_deferred() {
        let html = r#"<html><body><p>x</p><script>window.intercomSettings = {app_id: "abc"};</script><script async src="https://widget.intercom.io/widget/abc"></script></body></html>"#;
        let out = apply_widget_facades(html, &WidgetSettings::default());

        assert_eq!(out.stats.facades_applied, 1);
        assert_eq!(out.content.matches(r#"<template data-so-widget="intercom">"#).count(), 2);
        assert_eq!(out.content.matches("so-facade-chat").count(), 1);
        assert_eq!(out.content.matches("data-so-widget-loader").count(), 1);
        // lo script originale è ancora lì, ma dentro il template
        let template_start = out.content.find("<template").unwrap();
        assert!(out.content.find("widget.intercom.io").unwrap() > template_start);
    }

    #[test]
    fn test_excluded_widget_untouched() {
        let html = r#"<body><iframe src="https://www.google.com/maps/embed?pb=1"></iframe></body>"#;
        let excluded = WidgetSettings { excluded: vec!["google_maps".to_string()], ..Default::default() };
        assert_eq!(apply_widget_facades(html, &excluded).content, html);

        let out = apply_widget_facades(html, &WidgetSettings::default());
        assert!(out.content.contains(r#"<template data-so-widget="google_maps"><iframe"#));
        assert!(out.content.contains("so-facade-map"));
    }

    #[test]
    fn test_disabled_settings() {
        let html = r#"<body><iframe src="https://www.youtube.com/embed/abc"></iframe></body>"#;
        let off = VideoSettings { facades: false, ..Default::default() };
        assert_eq!(apply_video_facades(html, &off).content, html);
    }
}
