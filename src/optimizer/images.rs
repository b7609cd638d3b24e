//! # Image Optimization Module
//!
//! Ottimizzazione in memoria dei formati raster più comuni tramite il crate `image`,
//! più una pulizia leggera delle SVG.
//!
//! ## Formati Supportati
//!
//! | Formato | Resize | Ricodifica              | Variante WebP |
//! |---------|--------|-------------------------|---------------|
//! | JPEG    | ✅     | qualità da settings     | ✅ (lossless, se più piccola) |
//! | PNG     | ✅     | compressione Best       | ✅ (lossless, se più piccola) |
//! | WebP    | ✅     | lossless                | ❌ |
//! | SVG     | ❌     | cleanup testuale        | ❌ |
//! | GIF/AVIF/ICO | ❌ | pass-through           | ❌ |
//!
//! Le immagini animate (GIF con più frame, WebP `ANIM`, APNG `acTL`) non vengono
//! mai toccate: ricodificarle perderebbe l'animazione.
//!
//! ## Pipeline per immagine
//!
//! 1. **Rilevamento formato**: magic bytes, l'estensione è solo un fallback
//! 2. **Resize**: solo se più larga di `max_width`, aspect ratio preservato
//! 3. **Ricodifica**: tenuta solo se più piccola dell'originale o se c'è stato resize
//! 4. **WebP**: variante scritta accanto all'originale solo quando conviene
//!
//! Il lavoro è CPU-bound: la pipeline lo esegue dentro `spawn_blocking`.

use crate::error::OptimizeError;
use crate::markup::{self, tokenize, Token};
use crate::optimizer::{resolve_site_path, OptimizeOutcome, OptimizeStats};
use crate::settings::ImageSettings;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use tracing::debug;

/// Detected payload type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Jpeg,
    Png,
    Gif,
    WebP,
    Avif,
    Ico,
    Svg,
    Other,
}

impl ImageKind {
    pub fn mime(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
            Self::WebP => "image/webp",
            Self::Avif => "image/avif",
            Self::Ico => "image/x-icon",
            Self::Svg => "image/svg+xml",
            Self::Other => "application/octet-stream",
        }
    }

    fn raster_format(&self) -> Option<ImageFormat> {
        match self {
            Self::Jpeg => Some(ImageFormat::Jpeg),
            Self::Png => Some(ImageFormat::Png),
            Self::WebP => Some(ImageFormat::WebP),
            _ => None,
        }
    }
}

/// Resize filter, Lanczos3 for best downscaling quality
#[derive(Debug, Clone, Copy, Default)]
pub enum ResizeAlgorithm {
    #[default]
    Lanczos,
    /// Catmull-Rom, good general quality
    Catrom,
    /// Fast, acceptable for previews
    Triangle,
}

impl ResizeAlgorithm {
    fn filter(&self) -> FilterType {
        match self {
            Self::Lanczos => FilterType::Lanczos3,
            Self::Catrom => FilterType::CatmullRom,
            Self::Triangle => FilterType::Triangle,
        }
    }
}

/// Detect the format from magic bytes, falling back to the extension
pub fn sniff(bytes: &[u8], path: &str) -> ImageKind {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return ImageKind::Jpeg;
    }
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        return ImageKind::Png;
    }
    if bytes.starts_with(b"GIF8") {
        return ImageKind::Gif;
    }
    if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return ImageKind::WebP;
    }
    if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" && (&bytes[8..12] == b"avif" || &bytes[8..12] == b"avis") {
        return ImageKind::Avif;
    }
    if bytes.starts_with(&[0x00, 0x00, 0x01, 0x00]) {
        return ImageKind::Ico;
    }
    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(512)]).to_ascii_lowercase();
    if head.contains("<svg") {
        return ImageKind::Svg;
    }
    let lower = path.to_ascii_lowercase();
    match lower.rsplit('.').next() {
        Some("jpg") | Some("jpeg") => ImageKind::Jpeg,
        Some("png") => ImageKind::Png,
        Some("gif") => ImageKind::Gif,
        Some("webp") => ImageKind::WebP,
        Some("avif") => ImageKind::Avif,
        Some("ico") => ImageKind::Ico,
        Some("svg") => ImageKind::Svg,
        _ => ImageKind::Other,
    }
}

/// Site files worth handing to `optimize_image`
pub fn is_image_path(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    ["jpg", "jpeg", "png", "gif", "webp", "svg"]
        .iter()
        .any(|ext| lower.ends_with(&format!(".{}", ext)))
}

fn count_occurrences(bytes: &[u8], needle: &[u8]) -> usize {
    bytes.windows(needle.len()).filter(|w| *w == needle).count()
}

pub fn is_animated(bytes: &[u8], kind: ImageKind) -> bool {
    match kind {
        // un Graphic Control Extension per frame
        ImageKind::Gif => count_occurrences(bytes, &[0x21, 0xF9, 0x04]) > 1,
        ImageKind::WebP => count_occurrences(&bytes[..bytes.len().min(4096)], b"ANIM") > 0,
        ImageKind::Png => {
            let idat = bytes.windows(4).position(|w| w == b"IDAT").unwrap_or(bytes.len());
            count_occurrences(&bytes[..idat], b"acTL") > 0
        }
        _ => false,
    }
}

/// Result of one image optimization
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedImage {
    pub kind: ImageKind,
    pub bytes: Vec<u8>,
    /// Lossless WebP variant, only when smaller than `bytes`
    pub webp: Option<Vec<u8>>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub passthrough: bool,
    pub stats: OptimizeStats,
}

impl ProcessedImage {
    fn passthrough(bytes: &[u8], kind: ImageKind, note: &str) -> Self {
        let mut stats = OptimizeStats::sized(bytes.len(), bytes.len());
        stats.notes.push(note.to_string());
        Self {
            kind,
            bytes: bytes.to_vec(),
            webp: None,
            width: None,
            height: None,
            passthrough: true,
            stats,
        }
    }
}

/// Optimize one image payload
pub fn optimize_image(bytes: &[u8], path: &str, settings: &ImageSettings) -> Result<ProcessedImage, OptimizeError> {
    optimize_image_with(bytes, path, settings, ResizeAlgorithm::default())
}

pub fn optimize_image_with(
    bytes: &[u8],
    path: &str,
    settings: &ImageSettings,
    algorithm: ResizeAlgorithm,
) -> Result<ProcessedImage, OptimizeError> {
    let kind = sniff(bytes, path);
    if !settings.enabled {
        return Ok(ProcessedImage::passthrough(bytes, kind, "image optimization disabled"));
    }

    if kind == ImageKind::Svg {
        if !settings.svg_cleanup {
            return Ok(ProcessedImage::passthrough(bytes, kind, "svg cleanup disabled"));
        }
        let text = std::str::from_utf8(bytes)
            .map_err(|_| OptimizeError::UnsupportedFormat(format!("{}: svg is not utf-8", path)))?;
        let cleaned = cleanup_svg(text).into_bytes();
        let optimized = if cleaned.len() < bytes.len() { cleaned } else { bytes.to_vec() };
        return Ok(ProcessedImage {
            kind,
            stats: OptimizeStats::sized(bytes.len(), optimized.len()),
            bytes: optimized,
            webp: None,
            width: None,
            height: None,
            passthrough: false,
        });
    }

    let Some(format) = kind.raster_format() else {
        return Ok(ProcessedImage::passthrough(bytes, kind, "format passed through"));
    };
    if is_animated(bytes, kind) {
        return Ok(ProcessedImage::passthrough(bytes, kind, "animated image passed through"));
    }

    let decoded = image::load_from_memory_with_format(bytes, format)?;
    let (width, height) = decoded.dimensions();
    let resized = width > settings.max_width;
    let image = if resized {
        let new_height = ((height as u64 * settings.max_width as u64) / width.max(1) as u64).max(1) as u32;
        debug!("Resizing {} from {}x{} to {}x{}", path, width, height, settings.max_width, new_height);
        decoded.resize_exact(settings.max_width, new_height, algorithm.filter())
    } else {
        decoded
    };

    let encoded = encode(&image, kind, settings.jpeg_quality)?;
    let (final_bytes, reencoded) = if resized || encoded.len() < bytes.len() {
        (encoded, true)
    } else {
        (bytes.to_vec(), false)
    };

    let webp = if settings.generate_webp && kind != ImageKind::WebP {
        let variant = encode_webp(&image)?;
        (variant.len() < final_bytes.len()).then_some(variant)
    } else {
        None
    };

    let mut stats = OptimizeStats::sized(bytes.len(), final_bytes.len());
    if resized {
        stats.notes.push(format!("resized from {}px", width));
    }
    if !reencoded {
        stats.notes.push("original encoding kept".to_string());
    }
    let (width, height) = image.dimensions();
    Ok(ProcessedImage {
        kind,
        bytes: final_bytes,
        webp,
        width: Some(width),
        height: Some(height),
        passthrough: false,
        stats,
    })
}

fn encode(image: &DynamicImage, kind: ImageKind, jpeg_quality: u8) -> Result<Vec<u8>, OptimizeError> {
    let mut out = Vec::new();
    match kind {
        ImageKind::Jpeg => {
            let encoder = JpegEncoder::new_with_quality(&mut out, jpeg_quality.clamp(1, 100));
            DynamicImage::ImageRgb8(image.to_rgb8()).write_with_encoder(encoder)?;
        }
        ImageKind::Png => {
            let encoder = PngEncoder::new_with_quality(&mut out, CompressionType::Best, PngFilter::Adaptive);
            image.write_with_encoder(encoder)?;
        }
        ImageKind::WebP => return encode_webp(image),
        other => return Err(OptimizeError::UnsupportedFormat(format!("cannot encode {:?}", other))),
    }
    Ok(out)
}

fn encode_webp(image: &DynamicImage) -> Result<Vec<u8>, OptimizeError> {
    let mut out = Vec::new();
    let encoder = WebPEncoder::new_lossless(&mut out);
    DynamicImage::ImageRgba8(image.to_rgba8()).write_with_encoder(encoder)?;
    Ok(out)
}

/// `img/hero.jpg` → `img/hero.webp`; query and fragment are preserved
pub fn webp_path(path: &str) -> String {
    let split = path.find(['?', '#']).unwrap_or(path.len());
    let (file, suffix) = path.split_at(split);
    let stem_end = match (file.rfind('.'), file.rfind('/')) {
        (Some(dot), Some(slash)) if dot > slash + 1 => dot,
        (Some(dot), None) if dot > 0 => dot,
        _ => file.len(),
    };
    format!("{}.webp{}", &file[..stem_end], suffix)
}

fn svg_regexes() -> &'static [Regex] {
    static RE: OnceLock<Vec<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        [
            r"(?s)<!--.*?-->",
            r"(?s)<\?xml.*?\?>",
            r"(?is)<!DOCTYPE[^>]*>",
            r"(?is)<metadata\b.*?</metadata>",
            r"(?is)<sodipodi:namedview\b[^>]*/>",
            r"(?is)<sodipodi:namedview\b.*?</sodipodi:namedview>",
            r#"\s(?:inkscape|sodipodi):[\w-]+="[^"]*""#,
            r#"\sxmlns:(?:inkscape|sodipodi|dc|cc|rdf)="[^"]*""#,
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static svg cleanup regex"))
        .collect()
    })
}

fn inter_tag_whitespace() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r">\s+<").expect("static whitespace regex"))
}

/// Editor metadata, comments and inter-tag whitespace out; shapes and colors untouched
pub fn cleanup_svg(svg: &str) -> String {
    let mut out = svg.to_string();
    for re in svg_regexes() {
        out = re.replace_all(&out, "").into_owned();
    }
    inter_tag_whitespace().replace_all(out.trim(), "><").into_owned()
}

/// Wrap `<img>` tags whose file has a WebP variant in `<picture>`.
/// `variants` maps site paths of originals to their WebP site paths.
pub fn wrap_in_picture(html: &str, page_path: &str, variants: &BTreeMap<String, String>) -> OptimizeOutcome {
    if variants.is_empty() {
        return OptimizeOutcome::unchanged(html);
    }
    let mut picture_depth = 0usize;
    let mut edits = Vec::new();

    for token in tokenize(html) {
        match token {
            Token::Open { tag, .. } if tag.name == "picture" && !tag.self_closing => picture_depth += 1,
            Token::Close { name, .. } if name == "picture" => picture_depth = picture_depth.saturating_sub(1),
            Token::Open { tag, span } if tag.name == "img" && picture_depth == 0 => {
                let Some(src) = tag.get("src") else { continue };
                let known = resolve_site_path(page_path, src)
                    .map(|p| variants.contains_key(&p))
                    .unwrap_or(false);
                if !known || tag.has("srcset") {
                    continue;
                }
                let source = format!(r#"<source type="image/webp" srcset="{}">"#, webp_path(src));
                edits.push((span.clone(), format!("<picture>{}{}</picture>", source, &html[span])));
            }
            _ => {}
        }
    }

    let wrapped = edits.len() as u32;
    let content = markup::splice(html, edits);
    let mut stats = OptimizeStats::sized(html.len(), content.len());
    if wrapped > 0 {
        stats.notes.push(format!("{} images wrapped in <picture>", wrapped));
    }
    OptimizeOutcome { content, stats }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb, RgbImage};
    use std::io::Cursor;

    fn encode_test_image(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
        let img: RgbImage = ImageBuffer::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 128]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img).write_to(&mut out, format).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_sniff_prefers_magic_bytes() {
        let png = encode_test_image(4, 4, ImageFormat::Png);
        assert_eq!(sniff(&png, "misnamed.jpg"), ImageKind::Png);
        assert_eq!(sniff(b"<?xml version=\"1.0\"?><svg></svg>", "a.bin"), ImageKind::Svg);
        assert_eq!(sniff(b"????", "x.webp"), ImageKind::WebP);
        assert_eq!(sniff(b"GIF89a....", "x"), ImageKind::Gif);
    }

    #[test]
    fn test_animation_detection() {
        let mut gif = b"GIF89a".to_vec();
        gif.extend_from_slice(&[0x21, 0xF9, 0x04, 0, 0, 0, 0, 0x21, 0xF9, 0x04]);
        assert!(is_animated(&gif, ImageKind::Gif));
        assert!(!is_animated(b"GIF89a\x21\xF9\x04", ImageKind::Gif));

        let mut apng = vec![0x89, b'P', b'N', b'G'];
        apng.extend_from_slice(b"....acTL....IDAT");
        assert!(is_animated(&apng, ImageKind::Png));

        let result = optimize_image(&gif, "anim.gif", &ImageSettings::default()).unwrap();
        assert!(result.passthrough);
        assert_eq!(result.bytes, gif);
    }

    #[test]
    fn test_resize_to_max_width() {
        let png = encode_test_image(400, 200, ImageFormat::Png);
        let settings = ImageSettings { max_width: 100, ..Default::default() };
        let result = optimize_image(&png, "wide.png", &settings).unwrap();
        assert_eq!(result.width, Some(100));
        assert_eq!(result.height, Some(50));
        assert_eq!(sniff(&result.bytes, "wide.png"), ImageKind::Png);
        assert!(result.stats.notes.iter().any(|n| n.contains("resized")));
    }

    #[test]
    fn test_small_jpeg_keeps_dimensions_and_never_grows() {
        let jpeg = encode_test_image(64, 48, ImageFormat::Jpeg);
        let result = optimize_image(&jpeg, "photo.jpg", &ImageSettings::default()).unwrap();
        assert_eq!(result.width, Some(64));
        assert_eq!(result.height, Some(48));
        assert!(result.bytes.len() <= jpeg.len());
        if let Some(webp) = &result.webp {
            assert!(webp.len() < result.bytes.len());
            assert_eq!(sniff(webp, "x"), ImageKind::WebP);
        }
    }

    #[test]
    fn test_disabled_passes_through() {
        let png = encode_test_image(8, 8, ImageFormat::Png);
        let settings = ImageSettings { enabled: false, ..Default::default() };
        let result = optimize_image(&png, "a.png", &settings).unwrap();
        assert!(result.passthrough);
        assert_eq!(result.bytes, png);
    }

    #[test]
    fn test_cleanup_svg_preserves_palette() {
        let svg = r##"<?xml version="1.0" encoding="UTF-8"?>
<!-- Created with Inkscape -->
<svg xmlns="http://www.w3.org/2000/svg" xmlns:inkscape="http://www.inkscape.org/namespaces/inkscape" inkscape:version="1.2" viewBox="0 0 10 10">
  <metadata><rdf:RDF></rdf:RDF></metadata>
  <sodipodi:namedview id="base" />
  <path d="M0 0h10v10H0z" fill="#ff6600" inkscape:label="box"/>
</svg>"##;
        let out = cleanup_svg(svg);
        assert!(out.starts_with("<svg"));
        assert!(out.contains(r##"fill="#ff6600""##));
        assert!(out.contains(r#"viewBox="0 0 10 10""#));
        assert!(!out.contains("inkscape"));
        assert!(!out.contains("metadata"));
        assert!(!out.contains("<!--"));
        assert!(out.len() < svg.len());
    }

    #[test]
    fn test_webp_path() {
        assert_eq!(webp_path("img/hero.jpg"), "img/hero.webp");
        assert_eq!(webp_path("../img/a.b.png?v=2"), "../img/a.b.webp?v=2");
        assert_eq!(webp_path("img/.hidden"), "img/.hidden.webp");
    }

    #[test]
    fn test_wrap_in_picture() {
        let html = r#"<img src="img/a.jpg" alt="a"><picture><img src="img/a.jpg"></picture><img src="img/b.jpg">"#;
        let variants: BTreeMap<String, String> =
            [("img/a.jpg".to_string(), "img/a.webp".to_string())].into_iter().collect();
        let out = wrap_in_picture(html, "index.html", &variants);
        assert!(out.content.starts_with(
            r#"<picture><source type="image/webp" srcset="img/a.webp"><img src="img/a.jpg" alt="a"></picture><picture><img"#
        ));
        assert_eq!(out.content.matches("<source").count(), 1);
        assert!(out.content.ends_with(r#"<img src="img/b.jpg">"#));
    }
}
