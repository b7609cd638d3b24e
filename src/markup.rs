//! # Markup Utilities
//!
//! Tokenizer HTML leggero che lavora per *span* di byte, così ogni stage può
//! riscrivere solo i tag che modifica lasciando intatto il resto del documento.
//!
//! ## Responsabilità:
//! - Trova i tag di apertura/chiusura in ordine di documento, saltando commenti
//!   e il contenuto raw di `<script>`, `<style>`, `<textarea>`, `<title>`, `<noscript>`
//! - Ricostruisce gli elementi (con nesting) per nome di tag
//! - Parsing/serializzazione degli attributi di un tag
//! - Splice di modifiche non sovrapposte
//! - Riscrittura dei riferimenti `url(...)` nel CSS e parsing di `srcset`
//!
//! Le query "semantiche" (antenati, classi, selettori) passano invece da `scraper`.

use regex::Regex;
use std::ops::Range;
use std::sync::OnceLock;

const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style", "textarea", "title", "noscript"];
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track", "wbr",
];

/// One attribute as written in the source
#[derive(Debug, Clone, PartialEq)]
pub struct Attr {
    pub name: String,
    pub value: Option<String>,
    quote: char,
}

/// Parsed opening tag
#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    pub name: String,
    pub attrs: Vec<Attr>,
    pub self_closing: bool,
}

impl Tag {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_ascii_lowercase(),
            attrs: Vec::new(),
            self_closing: false,
        }
    }

    /// Parse `<name attr="v" flag>`; `None` when `raw` is not an opening tag
    pub fn parse(raw: &str) -> Option<Self> {
        let body = raw.strip_prefix('<')?;
        let chars: Vec<char> = body.chars().collect();
        let mut i = 0;

        while i < chars.len() && is_name_char(chars[i]) {
            i += 1;
        }
        if i == 0 || !chars[0].is_ascii_alphabetic() {
            return None;
        }
        let name: String = chars[..i].iter().collect::<String>().to_ascii_lowercase();
        let mut attrs = Vec::new();

        loop {
            while i < chars.len() && (chars[i].is_whitespace() || chars[i] == '/') {
                i += 1;
            }
            if i >= chars.len() || chars[i] == '>' {
                break;
            }

            let start = i;
            while i < chars.len() && !chars[i].is_whitespace() && !matches!(chars[i], '=' | '>' | '/') {
                i += 1;
            }
            if start == i {
                i += 1;
                continue;
            }
            let attr_name: String = chars[start..i].iter().collect::<String>().to_ascii_lowercase();

            while i < chars.len() && chars[i].is_whitespace() {
                i += 1;
            }
            if i < chars.len() && chars[i] == '=' {
                i += 1;
                while i < chars.len() && chars[i].is_whitespace() {
                    i += 1;
                }
                if i < chars.len() && (chars[i] == '"' || chars[i] == '\'') {
                    let quote = chars[i];
                    i += 1;
                    let value_start = i;
                    while i < chars.len() && chars[i] != quote {
                        i += 1;
                    }
                    let value: String = chars[value_start..i.min(chars.len())].iter().collect();
                    i += 1;
                    attrs.push(Attr { name: attr_name, value: Some(value), quote });
                } else {
                    let value_start = i;
                    while i < chars.len() && !chars[i].is_whitespace() && chars[i] != '>' {
                        i += 1;
                    }
                    let value: String = chars[value_start..i].iter().collect();
                    attrs.push(Attr { name: attr_name, value: Some(value), quote: '"' });
                }
            } else {
                attrs.push(Attr { name: attr_name, value: None, quote: '"' });
            }
        }

        let self_closing = raw.trim_end().ends_with("/>");
        Some(Self { name, attrs, self_closing })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_deref().unwrap_or(""))
    }

    pub fn has(&self, name: &str) -> bool {
        self.attrs.iter().any(|a| a.name == name)
    }

    pub fn set(&mut self, name: &str, value: &str) {
        match self.attrs.iter_mut().find(|a| a.name == name) {
            Some(attr) => attr.value = Some(value.to_string()),
            None => self.attrs.push(Attr {
                name: name.to_string(),
                value: Some(value.to_string()),
                quote: '"',
            }),
        }
    }

    /// Boolean attribute (`defer`, `async`, `muted`)
    pub fn set_flag(&mut self, name: &str) {
        if !self.has(name) {
            self.attrs.push(Attr {
                name: name.to_string(),
                value: None,
                quote: '"',
            });
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.attrs.retain(|a| a.name != name);
    }

    /// Whitespace-separated class tokens
    pub fn classes(&self) -> Vec<&str> {
        self.get("class").map(|c| c.split_whitespace().collect()).unwrap_or_default()
    }

    pub fn to_html(&self) -> String {
        let mut out = format!("<{}", self.name);
        for attr in &self.attrs {
            out.push(' ');
            out.push_str(&attr.name);
            if let Some(value) = &attr.value {
                let quote = if value.contains(attr.quote) {
                    if attr.quote == '"' { '\'' } else { '"' }
                } else {
                    attr.quote
                };
                out.push('=');
                out.push(quote);
                out.push_str(value);
                out.push(quote);
            }
        }
        out.push_str(if self.self_closing { " />" } else { ">" });
        out
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == ':' || c == '_'
}

/// Token with its byte range in the source document
#[derive(Debug, Clone)]
pub enum Token {
    Open { tag: Tag, span: Range<usize> },
    Close { name: String, span: Range<usize> },
}

/// Opening/closing tags in document order
pub fn tokenize(html: &str) -> Vec<Token> {
    let lower = html.to_ascii_lowercase();
    let mut tokens = Vec::new();
    let mut i = 0;

    while let Some(offset) = html[i..].find('<') {
        let start = i + offset;
        let rest = &html[start..];

        if rest.starts_with("<!--") {
            i = rest.find("-->").map(|e| start + e + 3).unwrap_or(html.len());
            continue;
        }
        if rest.starts_with("<!") || rest.starts_with("<?") {
            i = rest.find('>').map(|e| start + e + 1).unwrap_or(html.len());
            continue;
        }
        if let Some(after) = rest.strip_prefix("</") {
            let name: String = after.chars().take_while(|c| is_name_char(*c)).collect();
            let end = rest.find('>').map(|e| start + e + 1).unwrap_or(html.len());
            if !name.is_empty() {
                tokens.push(Token::Close {
                    name: name.to_ascii_lowercase(),
                    span: start..end,
                });
            }
            i = end;
            continue;
        }
        if !rest[1..].starts_with(|c: char| c.is_ascii_alphabetic()) {
            i = start + 1;
            continue;
        }

        let Some(end) = find_tag_end(html, start) else {
            break;
        };
        let Some(tag) = Tag::parse(&html[start..end]) else {
            i = start + 1;
            continue;
        };

        let raw_text = RAW_TEXT_ELEMENTS.contains(&tag.name.as_str()) && !tag.self_closing;
        let name = tag.name.clone();
        tokens.push(Token::Open { tag, span: start..end });
        i = end;

        if raw_text {
            let needle = format!("</{}", name);
            match lower[end..].find(&needle) {
                Some(close_offset) => {
                    let close_start = end + close_offset;
                    let close_end = html[close_start..]
                        .find('>')
                        .map(|e| close_start + e + 1)
                        .unwrap_or(html.len());
                    tokens.push(Token::Close {
                        name,
                        span: close_start..close_end,
                    });
                    i = close_end;
                }
                None => i = html.len(),
            }
        }
    }

    tokens
}

/// End (exclusive) of the tag starting at `start`, honouring quotes
fn find_tag_end(html: &str, start: usize) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (offset, c) in html[start..].char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '"' || c == '\'' => {
                // virgolette solo dentro valori di attributo (dopo '=')
                let before = html[start..start + offset].trim_end();
                if before.ends_with('=') {
                    quote = Some(c);
                }
            }
            None if c == '>' => return Some(start + offset + 1),
            None => {}
        }
    }
    None
}

/// Every opening tag with its span
pub fn open_tags(html: &str) -> Vec<(Tag, Range<usize>)> {
    tokenize(html)
        .into_iter()
        .filter_map(|t| match t {
            Token::Open { tag, span } => Some((tag, span)),
            Token::Close { .. } => None,
        })
        .collect()
}

/// A complete element located in the source
#[derive(Debug, Clone)]
pub struct Element {
    pub tag: Tag,
    pub open: Range<usize>,
    pub inner: Range<usize>,
    pub outer: Range<usize>,
}

impl Element {
    pub fn inner_html<'a>(&self, html: &'a str) -> &'a str {
        &html[self.inner.clone()]
    }

    pub fn outer_html<'a>(&self, html: &'a str) -> &'a str {
        &html[self.outer.clone()]
    }
}

/// All elements named `name`, outermost-last for nested ones
pub fn elements(html: &str, name: &str) -> Vec<Element> {
    let name = name.to_ascii_lowercase();
    let mut stack: Vec<(Tag, Range<usize>)> = Vec::new();
    let mut found = Vec::new();

    for token in tokenize(html) {
        match token {
            Token::Open { tag, span } if tag.name == name => {
                if tag.self_closing || VOID_ELEMENTS.contains(&name.as_str()) {
                    found.push(Element {
                        tag,
                        inner: span.end..span.end,
                        outer: span.clone(),
                        open: span,
                    });
                } else {
                    stack.push((tag, span));
                }
            }
            Token::Close { name: closing, span } if closing == name => {
                if let Some((tag, open)) = stack.pop() {
                    found.push(Element {
                        tag,
                        inner: open.end..span.start,
                        outer: open.start..span.end,
                        open,
                    });
                }
            }
            _ => {}
        }
    }

    found.sort_by_key(|e| e.outer.start);
    found
}

/// First element named `name`
pub fn first_element(html: &str, name: &str) -> Option<Element> {
    elements(html, name).into_iter().next()
}

/// Apply non-overlapping replacements; overlapping edits after the first are dropped
pub fn splice(html: &str, mut edits: Vec<(Range<usize>, String)>) -> String {
    edits.sort_by_key(|(range, _)| (range.start, range.end));
    let mut out = String::with_capacity(html.len());
    let mut cursor = 0;

    for (range, replacement) in edits {
        if range.start < cursor || range.end > html.len() {
            continue;
        }
        out.push_str(&html[cursor..range.start]);
        out.push_str(&replacement);
        cursor = range.end;
    }
    out.push_str(&html[cursor..]);
    out
}

/// Rewrite opening tags in place; the closure returns `true` when it changed the tag
pub fn rewrite_open_tags<F>(html: &str, mut f: F) -> String
where
    F: FnMut(&mut Tag) -> bool,
{
    let edits = open_tags(html)
        .into_iter()
        .filter_map(|(mut tag, span)| if f(&mut tag) { Some((span, tag.to_html())) } else { None })
        .collect();
    splice(html, edits)
}

/// Insert `snippet` right before `</name>`, or append when the element is missing
pub fn insert_before_close(html: &str, name: &str, snippet: &str) -> String {
    match elements(html, name).into_iter().next() {
        Some(element) => {
            let at = element.inner.end;
            format!("{}{}{}", &html[..at], snippet, &html[at..])
        }
        None => format!("{}{}", html, snippet),
    }
}

/// Insert `snippet` right after the opening `<name ...>` tag
pub fn insert_after_open(html: &str, name: &str, snippet: &str) -> String {
    match open_tags(html).into_iter().find(|(tag, _)| tag.name == name) {
        Some((_, span)) => format!("{}{}{}", &html[..span.end], snippet, &html[span.end..]),
        None => format!("{}{}", snippet, html),
    }
}

fn css_url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"url\(\s*(?:"([^"]*)"|'([^']*)'|([^'")\s]+))\s*\)"#).expect("static css url regex")
    })
}

/// Every `url(...)` reference in a CSS fragment
pub fn css_urls(css: &str) -> Vec<String> {
    css_url_regex()
        .captures_iter(css)
        .filter_map(|c| c.get(1).or_else(|| c.get(2)).or_else(|| c.get(3)))
        .map(|m| m.as_str().trim().to_string())
        .collect()
}

/// Rewrite `url(...)` references; `None` keeps the original
pub fn rewrite_css_urls<F>(css: &str, mut f: F) -> String
where
    F: FnMut(&str) -> Option<String>,
{
    css_url_regex()
        .replace_all(css, |caps: &regex::Captures| {
            let original = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
            let reference = caps
                .get(1)
                .or_else(|| caps.get(2))
                .or_else(|| caps.get(3))
                .map(|m| m.as_str().trim())
                .unwrap_or_default();
            match f(reference) {
                Some(replacement) => format!("url(\"{}\")", replacement),
                None => original.to_string(),
            }
        })
        .into_owned()
}

/// One `srcset` candidate: URL plus optional descriptor (`480w`, `2x`)
#[derive(Debug, Clone, PartialEq)]
pub struct SrcsetCandidate {
    pub url: String,
    pub descriptor: Option<String>,
}

impl SrcsetCandidate {
    /// Width in pixels for `w` descriptors
    pub fn width(&self) -> Option<u32> {
        self.descriptor.as_deref()?.strip_suffix('w')?.parse().ok()
    }

    /// Pixel density for `x` descriptors
    pub fn density(&self) -> Option<f32> {
        self.descriptor.as_deref()?.strip_suffix('x')?.parse().ok()
    }
}

pub fn parse_srcset(srcset: &str) -> Vec<SrcsetCandidate> {
    srcset
        .split(',')
        .filter_map(|candidate| {
            let mut parts = candidate.split_whitespace();
            let url = parts.next()?.to_string();
            let descriptor = parts.next().map(|d| d.to_string());
            Some(SrcsetCandidate { url, descriptor })
        })
        .collect()
}

pub fn format_srcset(candidates: &[SrcsetCandidate]) -> String {
    candidates
        .iter()
        .map(|c| match &c.descriptor {
            Some(d) => format!("{} {}", c.url, d),
            None => c.url.clone(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// `&amp;` in attribute values, as found in query strings
pub fn decode_attr(value: &str) -> String {
    value.replace("&amp;", "&")
}
