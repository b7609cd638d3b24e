//! # JavaScript Optimizer
//!
//! ## Responsabilità:
//! - Rimozione degli script "morti" per categoria (tracking pixel, polyfill legacy,
//!   emoji, widget commenti, social share, jquery-migrate), ognuna attivabile da settings
//! - Minificazione conservativa su token: commenti, spazi, `debugger`, rami `if (false)`,
//!   accorciamento dei parametri nelle funzioni semplici
//! - Strategia di caricamento (`defer`/`async`/`module`) sui tag esterni, esclusi
//!   gli script critici (analytics, tag manager) e quelli che usano `document.write`
//! - Spostamento opzionale degli script inline dall'head alla fine del body
//!
//! ## Minificazione:
//! Gli a-capo vengono mantenuti dove l'ASI potrebbe dipenderne. I parametri non
//! vengono rinominati nelle funzioni che contengono `eval`, `with`, `arguments`,
//! funzioni annidate o template con `${`, né quando il nome è nella allow-list globale.

use crate::markup::{self, elements, splice, Tag};
use crate::optimizer::{resolve_site_path, OptimizeOutcome, OptimizeStats};
use crate::settings::{DeadScriptToggles, JsSettings, LoadingStrategy};
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::OnceLock;

/// Inline scripts smaller than this stay in the head
pub const TINY_INLINE_SCRIPT_BYTES: usize = 200;

/// Identifiers third-party integrations expect to find untouched
pub const RESERVED_GLOBALS: &[&str] = &[
    "$", "jQuery", "wp", "ga", "gtag", "dataLayer", "fbq", "_gaq", "google", "grecaptcha", "Stripe", "Shopify",
    "React", "Vue", "angular", "window", "document", "module", "exports", "require", "define", "self", "globalThis",
];

const KEYWORDS: &[&str] = &[
    "break", "case", "catch", "class", "const", "continue", "debugger", "default", "delete", "do", "else", "export",
    "extends", "false", "finally", "for", "function", "if", "import", "in", "instanceof", "new", "null", "return",
    "super", "switch", "this", "throw", "true", "try", "typeof", "var", "void", "while", "with", "yield", "let",
    "static", "enum", "await", "async", "of", "undefined", "NaN", "Infinity",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadScriptCategory {
    TrackingPixels,
    LegacyPolyfills,
    Emoji,
    CommentWidgets,
    SocialShare,
    JqueryMigrate,
}

impl DeadScriptCategory {
    pub const ALL: [DeadScriptCategory; 6] = [
        Self::TrackingPixels,
        Self::LegacyPolyfills,
        Self::Emoji,
        Self::CommentWidgets,
        Self::SocialShare,
        Self::JqueryMigrate,
    ];

    /// Filename substrings identifying the category
    pub fn filename_patterns(&self) -> &'static [&'static str] {
        match self {
            Self::TrackingPixels => &[
                "fbevents.js",
                "facebook-pixel",
                "pixel.min.js",
                "insight.min.js",
                "linkedin-insight",
                "tiktok-pixel",
                "pinit.js",
                "bat.bing.com",
            ],
            Self::LegacyPolyfills => &[
                "polyfill",
                "html5shiv",
                "respond.min.js",
                "respond.js",
                "es5-shim",
                "es6-promise",
                "babel-polyfill",
                "picturefill",
            ],
            Self::Emoji => &["wp-emoji-release", "wp-emoji", "twemoji"],
            Self::CommentWidgets => &["comment-reply", "disqus", "commento"],
            Self::SocialShare => &["addthis", "sharethis", "addtoany", "social-share", "shareaholic"],
            Self::JqueryMigrate => &["jquery-migrate"],
        }
    }

    /// Signatures of inline bootstrap snippets belonging to the category
    pub fn inline_signatures(&self) -> &'static [&'static str] {
        match self {
            Self::TrackingPixels => &["fbq('init'", "fbq(\"init\"", "_linkedin_partner_id", "ttq.load("],
            Self::Emoji => &["_wpemojiSettings", "wpemojiSettings"],
            Self::SocialShare => &["addthis_config", "addtoany_config"],
            _ => &[],
        }
    }

    pub fn enabled(&self, toggles: &DeadScriptToggles) -> bool {
        match self {
            Self::TrackingPixels => toggles.tracking_pixels,
            Self::LegacyPolyfills => toggles.legacy_polyfills,
            Self::Emoji => toggles.emoji,
            Self::CommentWidgets => toggles.comment_widgets,
            Self::SocialShare => toggles.social_share,
            Self::JqueryMigrate => toggles.jquery_migrate,
        }
    }
}

/// Category whose filename pattern matches, regardless of toggles
pub fn matching_category(path: &str) -> Option<DeadScriptCategory> {
    let lower = path.to_ascii_lowercase();
    let file = lower.rsplit('/').next().unwrap_or(&lower);
    DeadScriptCategory::ALL
        .into_iter()
        .find(|c| c.filename_patterns().iter().any(|p| file.contains(p) || (p.contains('.') && lower.contains(p))))
}

/// Category to remove for `path` under the given toggles
pub fn dead_script_category(path: &str, toggles: &DeadScriptToggles) -> Option<DeadScriptCategory> {
    matching_category(path).filter(|c| c.enabled(toggles))
}

fn inline_dead_category(source: &str, toggles: &DeadScriptToggles) -> Option<DeadScriptCategory> {
    DeadScriptCategory::ALL
        .into_iter()
        .filter(|c| c.enabled(toggles))
        .find(|c| c.inline_signatures().iter().any(|s| source.contains(s)))
}

fn critical_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)googletagmanager|google-analytics\.com|gtag\(|gtm\.js|analytics\.js|dataLayer|_gaq|plausible|fathom|cookiebot|consent|onetrust")
            .expect("static critical script regex")
    })
}

/// Analytics / tag-manager scripts that must keep their loading behaviour
pub fn is_critical_script(text: &str) -> bool {
    critical_regex().is_match(text)
}

pub fn uses_document_write(source: &str) -> bool {
    source.contains("document.write")
}

/// Minify one JS file
pub fn optimize_js(source: &str, settings: &JsSettings) -> OptimizeOutcome {
    if !settings.enabled || !settings.minify {
        return OptimizeOutcome::unchanged(source);
    }
    let content = minify_js(source, &settings.reserved_globals);
    let stats = OptimizeStats::sized(source.len(), content.len());
    if content.len() >= source.len() {
        return OptimizeOutcome::unchanged(source);
    }
    OptimizeOutcome { content, stats }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Word,
    Number,
    Str,
    Template,
    Regex,
    Punct,
}

#[derive(Debug, Clone)]
struct JsToken {
    kind: Kind,
    text: String,
    /// A line break separated this token from the previous one
    newline_before: bool,
}

impl JsToken {
    fn is(&self, kind: Kind, text: &str) -> bool {
        self.kind == kind && self.text == text
    }

    fn punct(&self, text: &str) -> bool {
        self.is(Kind::Punct, text)
    }

    fn word(&self, text: &str) -> bool {
        self.is(Kind::Word, text)
    }
}

const PUNCTUATORS: &[&str] = &[
    ">>>=", "...", "===", "!==", "**=", "<<=", ">>=", ">>>", "&&=", "||=", "??=", "=>", "==", "!=", "<=", ">=", "&&",
    "||", "??", "?.", "++", "--", "+=", "-=", "*=", "/=", "%=", "&=", "|=", "^=", "**", "<<", ">>",
];

const REGEX_AFTER_WORDS: &[&str] = &[
    "return", "typeof", "case", "do", "else", "in", "of", "new", "delete", "void", "throw", "instanceof", "yield", "await",
];

fn regex_allowed(prev: Option<&JsToken>) -> bool {
    match prev {
        None => true,
        Some(t) => match t.kind {
            Kind::Word => REGEX_AFTER_WORDS.contains(&t.text.as_str()),
            Kind::Number | Kind::Str | Kind::Template | Kind::Regex => false,
            Kind::Punct => !matches!(t.text.as_str(), ")" | "]" | "}" | "++" | "--"),
        },
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$' || !c.is_ascii()
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$' || !c.is_ascii()
}

/// Tokenize, dropping comments and whitespace but remembering line breaks
fn tokenize(src: &str) -> Vec<JsToken> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens: Vec<JsToken> = Vec::new();
    let mut i = 0;
    let mut newline = false;

    let push = |tokens: &mut Vec<JsToken>, kind: Kind, text: String, newline: &mut bool| {
        tokens.push(JsToken { kind, text, newline_before: *newline });
        *newline = false;
    };

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            if c == '\n' || c == '\r' || c == '\u{2028}' || c == '\u{2029}' {
                newline = true;
            }
            i += 1;
            continue;
        }

        if c == '/' && chars.get(i + 1) == Some(&'/') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }
        if c == '/' && chars.get(i + 1) == Some(&'*') {
            let start = i;
            i += 2;
            while i + 1 < chars.len() && !(chars[i] == '*' && chars[i + 1] == '/') {
                i += 1;
            }
            if chars[start..i.min(chars.len())].contains(&'\n') {
                newline = true;
            }
            i = (i + 2).min(chars.len());
            continue;
        }

        let start = i;
        if c == '"' || c == '\'' {
            i += 1;
            while i < chars.len() && chars[i] != c && chars[i] != '\n' {
                if chars[i] == '\\' {
                    i += 1;
                }
                i += 1;
            }
            i = (i + 1).min(chars.len());
            push(&mut tokens, Kind::Str, chars[start..i].iter().collect(), &mut newline);
            continue;
        }

        if c == '`' {
            i = scan_template(&chars, i);
            push(&mut tokens, Kind::Template, chars[start..i].iter().collect(), &mut newline);
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).map(|d| d.is_ascii_digit()).unwrap_or(false)) {
            i += 1;
            while i < chars.len() {
                let d = chars[i];
                let exponent_sign = (d == '+' || d == '-')
                    && matches!(chars[i - 1], 'e' | 'E')
                    && !chars[start..i].iter().any(|x| *x == 'x' || *x == 'X');
                if d.is_ascii_alphanumeric() || d == '.' || d == '_' || exponent_sign {
                    i += 1;
                } else {
                    break;
                }
            }
            push(&mut tokens, Kind::Number, chars[start..i].iter().collect(), &mut newline);
            continue;
        }

        if is_ident_start(c) {
            while i < chars.len() && is_ident_char(chars[i]) {
                i += 1;
            }
            push(&mut tokens, Kind::Word, chars[start..i].iter().collect(), &mut newline);
            continue;
        }

        if c == '/' && regex_allowed(tokens.last()) {
            i += 1;
            let mut in_class = false;
            while i < chars.len() && chars[i] != '\n' {
                match chars[i] {
                    '\\' => i += 1,
                    '[' => in_class = true,
                    ']' => in_class = false,
                    '/' if !in_class => break,
                    _ => {}
                }
                i += 1;
            }
            i = (i + 1).min(chars.len());
            while i < chars.len() && chars[i].is_ascii_alphabetic() {
                i += 1;
            }
            push(&mut tokens, Kind::Regex, chars[start..i].iter().collect(), &mut newline);
            continue;
        }

        let rest: String = chars[i..(i + 4).min(chars.len())].iter().collect();
        let mut text = PUNCTUATORS
            .iter()
            .find(|p| rest.starts_with(*p))
            .map(|p| p.to_string())
            .unwrap_or_else(|| c.to_string());
        // `a?.5:1` è un ternario, non optional chaining
        if text == "?." && chars.get(i + 2).map(|d| d.is_ascii_digit()).unwrap_or(false) {
            text = "?".to_string();
        }
        i += text.chars().count();
        push(&mut tokens, Kind::Punct, text, &mut newline);
    }

    tokens
}

/// End (exclusive) of the template literal starting at `start`
fn scan_template(chars: &[char], start: usize) -> usize {
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 2,
            '`' => return i + 1,
            '$' if chars.get(i + 1) == Some(&'{') => {
                i += 2;
                let mut depth = 1;
                while i < chars.len() && depth > 0 {
                    match chars[i] {
                        '{' => depth += 1,
                        '}' => depth -= 1,
                        '`' => {
                            i = scan_template(chars, i);
                            continue;
                        }
                        '\'' | '"' => {
                            let quote = chars[i];
                            i += 1;
                            while i < chars.len() && chars[i] != quote {
                                if chars[i] == '\\' {
                                    i += 1;
                                }
                                i += 1;
                            }
                        }
                        _ => {}
                    }
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    chars.len()
}

/// Index of the token closing the bracket opened at `open`
fn matching_token(tokens: &[JsToken], open: usize, open_text: &str, close_text: &str) -> Option<usize> {
    let mut depth = 0;
    for (offset, token) in tokens[open..].iter().enumerate() {
        if token.punct(open_text) {
            depth += 1;
        } else if token.punct(close_text) {
            depth -= 1;
            if depth == 0 {
                return Some(open + offset);
            }
        }
    }
    None
}

fn is_constant_false(token: &JsToken) -> bool {
    token.word("false") || (token.kind == Kind::Number && token.text == "0")
}

/// Drop `debugger` statements and `if (false) { ... }` blocks without `else`
fn eliminate_dead_code(tokens: Vec<JsToken>) -> Vec<JsToken> {
    let mut out: Vec<JsToken> = Vec::with_capacity(tokens.len());
    let mut i = 0;
    while i < tokens.len() {
        let token = &tokens[i];

        if token.word("debugger") && !out.last().map(|t| t.punct(".")).unwrap_or(false) {
            let guarded = out
                .last()
                .map(|t| t.punct(")") || t.word("else") || t.word("do"))
                .unwrap_or(false);
            let has_semicolon = tokens.get(i + 1).map(|t| t.punct(";")).unwrap_or(false);
            if guarded {
                out.push(JsToken {
                    kind: Kind::Punct,
                    text: ";".to_string(),
                    newline_before: token.newline_before,
                });
            }
            i += if has_semicolon { 2 } else { 1 };
            continue;
        }

        if token.word("if")
            && !out.last().map(|t| t.word("else") || t.punct(".")).unwrap_or(false)
            && tokens.get(i + 1).map(|t| t.punct("(")).unwrap_or(false)
            && tokens.get(i + 2).map(is_constant_false).unwrap_or(false)
            && tokens.get(i + 3).map(|t| t.punct(")")).unwrap_or(false)
            && tokens.get(i + 4).map(|t| t.punct("{")).unwrap_or(false)
        {
            if let Some(close) = matching_token(&tokens, i + 4, "{", "}") {
                let followed_by_else = tokens.get(close + 1).map(|t| t.word("else")).unwrap_or(false);
                if !followed_by_else {
                    i = close + 1;
                    continue;
                }
            }
        }

        out.push(token.clone());
        i += 1;
    }
    out
}

fn short_names() -> impl Iterator<Item = String> {
    let letters: Vec<char> = ('a'..='z').collect();
    let singles = letters.clone().into_iter().map(|c| c.to_string());
    let doubles = letters
        .clone()
        .into_iter()
        .flat_map(move |a| ('a'..='z').map(move |b| format!("{}{}", a, b)));
    singles.chain(doubles)
}

/// Rename simple parameters of functions whose bodies are free of scope hazards
fn shorten_parameters(tokens: &mut [JsToken], reserved: &HashSet<String>) {
    let mut i = 0;
    while i < tokens.len() {
        if !tokens[i].word("function") {
            i += 1;
            continue;
        }
        let mut open_paren = i + 1;
        if tokens.get(open_paren).map(|t| t.kind == Kind::Word).unwrap_or(false) {
            open_paren += 1;
        }
        if !tokens.get(open_paren).map(|t| t.punct("(")).unwrap_or(false) {
            i += 1;
            continue;
        }
        let Some(close_paren) = matching_token(tokens, open_paren, "(", ")") else {
            break;
        };
        let body_open = close_paren + 1;
        if !tokens.get(body_open).map(|t| t.punct("{")).unwrap_or(false) {
            i = close_paren;
            continue;
        }
        let Some(body_close) = matching_token(tokens, body_open, "{", "}") else {
            break;
        };

        rename_in_function(tokens, open_paren, close_paren, body_close, reserved);
        i = body_close;
    }
}

fn rename_in_function(
    tokens: &mut [JsToken],
    open_paren: usize,
    close_paren: usize,
    body_close: usize,
    reserved: &HashSet<String>,
) {
    let params_slice = &tokens[open_paren + 1..close_paren];
    let simple = params_slice
        .iter()
        .enumerate()
        .all(|(n, t)| if n % 2 == 0 { t.kind == Kind::Word } else { t.punct(",") });
    if !simple || params_slice.is_empty() {
        return;
    }
    let params: Vec<String> = params_slice.iter().filter(|t| t.kind == Kind::Word).map(|t| t.text.clone()).collect();

    let body = &tokens[close_paren + 2..body_close];
    let hazardous = body.iter().any(|t| {
        (t.kind == Kind::Word && matches!(t.text.as_str(), "eval" | "with" | "arguments" | "function" | "this"))
            || t.punct("=>")
            || (t.kind == Kind::Template && t.text.contains("${"))
    });
    if hazardous {
        return;
    }

    let in_use: HashSet<&str> = tokens[open_paren..body_close]
        .iter()
        .filter(|t| t.kind == Kind::Word)
        .map(|t| t.text.as_str())
        .collect();

    // ogni occorrenza deve essere un riferimento semplice
    for index in close_paren + 2..body_close {
        let token = &tokens[index];
        if token.kind != Kind::Word || !params.contains(&token.text) {
            continue;
        }
        let prev = &tokens[index - 1];
        let next = tokens.get(index + 1);
        if prev.punct(".") || prev.punct("?.") {
            continue;
        }
        let next_is = |text: &str| next.map(|t| t.punct(text)).unwrap_or(false);
        if next_is(":") {
            return;
        }
        if (prev.punct("{") || prev.punct(",")) && (next_is("}") || next_is(",")) {
            return;
        }
    }

    let mut candidates = short_names().filter(|n| {
        !in_use.contains(n.as_str()) && !reserved.contains(n) && !KEYWORDS.contains(&n.as_str())
    });
    let mut renames: Vec<(String, String)> = Vec::new();
    for param in &params {
        if param.chars().count() <= 1 || reserved.contains(param) || renames.iter().any(|(from, _)| from == param) {
            continue;
        }
        if let Some(short) = candidates.next() {
            renames.push((param.clone(), short));
        }
    }
    if renames.is_empty() {
        return;
    }

    for index in open_paren + 1..body_close {
        if tokens[index].kind != Kind::Word {
            continue;
        }
        if index > close_paren && (tokens[index - 1].punct(".") || tokens[index - 1].punct("?.")) {
            continue;
        }
        if let Some((_, short)) = renames.iter().find(|(from, _)| *from == tokens[index].text) {
            tokens[index].text = short.clone();
        }
    }
}

const RESTRICTED_WORDS: &[&str] = &["return", "break", "continue", "throw", "yield", "async"];

fn keeps_newline(prev: &JsToken, next: &JsToken) -> bool {
    if prev.kind == Kind::Word && RESTRICTED_WORDS.contains(&prev.text.as_str()) {
        return true;
    }
    let prev_can_end = match prev.kind {
        Kind::Punct => matches!(prev.text.as_str(), ")" | "]" | "}" | "++" | "--"),
        _ => true,
    };
    let next_can_start = match next.kind {
        Kind::Punct => matches!(next.text.as_str(), "++" | "--" | "!" | "~" | "{"),
        _ => true,
    };
    prev_can_end && next_can_start
}

fn needs_space(prev: &JsToken, next: &JsToken) -> bool {
    let wordish = |t: &JsToken| matches!(t.kind, Kind::Word | Kind::Number);
    if wordish(prev) && wordish(next) {
        return true;
    }
    if prev.kind == Kind::Regex && next.kind == Kind::Word {
        return true;
    }
    if prev.kind == Kind::Number && next.kind == Kind::Punct && next.text.starts_with('.') {
        return true;
    }
    if prev.kind == Kind::Punct && next.kind == Kind::Punct {
        let (p, n) = (prev.text.as_str(), next.text.as_str());
        return (p.ends_with('+') && n.starts_with('+')) || (p.ends_with('-') && n.starts_with('-'));
    }
    false
}

fn emit(tokens: &[JsToken]) -> String {
    let mut out = String::new();
    let mut prev: Option<&JsToken> = None;
    for token in tokens {
        if let Some(p) = prev {
            if token.newline_before && keeps_newline(p, token) {
                out.push('\n');
            } else if needs_space(p, token) {
                out.push(' ');
            }
        }
        out.push_str(&token.text);
        prev = Some(token);
    }
    out
}

/// Conservative minifier; `extra_reserved` extends the global allow-list
pub fn minify_js(source: &str, extra_reserved: &[String]) -> String {
    let reserved: HashSet<String> = RESERVED_GLOBALS
        .iter()
        .map(|s| s.to_string())
        .chain(extra_reserved.iter().cloned())
        .collect();
    let tokens = tokenize(source);
    let mut tokens = eliminate_dead_code(tokens);
    shorten_parameters(&mut tokens, &reserved);
    emit(&tokens)
}

/// Per-page inputs for script tag rewriting
pub struct ScriptPageContext<'a> {
    pub page_path: &'a str,
    /// Site paths of script files deleted in the asset pass
    pub removed: &'a HashSet<String>,
    /// Site paths of script files that call `document.write`
    pub document_write: &'a HashSet<String>,
}

fn is_javascript(tag: &Tag) -> bool {
    match tag.get("type").map(|t| t.trim().to_ascii_lowercase()) {
        None => true,
        Some(t) => t.is_empty() || t == "module" || t.contains("javascript") || t.contains("ecmascript"),
    }
}

/// Remove dead script tags, apply the loading strategy, optionally move inline head scripts
pub fn optimize_script_tags(html: &str, ctx: &ScriptPageContext, settings: &JsSettings) -> OptimizeOutcome {
    if !settings.enabled {
        return OptimizeOutcome::unchanged(html);
    }

    let mut stats = OptimizeStats::default();
    let mut edits = Vec::new();

    for script in elements(html, "script") {
        let tag = &script.tag;
        if !is_javascript(tag) {
            continue;
        }

        match tag.get("src").map(markup::decode_attr) {
            Some(src) => {
                let site_path = resolve_site_path(ctx.page_path, &src);
                let deleted_file = site_path.as_ref().map(|p| ctx.removed.contains(p)).unwrap_or(false);
                let category = dead_script_category(&src, &settings.remove);
                if deleted_file || category.is_some() {
                    edits.push((script.outer.clone(), String::new()));
                    stats.removed.push(src.clone());
                    if !deleted_file {
                        stats.scripts_removed += 1;
                    }
                    continue;
                }

                let writes = site_path.as_ref().map(|p| ctx.document_write.contains(p)).unwrap_or(false);
                if writes || is_critical_script(&src) {
                    continue;
                }
                let mut rewritten = tag.clone();
                if apply_loading_strategy(&mut rewritten, settings.loading) {
                    edits.push((script.open.clone(), rewritten.to_html()));
                }
            }
            None => {
                let source = script.inner_html(html);
                if let Some(category) = inline_dead_category(source, &settings.remove) {
                    edits.push((script.outer.clone(), String::new()));
                    stats.removed.push(format!("inline:{:?}", category));
                    stats.scripts_removed += 1;
                }
            }
        }
    }

    let mut content = splice(html, edits);
    if settings.move_to_body {
        let (moved_html, moved) = relocate_inline_scripts(&content);
        if moved > 0 {
            stats.notes.push(format!("moved {} inline scripts to body", moved));
        }
        content = moved_html;
    }

    stats.original_bytes = html.len() as u64;
    stats.optimized_bytes = content.len() as u64;
    OptimizeOutcome { content, stats }
}

/// Returns `true` when the tag changed
fn apply_loading_strategy(tag: &mut Tag, strategy: LoadingStrategy) -> bool {
    if tag.has("nomodule") {
        return false;
    }
    let is_module = tag.get("type").map(|t| t.eq_ignore_ascii_case("module")).unwrap_or(false);
    match strategy {
        LoadingStrategy::None => false,
        LoadingStrategy::Defer => {
            if tag.has("defer") || tag.has("async") || is_module {
                return false;
            }
            tag.set_flag("defer");
            true
        }
        LoadingStrategy::Async => {
            if tag.has("async") || is_module {
                return false;
            }
            tag.remove("defer");
            tag.set_flag("async");
            true
        }
        LoadingStrategy::Module => {
            if is_module {
                return false;
            }
            tag.remove("defer");
            tag.set("type", "module");
            true
        }
    }
}

/// Move head inline scripts to the end of body, keeping their order.
/// Tiny config blocks, JSON blocks and critical scripts stay put.
pub fn relocate_inline_scripts(html: &str) -> (String, usize) {
    let Some(head) = markup::first_element(html, "head") else {
        return (html.to_string(), 0);
    };
    if markup::first_element(html, "body").is_none() {
        return (html.to_string(), 0);
    }

    let mut edits = Vec::new();
    let mut moved = Vec::new();
    for script in elements(html, "script") {
        if script.outer.start < head.inner.start || script.outer.end > head.inner.end {
            continue;
        }
        if script.tag.has("src") {
            continue;
        }
        let kind = script.tag.get("type").unwrap_or("").to_ascii_lowercase();
        if kind.contains("json") || !is_javascript(&script.tag) {
            continue;
        }
        let source = script.inner_html(html);
        if source.trim().len() < TINY_INLINE_SCRIPT_BYTES || is_critical_script(source) {
            continue;
        }
        moved.push(script.outer_html(html).to_string());
        edits.push((script.outer.clone(), String::new()));
    }

    if moved.is_empty() {
        return (html.to_string(), 0);
    }
    let count = moved.len();
    let without = splice(html, edits);
    (markup::insert_before_close(&without, "body", &moved.concat()), count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minify(src: &str) -> String {
        minify_js(src, &[])
    }

    #[test]
    fn test_dead_script_categories_follow_toggles() {
        let defaults = DeadScriptToggles::default();
        assert_eq!(
            dead_script_category("/wp-includes/js/wp-emoji-release.min.js", &defaults),
            Some(DeadScriptCategory::Emoji)
        );
        assert_eq!(
            dead_script_category("js/polyfill.min.js", &defaults),
            Some(DeadScriptCategory::LegacyPolyfills)
        );
        // default off
        assert_eq!(dead_script_category("js/jquery-migrate.min.js", &defaults), None);
        assert_eq!(dead_script_category("js/comment-reply.min.js", &defaults), None);

        let toggles = DeadScriptToggles { jquery_migrate: true, emoji: false, ..Default::default() };
        assert_eq!(
            dead_script_category("js/jquery-migrate.min.js", &toggles),
            Some(DeadScriptCategory::JqueryMigrate)
        );
        assert_eq!(dead_script_category("/wp-includes/js/wp-emoji-release.min.js", &toggles), None);
        assert_eq!(dead_script_category("js/app.js", &toggles), None);
    }

    #[test]
    fn test_minify_strips_comments_and_whitespace() {
        let out = minify("// header\nvar  total = 1 + 2; /* block */\nconsole.log( total );\n");
        assert_eq!(out, "var total=1+2;console.log(total);");
    }

    #[test]
    fn test_minify_preserves_strings_regex_and_templates() {
        let out = minify("var s = 'a  // not a comment'; var r = /ab+c\\/d/gi.test(s); var t = `x  ${ s } y`;");
        assert!(out.contains("'a  // not a comment'"));
        assert!(out.contains("/ab+c\\/d/gi.test(s)"));
        assert!(out.contains("`x  ${ s } y`"));
    }

    #[test]
    fn test_minify_keeps_asi_newlines() {
        let out = minify("let a = 1\nlet b = a\n++b\nreturn\nb");
        assert_eq!(out, "let a=1\nlet b=a\n++b\nreturn\nb");
        // nessuna ambiguità dopo `;` o `{`
        assert_eq!(minify("f();\n\ng();"), "f();g();");
        assert_eq!(minify("a + + b; c - -d"), "a+ +b;c- -d");
    }

    #[test]
    fn test_dead_code_elimination() {
        let out = minify("if (false) { debug(); } run(); debugger; if (0) { x() } else { y() }");
        assert_eq!(out, "run();if(0){x()}else{y()}");
        assert_eq!(minify("if (ok) debugger; next();"), "if(ok);next();");
    }

    #[test]
    fn test_parameter_shortening() {
        let out = minify("function add(first, second) { return first + second; }");
        assert_eq!(out, "function add(a,b){return a+b;}");

        // proprietà e allow-list intatte
        let out = minify("function f(options, jQuery) { return options.options + jQuery(options); }");
        assert_eq!(out, "function f(a,jQuery){return a.options+jQuery(a);}");
    }

    #[test]
    fn test_parameter_shortening_skips_hazards() {
        let src = "function f(value) { return eval(value); }";
        assert_eq!(minify(src), "function f(value){return eval(value);}");
        let src = "function f(value) { return { value }; }";
        assert_eq!(minify(src), "function f(value){return{value};}");
        let src = "function f(value) { return { value: value }; }";
        assert_eq!(minify(src), "function f(value){return{value:value};}");
        let src = "function f(value) { return function() { return value; }; }";
        assert!(minify(src).contains("return value"));
    }

    #[test]
    fn test_short_names_avoid_existing_identifiers() {
        let out = minify("function f(alpha, beta) { var a = alpha; return a + beta; }");
        assert_eq!(out, "function f(b,c){var a=b;return a+c;}");
    }

    #[test]
    fn test_script_tags_loading_and_removal() {
        let html = r#"<html><head>
<script src="/js/app.js"></script>
<script src="https://www.googletagmanager.com/gtag/js?id=G-1" async></script>
<script src="js/legacy.js"></script>
<script src="/wp-includes/js/wp-emoji-release.min.js"></script>
<script type="application/ld+json">{"@type":"Organization"}</script>
<script src="/js/removed.js"></script>
</head><body></body></html>"#;
        let removed: HashSet<String> = ["js/removed.js".to_string()].into_iter().collect();
        let writes: HashSet<String> = ["js/legacy.js".to_string()].into_iter().collect();
        let ctx = ScriptPageContext { page_path: "index.html", removed: &removed, document_write: &writes };
        let out = optimize_script_tags(html, &ctx, &JsSettings::default());

        assert!(out.content.contains(r#"<script src="/js/app.js" defer>"#));
        assert!(out.content.contains(r#"<script src="js/legacy.js"></script>"#));
        assert!(out.content.contains("googletagmanager.com/gtag/js?id=G-1\" async></script>"));
        assert!(!out.content.contains("wp-emoji"));
        assert!(!out.content.contains("removed.js"));
        assert!(out.content.contains("ld+json"));
        assert_eq!(out.stats.scripts_removed, 1);
        assert_eq!(out.stats.removed.len(), 2);
    }

    #[test]
    fn test_relocate_inline_scripts() {
        let big = format!("var config = {{}}; {}", "config.x = 1; ".repeat(20));
        let html = format!(
            r#"<html><head><script>var tiny=1;</script><script>{big}</script><script type="application/json">{{"a":"{pad}"}}</script><script>gtag('config', 'G-1'); {pad}</script></head><body><p>x</p></body></html>"#,
            big = big,
            pad = "x".repeat(250)
        );
        let (out, moved) = relocate_inline_scripts(&html);
        assert_eq!(moved, 1);
        let head_end = out.find("</head>").unwrap();
        assert!(out[..head_end].contains("var tiny=1;"));
        assert!(out[..head_end].contains("application/json"));
        assert!(out[..head_end].contains("gtag("));
        let body_start = out.find("<body>").unwrap();
        assert!(out[body_start..].contains("var config"));
    }

    #[test]
    fn test_module_strategy() {
        let html = r#"<script src="/a.js" defer></script>"#;
        let empty = HashSet::new();
        let ctx = ScriptPageContext { page_path: "index.html", removed: &empty, document_write: &empty };
        let settings = JsSettings { loading: LoadingStrategy::Module, ..Default::default() };
        let out = optimize_script_tags(html, &ctx, &settings);
        assert_eq!(out.content, r#"<script src="/a.js" type="module"></script>"#);
    }
}
