//! # CSS Optimizer
//!
//! Purge dei selettori non referenziati dall'HTML crawlato, normalizzazione di
//! `font-display` nei blocchi `@font-face` e minificazione.
//!
//! ## Responsabilità:
//! - Parser a nodi (regole, blocchi condizionali `@media`/`@supports`, at-rule opache)
//! - Purge basato su classi e id, con safelist a livelli `safe ⊃ moderate ⊃ aggressive`
//!   più i pattern regex dell'utente
//! - *Purge test mode*: riporta i selettori che verrebbero rimossi senza toccarli
//! - Serializzazione minificata o leggibile
//!
//! I selettori senza classi né id (tag, `*`, `:root`) non vengono mai rimossi.

use crate::optimizer::{OptimizeOutcome, OptimizeStats};
use crate::settings::{CssSettings, FontDisplay, PurgeAggressiveness};
use regex::Regex;
use scraper::{Html, Selector};
use std::collections::HashSet;
use std::sync::OnceLock;
use tracing::warn;

const AGGRESSIVE_SAFELIST: &[&str] = &[
    r"^(active|open|show|hidden|visible|disabled|selected|current)$",
    r"^is-",
    r"^has-",
];

const MODERATE_SAFELIST: &[&str] = &[
    r"^js-",
    r"^wp-",
    r"^fa-",
    r"^(fade|collapse|collapsing|in|out)$",
    r"^sr-only",
    r"^screen-reader",
    r"modal",
    r"dropdown",
    r"tooltip",
    r"popover",
];

const SAFE_SAFELIST: &[&str] = &[
    r"^swiper",
    r"^slick",
    r"^owl-",
    r"^lightbox",
    r"^elementor",
    r"^et_pb",
    r"^wp-block",
    r"^menu",
    r"^sub-menu",
    r"^nav",
    r"^animate",
    r"^aos",
    r"^woocommerce",
    r"^lazy",
    r"^loaded",
    r"^mobile",
    r"^sticky",
    r"^scrolled",
];

/// Safelist patterns for a tier; wider tiers include the narrower ones
pub fn safelist_patterns(aggressiveness: PurgeAggressiveness) -> Vec<&'static str> {
    let mut patterns = AGGRESSIVE_SAFELIST.to_vec();
    if aggressiveness != PurgeAggressiveness::Aggressive {
        patterns.extend_from_slice(MODERATE_SAFELIST);
    }
    if aggressiveness == PurgeAggressiveness::Safe {
        patterns.extend_from_slice(SAFE_SAFELIST);
    }
    patterns
}

/// Compiled safelist: tier patterns plus user patterns
pub struct Safelist {
    patterns: Vec<Regex>,
}

impl Safelist {
    pub fn new(aggressiveness: PurgeAggressiveness, user_patterns: &[String]) -> Self {
        let mut patterns: Vec<Regex> = safelist_patterns(aggressiveness)
            .into_iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect();
        for raw in user_patterns {
            match Regex::new(raw) {
                Ok(re) => patterns.push(re),
                Err(e) => warn!("Ignoring invalid safelist pattern {:?}: {}", raw, e),
            }
        }
        Self { patterns }
    }

    pub fn protects(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(name))
    }
}

/// Class and id tokens referenced anywhere in the crawled site
#[derive(Debug, Clone, Default)]
pub struct UsedSelectors {
    pub classes: HashSet<String>,
    pub ids: HashSet<String>,
    /// Word-like tokens from scripts, may name either a class or an id
    pub dynamic: HashSet<String>,
}

impl UsedSelectors {
    pub fn from_html<'a, I>(pages: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut used = Self::default();
        for page in pages {
            used.add_html(page);
        }
        used
    }

    pub fn add_html(&mut self, html: &str) {
        let document = Html::parse_document(html);
        if let Ok(all) = Selector::parse("*") {
            for element in document.select(&all) {
                let value = element.value();
                self.classes.extend(value.classes().map(|c| c.to_string()));
                if let Some(id) = value.id() {
                    self.ids.insert(id.to_string());
                }
            }
        }
        if let Ok(scripts) = Selector::parse("script:not([src])") {
            for script in document.select(&scripts) {
                self.add_script(&script.text().collect::<String>());
            }
        }
    }

    /// Class names toggled from JavaScript (`classList.add('open')`)
    pub fn add_script(&mut self, source: &str) {
        for token in script_token_regex().find_iter(source) {
            let token = token.as_str().trim_matches(|c| c == '"' || c == '\'' || c == '`');
            for word in token.split_whitespace() {
                self.dynamic.insert(word.to_string());
            }
        }
    }

    fn has_class(&self, name: &str) -> bool {
        self.classes.contains(name) || self.dynamic.contains(name)
    }

    fn has_id(&self, name: &str) -> bool {
        self.ids.contains(name) || self.dynamic.contains(name)
    }
}

fn script_token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"["'`][A-Za-z_][\w\- ]{0,80}["'`]"#).expect("static script token regex"))
}

/// Input shared by every stylesheet of a build
pub struct CssContext<'a> {
    pub used: &'a UsedSelectors,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CssNode {
    Rule { selectors: Vec<String>, declarations: String },
    /// `@media`, `@supports` and friends: nested rules
    Block { prelude: String, children: Vec<CssNode> },
    /// `@font-face`, `@keyframes`, `@import`: kept opaque
    AtRule { prelude: String, body: Option<String> },
}

const CONDITIONAL_AT_RULES: &[&str] = &["media", "supports", "layer", "container", "document", "-moz-document"];

/// Optimize one stylesheet
pub fn optimize_css(css: &str, ctx: &CssContext, settings: &CssSettings) -> OptimizeOutcome {
    if !settings.enabled {
        return OptimizeOutcome::unchanged(css);
    }

    let mut nodes = parse_stylesheet(css);
    let mut stats = OptimizeStats::default();

    if settings.purge {
        let safelist = Safelist::new(settings.aggressiveness, &settings.safelist);
        let mut purged = Vec::new();
        nodes = purge_nodes(nodes, ctx.used, &safelist, settings.purge_test_mode, &mut purged);
        if settings.purge_test_mode {
            stats.would_remove = purged;
        } else {
            stats.removed = purged;
        }
    }

    apply_font_display_nodes(&mut nodes, settings.font_display);

    let content = if settings.minify {
        serialize_minified(&nodes)
    } else {
        serialize_pretty(&nodes, 0)
    };
    stats.original_bytes = css.len() as u64;
    stats.optimized_bytes = content.len() as u64;
    OptimizeOutcome { content, stats }
}

/// Inject or normalize `font-display` in every `@font-face` block of `css`
pub fn apply_font_display(css: &str, display: FontDisplay) -> String {
    let mut nodes = parse_stylesheet(css);
    apply_font_display_nodes(&mut nodes, display);
    serialize_pretty(&nodes, 0)
}

fn apply_font_display_nodes(nodes: &mut [CssNode], display: FontDisplay) {
    for node in nodes {
        match node {
            CssNode::AtRule { prelude, body: Some(body) } if at_rule_name(prelude) == "font-face" => {
                *body = set_font_display(body, display);
            }
            CssNode::Block { children, .. } => apply_font_display_nodes(children, display),
            _ => {}
        }
    }
}

fn set_font_display(body: &str, display: FontDisplay) -> String {
    let mut declarations: Vec<String> = split_declarations(body)
        .into_iter()
        .filter(|d| !d.to_ascii_lowercase().starts_with("font-display"))
        .collect();
    declarations.push(format!("font-display: {}", display.as_css()));
    declarations.join("; ")
}

fn split_declarations(body: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut depth = 0i32;
    for c in body.chars() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '"' | '\'' => {
                    quote = Some(c);
                    current.push(c);
                }
                '(' => {
                    depth += 1;
                    current.push(c);
                }
                ')' => {
                    depth -= 1;
                    current.push(c);
                }
                ';' if depth <= 0 => {
                    if !current.trim().is_empty() {
                        out.push(current.trim().to_string());
                    }
                    current.clear();
                }
                _ => current.push(c),
            },
        }
    }
    if !current.trim().is_empty() {
        out.push(current.trim().to_string());
    }
    out
}

fn purge_nodes(
    nodes: Vec<CssNode>,
    used: &UsedSelectors,
    safelist: &Safelist,
    test_mode: bool,
    purged: &mut Vec<String>,
) -> Vec<CssNode> {
    let mut kept = Vec::with_capacity(nodes.len());
    for node in nodes {
        match node {
            CssNode::Rule { selectors, declarations } => {
                let (live, dead): (Vec<String>, Vec<String>) =
                    selectors.into_iter().partition(|s| selector_is_used(s, used, safelist));
                purged.extend(dead.iter().cloned());
                let selectors = if test_mode { live.into_iter().chain(dead).collect() } else { live };
                if !selectors.is_empty() {
                    kept.push(CssNode::Rule { selectors, declarations });
                }
            }
            CssNode::Block { prelude, children } => {
                let children = purge_nodes(children, used, safelist, test_mode, purged);
                if !children.is_empty() {
                    kept.push(CssNode::Block { prelude, children });
                }
            }
            other => kept.push(other),
        }
    }
    kept
}

fn selector_regexes() -> &'static (Regex, Regex, Regex, Regex) {
    static RE: OnceLock<(Regex, Regex, Regex, Regex)> = OnceLock::new();
    RE.get_or_init(|| {
        (
            Regex::new(r"\[[^\]]*\]").expect("static attribute regex"),
            Regex::new(r"::?[A-Za-z-]+(\([^)]*\))?").expect("static pseudo regex"),
            Regex::new(r"\.((?:\\.|[\w-])+)").expect("static class regex"),
            Regex::new(r"#((?:\\.|[\w-])+)").expect("static id regex"),
        )
    })
}

/// A selector survives when all its classes and ids are used or safelisted
pub fn selector_is_used(selector: &str, used: &UsedSelectors, safelist: &Safelist) -> bool {
    let (attributes, pseudos, classes, ids) = selector_regexes();
    let stripped = attributes.replace_all(selector, "");
    let stripped = pseudos.replace_all(&stripped, "");

    let unescape = |s: &str| s.replace('\\', "");
    let classes_ok = classes.captures_iter(&stripped).all(|c| {
        let name = unescape(&c[1]);
        used.has_class(&name) || safelist.protects(&name)
    });
    let ids_ok = ids.captures_iter(&stripped).all(|c| {
        let name = unescape(&c[1]);
        used.has_id(&name) || safelist.protects(&name)
    });
    classes_ok && ids_ok
}

/// Comments are stripped; strings are preserved
pub fn parse_stylesheet(css: &str) -> Vec<CssNode> {
    let cleaned = strip_comments(css);
    let mut pos = 0;
    parse_nodes(&cleaned, &mut pos, false)
}

fn strip_comments(css: &str) -> String {
    let bytes = css.as_bytes();
    let mut out = String::with_capacity(css.len());
    let mut i = 0;
    let mut last = 0;
    let mut quote: Option<u8> = None;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == b'\\' {
                    i += 1;
                } else if b == q {
                    quote = None;
                }
            }
            None => {
                if b == b'"' || b == b'\'' {
                    quote = Some(b);
                } else if b == b'/' && bytes.get(i + 1) == Some(&b'*') {
                    out.push_str(&css[last..i]);
                    let end = css[i + 2..].find("*/").map(|e| i + 2 + e + 2).unwrap_or(css.len());
                    i = end;
                    last = end;
                    continue;
                }
            }
        }
        i += 1;
    }
    out.push_str(&css[last.min(css.len())..]);
    out
}

/// Index of the first top-level occurrence of one of `targets`, honouring strings and parens
fn find_top_level(s: &str, from: usize, targets: &[u8]) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut quote: Option<u8> = None;
    let mut parens = 0i32;
    let mut i = from;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == b'\\' {
                    i += 1;
                } else if b == q {
                    quote = None;
                }
            }
            None => match b {
                b'"' | b'\'' => quote = Some(b),
                b'(' => parens += 1,
                b')' => parens -= 1,
                _ if parens <= 0 && targets.contains(&b) => return Some(i),
                _ => {}
            },
        }
        i += 1;
    }
    None
}

/// Index of the `}` closing the block opened at `open`
fn matching_brace(s: &str, open: usize) -> usize {
    let bytes = s.as_bytes();
    let mut depth = 0i32;
    let mut quote: Option<u8> = None;
    let mut i = open;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == b'\\' {
                    i += 1;
                } else if b == q {
                    quote = None;
                }
            }
            None => match b {
                b'"' | b'\'' => quote = Some(b),
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        return i;
                    }
                }
                _ => {}
            },
        }
        i += 1;
    }
    s.len()
}

fn parse_nodes(s: &str, pos: &mut usize, nested: bool) -> Vec<CssNode> {
    let mut nodes = Vec::new();
    loop {
        while *pos < s.len() && s.as_bytes()[*pos].is_ascii_whitespace() {
            *pos += 1;
        }
        if *pos >= s.len() {
            break;
        }
        if s.as_bytes()[*pos] == b'}' {
            *pos += 1;
            if nested {
                break;
            }
            continue;
        }

        let Some(delim) = find_top_level(s, *pos, b"{;}") else {
            break;
        };
        let prelude = s[*pos..delim].trim().to_string();

        match s.as_bytes()[delim] {
            b';' => {
                if prelude.starts_with('@') {
                    nodes.push(CssNode::AtRule { prelude, body: None });
                }
                *pos = delim + 1;
            }
            b'}' => {
                // dichiarazione orfana prima della chiusura di un blocco
                *pos = delim;
            }
            _ => {
                if prelude.starts_with('@') && CONDITIONAL_AT_RULES.contains(&at_rule_name(&prelude).as_str()) {
                    *pos = delim + 1;
                    let children = parse_nodes(s, pos, true);
                    nodes.push(CssNode::Block { prelude, children });
                } else {
                    let end = matching_brace(s, delim);
                    let body = s[delim + 1..end.min(s.len())].trim().to_string();
                    *pos = (end + 1).min(s.len());
                    if prelude.starts_with('@') {
                        nodes.push(CssNode::AtRule { prelude, body: Some(body) });
                    } else if !prelude.is_empty() {
                        nodes.push(CssNode::Rule {
                            selectors: split_selectors(&prelude),
                            declarations: body,
                        });
                    }
                }
            }
        }
    }
    nodes
}

fn at_rule_name(prelude: &str) -> String {
    prelude
        .trim_start_matches('@')
        .split(|c: char| c.is_whitespace() || c == '(' || c == '{')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase()
}

fn split_selectors(prelude: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut start = 0;
    while let Some(comma) = find_top_level(prelude, start, b",") {
        out.push(prelude[start..comma].trim().to_string());
        start = comma + 1;
    }
    out.push(prelude[start..].trim().to_string());
    out.retain(|s| !s.is_empty());
    out
}

/// Collapse whitespace outside strings; drop it around `chars`
fn squeeze(text: &str, chars: &[char]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut quote: Option<char> = None;
    let mut pending_space = false;
    for c in text.chars() {
        if let Some(q) = quote {
            out.push(c);
            if c == q {
                quote = None;
            }
            continue;
        }
        if c.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space {
            let prev_is_sep = out.chars().last().map(|p| chars.contains(&p)).unwrap_or(true);
            if !prev_is_sep && !chars.contains(&c) {
                out.push(' ');
            }
            pending_space = false;
        }
        if c == '"' || c == '\'' {
            quote = Some(c);
        }
        out.push(c);
    }
    out
}

fn minify_declarations(body: &str) -> String {
    let squeezed = squeeze(body, &[':', ';', ',', '{', '}', '>']);
    let squeezed = squeezed.replace(";}", "}");
    squeezed.trim_end_matches(';').to_string()
}

fn minify_selector(selector: &str) -> String {
    squeeze(selector, &[',', '>', '+', '~'])
}

fn serialize_minified(nodes: &[CssNode]) -> String {
    let mut out = String::new();
    for node in nodes {
        match node {
            CssNode::Rule { selectors, declarations } => {
                let selectors: Vec<String> = selectors.iter().map(|s| minify_selector(s)).collect();
                out.push_str(&selectors.join(","));
                out.push('{');
                out.push_str(&minify_declarations(declarations));
                out.push('}');
            }
            CssNode::Block { prelude, children } => {
                out.push_str(&squeeze(prelude, &[',', ':']));
                out.push('{');
                out.push_str(&serialize_minified(children));
                out.push('}');
            }
            CssNode::AtRule { prelude, body } => {
                out.push_str(&squeeze(prelude, &[',']));
                match body {
                    Some(body) => {
                        out.push('{');
                        out.push_str(&minify_declarations(body));
                        out.push('}');
                    }
                    None => out.push(';'),
                }
            }
        }
    }
    out
}

fn serialize_pretty(nodes: &[CssNode], depth: usize) -> String {
    let indent = "  ".repeat(depth);
    let mut out = String::new();
    for node in nodes {
        match node {
            CssNode::Rule { selectors, declarations } => {
                out.push_str(&format!("{}{} {{ {} }}\n", indent, selectors.join(", "), declarations.trim()));
            }
            CssNode::Block { prelude, children } => {
                out.push_str(&format!("{}{} {{\n", indent, prelude));
                out.push_str(&serialize_pretty(children, depth + 1));
                out.push_str(&format!("{}}}\n", indent));
            }
            CssNode::AtRule { prelude, body } => match body {
                Some(body) => out.push_str(&format!("{}{} {{ {} }}\n", indent, prelude, body.trim())),
                None => out.push_str(&format!("{}{};\n", indent, prelude)),
            },
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn used(html: &str) -> UsedSelectors {
        UsedSelectors::from_html([html])
    }

    #[test]
    fn test_parse_nested_blocks() {
        let nodes = parse_stylesheet("/* c */ a{color:red} @media (max-width: 600px) { .x, .y { margin: 0 } } @import url(a.css);");
        assert_eq!(nodes.len(), 3);
        match &nodes[1] {
            CssNode::Block { prelude, children } => {
                assert_eq!(prelude, "@media (max-width: 600px)");
                assert_eq!(children.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(&nodes[2], CssNode::AtRule { body: None, .. }));
    }

    #[test]
    fn test_purge_removes_unused_and_keeps_safelisted() {
        let css = ".used{color:red}.unused{color:blue}.is-open{display:block}#main{x:y}#gone{x:y}p{margin:0}";
        let ctx = CssContext { used: &used(r#"<div class="used" id="main"><p>x</p></div>"#) };
        let out = optimize_css(css, &ctx, &CssSettings::default());
        assert!(out.content.contains(".used{color:red}"));
        assert!(out.content.contains(".is-open"));
        assert!(out.content.contains("#main"));
        assert!(out.content.contains("p{margin:0}"));
        assert!(!out.content.contains(".unused"));
        assert!(!out.content.contains("#gone"));
        assert_eq!(out.stats.removed, vec![".unused", "#gone"]);
    }

    #[test]
    fn test_purge_test_mode_reports_without_removing() {
        let css = ".used { color: red }\n.unused { color: blue }";
        let ctx = CssContext { used: &used(r#"<p class="used">x</p>"#) };
        let settings = CssSettings { purge_test_mode: true, ..Default::default() };
        let out = optimize_css(css, &ctx, &settings);
        assert_eq!(out.stats.would_remove, vec![".unused"]);
        assert!(out.stats.removed.is_empty());
        assert!(out.content.contains(".unused"));
    }

    #[test]
    fn test_partial_selector_lists_and_pseudos() {
        let css = ".used:hover, .gone::after { color: red } .used:not(.never) { x: y } a[href$='.pdf'] { x: y }";
        let ctx = CssContext { used: &used(r#"<a class="used" href="a.pdf">x</a>"#) };
        let out = optimize_css(css, &ctx, &CssSettings::default());
        assert!(out.content.contains(".used:hover{"));
        assert!(!out.content.contains(".gone"));
        assert!(out.content.contains(".used:not(.never)"));
        assert!(out.content.contains("a[href$='.pdf']"));
    }

    #[test]
    fn test_aggressive_tier_is_narrower() {
        let safe = Safelist::new(PurgeAggressiveness::Safe, &[]);
        let moderate = Safelist::new(PurgeAggressiveness::Moderate, &[]);
        let aggressive = Safelist::new(PurgeAggressiveness::Aggressive, &[]);
        assert!(safe.protects("swiper-slide"));
        assert!(!moderate.protects("swiper-slide"));
        assert!(moderate.protects("js-toggle"));
        assert!(!aggressive.protects("js-toggle"));
        assert!(aggressive.protects("is-active"));

        let user = Safelist::new(PurgeAggressiveness::Aggressive, &["^promo-".to_string(), "(".to_string()]);
        assert!(user.protects("promo-banner"));
    }

    #[test]
    fn test_script_class_toggles_are_kept() {
        let mut used = used("<div class='menu'></div>");
        used.add_script("el.classList.add('drawer-expanded')");
        let ctx = CssContext { used: &used };
        let settings = CssSettings { aggressiveness: PurgeAggressiveness::Aggressive, ..Default::default() };
        let out = optimize_css(".drawer-expanded{x:y}.never{x:y}", &ctx, &settings);
        assert!(out.content.contains(".drawer-expanded"));
        assert!(!out.content.contains(".never"));
    }

    #[test]
    fn test_font_display_injected_and_normalized() {
        let css = "@font-face { font-family: 'A'; src: url(a.woff2) format('woff2') } @font-face { font-family: B; font-display: block; src: url(b.woff2) }";
        let out = apply_font_display(css, FontDisplay::Swap);
        assert_eq!(out.matches("font-display: swap").count(), 2);
        assert!(!out.contains("block"));
    }

    #[test]
    fn test_minify_keeps_strings_and_calc() {
        let css = ".used  >  a { content: \"a  b\"; width: calc(100% - 2px) ;  }\n\n@media screen and (min-width: 10px) { .used { x : y } }";
        let ctx = CssContext { used: &used("<div class='used'></div>") };
        let out = optimize_css(css, &ctx, &CssSettings::default());
        assert_eq!(
            out.content,
            ".used>a{content:\"a  b\";width:calc(100% - 2px)}@media screen and (min-width:10px){.used{x:y}}"
        );
        assert!(out.stats.optimized_bytes < out.stats.original_bytes);
    }

    #[test]
    fn test_disabled_is_identity() {
        let ctx = CssContext { used: &UsedSelectors::default() };
        let settings = CssSettings { enabled: false, ..Default::default() };
        let out = optimize_css(".a { b: c }", &ctx, &settings);
        assert_eq!(out.content, ".a { b: c }");
    }
}
