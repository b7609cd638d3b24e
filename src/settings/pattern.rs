//! # URL Pattern Matcher
//!
//! Traduce i pattern degli override per-asset in regex.
//!
//! ## Sintassi:
//! - glob: `*` qualsiasi sequenza, `?` un singolo carattere
//! - regex esplicita: prefisso `re:` (es. `re:^https://cdn\.example\.com/.*\.png$`)
//! - un pattern che inizia con `/` viene confrontato anche con path + query
//!
//! Un pattern malformato viene accettato ma non matcha nulla: non lancia mai errori.

use regex::Regex;
use tracing::warn;

/// Compiled URL pattern for asset-level overrides
#[derive(Debug, Clone)]
pub struct UrlPattern {
    raw: String,
    regex: Option<Regex>,
}

impl UrlPattern {
    pub fn new(raw: &str) -> Self {
        let source = match raw.strip_prefix("re:") {
            Some(expr) => expr.to_string(),
            None => glob_to_regex(raw),
        };

        let regex = match Regex::new(&source) {
            Ok(regex) => Some(regex),
            Err(e) => {
                warn!("Ignoring malformed URL pattern {:?}: {}", raw, e);
                None
            }
        };

        Self {
            raw: raw.to_string(),
            regex,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_valid(&self) -> bool {
        self.regex.is_some()
    }

    /// True when the pattern matches the full URL, or its path for `/`-rooted patterns
    pub fn matches(&self, url: &str) -> bool {
        let Some(regex) = &self.regex else {
            return false;
        };

        if regex.is_match(url) {
            return true;
        }

        if self.raw.starts_with('/') {
            if let Ok(parsed) = url::Url::parse(url) {
                let mut path = parsed.path().to_string();
                if let Some(query) = parsed.query() {
                    path.push('?');
                    path.push_str(query);
                }
                return regex.is_match(&path);
            }
        }

        false
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() + 8);
    out.push('^');
    for ch in glob.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_matches_full_url() {
        let pattern = UrlPattern::new("https://example.com/blog/*");
        assert!(pattern.matches("https://example.com/blog/first-post"));
        assert!(!pattern.matches("https://example.com/shop/item"));
    }

    #[test]
    fn test_rooted_glob_matches_path() {
        let pattern = UrlPattern::new("/assets/*.png");
        assert!(pattern.matches("https://example.com/assets/hero.png"));
        assert!(!pattern.matches("https://example.com/assets/hero.jpg"));
    }

    #[test]
    fn test_question_mark_and_escaping() {
        let pattern = UrlPattern::new("https://example.com/v?.css");
        assert!(pattern.matches("https://example.com/v1.css"));
        assert!(!pattern.matches("https://example.com/v12.css"));
        assert!(!pattern.matches("https://exampleXcom/v1.css"));
    }

    #[test]
    fn test_regex_prefix() {
        let pattern = UrlPattern::new(r"re:\.(png|jpe?g)$");
        assert!(pattern.matches("https://example.com/a/b.jpeg"));
        assert!(!pattern.matches("https://example.com/a/b.gif"));
    }

    #[test]
    fn test_malformed_pattern_matches_nothing() {
        let pattern = UrlPattern::new("re:([unclosed");
        assert!(!pattern.is_valid());
        assert!(!pattern.matches("https://example.com/"));
        assert!(!pattern.matches("([unclosed"));
    }
}
