//! # DOM Query Abstraction
//!
//! I classificatori dipendono solo da questo trait: implementato per
//! `scraper::ElementRef` (documento completo, con antenati e fratelli) e per
//! `markup::Tag` (solo il tag, usato durante la riscrittura per span).

use crate::markup::Tag;
use scraper::{ElementRef, Selector};

pub trait DomElement: Sized {
    fn name(&self) -> String;

    fn attr(&self, name: &str) -> Option<String>;

    fn parent_element(&self) -> Option<Self>;

    fn next_sibling_elements(&self) -> Vec<Self>;

    fn text_content(&self) -> String;

    /// CSS selector match; elements without a document only support `tag`, `#id` and `.class`
    fn matches_selector(&self, selector: &str) -> bool;

    fn has_attr(&self, name: &str) -> bool {
        self.attr(name).is_some()
    }

    fn classes(&self) -> Vec<String> {
        self.attr("class")
            .map(|c| c.split_whitespace().map(|s| s.to_ascii_lowercase()).collect())
            .unwrap_or_default()
    }

    /// Inline style, lowercased with whitespace removed (`position:absolute;z-index:-1`)
    fn compact_style(&self) -> String {
        self.attr("style")
            .map(|s| s.chars().filter(|c| !c.is_whitespace()).collect::<String>().to_ascii_lowercase())
            .unwrap_or_default()
    }

    /// Ancestors from the parent upwards, at most `limit`
    fn ancestors_up_to(&self, limit: usize) -> Vec<Self> {
        let mut out = Vec::new();
        let mut current = self.parent_element();
        while let Some(element) = current {
            if out.len() >= limit {
                break;
            }
            current = element.parent_element();
            out.push(element);
        }
        out
    }
}

impl<'a> DomElement for ElementRef<'a> {
    fn name(&self) -> String {
        self.value().name().to_ascii_lowercase()
    }

    fn attr(&self, name: &str) -> Option<String> {
        self.value().attr(name).map(|v| v.to_string())
    }

    fn parent_element(&self) -> Option<Self> {
        self.parent().and_then(ElementRef::wrap)
    }

    fn next_sibling_elements(&self) -> Vec<Self> {
        self.next_siblings().filter_map(ElementRef::wrap).collect()
    }

    fn text_content(&self) -> String {
        self.text().collect()
    }

    fn matches_selector(&self, selector: &str) -> bool {
        Selector::parse(selector).map(|s| s.matches(self)).unwrap_or(false)
    }
}

impl DomElement for Tag {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn attr(&self, name: &str) -> Option<String> {
        self.get(name).map(|v| v.to_string())
    }

    fn parent_element(&self) -> Option<Self> {
        None
    }

    fn next_sibling_elements(&self) -> Vec<Self> {
        Vec::new()
    }

    fn text_content(&self) -> String {
        String::new()
    }

    fn matches_selector(&self, selector: &str) -> bool {
        if let Some(id) = selector.strip_prefix('#') {
            self.get("id") == Some(id)
        } else if let Some(class) = selector.strip_prefix('.') {
            self.classes().iter().any(|c| *c == class)
        } else if selector.chars().all(|c| c.is_ascii_alphanumeric()) {
            self.name == selector.to_ascii_lowercase()
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scraper::Html;

    #[test]
    fn test_element_ref_navigation() {
        let doc = Html::parse_document(
            r#"<div class="Outer"><section><video id="v" style="Position: Absolute; Z-Index: -1"></video><div class="overlay"></div></section></div>"#,
        );
        let selector = Selector::parse("video").unwrap();
        let video = doc.select(&selector).next().unwrap();

        assert_eq!(video.compact_style(), "position:absolute;z-index:-1");
        assert_eq!(video.next_sibling_elements().len(), 1);
        let ancestors = video.ancestors_up_to(2);
        assert_eq!(ancestors.len(), 2);
        assert_eq!(ancestors[1].classes(), vec!["outer"]);
        assert!(video.matches_selector("section > video#v"));
    }

    #[test]
    fn test_tag_selector_subset() {
        let tag = Tag::parse(r#"<div id="drift-widget" class="a b">"#).unwrap();
        assert!(tag.matches_selector("#drift-widget"));
        assert!(tag.matches_selector(".b"));
        assert!(tag.matches_selector("div"));
        assert!(!tag.matches_selector("div > p"));
    }
}
