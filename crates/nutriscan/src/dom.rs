//! Small DOM helpers over `scraper` element references.

use scraper::{ElementRef, Selector};

use crate::types::{EngineError, EngineResult, SourceInfo};

/// Maximum characters of node text kept in a [`SourceInfo`].
pub const SOURCE_TEXT_LIMIT: usize = 100;

/// Parse a CSS selector, mapping the parser's borrowed error into an owned one.
pub fn parse_selector(selector: &str) -> EngineResult<Selector> {
    Selector::parse(selector).map_err(|e| EngineError::InvalidSelector {
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

/// Collect all text content from an element, trimmed and whitespace-collapsed.
pub fn element_text(el: &ElementRef<'_>) -> String {
    el.text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Text of the element's direct text-node children only.
pub fn own_text(el: &ElementRef<'_>) -> String {
    el.children()
        .filter_map(|child| child.value().as_text().map(|t| t.to_string()))
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn next_element_sibling<'a>(el: ElementRef<'a>) -> Option<ElementRef<'a>> {
    el.next_siblings().find_map(ElementRef::wrap)
}

/// Direct element children, skipping text and comment nodes.
pub fn element_children<'a>(el: ElementRef<'a>) -> impl Iterator<Item = ElementRef<'a>> {
    el.children().filter_map(ElementRef::wrap)
}

/// `nth-child` CSS path from the document root to `el`, e.g.
/// `html > body:nth-child(2) > div:nth-child(1)`.
pub fn selector_path(el: ElementRef<'_>) -> String {
    let mut parts = Vec::new();
    let mut current = Some(el);
    while let Some(node) = current {
        let tag = node.value().name().to_ascii_lowercase();
        let parent = node.parent().and_then(ElementRef::wrap);
        match parent {
            Some(_) => {
                let index = node
                    .prev_siblings()
                    .filter(|s| s.value().is_element())
                    .count()
                    + 1;
                parts.push(format!("{tag}:nth-child({index})"));
            }
            None => parts.push(tag),
        }
        current = parent;
    }
    parts.reverse();
    parts.join(" > ")
}

/// Detached description of an element for provenance summaries.
pub fn source_info(el: ElementRef<'_>) -> SourceInfo {
    let text = element_text(&el);
    SourceInfo {
        tag_name: el.value().name().to_ascii_uppercase(),
        text_content: text.chars().take(SOURCE_TEXT_LIMIT).collect(),
        selector_path: selector_path(el),
    }
}
