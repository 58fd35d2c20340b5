//! Label-synonym text search for pages without a known layout.
//!
//! For each field the synonyms are tried in order. A synonym matches a text
//! node case-insensitively; the value is the first number found walking
//! from that node's parent up to the container. When no text node yields a
//! number, elements whose `class` or `id` contains the synonym are tried.

use scraper::ElementRef;

use super::StrategyOutput;
use crate::dom::element_text;
use crate::locators::{HeuristicConfig, LocatorRule};
use crate::numeric::{normalize_whitespace, parse_leading_number};
use crate::types::{Field, FieldMethod, NutrientValue};

const SKIPPED_TAGS: &[&str] = &["script", "style", "noscript"];

/// A visible text node, kept as its parent element and its own text.
struct TextNode<'a> {
    parent: ElementRef<'a>,
    text: String,
}

/// Returns `None` only when no rule, synonym or serving label occurs in
/// the container at all.
pub(super) fn extract<'a>(
    config: &HeuristicConfig,
    fallback: &[LocatorRule],
    container: ElementRef<'a>,
) -> Option<StrategyOutput<'a>> {
    let mut output = StrategyOutput::default();
    let mut seen = output.apply_rules(container, fallback) > 0;

    let texts = visible_text_nodes(container);

    for entry in &config.synonyms {
        if output.record.has(entry.field) {
            continue;
        }
        for label in &entry.labels {
            let (occurred, found) = find_value(&texts, container, label);
            seen |= occurred;
            if let Some((element, value)) = found {
                tracing::trace!(field = %entry.field, label = %label, value, "text search hit");
                output.fill(
                    entry.field,
                    NutrientValue::Number(value),
                    element,
                    FieldMethod::TextSearch,
                );
                break;
            }
        }
    }

    if !output.record.has(Field::ServingSize) {
        for label in &config.serving_size_labels {
            if let Some((element, text)) = serving_size(&texts, label) {
                output.fill(
                    Field::ServingSize,
                    NutrientValue::Text(text),
                    element,
                    FieldMethod::TextSearch,
                );
                seen = true;
                break;
            }
        }
    }

    seen.then_some(output)
}

/// Search one synonym. Returns whether it occurred anywhere, and the value
/// if one was found.
fn find_value<'a>(
    texts: &[TextNode<'a>],
    container: ElementRef<'a>,
    label: &str,
) -> (bool, Option<(ElementRef<'a>, f64)>) {
    let needle = label.to_lowercase();
    let mut occurred = false;

    for node in texts.iter().filter(|n| n.text.to_lowercase().contains(&needle)) {
        occurred = true;
        if let Some(hit) = value_from_ancestors(node.parent, container) {
            return (true, Some(hit));
        }
    }

    for el in class_or_id_matches(container, label) {
        occurred = true;
        if let Some(n) = parse_leading_number(&element_text(&el)) {
            return (true, Some((el, n)));
        }
    }

    (occurred, None)
}

/// Non-blank text nodes under the container in document order, with
/// script and style content left out.
fn visible_text_nodes(container: ElementRef<'_>) -> Vec<TextNode<'_>> {
    container
        .descendants()
        .filter_map(|node| {
            let text = node.value().as_text()?;
            if text.trim().is_empty() {
                return None;
            }
            let parent = node.parent().and_then(ElementRef::wrap)?;
            if inside_skipped(parent) {
                return None;
            }
            Some(TextNode {
                parent,
                text: text.to_string(),
            })
        })
        .collect()
}

fn inside_skipped(el: ElementRef<'_>) -> bool {
    SKIPPED_TAGS.contains(&el.value().name())
        || el
            .ancestors()
            .filter_map(ElementRef::wrap)
            .any(|a| SKIPPED_TAGS.contains(&a.value().name()))
}

/// First element from `start` up to and including the container whose
/// text parses to a number.
fn value_from_ancestors<'a>(
    start: ElementRef<'a>,
    container: ElementRef<'a>,
) -> Option<(ElementRef<'a>, f64)> {
    let mut current = Some(start);
    while let Some(el) = current {
        if let Some(n) = parse_leading_number(&element_text(&el)) {
            return Some((el, n));
        }
        if el.id() == container.id() {
            break;
        }
        current = el.parent().and_then(ElementRef::wrap);
    }
    None
}

/// Elements whose `class` or `id` attribute contains `needle`, case-sensitively.
fn class_or_id_matches<'a, 'n>(
    container: ElementRef<'a>,
    needle: &'n str,
) -> impl Iterator<Item = ElementRef<'a>> + 'n
where
    'a: 'n,
{
    container
        .descendants()
        .filter_map(ElementRef::wrap)
        .filter(move |el| {
            let attrs = el.value();
            attrs.attr("class").is_some_and(|c| c.contains(needle))
                || attrs.attr("id").is_some_and(|i| i.contains(needle))
        })
}

/// Serving size from the first text node containing the label. A node
/// holding only the label takes its value from the next text node.
fn serving_size<'a>(texts: &[TextNode<'a>], label: &str) -> Option<(ElementRef<'a>, String)> {
    let needle = label.to_lowercase();
    let index = texts
        .iter()
        .position(|n| n.text.to_lowercase().contains(&needle))?;

    let node = &texts[index];
    let text = normalize_whitespace(&node.text);
    let bare = text.trim_end_matches(':').trim().to_lowercase() == needle;
    if bare {
        let next = texts.get(index + 1)?;
        return Some((next.parent, normalize_whitespace(&next.text)));
    }
    Some((node.parent, text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locators::LocatorConfig;
    use scraper::Html;

    fn extract_html(html: &Html) -> Option<StrategyOutput<'_>> {
        let config = LocatorConfig::builtin().unwrap();
        extract(&config.heuristic, &config.fallback, html.root_element())
    }

    #[test]
    fn test_label_and_value_in_sibling_cells() {
        let html = Html::parse_document(
            r#"<table>
                 <tr><td>Total Fat</td><td>8g</td></tr>
                 <tr><td>Protein</td><td>14.5g</td></tr>
               </table>"#,
        );
        let out = extract_html(&html).unwrap();
        // Ancestor walk reaches the row, whose text starts with the label.
        assert_eq!(out.record.fat, Some(NutrientValue::Number(8.0)));
        assert_eq!(out.record.protein, Some(NutrientValue::Number(14.5)));
        assert_eq!(out.provenance[&Field::Protein].value().name(), "tr");
        assert_eq!(out.methods[&Field::Protein], FieldMethod::TextSearch);
    }

    #[test]
    fn test_script_text_ignored() {
        let html = Html::parse_document(
            r#"<body><script>var protein = 99;</script><p>nothing here</p></body>"#,
        );
        assert!(extract_html(&html).is_none());
    }

    #[test]
    fn test_label_without_number_still_counts() {
        let html = Html::parse_document("<body><p>Protein: see package</p></body>");
        let out = extract_html(&html).unwrap();
        assert!(out.record.is_empty());
    }

    #[test]
    fn test_class_name_lookup() {
        let html = Html::parse_document(
            r#"<body><div class="nutrient-sodium">410 mg</div></body>"#,
        );
        let out = extract_html(&html).unwrap();
        assert_eq!(out.record.sodium, Some(NutrientValue::Number(410.0)));
        assert_eq!(out.provenance[&Field::Sodium].value().name(), "div");
    }

    #[test]
    fn test_serving_size_from_following_text() {
        let html = Html::parse_document(
            r#"<body><span>Serving Size</span> <span>2 slices (56g)</span>
               <p>Calories 150</p></body>"#,
        );
        let out = extract_html(&html).unwrap();
        assert_eq!(out.record.serving_size.as_deref(), Some("2 slices (56g)"));
        assert_eq!(out.record.calories, Some(NutrientValue::Number(150.0)));
    }

    #[test]
    fn test_serving_size_inline() {
        let html = Html::parse_document("<body><p>Serving size 1 cup (240ml)</p></body>");
        let out = extract_html(&html).unwrap();
        assert_eq!(
            out.record.serving_size.as_deref(),
            Some("Serving size 1 cup (240ml)")
        );
    }

    #[test]
    fn test_fallback_rules_run_first() {
        let html = Html::parse_document(
            r#"<div class="nutrition-facts"><div>Protein</div><div>21g</div></div>
               <p>Protein 3g</p>"#,
        );
        let out = extract_html(&html).unwrap();
        assert_eq!(out.record.protein, Some(NutrientValue::Number(21.0)));
        assert_eq!(out.methods[&Field::Protein], FieldMethod::Locator);
    }
}
