//! Locator configuration: known sources, their container selectors and
//! table layouts, label-keyed locator rules, and heuristic synonyms.
//!
//! The built-in configuration is embedded at compile time from
//! `locators.json`. A replacement file with the same shape can be loaded
//! with [`LocatorConfig::from_path`]; it is validated before use so that a
//! bad selector fails at load time instead of silently matching nothing.

use scraper::{ElementRef, Selector};
use serde::{Deserialize, Serialize};
use std::path::Path;
use url::Url;

use crate::dom::{element_children, element_text, next_element_sibling, own_text, parse_selector};
use crate::numeric::parse_leading_number;
use crate::types::{EngineError, EngineResult, Field, NutrientValue};

const BUILTIN_LOCATORS: &str = include_str!("locators.json");

/// A single "find this field here" rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocatorRule {
    pub field: Field,
    /// CSS selector evaluated inside the container.
    pub locator_expression: String,
    /// Only elements whose own text contains this string are considered.
    /// Case-sensitive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Take the value from the next element sibling of the matched element.
    #[serde(default)]
    pub next_sibling: bool,
    /// Take the value from the first descendant matching this selector.
    #[serde(default, rename = "value", skip_serializing_if = "Option::is_none")]
    pub value_selector: Option<String>,
    /// Spreadsheet column the field is exported to.
    #[serde(default)]
    pub column_index: u32,
    #[serde(default)]
    pub description: String,
}

/// A row-oriented nutrition table where one cell holds the label and
/// another holds the value for the active column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableLayout {
    pub row: String,
    pub cell: String,
    /// Selector for the visible value inside a cell. Without one the cell
    /// itself holds the value; with one, cells lacking a match are skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Text of the header row's first cell.
    pub header_marker: String,
    /// Header cell text that names the column to read.
    pub column_marker: String,
    /// Column used when the header row or marker cell is missing.
    pub default_column: usize,
    /// Label of the row whose next sibling carries the serving size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serving_label: Option<String>,
    pub labels: Vec<TableLabel>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableLabel {
    pub label: String,
    pub field: Field,
}

impl TableLayout {
    /// Field for a row label: the first mapping whose label the row text
    /// contains, so decorated labels like `"– Sugars"` still match.
    pub fn field_for_label(&self, label: &str) -> Option<Field> {
        let label = label.trim();
        self.labels
            .iter()
            .find(|l| label.contains(l.label.as_str()))
            .map(|l| l.field)
    }
}

/// A known nutrition data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceProfile {
    pub name: String,
    /// Host fragments; a URL belongs to this source when its host (minus
    /// `www.`) contains one of them.
    pub domains: Vec<String>,
    /// Container selectors in priority order.
    pub containers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<TableLayout>,
    #[serde(default)]
    pub rules: Vec<LocatorRule>,
}

impl SourceProfile {
    pub fn matches_host(&self, host: &str) -> bool {
        self.domains.iter().any(|d| host.contains(d.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynonymEntry {
    pub field: Field,
    pub labels: Vec<String>,
}

/// Label synonyms used by the generic heuristic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeuristicConfig {
    pub synonyms: Vec<SynonymEntry>,
    pub serving_size_labels: Vec<String>,
}

/// The whole locator table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocatorConfig {
    pub sources: Vec<SourceProfile>,
    /// Rules applied to pages of unknown sources.
    #[serde(default)]
    pub fallback: Vec<LocatorRule>,
    pub heuristic: HeuristicConfig,
}

/// A rule that produced a value, as reported by locator probing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocatorHit {
    pub field: Field,
    pub description: String,
    pub selector: String,
    pub text: String,
    pub value: NutrientValue,
}

/// Normalized host of a URL: lowercased, without a leading `www.`.
pub fn host_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    Some(host.strip_prefix("www.").unwrap_or(&host).to_string())
}

impl LocatorConfig {
    /// The configuration embedded in the binary.
    pub fn builtin() -> EngineResult<Self> {
        Self::from_json(BUILTIN_LOCATORS)
    }

    pub fn from_json(json: &str) -> EngineResult<Self> {
        let config: LocatorConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> EngineResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Check that every selector parses and source names are unique.
    pub fn validate(&self) -> EngineResult<()> {
        let mut names = std::collections::HashSet::new();
        for source in &self.sources {
            if !names.insert(source.name.as_str()) {
                return Err(EngineError::InvalidConfig(format!(
                    "duplicate source name {:?}",
                    source.name
                )));
            }
            if source.domains.is_empty() {
                return Err(EngineError::InvalidConfig(format!(
                    "source {:?} has no domains",
                    source.name
                )));
            }
            for container in &source.containers {
                parse_selector(container)?;
            }
            if let Some(table) = &source.table {
                parse_selector(&table.row)?;
                parse_selector(&table.cell)?;
                if let Some(value) = &table.value {
                    parse_selector(value)?;
                }
            }
            for rule in &source.rules {
                rule.validate()?;
            }
        }
        for rule in &self.fallback {
            rule.validate()?;
        }
        Ok(())
    }

    pub fn source_for_url(&self, url: &str) -> Option<&SourceProfile> {
        let host = host_of(url)?;
        self.sources.iter().find(|s| s.matches_host(&host))
    }

    pub fn source_named(&self, name: &str) -> Option<&SourceProfile> {
        self.sources.iter().find(|s| s.name == name)
    }

    pub fn is_known_source(&self, url: &str) -> bool {
        self.source_for_url(url).is_some()
    }

    /// Locator rules that apply to a URL: the source's own rules for a
    /// known source, the fallback set otherwise.
    pub fn rules_for_url(&self, url: &str) -> &[LocatorRule] {
        match self.source_for_url(url) {
            Some(source) => &source.rules,
            None => &self.fallback,
        }
    }

    /// Export column for a field, taken from the first rule that names it.
    pub fn column_for(&self, field: Field) -> Option<u32> {
        self.sources
            .iter()
            .flat_map(|s| s.rules.iter())
            .chain(self.fallback.iter())
            .find(|r| r.field == field)
            .map(|r| r.column_index)
    }
}

impl LocatorRule {
    fn validate(&self) -> EngineResult<()> {
        parse_selector(&self.locator_expression)?;
        if let Some(value) = &self.value_selector {
            parse_selector(value)?;
        }
        Ok(())
    }

    /// Evaluate the rule inside `scope`, returning the element that holds
    /// the value and the value itself. The first matching element wins.
    pub fn evaluate<'a>(&self, scope: ElementRef<'a>) -> Option<(ElementRef<'a>, NutrientValue)> {
        let selector = Selector::parse(&self.locator_expression).ok()?;
        let value_selector = match &self.value_selector {
            Some(s) => Some(Selector::parse(s).ok()?),
            None => None,
        };

        for candidate in scope.select(&selector) {
            if let Some(label) = &self.label {
                if !label_matches(candidate, label, value_selector.is_some()) {
                    continue;
                }
            }

            let target = if self.next_sibling {
                match next_element_sibling(candidate) {
                    Some(sibling) => sibling,
                    None => continue,
                }
            } else if let Some(value_selector) = &value_selector {
                match candidate.select(value_selector).next() {
                    Some(inner) => inner,
                    None => continue,
                }
            } else {
                candidate
            };

            let text = element_text(&target);
            if text.is_empty() {
                continue;
            }
            let value = match parse_leading_number(&text) {
                Some(n) => NutrientValue::Number(n),
                None if self.field == Field::ServingSize => NutrientValue::Text(text),
                None => continue,
            };
            return Some((target, value));
        }
        None
    }

    /// Evaluate and describe the hit for locator probing.
    pub fn probe(&self, scope: ElementRef<'_>) -> Option<LocatorHit> {
        let (element, value) = self.evaluate(scope)?;
        Some(LocatorHit {
            field: self.field,
            description: self.description.clone(),
            selector: self.locator_expression.clone(),
            text: element_text(&element),
            value,
        })
    }
}

/// Probe every rule inside `container`, keeping the first hit per field.
pub fn evaluate_rules(container: ElementRef<'_>, rules: &[LocatorRule]) -> Vec<LocatorHit> {
    let mut hits: Vec<LocatorHit> = Vec::new();
    for rule in rules {
        if hits.iter().any(|h| h.field == rule.field) {
            continue;
        }
        if let Some(hit) = rule.probe(container) {
            hits.push(hit);
        }
    }
    hits
}

/// Rows carrying a value selector keep their label in a header cell, so
/// direct children are checked too.
fn label_matches(element: ElementRef<'_>, label: &str, include_children: bool) -> bool {
    if own_text(&element).contains(label) {
        return true;
    }
    include_children
        && element_children(element).any(|child| own_text(&child).contains(label))
}

#[cfg(test)]
mod tests {
    use super::*;
    use scraper::Html;

    #[test]
    fn test_builtin_config_loads() {
        let config = LocatorConfig::builtin().unwrap();
        assert_eq!(config.sources.len(), 3);
        assert!(config.source_named("woolworths.com.au").is_some());
        assert_eq!(config.fallback.len(), 10);
        assert_eq!(config.column_for(Field::Protein), Some(10));
    }

    #[test]
    fn test_source_for_url_strips_www() {
        let config = LocatorConfig::builtin().unwrap();
        let source = config
            .source_for_url("https://www.woolworths.com.au/shop/productdetails/1234")
            .unwrap();
        assert_eq!(source.name, "woolworths.com.au");
        assert!(config.is_known_source("https://www.nutritionix.com/food/apple"));
        assert!(!config.is_known_source("https://example.com/food"));
        assert!(!config.is_known_source("not a url"));
    }

    #[test]
    fn test_rules_for_unknown_url_are_fallback() {
        let config = LocatorConfig::builtin().unwrap();
        let rules = config.rules_for_url("https://example.com/");
        assert_eq!(rules, config.fallback.as_slice());
        let rules = config.rules_for_url("https://www.eatthismuch.com/food/nutrition/egg");
        assert_eq!(rules[0].locator_expression, "tr");
    }

    #[test]
    fn test_invalid_selector_rejected() {
        let json = r#"{
            "sources": [],
            "fallback": [{"field": "protein", "locator_expression": "div[[["}],
            "heuristic": {"synonyms": [], "serving_size_labels": []}
        }"#;
        let err = LocatorConfig::from_json(json).unwrap_err();
        assert!(matches!(err, EngineError::InvalidSelector { .. }));
    }

    #[test]
    fn test_duplicate_source_rejected() {
        let json = r#"{
            "sources": [
                {"name": "a", "domains": ["a.com"], "containers": []},
                {"name": "a", "domains": ["b.com"], "containers": []}
            ],
            "heuristic": {"synonyms": [], "serving_size_labels": []}
        }"#;
        assert!(matches!(
            LocatorConfig::from_json(json),
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_next_sibling_rule() {
        let html = Html::parse_document(
            r#"<div class="nutrition-facts"><div>Protein</div><div>14.5g</div></div>"#,
        );
        let rule = LocatorRule {
            field: Field::Protein,
            locator_expression: "div.nutrition-facts div".into(),
            label: Some("Protein".into()),
            next_sibling: true,
            value_selector: None,
            column_index: 10,
            description: "Protein".into(),
        };
        let (el, value) = rule.evaluate(html.root_element()).unwrap();
        assert_eq!(value, NutrientValue::Number(14.5));
        assert_eq!(el.value().name(), "div");
    }

    #[test]
    fn test_value_selector_rule_matches_header_cell() {
        let html = Html::parse_document(
            r#"<table><tr><th>Carbs</th><td>20g</td></tr>
               <tr><th>Protein</th><td>6.3g</td><td>12%</td></tr></table>"#,
        );
        let rule = LocatorRule {
            field: Field::Protein,
            locator_expression: "tr".into(),
            label: Some("Protein".into()),
            next_sibling: false,
            value_selector: Some("td".into()),
            column_index: 10,
            description: "Protein".into(),
        };
        let hit = rule.probe(html.root_element()).unwrap();
        assert_eq!(hit.value, NutrientValue::Number(6.3));
        assert_eq!(hit.text, "6.3g");
    }

    #[test]
    fn test_rule_skips_non_numeric_values() {
        let html = Html::parse_document(r#"<span itemprop="fatContent">-</span>"#);
        let rule = LocatorRule {
            field: Field::Fat,
            locator_expression: r#"span[itemprop="fatContent"]"#.into(),
            label: None,
            next_sibling: false,
            value_selector: None,
            column_index: 12,
            description: "Fat".into(),
        };
        assert!(rule.evaluate(html.root_element()).is_none());
    }

    #[test]
    fn test_evaluate_rules_first_hit_per_field() {
        let html = Html::parse_document(
            r#"<div class="nf">
                 <span itemprop="ironContent">2mg</span>
                 <div>Iron</div><div>9mg</div>
               </div>"#,
        );
        let config = LocatorConfig::builtin().unwrap();
        let rules = &config.source_named("nutritionix.com").unwrap().rules;
        let hits = evaluate_rules(html.root_element(), rules);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].field, Field::Iron);
        assert_eq!(hits[0].value, NutrientValue::Number(2.0));
    }
}
