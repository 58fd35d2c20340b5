//! Extraction engine: container lookup plus a fixed chain of strategies.
//!
//! The chain is structured metadata, then the site-specific table and
//! locator rules, then the generic label heuristic. The first strategy that
//! can handle the container and returns a record wins, even if that record
//! has every field empty; later strategies are not consulted.
//!
//! Everything here is synchronous because `scraper` types are `!Send`.
//! Provenance borrows elements from the parsed [`Html`], so an
//! [`Extraction`] cannot outlive its document. Call
//! [`Extraction::into_report`] to get an owned, thread-safe result.

mod heuristic;
mod site_specific;
mod structured;

use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::dom::source_info;
use crate::locators::{
    evaluate_rules, HeuristicConfig, LocatorConfig, LocatorHit, LocatorRule, SourceProfile,
};
use crate::types::{
    EngineError, EngineResult, Field, FieldMethod, NutrientValue, NutritionRecord, NutritionStats,
    ProvenanceSummary, StrategyKind,
};

/// Field to the DOM node that produced its value, borrowed from the document.
pub type ProvenanceMap<'a> = BTreeMap<Field, ElementRef<'a>>;

/// What a single strategy produced.
#[derive(Debug, Clone, Default)]
pub struct StrategyOutput<'a> {
    pub record: NutritionRecord,
    pub provenance: ProvenanceMap<'a>,
    pub methods: BTreeMap<Field, FieldMethod>,
}

impl<'a> StrategyOutput<'a> {
    /// Fill a field unless it already has a value. Returns whether it was set.
    pub(crate) fn fill(
        &mut self,
        field: Field,
        value: NutrientValue,
        element: ElementRef<'a>,
        method: FieldMethod,
    ) -> bool {
        if self.record.has(field) {
            return false;
        }
        self.record.set(field, value);
        self.provenance.insert(field, element);
        self.methods.insert(field, method);
        true
    }

    /// Apply locator rules for fields that are still empty. Returns the
    /// number of rules that produced a value.
    pub(crate) fn apply_rules(&mut self, container: ElementRef<'a>, rules: &[LocatorRule]) -> usize {
        let mut hits = 0;
        for rule in rules {
            if self.record.has(rule.field) {
                continue;
            }
            if let Some((element, value)) = rule.evaluate(container) {
                tracing::debug!(field = %rule.field, selector = %rule.locator_expression, "locator hit");
                if self.fill(rule.field, value, element, FieldMethod::Locator) {
                    hits += 1;
                }
            }
        }
        hits
    }
}

/// One step of the extraction chain.
#[derive(Debug, Clone, Copy)]
pub enum Strategy<'c> {
    StructuredMetadata,
    SiteSpecific(Option<&'c SourceProfile>),
    GenericHeuristic {
        config: &'c HeuristicConfig,
        fallback: &'c [LocatorRule],
    },
}

impl<'c> Strategy<'c> {
    pub fn kind(&self) -> StrategyKind {
        match self {
            Strategy::StructuredMetadata => StrategyKind::StructuredMetadata,
            Strategy::SiteSpecific(_) => StrategyKind::SiteSpecific,
            Strategy::GenericHeuristic { .. } => StrategyKind::GenericHeuristic,
        }
    }

    pub fn can_handle(&self, container: ElementRef<'_>) -> bool {
        match self {
            Strategy::StructuredMetadata => structured::has_metadata(container),
            Strategy::SiteSpecific(Some(source)) => {
                source.table.is_some() || !source.rules.is_empty()
            }
            Strategy::SiteSpecific(None) => false,
            Strategy::GenericHeuristic { .. } => true,
        }
    }

    pub fn extract<'a>(&self, container: ElementRef<'a>) -> Option<StrategyOutput<'a>> {
        match self {
            Strategy::StructuredMetadata => structured::extract(container),
            Strategy::SiteSpecific(Some(source)) => site_specific::extract(source, container),
            Strategy::SiteSpecific(None) => None,
            Strategy::GenericHeuristic { config, fallback } => {
                heuristic::extract(config, fallback, container)
            }
        }
    }
}

/// Result of running the engine over one document.
#[derive(Debug, Clone)]
pub struct Extraction<'a> {
    pub record: NutritionRecord,
    pub provenance: ProvenanceMap<'a>,
    pub methods: BTreeMap<Field, FieldMethod>,
    /// Strategy that produced the record, `None` when nothing did.
    pub strategy: Option<StrategyKind>,
    pub container_found: bool,
    /// Name of the known source the page was matched to.
    pub source: Option<String>,
}

impl<'a> Extraction<'a> {
    fn empty(source: Option<&SourceProfile>, container_found: bool) -> Self {
        Self {
            record: NutritionRecord::default(),
            provenance: ProvenanceMap::new(),
            methods: BTreeMap::new(),
            strategy: None,
            container_found,
            source: source.map(|s| s.name.clone()),
        }
    }

    /// Detach provenance from the document.
    pub fn summarize(&self) -> ProvenanceSummary {
        self.provenance
            .iter()
            .map(|(field, el)| (*field, source_info(*el)))
            .collect()
    }

    pub fn into_report(self, title: Option<String>) -> ExtractionReport {
        let sources = self.summarize();
        let stats = self.record.stats(Some(&sources));
        ExtractionReport {
            record: self.record,
            sources,
            methods: self.methods,
            strategy: self.strategy,
            container_found: self.container_found,
            source: self.source,
            title,
            stats,
        }
    }
}

/// Owned, serializable extraction result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionReport {
    pub record: NutritionRecord,
    pub sources: ProvenanceSummary,
    #[serde(default)]
    pub methods: BTreeMap<Field, FieldMethod>,
    pub strategy: Option<StrategyKind>,
    pub container_found: bool,
    pub source: Option<String>,
    pub title: Option<String>,
    pub stats: NutritionStats,
}

/// Runs the strategy chain with a given locator configuration.
#[derive(Debug, Clone)]
pub struct Engine {
    config: LocatorConfig,
}

impl Engine {
    pub fn new(config: LocatorConfig) -> Self {
        Self { config }
    }

    pub fn builtin() -> EngineResult<Self> {
        Ok(Self::new(LocatorConfig::builtin()?))
    }

    pub fn config(&self) -> &LocatorConfig {
        &self.config
    }

    fn chain<'c>(&'c self, source: Option<&'c SourceProfile>) -> [Strategy<'c>; 3] {
        [
            Strategy::StructuredMetadata,
            Strategy::SiteSpecific(source),
            Strategy::GenericHeuristic {
                config: &self.config.heuristic,
                fallback: &self.config.fallback,
            },
        ]
    }

    /// Find the nutrition container. Known sources try their container
    /// selectors in order; unknown pages use the whole document.
    pub fn locate_container<'a>(
        &self,
        document: &'a Html,
        source: Option<&SourceProfile>,
    ) -> Option<ElementRef<'a>> {
        let Some(source) = source else {
            return Some(document.root_element());
        };
        for container in &source.containers {
            let Ok(selector) = Selector::parse(container) else {
                continue;
            };
            if let Some(found) = document.select(&selector).next() {
                return Some(found);
            }
        }
        tracing::debug!(source = %source.name, "no nutrition container matched");
        None
    }

    /// Run the chain over a located container.
    pub fn extract<'a>(
        &self,
        container: ElementRef<'a>,
        source: Option<&SourceProfile>,
    ) -> Extraction<'a> {
        for strategy in self.chain(source) {
            if !strategy.can_handle(container) {
                continue;
            }
            if let Some(output) = strategy.extract(container) {
                tracing::debug!(
                    strategy = %strategy.kind(),
                    fields = output.record.populated_fields().len(),
                    "strategy produced a record"
                );
                return Extraction {
                    record: output.record,
                    provenance: output.provenance,
                    methods: output.methods,
                    strategy: Some(strategy.kind()),
                    container_found: true,
                    source: source.map(|s| s.name.clone()),
                };
            }
        }
        tracing::debug!("no strategy produced a record");
        Extraction::empty(source, true)
    }

    /// Match the URL to a source, locate the container and extract.
    pub fn extract_page<'a>(&self, document: &'a Html, url: &str) -> Extraction<'a> {
        let source = self.config.source_for_url(url);
        self.extract_for(document, source)
    }

    /// Extract with a source forced by name, regardless of the page URL.
    pub fn extract_with_source<'a>(
        &self,
        document: &'a Html,
        name: &str,
    ) -> EngineResult<Extraction<'a>> {
        let source = self
            .config
            .source_named(name)
            .ok_or_else(|| EngineError::UnknownSource(name.to_string()))?;
        Ok(self.extract_for(document, Some(source)))
    }

    fn extract_for<'a>(&self, document: &'a Html, source: Option<&SourceProfile>) -> Extraction<'a> {
        match self.locate_container(document, source) {
            Some(container) => self.extract(container, source),
            None => Extraction::empty(source, false),
        }
    }

    /// Evaluate the locator rules that apply to `url` and report what each
    /// one finds, without running the strategy chain.
    pub fn probe_locators(&self, document: &Html, url: &str) -> Vec<LocatorHit> {
        let source = self.config.source_for_url(url);
        let scope = self
            .locate_container(document, source)
            .unwrap_or_else(|| document.root_element());
        evaluate_rules(scope, self.config.rules_for_url(url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Engine {
        Engine::builtin().unwrap()
    }

    #[test]
    fn test_unknown_page_uses_document_root() {
        let html = Html::parse_document("<body><p>Protein 5g</p></body>");
        let container = engine().locate_container(&html, None).unwrap();
        assert_eq!(container.value().name(), "html");
    }

    #[test]
    fn test_known_source_without_container_is_empty() {
        let html = Html::parse_document("<body><p>Protein 5g</p></body>");
        let extraction =
            engine().extract_page(&html, "https://www.woolworths.com.au/shop/productdetails/1");
        assert!(!extraction.container_found);
        assert!(extraction.record.is_empty());
        assert!(extraction.strategy.is_none());
        assert_eq!(extraction.source.as_deref(), Some("woolworths.com.au"));
    }

    #[test]
    fn test_alternate_container_selector() {
        let html = Html::parse_document(
            r#"<div class="nf"><span itemprop="proteinContent">7g</span></div>"#,
        );
        let extraction = engine().extract_page(&html, "https://www.nutritionix.com/food/egg");
        assert!(extraction.container_found);
        assert_eq!(extraction.strategy, Some(StrategyKind::SiteSpecific));
        assert_eq!(extraction.record.protein, Some(NutrientValue::Number(7.0)));
        assert_eq!(extraction.methods[&Field::Protein], FieldMethod::Locator);
    }

    #[test]
    fn test_extract_with_unknown_source() {
        let html = Html::parse_document("<body></body>");
        let err = engine().extract_with_source(&html, "nope.example").unwrap_err();
        assert!(matches!(err, EngineError::UnknownSource(name) if name == "nope.example"));
    }

    #[test]
    fn test_report_is_detached() {
        let html = Html::parse_document(
            r#"<body><table><tr><td>Total Fat 3g</td></tr></table></body>"#,
        );
        let report = engine()
            .extract_page(&html, "https://example.com/food")
            .into_report(Some("Food".into()));
        assert_eq!(report.record.fat, Some(NutrientValue::Number(3.0)));
        assert_eq!(report.sources[&Field::Fat].tag_name, "TD");
        assert_eq!(report.stats.found_count, 1);
        assert_eq!(report.stats.highlighted_count, 1);
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"generic_heuristic\""));
    }

    #[test]
    fn test_probe_locators_reports_hits() {
        let html = Html::parse_document(
            r#"<div class="nutrition-facts"><div>Protein</div><div>4g</div>
               <div>Fiber</div><div>2.5g</div></div>"#,
        );
        let hits = engine().probe_locators(&html, "https://example.com/");
        let fields: Vec<Field> = hits.iter().map(|h| h.field).collect();
        assert_eq!(fields, vec![Field::Protein, Field::Fiber]);
        assert_eq!(hits[1].value, NutrientValue::Number(2.5));
    }
}
