//! Nutriscan core: nutrition facts extraction from HTML documents, with
//! per-field provenance and in-page highlight scripts.

pub mod dom;
pub mod engine;
pub mod highlight;
pub mod locators;
pub mod numeric;
pub mod types;

pub use engine::{Engine, Extraction, ExtractionReport, ProvenanceMap, Strategy, StrategyOutput};
pub use highlight::{HighlightPlan, DEFAULT_LABEL_DURATION};
pub use locators::{LocatorConfig, LocatorHit, LocatorRule, SourceProfile};
pub use numeric::{is_meaningful, parse_leading_number};
pub use types::*;
