//! JSON-LD `NutritionInformation` extraction.

use scraper::{ElementRef, Selector};
use serde_json::Value;
use std::sync::OnceLock;

use super::StrategyOutput;
use crate::numeric::parse_leading_number;
use crate::types::{Field, FieldMethod, NutrientValue};

const NUTRITION_TYPE: &str = "NutritionInformation";

/// schema.org property to record field.
const PROPERTY_MAP: &[(&str, Field)] = &[
    ("calories", Field::Calories),
    ("proteinContent", Field::Protein),
    ("fatContent", Field::Fat),
    ("carbohydrateContent", Field::Carbs),
    ("fiberContent", Field::Fiber),
    ("sugarContent", Field::Sugar),
    ("cholesterolContent", Field::Cholesterol),
    ("sodiumContent", Field::Sodium),
    ("saturatedFatContent", Field::SaturatedFat),
    ("servingSize", Field::ServingSize),
];

fn jsonld_selector() -> &'static Selector {
    static SEL: OnceLock<Selector> = OnceLock::new();
    SEL.get_or_init(|| Selector::parse(r#"script[type="application/ld+json"]"#).unwrap())
}

pub(super) fn has_metadata(container: ElementRef<'_>) -> bool {
    container.select(jsonld_selector()).next().is_some()
}

/// Use the first JSON-LD block that contains a `NutritionInformation`
/// object. Malformed blocks are skipped.
pub(super) fn extract<'a>(container: ElementRef<'a>) -> Option<StrategyOutput<'a>> {
    for script in container.select(jsonld_selector()) {
        let text = script.text().collect::<String>();
        let text = text.trim();
        if text.is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(text) else {
            tracing::debug!("skipping malformed JSON-LD block");
            continue;
        };
        let Some(info) = find_nutrition(&value) else {
            continue;
        };

        let mut output = StrategyOutput::default();
        for (property, field) in PROPERTY_MAP {
            if let Some(parsed) = info.get(*property).and_then(|v| to_value(*field, v)) {
                output.fill(*field, parsed, script, FieldMethod::StructuredMetadata);
            }
        }
        return Some(output);
    }
    None
}

fn is_nutrition_type(value: &Value) -> bool {
    match value.get("@type") {
        Some(Value::String(t)) => t == NUTRITION_TYPE,
        Some(Value::Array(types)) => types.iter().any(|t| t.as_str() == Some(NUTRITION_TYPE)),
        _ => false,
    }
}

/// Depth-first search for a `NutritionInformation` object. Covers direct
/// objects, top-level arrays, `@graph` and nesting such as
/// `Recipe.nutrition`.
fn find_nutrition(value: &Value) -> Option<&Value> {
    match value {
        Value::Object(map) => {
            if is_nutrition_type(value) {
                return Some(value);
            }
            map.values().find_map(find_nutrition)
        }
        Value::Array(items) => items.iter().find_map(find_nutrition),
        _ => None,
    }
}

fn to_value(field: Field, raw: &Value) -> Option<NutrientValue> {
    match raw {
        Value::Number(n) => n.as_f64().map(NutrientValue::Number),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            if field == Field::ServingSize {
                return Some(NutrientValue::Text(s.to_string()));
            }
            Some(match parse_leading_number(s) {
                Some(n) => NutrientValue::Number(n),
                None => NutrientValue::Text(s.to_string()),
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scraper::Html;

    fn run(html: &str) -> Option<StrategyOutput<'static>> {
        let doc: &'static Html = Box::leak(Box::new(Html::parse_document(html)));
        extract(doc.root_element())
    }

    #[test]
    fn test_direct_nutrition_object() {
        let out = run(r#"<script type="application/ld+json">
            {"@type": "NutritionInformation", "calories": "240 calories",
             "proteinContent": "14 g", "sugarContent": 0, "servingSize": "1 cup"}
            </script>"#)
        .unwrap();
        assert_eq!(out.record.calories, Some(NutrientValue::Number(240.0)));
        assert_eq!(out.record.protein, Some(NutrientValue::Number(14.0)));
        assert_eq!(out.record.sugar, Some(NutrientValue::Number(0.0)));
        assert_eq!(out.record.serving_size.as_deref(), Some("1 cup"));
        assert_eq!(out.provenance[&Field::Protein].value().name(), "script");
        assert!(out.record.calcium.is_none());
    }

    #[test]
    fn test_nested_in_recipe_graph() {
        let out = run(r#"<script type="application/ld+json">
            {"@context": "https://schema.org", "@graph": [
              {"@type": "WebPage", "name": "x"},
              {"@type": "Recipe", "nutrition":
                {"@type": ["NutritionInformation"], "fatContent": "9.5 g"}}
            ]}
            </script>"#)
        .unwrap();
        assert_eq!(out.record.fat, Some(NutrientValue::Number(9.5)));
    }

    #[test]
    fn test_malformed_block_skipped() {
        let out = run(r#"
            <script type="application/ld+json">{ not json</script>
            <script type="application/ld+json">
              [{"@type": "Product"}, {"@type": "NutritionInformation", "sodiumContent": "410 mg"}]
            </script>"#)
        .unwrap();
        assert_eq!(out.record.sodium, Some(NutrientValue::Number(410.0)));
    }

    #[test]
    fn test_no_nutrition_type() {
        assert!(run(r#"<script type="application/ld+json">{"@type": "Product"}</script>"#).is_none());
    }
}
