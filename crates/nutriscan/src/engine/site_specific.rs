//! Known-source extraction: row-oriented nutrition tables followed by the
//! source's locator rules.

use scraper::{ElementRef, Selector};

use super::StrategyOutput;
use crate::dom::{element_text, next_element_sibling};
use crate::locators::{SourceProfile, TableLayout};
use crate::numeric::parse_value_token;
use crate::types::{Field, FieldMethod, NutrientValue};

const ABSENT_MARKER: &str = "-";

/// Returns `None` only when neither the table nor any rule matched
/// anything, so the chain can fall through to the heuristic.
pub(super) fn extract<'a>(
    source: &SourceProfile,
    container: ElementRef<'a>,
) -> Option<StrategyOutput<'a>> {
    let mut output = StrategyOutput::default();
    let mut matched = false;

    if let Some(layout) = &source.table {
        matched |= read_table(layout, container, &mut output);
    }
    let hits = output.apply_rules(container, &source.rules);
    matched |= hits > 0;

    if !matched {
        return None;
    }
    tracing::debug!(
        source = %source.name,
        fields = output.record.populated_fields().len(),
        "site-specific extraction finished"
    );
    Some(output)
}

/// Read the table into `output`. Returns whether any row was present.
fn read_table<'a>(
    layout: &TableLayout,
    container: ElementRef<'a>,
    output: &mut StrategyOutput<'a>,
) -> bool {
    let (Ok(row_sel), Ok(cell_sel)) = (Selector::parse(&layout.row), Selector::parse(&layout.cell))
    else {
        return false;
    };
    let value_sel = match &layout.value {
        Some(s) => match Selector::parse(s) {
            Ok(sel) => Some(sel),
            Err(_) => return false,
        },
        None => None,
    };

    let rows: Vec<ElementRef<'a>> = container.select(&row_sel).collect();
    if rows.is_empty() {
        return false;
    }
    tracing::debug!(rows = rows.len(), "nutrition table rows found");

    if let Some(label) = &layout.serving_label {
        read_serving_size(&rows, label, &cell_sel, output);
    }

    let column = value_column(layout, &rows, &cell_sel);

    for row in &rows {
        let cells: Vec<ElementRef<'a>> = row.select(&cell_sel).collect();
        if cells.len() <= column {
            continue;
        }
        let Some(field) = layout.field_for_label(&element_text(&cells[0])) else {
            continue;
        };
        let value_el = match &value_sel {
            Some(sel) => match cells[column].select(sel).next() {
                Some(el) => el,
                None => continue,
            },
            None => cells[column],
        };
        let text = element_text(&value_el);
        if let Some(value) = table_value(&text) {
            output.fill(field, value, value_el, FieldMethod::Table);
        }
    }
    true
}

/// The serving size sits in the second cell of the row after the labelled one.
fn read_serving_size<'a>(
    rows: &[ElementRef<'a>],
    label: &str,
    cell_sel: &Selector,
    output: &mut StrategyOutput<'a>,
) {
    let Some(labelled) = rows.iter().find(|r| element_text(r).contains(label)) else {
        return;
    };
    let Some(next) = next_element_sibling(*labelled) else {
        return;
    };
    let Some(cell) = next.select(cell_sel).nth(1) else {
        return;
    };
    let text = element_text(&cell);
    if !text.is_empty() {
        output.fill(Field::ServingSize, NutrientValue::Text(text), cell, FieldMethod::Table);
    }
}

/// Index of the value column: the header cell containing the column
/// marker, else the layout default.
fn value_column(layout: &TableLayout, rows: &[ElementRef<'_>], cell_sel: &Selector) -> usize {
    rows.iter()
        .find(|r| element_text(r).contains(&layout.header_marker))
        .and_then(|header| {
            header
                .select(cell_sel)
                .position(|c| element_text(&c).contains(&layout.column_marker))
        })
        .unwrap_or(layout.default_column)
}

fn table_value(text: &str) -> Option<NutrientValue> {
    let text = text.trim();
    if text.is_empty() || text == ABSENT_MARKER {
        return None;
    }
    Some(match parse_value_token(text) {
        Some((n, _)) => NutrientValue::Number(n),
        None => NutrientValue::Text(text.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locators::LocatorConfig;
    use scraper::Html;

    fn woolworths_panel(header: &str, rows: &str) -> String {
        format!(
            r#"<div class="nutritional-info_component_nutritional-info-panel">
                 <ul class="nutrition-row"><li>Serving size</li></ul>
                 <ul class="nutrition-row"><li>Servings</li><li>30g</li></ul>
                 <ul class="nutrition-row">{header}</ul>
                 {rows}
               </div>"#
        )
    }

    fn row(label: &str, a: &str, b: &str) -> String {
        format!(
            r#"<ul class="nutrition-row"><li>{label}</li>
                 <li><span aria-hidden="true">{a}</span></li>
                 <li><span aria-hidden="true">{b}</span></li></ul>"#
        )
    }

    #[test]
    fn test_reads_per_100g_column() {
        let config = LocatorConfig::builtin().unwrap();
        let source = config.source_named("woolworths.com.au").unwrap();
        let doc = woolworths_panel(
            "<li></li><li>Quantity Per Serving</li><li>Quantity Per 100g</li>",
            &[
                row("Protein", "2.1g", "7.0g"),
                row("– Sugars", "1g", "-"),
                row("Sodium", "100mg", "trace"),
            ]
            .concat(),
        );
        let html = Html::parse_document(&doc);
        let out = extract(source, html.root_element()).unwrap();
        assert_eq!(out.record.protein, Some(NutrientValue::Number(7.0)));
        assert_eq!(out.record.sugar, None);
        assert_eq!(out.record.sodium, Some(NutrientValue::Text("trace".into())));
        assert_eq!(out.record.serving_size.as_deref(), Some("30g"));
        assert_eq!(out.provenance[&Field::Protein].value().name(), "span");
    }

    #[test]
    fn test_table_without_nutrient_rows_still_wins() {
        let config = LocatorConfig::builtin().unwrap();
        let source = config.source_named("woolworths.com.au").unwrap();
        let doc = woolworths_panel("<li>Quantity Per 100g</li>", "");
        let html = Html::parse_document(&doc);
        let out = extract(source, html.root_element()).unwrap();
        assert_eq!(out.record.populated_fields(), vec![Field::ServingSize]);
    }

    #[test]
    fn test_no_structure_returns_none() {
        let config = LocatorConfig::builtin().unwrap();
        let source = config.source_named("woolworths.com.au").unwrap();
        let html = Html::parse_document("<div><p>Protein 4g</p></div>");
        assert!(extract(source, html.root_element()).is_none());
    }

    #[test]
    fn test_table_value() {
        assert_eq!(table_value(" - "), None);
        assert_eq!(table_value("1,210kJ"), Some(NutrientValue::Number(1.0)));
        assert_eq!(table_value("<1g"), Some(NutrientValue::Number(1.0)));
    }
}
