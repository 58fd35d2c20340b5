//! Core data types for nutrition records, provenance summaries, and batch rows.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::numeric::is_meaningful;

/// Number of nutrient fields considered when computing completeness.
/// Serving size is free-form text and does not count.
pub const NUTRIENT_FIELD_COUNT: usize = 12;

/// A named field of a [`NutritionRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Calories,
    Protein,
    Fat,
    Carbs,
    Fiber,
    Sugar,
    AddedSugar,
    Cholesterol,
    Sodium,
    SaturatedFat,
    Calcium,
    Iron,
    ServingSize,
}

impl Field {
    /// Every field, in record order.
    pub const ALL: [Field; 13] = [
        Field::Calories,
        Field::Protein,
        Field::Fat,
        Field::Carbs,
        Field::Fiber,
        Field::Sugar,
        Field::AddedSugar,
        Field::Cholesterol,
        Field::Sodium,
        Field::SaturatedFat,
        Field::Calcium,
        Field::Iron,
        Field::ServingSize,
    ];

    /// The stable snake_case key used in JSON and locator configuration.
    pub fn as_str(self) -> &'static str {
        match self {
            Field::Calories => "calories",
            Field::Protein => "protein",
            Field::Fat => "fat",
            Field::Carbs => "carbs",
            Field::Fiber => "fiber",
            Field::Sugar => "sugar",
            Field::AddedSugar => "added_sugar",
            Field::Cholesterol => "cholesterol",
            Field::Sodium => "sodium",
            Field::SaturatedFat => "saturated_fat",
            Field::Calcium => "calcium",
            Field::Iron => "iron",
            Field::ServingSize => "serving_size",
        }
    }

    /// Human-readable label used for highlight badges and log messages.
    pub fn label(self) -> &'static str {
        match self {
            Field::Calories => "Calories",
            Field::Protein => "Protein",
            Field::Fat => "Fat",
            Field::Carbs => "Carbohydrates",
            Field::Fiber => "Fiber",
            Field::Sugar => "Sugar",
            Field::AddedSugar => "Added Sugar",
            Field::Cholesterol => "Cholesterol",
            Field::Sodium => "Sodium",
            Field::SaturatedFat => "Saturated Fat",
            Field::Calcium => "Calcium",
            Field::Iron => "Iron",
            Field::ServingSize => "Serving Size",
        }
    }

    /// Display unit for the field, empty for free-form fields.
    pub fn unit(self) -> &'static str {
        match self {
            Field::Calories => "kcal",
            Field::Protein
            | Field::Fat
            | Field::Carbs
            | Field::Fiber
            | Field::Sugar
            | Field::AddedSugar
            | Field::SaturatedFat => "g",
            Field::Cholesterol | Field::Sodium | Field::Calcium | Field::Iron => "mg",
            Field::ServingSize => "",
        }
    }

    pub fn is_nutrient(self) -> bool {
        self != Field::ServingSize
    }

    /// Parse a field key (`"saturated_fat"`, `"carbs"`, ...).
    pub fn from_key(key: &str) -> Option<Field> {
        Field::ALL.iter().copied().find(|f| f.as_str() == key)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single extracted nutrient value.
///
/// Most values are numeric; some site tables carry text such as `"trace"`
/// that is kept verbatim rather than dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NutrientValue {
    Number(f64),
    Text(String),
}

impl NutrientValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            NutrientValue::Number(n) => Some(*n),
            NutrientValue::Text(_) => None,
        }
    }
}

impl fmt::Display for NutrientValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NutrientValue::Number(n) => write!(f, "{n}"),
            NutrientValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for NutrientValue {
    fn from(n: f64) -> Self {
        NutrientValue::Number(n)
    }
}

/// Nutrition facts for one product or food. Every field is independently
/// nullable; a record with every field `None` is a valid empty result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NutritionRecord {
    pub calories: Option<NutrientValue>,
    pub protein: Option<NutrientValue>,
    pub fat: Option<NutrientValue>,
    pub carbs: Option<NutrientValue>,
    pub fiber: Option<NutrientValue>,
    pub sugar: Option<NutrientValue>,
    pub added_sugar: Option<NutrientValue>,
    pub cholesterol: Option<NutrientValue>,
    pub sodium: Option<NutrientValue>,
    pub saturated_fat: Option<NutrientValue>,
    pub calcium: Option<NutrientValue>,
    pub iron: Option<NutrientValue>,
    pub serving_size: Option<String>,
}

impl NutritionRecord {
    fn slot(&self, field: Field) -> Option<&Option<NutrientValue>> {
        Some(match field {
            Field::Calories => &self.calories,
            Field::Protein => &self.protein,
            Field::Fat => &self.fat,
            Field::Carbs => &self.carbs,
            Field::Fiber => &self.fiber,
            Field::Sugar => &self.sugar,
            Field::AddedSugar => &self.added_sugar,
            Field::Cholesterol => &self.cholesterol,
            Field::Sodium => &self.sodium,
            Field::SaturatedFat => &self.saturated_fat,
            Field::Calcium => &self.calcium,
            Field::Iron => &self.iron,
            Field::ServingSize => return None,
        })
    }

    fn slot_mut(&mut self, field: Field) -> Option<&mut Option<NutrientValue>> {
        Some(match field {
            Field::Calories => &mut self.calories,
            Field::Protein => &mut self.protein,
            Field::Fat => &mut self.fat,
            Field::Carbs => &mut self.carbs,
            Field::Fiber => &mut self.fiber,
            Field::Sugar => &mut self.sugar,
            Field::AddedSugar => &mut self.added_sugar,
            Field::Cholesterol => &mut self.cholesterol,
            Field::Sodium => &mut self.sodium,
            Field::SaturatedFat => &mut self.saturated_fat,
            Field::Calcium => &mut self.calcium,
            Field::Iron => &mut self.iron,
            Field::ServingSize => return None,
        })
    }

    /// Read a nutrient field. Serving size is text and goes through
    /// [`serving_size`](Self::serving_size) instead.
    pub fn get(&self, field: Field) -> Option<&NutrientValue> {
        self.slot(field).and_then(|v| v.as_ref())
    }

    /// Write a nutrient field. Writing a `Text` value to
    /// [`Field::ServingSize`] stores it as the serving size.
    pub fn set(&mut self, field: Field, value: NutrientValue) {
        match self.slot_mut(field) {
            Some(slot) => *slot = Some(value),
            None => self.serving_size = Some(value.to_string()),
        }
    }

    pub fn has(&self, field: Field) -> bool {
        match field {
            Field::ServingSize => self.serving_size.is_some(),
            _ => self.get(field).is_some(),
        }
    }

    /// Fields holding a value, in record order.
    pub fn populated_fields(&self) -> Vec<Field> {
        Field::ALL.iter().copied().filter(|f| self.has(*f)).collect()
    }

    /// True when no field holds a value.
    pub fn is_empty(&self) -> bool {
        Field::ALL.iter().all(|f| !self.has(*f))
    }

    /// Flatten the record into `field -> display string` pairs, skipping
    /// absent fields.
    pub fn to_flat_map(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for field in Field::ALL {
            if field == Field::ServingSize {
                if let Some(s) = &self.serving_size {
                    out.insert(field.as_str().to_string(), s.clone());
                }
            } else if let Some(v) = self.get(field) {
                out.insert(field.as_str().to_string(), v.to_string());
            }
        }
        out
    }

    /// Completeness statistics for display. Zero values and over-long text
    /// do not count as found.
    pub fn stats(&self, sources: Option<&ProvenanceSummary>) -> NutritionStats {
        let mut found_count = 0usize;
        let mut highlighted_count = 0usize;
        for field in Field::ALL.iter().copied().filter(|f| f.is_nutrient()) {
            let Some(value) = self.get(field) else { continue };
            if !is_meaningful(value) {
                continue;
            }
            found_count += 1;
            if sources.map(|s| s.contains_key(&field)).unwrap_or(false) {
                highlighted_count += 1;
            }
        }
        NutritionStats {
            completeness: found_count as f32 / NUTRIENT_FIELD_COUNT as f32 * 100.0,
            found_count,
            highlighted_count,
        }
    }
}

/// Completeness of a record as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NutritionStats {
    /// Percentage of nutrient fields with a meaningful value.
    pub completeness: f32,
    pub found_count: usize,
    pub highlighted_count: usize,
}

/// Which strategy in the chain produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    StructuredMetadata,
    SiteSpecific,
    GenericHeuristic,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StructuredMetadata => write!(f, "structured metadata"),
            Self::SiteSpecific => write!(f, "site-specific"),
            Self::GenericHeuristic => write!(f, "generic heuristic"),
        }
    }
}

/// How an individual field was found, for the extraction log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldMethod {
    StructuredMetadata,
    Table,
    Locator,
    TextSearch,
}

impl fmt::Display for FieldMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StructuredMetadata => write!(f, "Structured Data"),
            Self::Table => write!(f, "Table"),
            Self::Locator => write!(f, "Locator"),
            Self::TextSearch => write!(f, "Text Search"),
        }
    }
}

/// Detached description of the DOM node that produced a value. Safe to
/// send across threads and persist after the document is gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub tag_name: String,
    /// First 100 characters of the node's trimmed text.
    pub text_content: String,
    /// `nth-child` CSS path from the document root to the node.
    pub selector_path: String,
}

/// Serialized provenance: field to source node description.
pub type ProvenanceSummary = BTreeMap<Field, SourceInfo>;

/// Processing state of one batch row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// One input URL of a batch job and what became of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRow {
    pub url: String,
    pub status: BatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_data: Option<NutritionRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchRow {
    pub fn pending(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status: BatchStatus::Pending,
            extracted_data: None,
            error: None,
        }
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = BatchStatus::Failed;
        self.error = Some(error.into());
    }

    pub fn complete(&mut self, record: NutritionRecord) {
        self.status = BatchStatus::Completed;
        self.extracted_data = Some(record);
        self.error = None;
    }
}

/// Errors raised by the core library.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("Unknown source: {0}")]
    UnknownSource(String),

    #[error("Invalid selector {selector:?}: {reason}")]
    InvalidSelector { selector: String, reason: String },

    #[error("Invalid locator configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
