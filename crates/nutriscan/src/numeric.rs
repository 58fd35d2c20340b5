//! Leading-number parsing for nutrition label text.
//!
//! Only the first number in a piece of text is used: `"14.5g protein"`
//! yields `14.5`. Text without any digit (`"-"`, `"n/a"`) yields nothing,
//! which is different from a literal `"0g"`.

use regex::Regex;
use std::sync::OnceLock;

use crate::types::NutrientValue;

/// Raw value tokens longer than this are treated as noise.
pub const MAX_RAW_VALUE_LEN: usize = 15;

fn value_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(\d+(?:\.\d+)?)\s*[a-z%]*").unwrap())
}

fn prefix_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:\d+\.?\d*|\.\d+)").unwrap())
}

/// Parse the first number in `text`, returning the value and the raw token
/// it came from (number plus any trailing unit).
pub fn parse_value_token(text: &str) -> Option<(f64, String)> {
    if text.trim().is_empty() {
        return None;
    }

    if let Some(caps) = value_regex().captures(text) {
        let token = caps.get(0).map(|m| m.as_str().trim()).unwrap_or_default();
        if let Some(value) = caps.get(1).and_then(|m| m.as_str().parse::<f64>().ok()) {
            return Some((value, token.to_string()));
        }
    }

    // Digits glued to letters ("B12") have no word boundary; fall back to
    // blanking everything that is not a digit or a dot.
    let cleaned: String = text
        .chars()
        .map(|c| if c.is_ascii_digit() || c == '.' { c } else { ' ' })
        .collect();
    let first = cleaned.split_whitespace().next()?;
    let prefix = prefix_regex().find(first)?.as_str();
    let value = prefix.parse::<f64>().ok()?;
    Some((value, first.to_string()))
}

/// Parse the first number in `text`, rejecting over-long raw tokens.
pub fn parse_leading_number(text: &str) -> Option<f64> {
    let (value, token) = parse_value_token(text)?;
    if token.chars().count() > MAX_RAW_VALUE_LEN {
        return None;
    }
    Some(value)
}

/// Whether a value should be shown as "found". Zero is a valid extracted
/// value but does not count as meaningfully present.
pub fn is_meaningful(value: &NutrientValue) -> bool {
    match value {
        NutrientValue::Number(n) => *n != 0.0,
        NutrientValue::Text(s) => !s.is_empty() && s.chars().count() <= MAX_RAW_VALUE_LEN,
    }
}

/// Collapse runs of whitespace and trim, the way rendered text reads.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_number_with_unit() {
        assert_eq!(parse_leading_number("14.5g protein"), Some(14.5));
        assert_eq!(parse_leading_number("Protein 3.2 g 6%"), Some(3.2));
    }

    #[test]
    fn test_dash_is_absent() {
        assert_eq!(parse_leading_number("-"), None);
        assert_eq!(parse_leading_number(""), None);
        assert_eq!(parse_leading_number("n/a"), None);
    }

    #[test]
    fn test_zero_is_present() {
        assert_eq!(parse_leading_number("0g"), Some(0.0));
        assert!(!is_meaningful(&NutrientValue::Number(0.0)));
    }

    #[test]
    fn test_glued_digits_fall_back() {
        // Kept as-is: the label's own digits are taken as the value.
        assert_eq!(parse_leading_number("Vitamin B12"), Some(12.0));
    }

    #[test]
    fn test_long_token_rejected() {
        assert_eq!(parse_leading_number("1234567890123456789"), None);
        assert!(parse_value_token("1234567890123456789").is_some());
    }

    #[test]
    fn test_meaningful_text() {
        assert!(is_meaningful(&NutrientValue::Text("trace".into())));
        assert!(!is_meaningful(&NutrientValue::Text(String::new())));
        assert!(!is_meaningful(&NutrientValue::Text(
            "a very long value that is noise".into()
        )));
    }

    #[test]
    fn test_normalize_whitespace() {
        assert_eq!(normalize_whitespace("  Total\n  Fat \t 3g "), "Total Fat 3g");
    }
}
