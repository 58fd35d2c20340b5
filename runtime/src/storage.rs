//! Persisted session state under the state directory (`~/.nutriscan`).
//!
//! - `preview.json`: the last successful extraction. A single slot,
//!   overwritten each time; readers must cope with it being absent.
//! - `logs.json`: the rolling extraction log, newest entry first, capped.
//!
//! Writes go to a temporary file that is renamed over the target.

use chrono::{DateTime, Utc};
use nutriscan::locators::host_of;
use nutriscan::{
    ExtractionReport, Field, FieldMethod, NutritionRecord, NutritionStats, ProvenanceSummary,
    StrategyKind, NUTRIENT_FIELD_COUNT,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{ScanError, ScanResult};

pub const PREVIEW_FILE: &str = "preview.json";
pub const LOG_FILE: &str = "logs.json";

/// The record shown in the popup preview.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewRecord {
    pub url: String,
    pub title: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub record: NutritionRecord,
    /// Where each value came from on the page.
    pub sources: ProvenanceSummary,
    pub strategy: Option<StrategyKind>,
    pub source: Option<String>,
    pub stats: NutritionStats,
}

impl PreviewRecord {
    pub fn new(url: impl Into<String>, report: ExtractionReport) -> Self {
        Self {
            url: url.into(),
            title: report.title,
            timestamp: Utc::now(),
            record: report.record,
            sources: report.sources,
            strategy: report.strategy,
            source: report.source,
            stats: report.stats,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Url,
    Locator,
    Extraction,
    Error,
    Info,
}

impl LogKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "url" => Some(Self::Url),
            "locator" => Some(Self::Locator),
            "extraction" => Some(Self::Extraction),
            "error" => Some(Self::Error),
            "info" => Some(Self::Info),
            _ => None,
        }
    }
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Url => "url",
            Self::Locator => "locator",
            Self::Extraction => "extraction",
            Self::Error => "error",
            Self::Info => "info",
        };
        f.pad(s)
    }
}

/// One line of the extraction log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: LogKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl LogEntry {
    pub fn new(kind: LogKind, message: impl Into<String>, data: Value) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            message: message.into(),
            data,
        }
    }

    pub fn url(url: &str) -> Self {
        Self::new(LogKind::Url, format!("[URL] {url}"), serde_json::json!({ "url": url }))
    }

    /// A field filled by a locator, a table or structured data, or by text search.
    pub fn field_found(field: Field, method: FieldMethod, value: &str) -> Self {
        let kind = match method {
            FieldMethod::TextSearch => LogKind::Extraction,
            _ => LogKind::Locator,
        };
        Self::new(
            kind,
            format!("[{method}] Extracted {} = {value}", field.label()),
            serde_json::json!({ "field": field, "method": method, "value": value }),
        )
    }

    pub fn field_missing(field: Field) -> Self {
        Self::new(
            LogKind::Error,
            format!("[Failed] No value found for: {}", field.label()),
            serde_json::json!({ "field": field }),
        )
    }

    pub fn summary(found: usize, total: usize, domain: &str) -> Self {
        Self::new(
            LogKind::Info,
            format!("[Summary] Extracted {found}/{total} fields from {domain}"),
            serde_json::json!({ "found": found, "total": total, "domain": domain }),
        )
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogKind::Error, message, Value::Null)
    }
}

/// Log lines for one extraction, in the order they happened.
pub fn extraction_entries(url: &str, report: &ExtractionReport) -> Vec<LogEntry> {
    let mut entries = vec![LogEntry::url(url)];
    let mut found = 0usize;
    for field in Field::ALL {
        let value = match field {
            Field::ServingSize => report.record.serving_size.clone(),
            _ => report.record.get(field).map(ToString::to_string),
        };
        match value {
            Some(value) => {
                if field.is_nutrient() {
                    found += 1;
                }
                let method = report
                    .methods
                    .get(&field)
                    .copied()
                    .unwrap_or(FieldMethod::TextSearch);
                entries.push(LogEntry::field_found(field, method, &value));
            }
            None if field.is_nutrient() => entries.push(LogEntry::field_missing(field)),
            None => {}
        }
    }
    let domain = host_of(url).unwrap_or_else(|| url.to_string());
    entries.push(LogEntry::summary(found, NUTRIENT_FIELD_COUNT, &domain));
    entries
}

/// Preview slot and extraction log on disk.
#[derive(Debug)]
pub struct SessionStore {
    dir: PathBuf,
    log_cap: usize,
    /// Serializes read-modify-write of the log file.
    lock: Mutex<()>,
}

impl SessionStore {
    pub fn open(dir: impl Into<PathBuf>, log_cap: usize) -> ScanResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| ScanError::Storage(format!("{}: {e}", dir.display())))?;
        Ok(Self {
            dir,
            log_cap: log_cap.max(1),
            lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn save_preview(&self, preview: &PreviewRecord) -> ScanResult<()> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        write_atomic(&self.dir.join(PREVIEW_FILE), &serde_json::to_vec_pretty(preview)?)
    }

    /// The last preview, or `None` if nothing was saved yet.
    pub fn load_preview(&self) -> ScanResult<Option<PreviewRecord>> {
        let path = self.dir.join(PREVIEW_FILE);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Add entries given in the order they happened. The log keeps the
    /// newest first and drops the oldest past the cap.
    pub fn append_logs(&self, entries: Vec<LogEntry>) -> ScanResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut log = self.read_log();
        let mut combined: Vec<LogEntry> = entries.into_iter().rev().collect();
        combined.append(&mut log);
        combined.truncate(self.log_cap);
        write_atomic(&self.dir.join(LOG_FILE), &serde_json::to_vec(&combined)?)
    }

    /// Newest-first log entries, optionally filtered by kind.
    pub fn logs(&self, kind: Option<LogKind>, limit: Option<usize>) -> ScanResult<Vec<LogEntry>> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        Ok(self
            .read_log()
            .into_iter()
            .filter(|e| kind.map_or(true, |k| e.kind == k))
            .take(limit.unwrap_or(usize::MAX))
            .collect())
    }

    pub fn clear_logs(&self) -> ScanResult<()> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        match std::fs::remove_file(self.dir.join(LOG_FILE)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Append the log lines describing one extraction.
    pub fn record_extraction(&self, url: &str, report: &ExtractionReport) -> ScanResult<()> {
        self.append_logs(extraction_entries(url, report))
    }

    /// A missing or unreadable log counts as empty.
    fn read_log(&self) -> Vec<LogEntry> {
        let path = self.dir.join(LOG_FILE);
        let Ok(bytes) = std::fs::read(&path) else {
            return Vec::new();
        };
        serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            tracing::warn!("discarding unreadable extraction log {}: {e}", path.display());
            Vec::new()
        })
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> ScanResult<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nutriscan::{Engine, NutrientValue};
    use scraper::Html;

    fn report() -> ExtractionReport {
        let html = Html::parse_document(
            "<html><body><p>Protein 14.5g</p><p>Sodium 0mg</p></body></html>",
        );
        Engine::builtin()
            .unwrap()
            .extract_page(&html, "https://www.example.com/bar")
            .into_report(Some("Bar".into()))
    }

    #[test]
    fn test_missing_preview_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path(), 10).unwrap();
        assert!(store.load_preview().unwrap().is_none());
    }

    #[test]
    fn test_preview_slot_is_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path(), 10).unwrap();
        store
            .save_preview(&PreviewRecord::new("https://a.example/1", report()))
            .unwrap();
        store
            .save_preview(&PreviewRecord::new("https://b.example/2", report()))
            .unwrap();
        let preview = store.load_preview().unwrap().unwrap();
        assert_eq!(preview.url, "https://b.example/2");
        assert_eq!(preview.title.as_deref(), Some("Bar"));
        assert_eq!(preview.record.protein, Some(NutrientValue::Number(14.5)));
        assert!(preview.sources.contains_key(&Field::Protein));
    }

    #[test]
    fn test_log_is_newest_first_and_capped() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path(), 3).unwrap();
        store
            .append_logs(vec![LogEntry::error("one"), LogEntry::error("two")])
            .unwrap();
        store
            .append_logs(vec![LogEntry::error("three"), LogEntry::error("four")])
            .unwrap();
        let messages: Vec<String> = store
            .logs(None, None)
            .unwrap()
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert_eq!(messages, vec!["four", "three", "two"]);
    }

    #[test]
    fn test_extraction_entries() {
        let entries = extraction_entries("https://www.example.com/bar", &report());
        let messages: Vec<&str> = entries.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages[0], "[URL] https://www.example.com/bar");
        assert!(messages.contains(&"[Text Search] Extracted Protein = 14.5"));
        assert!(messages.contains(&"[Text Search] Extracted Sodium = 0"));
        assert!(messages.contains(&"[Failed] No value found for: Fat"));
        assert_eq!(
            *messages.last().unwrap(),
            "[Summary] Extracted 2/12 fields from example.com"
        );
    }

    #[test]
    fn test_filter_by_kind_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path(), 1000).unwrap();
        store
            .record_extraction("https://www.example.com/bar", &report())
            .unwrap();
        let errors = store.logs(Some(LogKind::Error), Some(3)).unwrap();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().all(|e| e.kind == LogKind::Error));

        let json = std::fs::read_to_string(dir.path().join(LOG_FILE)).unwrap();
        assert!(json.contains(r#""type":"info""#));

        store.clear_logs().unwrap();
        assert!(store.logs(None, None).unwrap().is_empty());
        store.clear_logs().unwrap();
    }

    #[test]
    fn test_corrupt_log_counts_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(LOG_FILE), "{ nope").unwrap();
        let store = SessionStore::open(dir.path(), 10).unwrap();
        assert!(store.logs(None, None).unwrap().is_empty());
        store.append_logs(vec![LogEntry::error("fresh")]).unwrap();
        assert_eq!(store.logs(None, None).unwrap().len(), 1);
    }
}
