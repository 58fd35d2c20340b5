//! `nutriscan parse` and `nutriscan fetch`: extraction without a live
//! browser, from a saved HTML file or a plain HTTP fetch.

use anyhow::{Context, Result};
use nutriscan::ExtractionReport;
use std::path::Path;
use tracing::warn;

use crate::agent::extract_html;
use crate::config::RuntimeConfig;
use crate::renderer::http::{document_title, HttpRenderer};
use crate::renderer::Renderer;
use crate::storage::{PreviewRecord, SessionStore};

use super::{load_engine, open_store, print_json};

pub async fn run_parse(config: RuntimeConfig, file: &Path, url: Option<&str>) -> Result<()> {
    let html = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let engine = load_engine(&config)?;
    let url = url.unwrap_or_default();
    let title = Some(document_title(&html)).filter(|t| !t.is_empty());
    let report = extract_html(&engine, &html, url, None, title)?;
    print_json(&report)
}

pub async fn run_fetch(config: RuntimeConfig, url: &str) -> Result<()> {
    let engine = load_engine(&config)?;
    let renderer = HttpRenderer::new(config.page_load_timeout);
    let context = renderer.new_context().await?;
    let timeout_ms = config.page_load_timeout.as_millis() as u64;
    context.navigate(url, timeout_ms).await?;

    let html = context.get_html().await?;
    let final_url = context.get_url().await?;
    let title = context.title().await.ok().filter(|t| !t.is_empty());
    context.close().await?;

    let report = extract_html(&engine, &html, &final_url, None, title)?;

    match open_store(&config) {
        Ok(store) => remember(&store, &final_url, &report),
        Err(e) => warn!("extraction not saved: {e:#}"),
    }
    print_json(&report)
}

fn remember(store: &SessionStore, url: &str, report: &ExtractionReport) {
    if let Err(e) = store.record_extraction(url, report) {
        warn!("failed to append extraction log: {e}");
    }
    if report.strategy.is_some() {
        if let Err(e) = store.save_preview(&PreviewRecord::new(url, report.clone())) {
            warn!("failed to save preview: {e}");
        }
    }
}
