//! `nutriscan batch <file>`: extract every URL in a list, one page at a time.

use anyhow::{bail, Context, Result};
use nutriscan::BatchStatus;
use std::path::Path;
use std::sync::Arc;

use crate::batch::{read_url_file, BatchOrchestrator, BatchSummary};
use crate::config::RuntimeConfig;
use crate::renderer::chromium::ChromiumRenderer;

use super::{load_engine, open_store, print_json, Session};

pub async fn run(config: RuntimeConfig, file: &Path, known_only: bool) -> Result<()> {
    let urls = read_url_file(file)
        .with_context(|| format!("failed to read URL list {}", file.display()))?;
    if urls.is_empty() {
        bail!("{} contains no URLs", file.display());
    }

    let engine = load_engine(&config)?;
    let store = open_store(&config)?;
    let renderer = ChromiumRenderer::new()
        .await
        .context("`batch` needs Chromium")?;

    let locators = Arc::new(engine.config().clone());
    let session = Session::start(&config, Arc::new(renderer), engine, Some(store));
    let batch = BatchOrchestrator::new(Arc::clone(&session.coordinator), locators);

    let total = urls.len();
    let rows = batch
        .process_batch(&urls, known_only, |index, row| {
            let mark = match row.status {
                BatchStatus::Completed => "ok",
                _ => "FAILED",
            };
            eprintln!("  [{}/{total}] {mark:<6} {}", index + 1, row.url);
            if let Some(error) = &row.error {
                eprintln!("           {error}");
            }
        })
        .await;
    session.stop().await;

    let summary = BatchSummary::from_rows(&rows);
    eprintln!(
        "  {} of {} completed, {} failed",
        summary.completed, summary.total, summary.failed
    );
    print_json(&rows)
}
