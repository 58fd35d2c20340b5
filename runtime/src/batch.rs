//! Sequential batch extraction over a list of URLs.
//!
//! Each URL gets its own page: open, wait for the load with a timeout, let
//! page scripts settle, request extraction (retrying an empty result), and
//! close the page whatever happened. One row's failure never stops the
//! batch.

use nutriscan::locators::host_of;
use nutriscan::{BatchRow, BatchStatus, LocatorConfig, NutritionRecord};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

use crate::config::RuntimeConfig;
use crate::coordinator::Coordinator;
use crate::error::{ScanError, ScanResult};
use crate::host::PageHandle;
use crate::protocol::{AgentRequest, AgentResponse};

/// Outcome counts for a finished batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
}

impl BatchSummary {
    pub fn from_rows(rows: &[BatchRow]) -> Self {
        let count = |status: BatchStatus| rows.iter().filter(|r| r.status == status).count();
        Self {
            total: rows.len(),
            completed: count(BatchStatus::Completed),
            failed: count(BatchStatus::Failed),
        }
    }
}

pub struct BatchOrchestrator {
    coordinator: Arc<Coordinator>,
    config: RuntimeConfig,
    locators: Arc<LocatorConfig>,
}

impl BatchOrchestrator {
    pub fn new(coordinator: Arc<Coordinator>, locators: Arc<LocatorConfig>) -> Self {
        let config = coordinator.config().clone();
        Self {
            coordinator,
            config,
            locators,
        }
    }

    /// Process every URL in order. `on_progress` is called with the row
    /// index after each row finishes, whatever its outcome.
    pub async fn process_batch<F>(
        &self,
        urls: &[String],
        restrict_to_known_sources: bool,
        mut on_progress: F,
    ) -> Vec<BatchRow>
    where
        F: FnMut(usize, &BatchRow),
    {
        let job = uuid::Uuid::new_v4();
        let span = tracing::info_span!("batch", %job, urls = urls.len());
        async {
            info!(restrict_to_known_sources, "batch started");
            let mut rows: Vec<BatchRow> = urls.iter().map(BatchRow::pending).collect();

            for (index, row) in rows.iter_mut().enumerate() {
                row.status = BatchStatus::Processing;
                if restrict_to_known_sources && !self.locators.is_known_source(&row.url) {
                    let host = host_of(&row.url).unwrap_or_else(|| row.url.clone());
                    row.fail(ScanError::UnknownSource(host).describe());
                } else {
                    match self.extract_url(&row.url).await {
                        Ok(record) => row.complete(record),
                        Err(message) => row.fail(message),
                    }
                }
                debug!(index, url = %row.url, status = ?row.status, "batch row finished");
                on_progress(index, row);
            }

            let summary = BatchSummary::from_rows(&rows);
            info!(completed = summary.completed, failed = summary.failed, "batch finished");
            rows
        }
        .instrument(span)
        .await
    }

    /// Open, extract and close one page. Errors come back as the message
    /// recorded on the row.
    async fn extract_url(&self, url: &str) -> Result<NutritionRecord, String> {
        let host = self.coordinator.host();
        let handle = host.open(url).await.map_err(|e| e.describe())?;

        let outcome = self.extract_open_page(handle, url).await;

        if let Err(e) = host.close(handle).await {
            warn!(%handle, "failed to close batch page: {e}");
        }
        self.coordinator.on_page_closed(handle);
        outcome
    }

    async fn extract_open_page(&self, handle: PageHandle, url: &str) -> Result<NutritionRecord, String> {
        self.wait_for_load(handle).await.map_err(|e| e.describe())?;
        tokio::time::sleep(self.config.settle_delay).await;

        let request = match self.locators.source_for_url(url) {
            Some(source) => AgentRequest::ExtractViaNamedSource {
                source_name: source.name.clone(),
            },
            None => AgentRequest::Extract,
        };

        let mut last_failure = ScanError::NoMatchFound.describe();
        for attempt in 0..=self.config.batch_retries {
            if attempt > 0 {
                debug!(%handle, attempt, "retrying extraction");
                tokio::time::sleep(self.config.batch_retry_delay).await;
            }
            last_failure = match self.coordinator.request(handle, request.clone()).await {
                Ok(AgentResponse {
                    success: true,
                    data: Some(record),
                    ..
                }) if !record.is_empty() => return Ok(record),
                Ok(AgentResponse { success: true, .. }) => ScanError::NoMatchFound.describe(),
                Ok(AgentResponse { error, .. }) => {
                    error.unwrap_or_else(|| ScanError::NoMatchFound.describe())
                }
                Err(e) if !e.is_retryable() => return Err(e.describe()),
                Err(e) => e.describe(),
            };
        }
        Err(last_failure)
    }

    async fn wait_for_load(&self, handle: PageHandle) -> ScanResult<()> {
        let limit = self.config.page_load_timeout;
        match tokio::time::timeout(limit, self.coordinator.host().wait_loaded(handle)).await {
            Ok(loaded) => loaded,
            Err(_) => Err(ScanError::PageLoadTimeout(limit)),
        }
    }
}

/// Read a URL list: one URL per line, blank lines and `#` comments skipped.
pub fn read_url_file(path: &Path) -> ScanResult<Vec<String>> {
    let text = std::fs::read_to_string(path)?;
    Ok(parse_url_list(&text))
}

fn parse_url_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}
