//! `nutriscan extract <url>`: extract one live page in headless Chromium.

use anyhow::{bail, Context, Result};
use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::error::ScanError;
use crate::host::PageHost;
use crate::protocol::AgentRequest;
use crate::renderer::chromium::ChromiumRenderer;

use super::{load_engine, open_store, print_json, Session};

pub async fn run(config: RuntimeConfig, url: &str) -> Result<()> {
    let engine = load_engine(&config)?;
    let store = open_store(&config)?;
    let renderer = ChromiumRenderer::new()
        .await
        .context("`extract` needs Chromium; try `nutriscan fetch` for static pages")?;

    let session = Session::start(&config, Arc::new(renderer), engine, Some(store));
    let outcome = extract_page(&session, &config, url).await;
    session.stop().await;

    let response = outcome.map_err(|e| anyhow::anyhow!(e.describe()))?;
    if !response.success {
        bail!(response.error.unwrap_or_else(|| ScanError::NoMatchFound.describe()));
    }
    print_json(&response)
}

async fn extract_page(
    session: &Session,
    config: &RuntimeConfig,
    url: &str,
) -> Result<crate::protocol::AgentResponse, ScanError> {
    let handle = session.host.open(url).await?;
    let limit = config.page_load_timeout;
    let loaded = match tokio::time::timeout(limit, session.host.wait_loaded(handle)).await {
        Ok(loaded) => loaded,
        Err(_) => Err(ScanError::PageLoadTimeout(limit)),
    };
    let outcome = match loaded {
        Ok(()) => {
            tokio::time::sleep(config.settle_delay).await;
            session.coordinator.request(handle, AgentRequest::Extract).await
        }
        Err(e) => Err(e),
    };
    if let Err(e) = session.host.close(handle).await {
        tracing::warn!(%handle, "failed to close page: {e}");
    }
    outcome
}
