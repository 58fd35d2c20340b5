//! The page agent: one task per injected page.
//!
//! On start the agent sets the readiness marker on the document root and
//! installs a mutation observer that puts it back if page scripts remove
//! it. It then registers with the coordinator (retried until acknowledged
//! or out of attempts), sends a heartbeat on a fixed interval, and serves
//! requests one at a time.
//!
//! Extraction parses a snapshot of the live DOM on a blocking thread, since
//! the parsed document cannot cross threads. Every request is answered
//! exactly once.

use nutriscan::{Engine, ExtractionReport, HighlightPlan};
use scraper::Html;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::coordinator::CoordinatorEvent;
use crate::error::{ScanError, ScanResult};
use crate::host::PageHandle;
use crate::protocol::{AgentRequest, AgentResponse, ReplyLatch};
use crate::renderer::RenderContext;
use crate::storage::{extraction_entries, PreviewRecord, SessionStore};

/// Attribute on `<html>` that marks a page as hosting a live agent.
pub const MARKER_ATTRIBUTE: &str = "data-nutrition-crawl-loaded";

/// Sets the readiness marker and keeps it in place.
pub const INSTALL_MARKER_SCRIPT: &str = r#"(() => {
  const root = document.documentElement;
  const name = 'data-nutrition-crawl-loaded';
  root.setAttribute(name, 'true');
  if (!window.__nutriscanMarkerObserver) {
    const observer = new MutationObserver(() => {
      if (root.getAttribute(name) !== 'true') root.setAttribute(name, 'true');
    });
    observer.observe(root, { attributes: true, attributeFilter: [name] });
    window.__nutriscanMarkerObserver = observer;
  }
  return true;
})()"#;

/// Evaluates to `true` when the readiness marker is present.
pub const PROBE_MARKER_SCRIPT: &str =
    "document.documentElement.getAttribute('data-nutrition-crawl-loaded') === 'true'";

/// A request queued for an agent, with its reply slot.
#[derive(Debug)]
pub struct AgentEnvelope {
    pub request: AgentRequest,
    pub reply: ReplyLatch,
}

pub struct PageAgent {
    handle: PageHandle,
    context: Arc<dyn RenderContext>,
    engine: Arc<Engine>,
    store: Option<Arc<SessionStore>>,
    config: RuntimeConfig,
    events: mpsc::UnboundedSender<CoordinatorEvent>,
    /// Last extraction on this page, served by `copyLast`.
    last: Option<ExtractionReport>,
}

impl PageAgent {
    pub fn new(
        handle: PageHandle,
        context: Arc<dyn RenderContext>,
        engine: Arc<Engine>,
        store: Option<Arc<SessionStore>>,
        config: RuntimeConfig,
        events: mpsc::UnboundedSender<CoordinatorEvent>,
    ) -> Self {
        Self {
            handle,
            context,
            engine,
            store,
            config,
            events,
            last: None,
        }
    }

    pub fn spawn(self, inbox: mpsc::Receiver<AgentEnvelope>) -> JoinHandle<()> {
        tokio::spawn(self.run(inbox))
    }

    async fn run(mut self, mut inbox: mpsc::Receiver<AgentEnvelope>) {
        let handle = self.handle;
        if let Err(e) = self.context.execute_js(INSTALL_MARKER_SCRIPT).await {
            warn!(%handle, "could not set readiness marker: {e:#}");
        }
        let url = self.context.get_url().await.unwrap_or_default();

        let registration = register(
            self.events.clone(),
            handle,
            url,
            self.config.clone(),
        );
        tokio::pin!(registration);
        let mut registering = true;

        let every = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + every, every);

        loop {
            tokio::select! {
                registered = &mut registration, if registering => {
                    registering = false;
                    if !registered {
                        warn!(%handle, "agent registration was never acknowledged");
                    }
                }
                _ = heartbeat.tick() => {
                    if self.events.send(CoordinatorEvent::Heartbeat { handle }).is_err() {
                        debug!(%handle, "coordinator gone, agent stopping");
                        break;
                    }
                }
                envelope = inbox.recv() => match envelope {
                    Some(envelope) => self.dispatch(envelope).await,
                    None => break,
                },
            }
        }
        debug!(%handle, "agent stopped");
    }

    async fn dispatch(&mut self, envelope: AgentEnvelope) {
        let AgentEnvelope { request, reply } = envelope;
        if reply.is_abandoned() {
            debug!(handle = %self.handle, action = request.name(), "requester gone, skipping request");
            return;
        }
        debug!(handle = %self.handle, action = request.name(), "agent request");
        match request {
            AgentRequest::Ping => {
                reply.complete(AgentResponse::pong());
            }
            AgentRequest::Extract => self.handle_extract(reply).await,
            AgentRequest::HighlightOnly => {
                let response = match self.run_extraction(None, true).await {
                    Ok((report, highlighted)) => self.remember(report, highlighted),
                    Err(e) => AgentResponse::failure(&e),
                };
                reply.complete(response);
            }
            AgentRequest::ExtractViaNamedSource { source_name } => {
                let response = match self.run_extraction(Some(source_name), false).await {
                    Ok((report, _)) => {
                        self.log_in_background(&report).await;
                        self.remember(report, None)
                    }
                    Err(e) => AgentResponse::failure(&e),
                };
                reply.complete(response);
            }
            AgentRequest::CopyLast => {
                let response = match &self.last {
                    Some(report) => response_for(report, None),
                    None => match self.run_extraction(None, false).await {
                        Ok((report, _)) => self.remember(report, None),
                        Err(e) => AgentResponse::failure(&e),
                    },
                };
                reply.complete(response);
            }
        }
    }

    /// Extract with highlighting, then persist the preview and log. The
    /// reply goes out when persisting finishes or its timeout expires,
    /// whichever comes first.
    async fn handle_extract(&mut self, reply: ReplyLatch) {
        let (report, highlighted) = match self.run_extraction(None, true).await {
            Ok(out) => out,
            Err(e) => {
                reply.complete(AgentResponse::failure(&e));
                return;
            }
        };
        let response = response_for(&report, highlighted);
        self.last = Some(report.clone());

        let Some(store) = self.store.clone() else {
            reply.complete(response);
            return;
        };
        let url = self.context.get_url().await.unwrap_or_default();

        let writer = {
            let reply = reply.clone();
            let response = response.clone();
            tokio::spawn(async move {
                let saved = tokio::task::spawn_blocking(move || persist(&store, url, report)).await;
                match saved {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("failed to persist extraction: {e}"),
                    Err(e) => warn!("persist task failed: {e}"),
                }
                reply.complete(response);
            })
        };

        if tokio::time::timeout(self.config.persist_timeout, writer).await.is_err() {
            warn!(handle = %self.handle, "preview write still pending, replying without it");
        }
        if !reply.is_completed() {
            reply.complete(response);
        }
    }

    async fn log_in_background(&self, report: &ExtractionReport) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let url = self.context.get_url().await.unwrap_or_default();
        let entries = extraction_entries(&url, report);
        tokio::task::spawn_blocking(move || {
            if let Err(e) = store.append_logs(entries) {
                warn!("failed to append extraction log: {e}");
            }
        });
    }

    fn remember(&mut self, report: ExtractionReport, highlighted: Option<usize>) -> AgentResponse {
        let response = response_for(&report, highlighted);
        self.last = Some(report);
        response
    }

    async fn run_extraction(
        &self,
        source: Option<String>,
        highlight: bool,
    ) -> ScanResult<(ExtractionReport, Option<usize>)> {
        let html = self.context.get_html().await.map_err(page_error)?;
        let url = self.context.get_url().await.map_err(page_error)?;
        let title = self
            .context
            .title()
            .await
            .ok()
            .filter(|t| !t.trim().is_empty());

        let engine = Arc::clone(&self.engine);
        let report = tokio::task::spawn_blocking(move || {
            extract_html(&engine, &html, &url, source.as_deref(), title)
        })
        .await
        .map_err(|e| ScanError::Agent(format!("extraction task failed: {e}")))??;

        info!(
            handle = %self.handle,
            strategy = ?report.strategy,
            fields = report.record.populated_fields().len(),
            "extraction finished"
        );

        let highlighted = if highlight {
            Some(self.highlight(&report).await)
        } else {
            None
        };
        Ok((report, highlighted))
    }

    /// Mark every node that produced a value. Returns how many were marked.
    async fn highlight(&self, report: &ExtractionReport) -> usize {
        let plan = HighlightPlan::from_summary(&report.sources, self.config.label_duration);
        if plan.is_empty() {
            return 0;
        }
        match self.context.execute_js(&plan.render_script()).await {
            Ok(count) => count.as_u64().unwrap_or(0) as usize,
            Err(e) => {
                warn!(handle = %self.handle, "highlight script failed: {e:#}");
                0
            }
        }
    }
}

/// Announce the agent until the coordinator acknowledges it. Returns
/// whether it did.
async fn register(
    events: mpsc::UnboundedSender<CoordinatorEvent>,
    handle: PageHandle,
    url: String,
    config: RuntimeConfig,
) -> bool {
    for attempt in 0..=config.register_retries {
        if attempt > 0 {
            tokio::time::sleep(config.register_retry_delay).await;
        }
        let (ack, acked) = oneshot::channel();
        let event = CoordinatorEvent::Register {
            handle,
            url: url.clone(),
            ack,
        };
        if events.send(event).is_err() {
            warn!(%handle, attempt, "coordinator inbox closed, registration failed");
            continue;
        }
        match tokio::time::timeout(config.register_timeout, acked).await {
            Ok(Ok(())) => {
                debug!(%handle, "agent registered");
                return true;
            }
            _ => warn!(%handle, attempt, "registration not acknowledged"),
        }
    }
    false
}

fn persist(store: &SessionStore, url: String, report: ExtractionReport) -> ScanResult<()> {
    store.record_extraction(&url, &report)?;
    if report.strategy.is_some() {
        store.save_preview(&PreviewRecord::new(url, report))?;
    }
    Ok(())
}

fn page_error(e: anyhow::Error) -> ScanError {
    ScanError::Host(format!("{e:#}"))
}

/// Reply for a finished extraction. A page where no strategy applied is
/// reported as unrecognized.
fn response_for(report: &ExtractionReport, highlighted: Option<usize>) -> AgentResponse {
    if report.strategy.is_none() {
        return AgentResponse::failure(&ScanError::NoMatchFound);
    }
    AgentResponse::record(report.record.clone(), highlighted)
}

/// Run the engine over an HTML snapshot. With `source` set, that known
/// source's layout is used regardless of the URL.
pub fn extract_html(
    engine: &Engine,
    html: &str,
    url: &str,
    source: Option<&str>,
    title: Option<String>,
) -> ScanResult<ExtractionReport> {
    let document = Html::parse_document(html);
    let extraction = match source {
        Some(name) => engine.extract_with_source(&document, name)?,
        None => engine.extract_page(&document, url),
    };
    Ok(extraction.into_report(title))
}
