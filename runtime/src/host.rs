//! The host browser platform as seen by the coordinator.
//!
//! [`PageHost`] is the narrow interface the coordinator and the batch
//! orchestrator drive: open and close pages, inject the agent, probe the
//! readiness marker and hand requests to a running agent. [`BrowserHost`]
//! implements it over a [`Renderer`], keeping one slot per page and
//! reporting navigation and close events to the coordinator inbox.

use async_trait::async_trait;
use nutriscan::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::agent::{self, AgentEnvelope, PageAgent};
use crate::config::RuntimeConfig;
use crate::coordinator::CoordinatorEvent;
use crate::error::{ScanError, ScanResult};
use crate::protocol::{AgentRequest, ReplyLatch, Responder};
use crate::renderer::{RenderContext, Renderer};
use crate::storage::SessionStore;

/// Upper bound on a single renderer navigation. Callers apply their own,
/// usually shorter, load timeout on top.
const NAVIGATION_TIMEOUT_MS: u64 = 30_000;

/// Queued requests per agent before `deliver` waits.
const AGENT_INBOX_CAPACITY: usize = 16;

/// Opaque identifier of a page instance, issued by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageHandle(pub u64);

impl fmt::Display for PageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page-{}", self.0)
    }
}

/// Operations of the host browser platform.
#[async_trait]
pub trait PageHost: Send + Sync {
    /// Open a page and start loading `url`. Returns before the load completes.
    async fn open(&self, url: &str) -> ScanResult<PageHandle>;
    /// Resolve once the page's load completes.
    async fn wait_loaded(&self, handle: PageHandle) -> ScanResult<()>;
    /// Load a new document in an existing page.
    async fn navigate(&self, handle: PageHandle, url: &str) -> ScanResult<()>;
    /// Current location of the page.
    async fn url(&self, handle: PageHandle) -> ScanResult<String>;
    /// Start the page agent. A no-op when one is already running.
    async fn inject(&self, handle: PageHandle) -> ScanResult<()>;
    /// Whether the readiness marker is present on the document.
    async fn probe_marker(&self, handle: PageHandle) -> ScanResult<bool>;
    /// Hand a request to the page's agent. The agent answers on `responder`.
    async fn deliver(
        &self,
        handle: PageHandle,
        request: AgentRequest,
        responder: Responder,
    ) -> ScanResult<()>;
    async fn close(&self, handle: PageHandle) -> ScanResult<()>;
    fn open_pages(&self) -> usize;
}

type LoadState = Option<Result<(), String>>;

struct AgentLink {
    inbox: mpsc::Sender<AgentEnvelope>,
    task: JoinHandle<()>,
}

impl AgentLink {
    fn is_running(&self) -> bool {
        !self.task.is_finished() && !self.inbox.is_closed()
    }
}

struct PageSlot {
    context: Arc<dyn RenderContext>,
    loaded: watch::Receiver<LoadState>,
    loader: JoinHandle<()>,
    agent: Option<AgentLink>,
}

impl PageSlot {
    fn stop_tasks(&mut self) {
        self.loader.abort();
        if let Some(agent) = self.agent.take() {
            agent.task.abort();
        }
    }
}

/// [`PageHost`] over a [`Renderer`], running one [`PageAgent`] task per
/// injected page.
pub struct BrowserHost {
    renderer: Arc<dyn Renderer>,
    engine: Arc<Engine>,
    store: Option<Arc<SessionStore>>,
    config: RuntimeConfig,
    events: mpsc::UnboundedSender<CoordinatorEvent>,
    pages: Mutex<HashMap<PageHandle, PageSlot>>,
    next_handle: AtomicU64,
}

impl BrowserHost {
    pub fn new(
        renderer: Arc<dyn Renderer>,
        engine: Arc<Engine>,
        store: Option<Arc<SessionStore>>,
        config: RuntimeConfig,
        events: mpsc::UnboundedSender<CoordinatorEvent>,
    ) -> Self {
        Self {
            renderer,
            engine,
            store,
            config,
            events,
            pages: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    fn pages(&self) -> std::sync::MutexGuard<'_, HashMap<PageHandle, PageSlot>> {
        self.pages.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn context(&self, handle: PageHandle) -> ScanResult<Arc<dyn RenderContext>> {
        self.pages()
            .get(&handle)
            .map(|slot| Arc::clone(&slot.context))
            .ok_or(ScanError::UnknownPage(handle.0))
    }

    fn notify(&self, event: CoordinatorEvent) {
        if self.events.send(event).is_err() {
            debug!("coordinator inbox closed");
        }
    }

    /// Close every open page.
    pub async fn shutdown(&self) {
        let handles: Vec<PageHandle> = self.pages().keys().copied().collect();
        for handle in handles {
            if let Err(e) = self.close(handle).await {
                warn!(%handle, "failed to close page: {e}");
            }
        }
    }
}

fn start_loading(context: Arc<dyn RenderContext>, url: String) -> (watch::Receiver<LoadState>, JoinHandle<()>) {
    let (tx, rx) = watch::channel(None);
    let task = tokio::spawn(async move {
        let outcome = context
            .navigate(&url, NAVIGATION_TIMEOUT_MS)
            .await
            .map(|nav| debug!(url = %nav.final_url, ms = nav.load_time_ms, "page loaded"))
            .map_err(|e| e.to_string());
        let _ = tx.send(Some(outcome));
    });
    (rx, task)
}

fn host_error(e: anyhow::Error) -> ScanError {
    ScanError::Host(format!("{e:#}"))
}

#[async_trait]
impl PageHost for BrowserHost {
    async fn open(&self, url: &str) -> ScanResult<PageHandle> {
        let context: Arc<dyn RenderContext> =
            Arc::from(self.renderer.new_context().await.map_err(host_error)?);
        let handle = PageHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let (loaded, loader) = start_loading(Arc::clone(&context), url.to_string());
        self.pages().insert(
            handle,
            PageSlot {
                context,
                loaded,
                loader,
                agent: None,
            },
        );
        info!(%handle, url, "page opened");
        Ok(handle)
    }

    async fn wait_loaded(&self, handle: PageHandle) -> ScanResult<()> {
        let mut loaded = self
            .pages()
            .get(&handle)
            .map(|slot| slot.loaded.clone())
            .ok_or(ScanError::UnknownPage(handle.0))?;
        let outcome: LoadState = loaded
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ScanError::ContextInvalidated)?
            .clone();
        match outcome {
            Some(Err(e)) => Err(ScanError::Host(e)),
            _ => Ok(()),
        }
    }

    async fn navigate(&self, handle: PageHandle, url: &str) -> ScanResult<()> {
        {
            let mut pages = self.pages();
            let slot = pages
                .get_mut(&handle)
                .ok_or(ScanError::UnknownPage(handle.0))?;
            // The old document and its agent are gone.
            slot.stop_tasks();
            let (loaded, loader) = start_loading(Arc::clone(&slot.context), url.to_string());
            slot.loaded = loaded;
            slot.loader = loader;
        }
        info!(%handle, url, "page navigating");
        self.notify(CoordinatorEvent::Navigated {
            handle,
            url: url.to_string(),
        });
        Ok(())
    }

    async fn url(&self, handle: PageHandle) -> ScanResult<String> {
        self.context(handle)?.get_url().await.map_err(host_error)
    }

    async fn inject(&self, handle: PageHandle) -> ScanResult<()> {
        let context = {
            let pages = self.pages();
            let slot = pages.get(&handle).ok_or(ScanError::UnknownPage(handle.0))?;
            if slot.agent.as_ref().is_some_and(AgentLink::is_running) {
                debug!(%handle, "agent already running, injection is a no-op");
                return Ok(());
            }
            Arc::clone(&slot.context)
        };

        let (inbox, requests) = mpsc::channel(AGENT_INBOX_CAPACITY);
        let agent = PageAgent::new(
            handle,
            context,
            Arc::clone(&self.engine),
            self.store.clone(),
            self.config.clone(),
            self.events.clone(),
        );
        let task = agent.spawn(requests);

        let mut pages = self.pages();
        match pages.get_mut(&handle) {
            Some(slot) => {
                slot.agent = Some(AgentLink { inbox, task });
                debug!(%handle, "agent injected");
                Ok(())
            }
            None => {
                task.abort();
                Err(ScanError::UnknownPage(handle.0))
            }
        }
    }

    async fn probe_marker(&self, handle: PageHandle) -> ScanResult<bool> {
        let value = self
            .context(handle)?
            .execute_js(agent::PROBE_MARKER_SCRIPT)
            .await
            .map_err(host_error)?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn deliver(
        &self,
        handle: PageHandle,
        request: AgentRequest,
        responder: Responder,
    ) -> ScanResult<()> {
        let inbox = {
            let pages = self.pages();
            let slot = pages.get(&handle).ok_or(ScanError::UnknownPage(handle.0))?;
            slot.agent
                .as_ref()
                .filter(|a| a.is_running())
                .map(|a| a.inbox.clone())
                .ok_or(ScanError::ContextInvalidated)?
        };
        inbox
            .send(AgentEnvelope {
                request,
                reply: ReplyLatch::new(responder),
            })
            .await
            .map_err(|_| ScanError::ContextInvalidated)
    }

    async fn close(&self, handle: PageHandle) -> ScanResult<()> {
        let mut slot = self
            .pages()
            .remove(&handle)
            .ok_or(ScanError::UnknownPage(handle.0))?;
        slot.stop_tasks();
        if let Err(e) = slot.context.close().await {
            warn!(%handle, "renderer close failed: {e}");
        }
        info!(%handle, "page closed");
        self.notify(CoordinatorEvent::Closed { handle });
        Ok(())
    }

    fn open_pages(&self) -> usize {
        self.pages().len()
    }
}

/// Whether an agent can run on a page at this URL. Browser-internal pages,
/// extension pages and anything other than http(s) cannot host one.
pub fn is_supported_url(url: &str) -> bool {
    match url::Url::parse(url) {
        Ok(parsed) => matches!(parsed.scheme(), "http" | "https"),
        Err(_) => false,
    }
}
