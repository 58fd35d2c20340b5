//! CLI subcommand implementations for the nutriscan binary.

pub mod batch_cmd;
pub mod extract_cmd;
pub mod logs_cmd;
pub mod parse_cmd;
pub mod serve;
pub mod sources_cmd;

use anyhow::{Context, Result};
use nutriscan::Engine;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::coordinator::Coordinator;
use crate::host::{BrowserHost, PageHost};
use crate::renderer::Renderer;
use crate::storage::SessionStore;

/// Install the tracing subscriber. Logs go to stderr so stdout stays
/// machine-readable.
pub fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose { "nutriscan=debug" } else { "nutriscan=info" };
    // `nutriscan` also covers the `nutriscan_runtime` targets.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Environment configuration with CLI overrides applied.
pub fn load_config(locators: Option<PathBuf>) -> RuntimeConfig {
    let mut config = RuntimeConfig::from_env();
    if locators.is_some() {
        config.locators = locators;
    }
    config
}

pub fn load_engine(config: &RuntimeConfig) -> Result<Arc<Engine>> {
    let locators = config.load_locators().context("failed to load locator configuration")?;
    Ok(Arc::new(Engine::new(locators)))
}

pub fn open_store(config: &RuntimeConfig) -> Result<Arc<SessionStore>> {
    let store = SessionStore::open(&config.state_dir, config.log_cap)
        .with_context(|| format!("failed to open state directory {}", config.state_dir.display()))?;
    Ok(Arc::new(store))
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// A browser host with its coordinator and event loop, as used by the
/// commands that drive live pages.
pub struct Session {
    pub host: Arc<BrowserHost>,
    pub coordinator: Arc<Coordinator>,
    renderer: Arc<dyn Renderer>,
    shutdown: Arc<Notify>,
    events: JoinHandle<()>,
}

impl Session {
    pub fn start(
        config: &RuntimeConfig,
        renderer: Arc<dyn Renderer>,
        engine: Arc<Engine>,
        store: Option<Arc<SessionStore>>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let host = Arc::new(BrowserHost::new(
            Arc::clone(&renderer),
            engine,
            store,
            config.clone(),
            events_tx,
        ));
        let page_host: Arc<dyn PageHost> = host.clone();
        let coordinator = Arc::new(Coordinator::new(page_host, config.clone()));
        let shutdown = Arc::new(Notify::new());
        let events = coordinator.spawn_event_loop(events_rx, Arc::clone(&shutdown));
        info!("coordinator started");
        Self {
            host,
            coordinator,
            renderer,
            shutdown,
            events,
        }
    }

    /// Close every page, stop the event loop and shut the renderer down.
    pub async fn stop(self) {
        self.host.shutdown().await;
        self.shutdown.notify_one();
        let _ = self.events.await;
        if let Err(e) = self.renderer.shutdown().await {
            warn!("renderer shutdown failed: {e:#}");
        }
    }
}
