//! `nutriscan serve`: browser, coordinator and socket server.

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::renderer::chromium::ChromiumRenderer;
use crate::renderer::{NoopRenderer, Renderer};
use crate::server::Server;

use super::{load_engine, open_store, Session};

pub async fn run(config: RuntimeConfig) -> Result<()> {
    info!("starting nutriscan v{}", env!("CARGO_PKG_VERSION"));
    let engine = load_engine(&config)?;
    let store = open_store(&config)?;

    let renderer: Arc<dyn Renderer> = match ChromiumRenderer::new().await {
        Ok(renderer) => {
            info!("Chromium renderer initialized");
            Arc::new(renderer)
        }
        Err(e) => {
            warn!("Chromium not available: {e:#}");
            warn!("pages cannot be opened until a browser is installed");
            Arc::new(NoopRenderer)
        }
    };

    let session = Session::start(&config, renderer, engine, Some(store));
    let server = Server::new(&config.socket_path, Arc::clone(&session.coordinator));
    let shutdown = server.shutdown_handle();

    eprintln!(
        "  nutriscan v{} listening on {}",
        env!("CARGO_PKG_VERSION"),
        config.socket_path.display()
    );

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
            shutdown.notify_one();
        }
    });

    let served = server.start().await;
    session.stop().await;
    served
}
