//! HTTP-only renderer: fetches the static HTML of a page with reqwest.
//!
//! No scripts run, so `execute_js` always yields `Null`. Good enough for
//! sites that ship their nutrition panel or JSON-LD in the initial HTML.

use super::{NavigationResult, RenderContext, Renderer};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
                          AppleWebKit/537.36 (KHTML, like Gecko) \
                          Chrome/131.0.0.0 Safari/537.36";

/// Renderer backed by plain HTTP GET requests.
pub struct HttpRenderer {
    client: reqwest::Client,
    active_count: Arc<AtomicUsize>,
}

impl HttpRenderer {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            active_count: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Renderer for HttpRenderer {
    async fn new_context(&self) -> Result<Box<dyn RenderContext>> {
        self.active_count.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(HttpContext {
            client: self.client.clone(),
            snapshot: Mutex::new(Snapshot::default()),
            active_count: Arc::clone(&self.active_count),
        }))
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    fn active_contexts(&self) -> usize {
        self.active_count.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
struct Snapshot {
    url: String,
    html: String,
    closed: bool,
}

/// The last fetched document.
pub struct HttpContext {
    client: reqwest::Client,
    snapshot: Mutex<Snapshot>,
    active_count: Arc<AtomicUsize>,
}

impl HttpContext {
    fn read<T>(&self, f: impl FnOnce(&Snapshot) -> T) -> Result<T> {
        let snapshot = self.snapshot.lock().unwrap_or_else(|p| p.into_inner());
        if snapshot.closed {
            bail!("page context is closed");
        }
        Ok(f(&snapshot))
    }
}

#[async_trait]
impl RenderContext for HttpContext {
    async fn navigate(&self, url: &str, timeout_ms: u64) -> Result<NavigationResult> {
        self.read(|_| ())?;
        let start = Instant::now();
        let response = self
            .client
            .get(url)
            .timeout(Duration::from_millis(timeout_ms))
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;
        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let html = response.text().await.context("failed to read response body")?;

        let mut snapshot = self.snapshot.lock().unwrap_or_else(|p| p.into_inner());
        snapshot.url = final_url.clone();
        snapshot.html = html;

        Ok(NavigationResult {
            final_url,
            status,
            load_time_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn execute_js(&self, _script: &str) -> Result<serde_json::Value> {
        self.read(|_| serde_json::Value::Null)
    }

    async fn get_html(&self) -> Result<String> {
        self.read(|s| s.html.clone())
    }

    async fn get_url(&self) -> Result<String> {
        self.read(|s| s.url.clone())
    }

    async fn title(&self) -> Result<String> {
        self.read(|s| document_title(&s.html))
    }

    async fn close(&self) -> Result<()> {
        let mut snapshot = self.snapshot.lock().unwrap_or_else(|p| p.into_inner());
        if !snapshot.closed {
            snapshot.closed = true;
            self.active_count.fetch_sub(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

/// Text of the first `<title>` element, trimmed.
pub fn document_title(html: &str) -> String {
    let document = scraper::Html::parse_document(html);
    let Ok(selector) = scraper::Selector::parse("title") else {
        return String::new();
    };
    document
        .select(&selector)
        .next()
        .map(|t| t.text().collect::<String>().trim().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_fetches_static_snapshot() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/oats"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<html><head><title> Rolled Oats </title></head><body><p>Protein 10g</p></body></html>",
            ))
            .mount(&server)
            .await;

        let renderer = HttpRenderer::new(Duration::from_secs(5));
        let ctx = renderer.new_context().await.unwrap();
        let url = format!("{}/oats", server.uri());
        let nav = ctx.navigate(&url, 5000).await.unwrap();

        assert_eq!(nav.status, 200);
        assert_eq!(ctx.get_url().await.unwrap(), url);
        assert_eq!(ctx.title().await.unwrap(), "Rolled Oats");
        assert!(ctx.get_html().await.unwrap().contains("Protein 10g"));
        assert!(ctx.execute_js("1 + 1").await.unwrap().is_null());

        ctx.close().await.unwrap();
        assert_eq!(renderer.active_contexts(), 0);
        assert!(ctx.get_html().await.is_err());
    }
}
