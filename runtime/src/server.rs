//! Unix domain socket server for the coordinator protocol.
//!
//! Handles connection lifecycle, inactivity timeouts, malformed JSON and
//! rate limiting. Each connection is served on its own task; requests on
//! one connection are answered in order.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::coordinator::{AgentStatus, Coordinator};
use crate::error::ScanResult;
use crate::protocol::{self, CoordinatorRequest, CoordinatorResponse, StatusResult};

/// Inactivity timeout per connection.
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(300);

/// Maximum request line size (1 MB).
const MAX_REQUEST_SIZE: usize = 1024 * 1024;

/// Maximum requests per second per connection.
const MAX_REQUESTS_PER_SEC: u32 = 100;

struct SharedState {
    started_at: Instant,
    coordinator: Arc<Coordinator>,
}

/// The coordinator socket server.
pub struct Server {
    socket_path: PathBuf,
    started_at: Instant,
    shutdown: Arc<Notify>,
    coordinator: Arc<Coordinator>,
}

impl Server {
    pub fn new(socket_path: &Path, coordinator: Arc<Coordinator>) -> Self {
        Self {
            socket_path: socket_path.to_path_buf(),
            started_at: Instant::now(),
            shutdown: Arc::new(Notify::new()),
            coordinator,
        }
    }

    /// Get the shutdown notifier (for external shutdown signaling).
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    /// Start accepting connections and serving requests.
    pub async fn start(&self) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .context("failed to remove stale socket file")?;
        }

        let listener =
            UnixListener::bind(&self.socket_path).context("failed to bind Unix socket")?;

        info!("nutriscan coordinator listening on {}", self.socket_path.display());

        let state = Arc::new(SharedState {
            started_at: self.started_at,
            coordinator: Arc::clone(&self.coordinator),
        });

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _addr)) => {
                            let st = Arc::clone(&state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, st).await {
                                    warn!("connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            error!("accept error: {e}");
                        }
                    }
                }
                _ = self.shutdown.notified() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        let _ = std::fs::remove_file(&self.socket_path);
        info!("server stopped");
        Ok(())
    }
}

/// Handle a single client connection with inactivity timeout and rate limiting.
async fn handle_connection(stream: tokio::net::UnixStream, state: Arc<SharedState>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    let mut rate_window_start = Instant::now();
    let mut rate_count: u32 = 0;

    loop {
        line.clear();

        let read_result =
            tokio::time::timeout(INACTIVITY_TIMEOUT, reader.read_line(&mut line)).await;

        let response = match read_result {
            Ok(Ok(0)) => break,
            Ok(Ok(_)) if line.len() > MAX_REQUEST_SIZE => protocol::format_error(
                "unknown",
                "E_MESSAGE_TOO_LARGE",
                &format!(
                    "Request exceeds maximum size of {}MB",
                    MAX_REQUEST_SIZE / (1024 * 1024)
                ),
            ),
            Ok(Ok(_)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                if rate_window_start.elapsed() >= Duration::from_secs(1) {
                    rate_window_start = Instant::now();
                    rate_count = 0;
                }
                rate_count += 1;
                if rate_count > MAX_REQUESTS_PER_SEC {
                    protocol::format_error(
                        "unknown",
                        "E_RATE_LIMITED",
                        &format!("Rate limit exceeded: max {MAX_REQUESTS_PER_SEC} requests/second"),
                    )
                } else {
                    match protocol::parse_request(trimmed) {
                        Ok(req) => handle_request(req, Arc::clone(&state)).await,
                        // Malformed input gets an error; the connection stays open.
                        Err(e) if e.to_string() == "invalid JSON" => protocol::format_error(
                            "unknown",
                            "E_INVALID_JSON",
                            &format!("Malformed JSON: {e:#}"),
                        ),
                        Err(e) => protocol::format_error("unknown", "E_INVALID_PARAMS", &format!("{e:#}")),
                    }
                }
            }
            Ok(Err(e)) => {
                warn!("read error: {e}");
                break;
            }
            Err(_) => {
                let resp = protocol::format_error(
                    "timeout",
                    "E_INACTIVITY_TIMEOUT",
                    "Connection closed due to inactivity",
                );
                writer.write_all(resp.as_bytes()).await.ok();
                writer.flush().await.ok();
                info!("closing inactive connection");
                break;
            }
        };

        if writer.write_all(response.as_bytes()).await.is_err() {
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }
    }

    Ok(())
}

/// Handle a parsed request and return a JSON response line.
async fn handle_request(req: protocol::Request, state: Arc<SharedState>) -> String {
    let id = req.id;
    debug!(%id, request = ?req.body, "coordinator request");
    match dispatch(req.body, &state).await {
        Ok(result) => {
            protocol::format_response(&id, serde_json::to_value(result).unwrap_or_default())
        }
        Err(e) => {
            warn!(%id, code = e.code(), "request failed: {e}");
            protocol::format_scan_error(&id, &e)
        }
    }
}

async fn dispatch(body: CoordinatorRequest, state: &SharedState) -> ScanResult<CoordinatorResponse> {
    let coordinator = &state.coordinator;
    let host = coordinator.host();
    Ok(match body {
        CoordinatorRequest::EnsureInjected { handle, force } => {
            coordinator.ensure_injected(handle, force).await?;
            CoordinatorResponse::Injected {
                handle,
                confirmed: coordinator.status(handle) == Some(AgentStatus::RegisteredConfirmed),
            }
        }
        CoordinatorRequest::Relay {
            handle,
            inner_request,
        } => CoordinatorResponse::Agent(coordinator.relay(handle, inner_request).await?),
        CoordinatorRequest::RegisterHeartbeat { handle } => CoordinatorResponse::Heartbeat {
            handle,
            known: coordinator.register_heartbeat(handle),
        },
        CoordinatorRequest::OpenPage { url } => CoordinatorResponse::Page {
            handle: host.open(&url).await?,
        },
        CoordinatorRequest::NavigatePage { handle, url } => {
            host.navigate(handle, &url).await?;
            CoordinatorResponse::Page { handle }
        }
        CoordinatorRequest::ClosePage { handle } => {
            host.close(handle).await?;
            coordinator.on_page_closed(handle);
            CoordinatorResponse::Page { handle }
        }
        CoordinatorRequest::Status => CoordinatorResponse::Status(StatusResult {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_s: state.started_at.elapsed().as_secs(),
            open_pages: host.open_pages(),
            agents: coordinator.snapshot(),
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::error::ScanError;
    use crate::host::{PageHandle, PageHost};
    use crate::protocol::{AgentRequest, AgentResponse, Responder};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixStream;

    /// Host whose pages all sit on one product URL with a live agent.
    #[derive(Default)]
    struct StaticHost {
        next: AtomicU64,
    }

    #[async_trait]
    impl PageHost for StaticHost {
        async fn open(&self, _url: &str) -> ScanResult<PageHandle> {
            Ok(PageHandle(self.next.fetch_add(1, Ordering::SeqCst) + 1))
        }
        async fn wait_loaded(&self, _handle: PageHandle) -> ScanResult<()> {
            Ok(())
        }
        async fn navigate(&self, _handle: PageHandle, _url: &str) -> ScanResult<()> {
            Ok(())
        }
        async fn url(&self, handle: PageHandle) -> ScanResult<String> {
            match handle.0 {
                0 => Err(ScanError::UnknownPage(0)),
                _ => Ok("https://shop.example.com/oats".into()),
            }
        }
        async fn inject(&self, _handle: PageHandle) -> ScanResult<()> {
            Ok(())
        }
        async fn probe_marker(&self, _handle: PageHandle) -> ScanResult<bool> {
            Ok(true)
        }
        async fn deliver(
            &self,
            _handle: PageHandle,
            _request: AgentRequest,
            responder: Responder,
        ) -> ScanResult<()> {
            responder.respond(AgentResponse::pong());
            Ok(())
        }
        async fn close(&self, _handle: PageHandle) -> ScanResult<()> {
            Ok(())
        }
        fn open_pages(&self) -> usize {
            self.next.load(Ordering::SeqCst) as usize
        }
    }

    struct Running {
        socket_path: PathBuf,
        shutdown: Arc<Notify>,
        task: tokio::task::JoinHandle<()>,
    }

    async fn start_server(name: &str) -> Running {
        let socket_path =
            PathBuf::from(format!("/tmp/nutriscan-test-{name}-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&socket_path);

        let coordinator = Arc::new(Coordinator::new(
            Arc::new(StaticHost::default()),
            RuntimeConfig::default(),
        ));
        let server = Server::new(&socket_path, coordinator);
        let shutdown = server.shutdown_handle();
        let task = tokio::spawn(async move {
            server.start().await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        Running {
            socket_path,
            shutdown,
            task,
        }
    }

    async fn stop(running: Running) {
        running.shutdown.notify_one();
        let _ = running.task.await;
        let _ = std::fs::remove_file(&running.socket_path);
    }

    struct Client {
        reader: BufReader<tokio::net::unix::OwnedReadHalf>,
        writer: tokio::net::unix::OwnedWriteHalf,
    }

    impl Client {
        async fn connect(path: &Path) -> Self {
            let stream = UnixStream::connect(path).await.expect("failed to connect");
            let (reader, writer) = stream.into_split();
            Self {
                reader: BufReader::new(reader),
                writer,
            }
        }

        async fn call(&mut self, line: &str) -> serde_json::Value {
            self.writer.write_all(format!("{line}\n").as_bytes()).await.unwrap();
            let mut buf = String::new();
            self.reader.read_line(&mut buf).await.unwrap();
            serde_json::from_str(&buf).unwrap()
        }
    }

    #[tokio::test]
    async fn test_status() {
        let running = start_server("status").await;
        let mut client = Client::connect(&running.socket_path).await;

        let response = client.call(r#"{"id":"s1","action":"status"}"#).await;
        assert_eq!(response["id"], "s1");
        assert!(response["result"]["version"].as_str().is_some());
        assert_eq!(response["result"]["agents"], serde_json::json!([]));

        drop(client);
        stop(running).await;
    }

    #[tokio::test]
    async fn test_malformed_json_keeps_connection() {
        let running = start_server("json").await;
        let mut client = Client::connect(&running.socket_path).await;

        let response = client.call("this is not json").await;
        assert_eq!(response["error"]["code"], "E_INVALID_JSON");

        let response = client.call(r#"{"id":"x","action":"teleport"}"#).await;
        assert_eq!(response["error"]["code"], "E_INVALID_PARAMS");

        let response = client.call(r#"{"id":"s2","action":"status"}"#).await;
        assert_eq!(response["id"], "s2");

        drop(client);
        stop(running).await;
    }

    #[tokio::test]
    async fn test_open_inject_relay() {
        let running = start_server("relay").await;
        let mut client = Client::connect(&running.socket_path).await;

        let opened = client
            .call(r#"{"id":"o1","action":"openPage","url":"https://shop.example.com/oats"}"#)
            .await;
        let handle = opened["result"]["handle"].as_u64().unwrap();

        let early = client
            .call(&format!(
                r#"{{"id":"r0","action":"relay","handle":{handle},"innerRequest":{{"action":"ping"}}}}"#
            ))
            .await;
        assert_eq!(early["error"]["code"], "E_AGENT_UNCONFIRMED");

        let injected = client
            .call(&format!(r#"{{"id":"i1","action":"ensureInjected","handle":{handle}}}"#))
            .await;
        assert_eq!(injected["result"]["confirmed"], true);

        let pong = client
            .call(&format!(
                r#"{{"id":"r1","action":"relay","handle":{handle},"innerRequest":{{"action":"ping"}}}}"#
            ))
            .await;
        assert_eq!(pong["id"], "r1");
        assert_eq!(pong["result"]["success"], true);
        assert!(pong["result"]["timestamp"].as_str().is_some());

        let beat = client
            .call(&format!(r#"{{"id":"h1","action":"registerHeartbeat","handle":{handle}}}"#))
            .await;
        assert_eq!(beat["result"]["known"], true);

        let status = client.call(r#"{"id":"s1","action":"status"}"#).await;
        assert_eq!(status["result"]["agents"][0]["status"], "registered_confirmed");

        drop(client);
        stop(running).await;
    }

    #[tokio::test]
    async fn test_unknown_page_reports_remedy() {
        let running = start_server("unknown").await;
        let mut client = Client::connect(&running.socket_path).await;

        let response = client
            .call(r#"{"id":"i0","action":"ensureInjected","handle":0}"#)
            .await;
        assert_eq!(response["error"]["code"], "E_UNKNOWN_PAGE");
        assert!(response["error"]["remedy"].as_str().is_some());

        drop(client);
        stop(running).await;
    }
}
