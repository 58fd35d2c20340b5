//! Messages exchanged with page agents and the coordinator socket.
//!
//! Socket requests are newline-delimited JSON objects carrying an optional
//! `id` and an `action` tag. Agent replies travel over a [`Responder`],
//! which can be completed once; [`ReplyLatch`] wraps one for code paths
//! where several tasks race to answer the same request.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use nutriscan::NutritionRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

use crate::coordinator::AgentSnapshot;
use crate::error::ScanError;
use crate::host::PageHandle;

/// Request handled by a page agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum AgentRequest {
    Ping,
    Extract,
    HighlightOnly,
    ExtractViaNamedSource {
        #[serde(rename = "sourceName")]
        source_name: String,
    },
    /// Last extracted record, extracting fresh when there is none.
    CopyLast,
}

impl AgentRequest {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Extract => "extract",
            Self::HighlightOnly => "highlightOnly",
            Self::ExtractViaNamedSource { .. } => "extractViaNamedSource",
            Self::CopyLast => "copyLast",
        }
    }
}

/// Page agent reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<NutritionRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Nodes highlighted on the page, for requests that highlight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highlighted: Option<usize>,
}

impl AgentResponse {
    pub fn pong() -> Self {
        Self {
            success: true,
            timestamp: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn record(record: NutritionRecord, highlighted: Option<usize>) -> Self {
        Self {
            success: true,
            data: Some(record),
            timestamp: Some(Utc::now()),
            highlighted,
            ..Self::default()
        }
    }

    pub fn failure(error: &ScanError) -> Self {
        Self {
            success: false,
            error: Some(error.describe()),
            timestamp: Some(Utc::now()),
            ..Self::default()
        }
    }
}

/// Request handled by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum CoordinatorRequest {
    EnsureInjected {
        handle: PageHandle,
        #[serde(default)]
        force: bool,
    },
    Relay {
        handle: PageHandle,
        #[serde(rename = "innerRequest")]
        inner_request: AgentRequest,
    },
    RegisterHeartbeat {
        handle: PageHandle,
    },
    OpenPage {
        url: String,
    },
    NavigatePage {
        handle: PageHandle,
        url: String,
    },
    ClosePage {
        handle: PageHandle,
    },
    Status,
}

/// Successful coordinator reply, serialized as the `result` of a frame.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum CoordinatorResponse {
    Injected { handle: PageHandle, confirmed: bool },
    Agent(AgentResponse),
    Heartbeat { handle: PageHandle, known: bool },
    Page { handle: PageHandle },
    Status(StatusResult),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResult {
    pub version: String,
    pub uptime_s: u64,
    pub open_pages: usize,
    pub agents: Vec<AgentSnapshot>,
}

/// A parsed socket request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Request {
    #[serde(default = "unknown_id")]
    pub id: String,
    #[serde(flatten)]
    pub body: CoordinatorRequest,
}

fn unknown_id() -> String {
    "unknown".to_string()
}

/// Parse one JSON request line.
pub fn parse_request(json: &str) -> Result<Request> {
    let value: Value = serde_json::from_str(json).context("invalid JSON")?;
    if value.get("action").and_then(Value::as_str).is_none() {
        anyhow::bail!("missing 'action' field");
    }
    serde_json::from_value(value).context("invalid request")
}

/// Format a successful response (newline-terminated).
pub fn format_response(id: &str, result: Value) -> String {
    let resp = serde_json::json!({
        "id": id,
        "result": result,
    });
    format!("{resp}\n")
}

/// Format an error response (newline-terminated).
pub fn format_error(id: &str, code: &str, message: &str) -> String {
    let resp = serde_json::json!({
        "id": id,
        "error": {
            "code": code,
            "message": message,
        },
    });
    format!("{resp}\n")
}

/// Format a runtime failure with its remedy.
pub fn format_scan_error(id: &str, error: &ScanError) -> String {
    let resp = serde_json::json!({
        "id": id,
        "error": {
            "code": error.code(),
            "message": error.to_string(),
            "remedy": error.remedy(),
        },
    });
    format!("{resp}\n")
}

/// Reply channel for one agent request. Consumed by the single reply.
#[derive(Debug)]
pub struct Responder(oneshot::Sender<AgentResponse>);

impl Responder {
    pub fn channel() -> (Self, oneshot::Receiver<AgentResponse>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    /// Send the reply. Returns false if the requester stopped waiting.
    pub fn respond(self, response: AgentResponse) -> bool {
        self.0.send(response).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// Shared handle to a [`Responder`]. The first `complete` wins; later
/// completions are dropped.
#[derive(Debug, Clone)]
pub struct ReplyLatch(Arc<Mutex<Option<Responder>>>);

impl ReplyLatch {
    pub fn new(responder: Responder) -> Self {
        Self(Arc::new(Mutex::new(Some(responder))))
    }

    /// Complete the request. Returns false when it was already completed.
    pub fn complete(&self, response: AgentResponse) -> bool {
        let taken = self.0.lock().unwrap_or_else(|p| p.into_inner()).take();
        match taken {
            Some(responder) => {
                if !responder.respond(response) {
                    tracing::debug!("requester gone before agent reply");
                }
                true
            }
            None => {
                tracing::debug!("dropping duplicate agent reply");
                false
            }
        }
    }

    pub fn is_completed(&self) -> bool {
        self.0.lock().unwrap_or_else(|p| p.into_inner()).is_none()
    }

    /// Still open, but the requester stopped waiting for the reply.
    pub fn is_abandoned(&self) -> bool {
        self.0
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(Responder::is_closed)
    }
}
