//! Runtime error taxonomy.
//!
//! Every failure that reaches a user carries a stable code and a suggested
//! remedy, so the CLI and the socket protocol never surface a raw platform
//! error on its own.

use std::time::Duration;

/// Errors raised while coordinating page agents and batch jobs.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ScanError {
    #[error("Could not inject the page agent: {0}")]
    InjectionFailed(String),

    #[error("Page agent did not confirm it is running after {attempts} probes")]
    AgentUnconfirmed { attempts: u32 },

    #[error("Page agent did not respond within {0:?}")]
    RelayTimeout(Duration),

    #[error("Page context was torn down mid-call")]
    ContextInvalidated,

    #[error("No nutrition data found on this page")]
    NoMatchFound,

    #[error("Page did not finish loading within {0:?}")]
    PageLoadTimeout(Duration),

    #[error("Unknown page handle: {0}")]
    UnknownPage(u64),

    #[error("Unsupported page: {0}")]
    UnsupportedScheme(String),

    #[error("Unknown source: {0}")]
    UnknownSource(String),

    #[error("Page agent reported an error: {0}")]
    Agent(String),

    #[error("Browser error: {0}")]
    Host(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl ScanError {
    /// Stable error code for the socket protocol.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InjectionFailed(_) => "E_INJECTION_FAILED",
            Self::AgentUnconfirmed { .. } => "E_AGENT_UNCONFIRMED",
            Self::RelayTimeout(_) => "E_RELAY_TIMEOUT",
            Self::ContextInvalidated => "E_CONTEXT_INVALIDATED",
            Self::NoMatchFound => "E_NO_MATCH",
            Self::PageLoadTimeout(_) => "E_PAGE_LOAD_TIMEOUT",
            Self::UnknownPage(_) => "E_UNKNOWN_PAGE",
            Self::UnsupportedScheme(_) => "E_UNSUPPORTED_PAGE",
            Self::UnknownSource(_) => "E_UNKNOWN_SOURCE",
            Self::Agent(_) => "E_AGENT",
            Self::Host(_) => "E_HOST",
            Self::Storage(_) => "E_STORAGE",
        }
    }

    /// Whether a caller may try the same operation again. A torn-down
    /// context, or a page that can never host an agent, is final.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::ContextInvalidated
                | Self::UnsupportedScheme(_)
                | Self::UnknownPage(_)
                | Self::UnknownSource(_)
                | Self::Storage(_)
        )
    }

    /// Suggested fix shown next to the message.
    pub fn remedy(&self) -> &'static str {
        match self {
            Self::InjectionFailed(_) | Self::AgentUnconfirmed { .. } | Self::ContextInvalidated => {
                "Reload the page and try again."
            }
            Self::RelayTimeout(_) => "The page may be busy. Wait for it to settle, then retry.",
            Self::NoMatchFound => {
                "This page is not recognized. Open the product's nutrition panel and retry."
            }
            Self::PageLoadTimeout(_) => "Check the URL and your connection, then retry the row.",
            Self::UnknownPage(_) => "The page was closed. Open it again.",
            Self::UnsupportedScheme(_) => "Open a regular http(s) product page.",
            Self::UnknownSource(_) => "Run `nutriscan sources` to list known sources.",
            Self::Agent(_) | Self::Host(_) => "Reload the page and try again.",
            Self::Storage(_) => "Check permissions on the state directory.",
        }
    }

    /// Message and remedy on one line, for user-facing output.
    pub fn describe(&self) -> String {
        format!("{self}. {}", self.remedy())
    }
}

impl From<std::io::Error> for ScanError {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for ScanError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<nutriscan::EngineError> for ScanError {
    fn from(e: nutriscan::EngineError) -> Self {
        match e {
            nutriscan::EngineError::UnknownSource(name) => Self::UnknownSource(name),
            other => Self::Agent(other.to_string()),
        }
    }
}

pub type ScanResult<T> = Result<T, ScanError>;
