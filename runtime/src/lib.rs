// Copyright 2026 Nutriscan Contributors
// SPDX-License-Identifier: Apache-2.0

//! Nutriscan runtime: page agents, the coordinator that tracks and relays
//! to them, batch extraction and the socket protocol.
//!
//! The extraction engine itself lives in the `nutriscan` crate; this crate
//! runs it against live pages.

pub mod agent;
pub mod batch;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod host;
pub mod protocol;
pub mod renderer;
pub mod server;
pub mod storage;

pub use coordinator::{AgentStatus, Coordinator, CoordinatorEvent};
pub use error::{ScanError, ScanResult};
pub use host::{BrowserHost, PageHandle, PageHost};
