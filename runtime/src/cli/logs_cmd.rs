//! `nutriscan preview` and `nutriscan logs`: read the persisted session state.

use anyhow::{bail, Result};

use crate::config::RuntimeConfig;
use crate::storage::LogKind;

use super::{open_store, print_json};

pub fn run_preview(config: RuntimeConfig) -> Result<()> {
    let store = open_store(&config)?;
    match store.load_preview()? {
        Some(preview) => print_json(&preview),
        None => {
            eprintln!("  No extraction yet. Run `nutriscan extract <url>` first.");
            Ok(())
        }
    }
}

pub fn run_logs(
    config: RuntimeConfig,
    kind: Option<&str>,
    limit: Option<usize>,
    clear: bool,
    json: bool,
) -> Result<()> {
    let store = open_store(&config)?;
    if clear {
        store.clear_logs()?;
        eprintln!("  Extraction log cleared.");
        return Ok(());
    }

    let kind = match kind {
        Some(name) => match LogKind::parse(name) {
            Some(kind) => Some(kind),
            None => bail!("unknown log kind '{name}' (expected url, locator, extraction, error or info)"),
        },
        None => None,
    };

    let entries = store.logs(kind, limit)?;
    if json {
        return print_json(&entries);
    }
    if entries.is_empty() {
        eprintln!("  No log entries.");
    }
    for entry in entries {
        println!(
            "{} {:<10} {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.kind,
            entry.message
        );
    }
    Ok(())
}
