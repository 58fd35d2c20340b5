// Copyright 2026 Nutriscan Contributors
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

use nutriscan_runtime::cli;

#[derive(Parser)]
#[command(
    name = "nutriscan",
    about = "Nutriscan: nutrition facts extraction from product and recipe pages",
    version,
    after_help = "Run 'nutriscan <command> --help' for details on each command."
)]
struct Cli {
    /// Enable verbose/debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,

    /// Locator configuration file replacing the built-in one
    #[arg(long, global = true, value_name = "PATH")]
    locators: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the browser, coordinator and socket server
    Serve,
    /// Extract nutrition facts from a live page in headless Chromium
    Extract {
        /// Page URL
        url: String,
    },
    /// Extract every URL listed in a file, one page at a time
    Batch {
        /// File with one URL per line ('#' starts a comment)
        file: PathBuf,
        /// Fail URLs that are not from a known source without opening them
        #[arg(long)]
        known_only: bool,
    },
    /// Extract from a saved HTML file
    Parse {
        /// HTML file
        file: PathBuf,
        /// URL the page was saved from, used to pick a known source
        #[arg(long)]
        url: Option<String>,
    },
    /// Extract from the static HTML of a page, without a browser
    Fetch {
        /// Page URL
        url: String,
    },
    /// Show the last saved extraction
    Preview,
    /// Show or clear the extraction log
    Logs {
        /// Only entries of this kind (url, locator, extraction, error, info)
        #[arg(long)]
        kind: Option<String>,
        /// Maximum number of entries, newest first
        #[arg(long)]
        limit: Option<usize>,
        /// Delete the log
        #[arg(long)]
        clear: bool,
        /// Print entries as JSON
        #[arg(long)]
        json: bool,
    },
    /// List known sources
    Sources,
    /// Generate shell completion scripts
    Completions {
        /// Shell type (bash, zsh, fish, powershell)
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    cli::init_tracing(cli.verbose, cli.log_json);
    let config = cli::load_config(cli.locators);

    let result = match cli.command {
        Commands::Serve => cli::serve::run(config).await,
        Commands::Extract { url } => cli::extract_cmd::run(config, &url).await,
        Commands::Batch { file, known_only } => cli::batch_cmd::run(config, &file, known_only).await,
        Commands::Parse { file, url } => cli::parse_cmd::run_parse(config, &file, url.as_deref()).await,
        Commands::Fetch { url } => cli::parse_cmd::run_fetch(config, &url).await,
        Commands::Preview => cli::logs_cmd::run_preview(config),
        Commands::Logs {
            kind,
            limit,
            clear,
            json,
        } => cli::logs_cmd::run_logs(config, kind.as_deref(), limit, clear, json),
        Commands::Sources => cli::sources_cmd::run(config),
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "nutriscan", &mut std::io::stdout());
            Ok(())
        }
    };

    // Consistent exit codes: 0=success, 1=error
    if let Err(e) = &result {
        eprintln!("  Error: {e:#}");
        std::process::exit(1);
    }

    result
}
