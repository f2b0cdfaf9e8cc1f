//! vault-daemon: command-line access to a versioned markdown vault.
//!
//! `watch` keeps a document cache in line with disk and serves JSON-line requests
//! from stdin until stdin closes, Ctrl+C or SIGTERM.
//! The other subcommands run one document operation and print JSON to stdout.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::io::BufReader;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vault_core::{DocumentCache, DocumentService, HistoryPool, NativeDisk, WatchAdapter};

mod config;
mod session;

use config::Config;
use session::Request;

#[derive(Parser, Debug)]
#[command(name = "vault-daemon")]
#[command(about = "Markdown vault with per-document version history")]
struct Cli {
    /// Vault root directory (overrides VAULT_ROOT)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Owner whose documents are addressed
    #[arg(long, global = true, env = "VAULT_OWNER", default_value = "default")]
    owner: String,

    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Keep the document cache in sync with disk and serve JSON-line requests on stdin
    Watch,
    /// Write a document (content from --file or stdin)
    Write {
        path: String,
        /// Read content from this file instead of stdin
        #[arg(long)]
        file: Option<PathBuf>,
        /// Comment stored with the version record
        #[arg(short, long, default_value = "")]
        comment: String,
    },
    /// Print a document
    Read { path: String },
    /// Move a document to the recycle bin
    Delete { path: String },
    /// Rename a document and its attachments
    Rename { from: String, to: String },
    /// List the versions of a document, newest first
    History { path: String },
    /// Print a document as of one version
    Show { path: String, id: u64 },
    /// Search the owner's documents
    Search {
        query: String,
        /// Treat the query as a regular expression
        #[arg(long)]
        regex: bool,
    },
    /// List a directory (the owner directory when no path is given)
    List {
        #[arg(default_value = "")]
        path: String,
        /// Include the contents of subdirectories
        #[arg(short, long)]
        recursive: bool,
    },
    /// Create a directory
    Mkdir { path: String },
    /// Remove a directory and everything in it
    Rmdir { path: String },
    /// Move a directory
    Mvdir { from: String, to: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose). Logs go to
    // stderr so stdout stays machine-readable.
    let default_filter = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let config = Config::resolve(cli.root.clone())?;
    std::fs::create_dir_all(&config.root)
        .with_context(|| format!("Failed to create vault root {}", config.root.display()))?;
    info!("Vault root: {}", config.root.display());

    let cache = Arc::new(DocumentCache::new());
    let service = DocumentService::new(
        config.root.clone(),
        NativeDisk::new(),
        Arc::clone(&cache),
        Arc::new(HistoryPool::new(config.root.clone())),
    );
    let owner = cli.owner.as_str();

    let request = match cli.command {
        Command::Watch => {
            let adapter = WatchAdapter::start(config.root.clone(), Arc::clone(&cache)).await?;
            info!(
                "Watching {} directories, {} documents cached. Reading requests from stdin.",
                adapter.watched_dirs(),
                cache.len()
            );
            let input = BufReader::new(tokio::io::stdin());
            tokio::select! {
                result = session::serve(&service, owner, input, tokio::io::stdout()) => {
                    result?;
                    info!("Request stream closed, stopping watcher...");
                }
                _ = shutdown_signal() => {}
            }
            adapter.stop();
            return Ok(());
        }
        Command::Write {
            path,
            file,
            comment,
        } => {
            let content = match file {
                Some(file) => std::fs::read_to_string(&file)
                    .with_context(|| format!("Failed to read {}", file.display()))?,
                None => {
                    let mut content = String::new();
                    std::io::stdin()
                        .read_to_string(&mut content)
                        .context("Failed to read content from stdin")?;
                    content
                }
            };
            Request::Write {
                path,
                content,
                comment,
            }
        }
        Command::Read { path } => Request::Read { path },
        Command::Delete { path } => Request::Delete { path },
        Command::Rename { from, to } => Request::Rename { from, to },
        Command::History { path } => Request::History { path },
        Command::Show { path, id } => Request::Show { path, id },
        Command::Search { query, regex } => {
            // Populate the cache from disk, then search it.
            let adapter = WatchAdapter::start(config.root.clone(), Arc::clone(&cache)).await?;
            adapter.stop();
            Request::Search { query, regex }
        }
        Command::List { path, recursive } => Request::List { path, recursive },
        Command::Mkdir { path } => Request::CreateDir { path },
        Command::Rmdir { path } => Request::DeleteDir { path },
        Command::Mvdir { from, to } => Request::RenameDir { from, to },
    };

    let result = session::execute(&service, owner, request).await?;
    print_json(&result)?;
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM on Unix).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, stopping watcher...");
}
