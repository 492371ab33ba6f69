//! chatrelay - Relay streamed chat completions to browser clients.
//!
//! Architecture:
//! - A client opens a long-lived receive channel keyed by a session id
//! - Submissions for that session stream their chunks into the channel
//! - An inline variant streams the chunks in the submit response instead
//! - The CLI is a thin client that talks to a running relay via HTTP

mod cli;
mod client;
mod codec;
mod config;
mod error;
mod models;
mod provider;
mod relay;
mod server;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{execute, Cli};

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "chatrelay=debug,tower_http=debug"
    } else {
        "chatrelay=info,tower_http=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    execute(cli).await
}
