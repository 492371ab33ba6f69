//! CLI command execution.
//!
//! `serve` runs the relay in-process; the other commands are thin clients
//! that talk to a running relay over HTTP.

use std::io::Write;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::debug;
use uuid::Uuid;

use crate::client::{read_exchange, RelayClient, Transcript};
use crate::config::RelayConfig;
use crate::models::{ChatMessage, ChatRequest};
use crate::server;

use super::args::{Cli, Commands, ServeArgs};

impl From<ServeArgs> for RelayConfig {
    fn from(args: ServeArgs) -> Self {
        Self::default()
            .with_addr(args.host, args.port)
            .with_heartbeat_interval(Duration::from_secs(args.heartbeat_secs))
            .with_sink_capacity(args.sink_capacity)
            .with_provider(args.provider)
            .with_api_key(args.api_key)
            .with_api_base(args.api_base)
            .with_default_model(args.default_model)
    }
}

pub async fn execute(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Serve(args) => server::start_server(args.into()).await,
        Commands::Chat {
            target,
            session,
            model,
            inline,
            no_stream,
            message,
        } => {
            let message = message.join(" ");
            if message.trim().is_empty() {
                bail!("Message is required for chat command");
            }
            let client = RelayClient::new(target.server);
            let mut request = ChatRequest::new(vec![ChatMessage::user(message)]);
            if let Some(model) = model {
                request = request.with_model(model);
            }
            if inline {
                chat_inline(&client, &request).await
            } else if no_stream {
                chat_whole(&client, &request).await
            } else {
                let session = session.unwrap_or_else(|| format!("cli-{}", Uuid::now_v7()));
                chat_session(&client, request.with_session(session)).await
            }
        }
        Commands::Status { target } => show_status(&RelayClient::new(target.server)).await,
        Commands::Sessions { target } => list_sessions(&RelayClient::new(target.server)).await,
        Commands::Models { target } => list_models(&RelayClient::new(target.server)).await,
    }
}

fn print_piece(text: &str) {
    print!("{text}");
    let _ = std::io::stdout().flush();
}

fn finish(transcript: Transcript) -> Result<()> {
    println!();
    if let Some(model) = transcript.metadata.as_ref().and_then(|m| m.get("model")) {
        debug!(%model, "reply finished");
    }
    transcript.into_result()?;
    Ok(())
}

/// Open the receive channel, then submit, then print until the terminal chunk.
async fn chat_session(client: &RelayClient, request: ChatRequest) -> Result<()> {
    let session_id = request.session_id.clone().unwrap_or_default();
    let mut reader = client
        .open_channel(&session_id)
        .await
        .context("Failed to open receive channel")?;

    client
        .submit(&request)
        .await
        .context("Failed to submit message")?;

    finish(read_exchange(&mut reader, print_piece).await)
}

async fn chat_inline(client: &RelayClient, request: &ChatRequest) -> Result<()> {
    let mut reader = client
        .stream_inline(request)
        .await
        .context("Failed to start inline stream")?;

    finish(read_exchange(&mut reader, print_piece).await)
}

async fn chat_whole(client: &RelayClient, request: &ChatRequest) -> Result<()> {
    let reply = client.chat(request).await.context("Chat request failed")?;
    println!("{}", reply.message.content);
    Ok(())
}

async fn show_status(client: &RelayClient) -> Result<()> {
    let report = client.status().await.context("Failed to get relay status")?;
    let verdict = if report.api_key_valid { "valid" } else { "NOT valid" };
    println!("API key: {verdict}");
    println!("Checked: {}", report.timestamp.format("%Y-%m-%d %H:%M:%S UTC"));
    Ok(())
}

async fn list_sessions(client: &RelayClient) -> Result<()> {
    let sessions = client.sessions().await.context("Failed to list sessions")?;
    if sessions.is_empty() {
        println!("No open sessions.");
        return Ok(());
    }

    println!(
        "{:<28} {:<20} {:<20} {:<9}",
        "SESSION", "OPENED", "LAST ACTIVITY", "STREAMING"
    );
    println!("{}", "-".repeat(80));

    for session in sessions {
        let id: String = session.id.chars().take(26).collect();
        println!(
            "{:<28} {:<20} {:<20} {:<9}",
            id,
            session.opened_at.format("%Y-%m-%d %H:%M:%S"),
            session.last_activity.format("%Y-%m-%d %H:%M:%S"),
            if session.streaming { "yes" } else { "no" },
        );
    }
    Ok(())
}

async fn list_models(client: &RelayClient) -> Result<()> {
    let models = client.models().await.context("Failed to list models")?;
    if models.is_empty() {
        println!("No models available.");
        return Ok(());
    }

    println!("{:<40} {:<20}", "MODEL", "OWNED BY");
    println!("{}", "-".repeat(60));
    for model in models {
        println!(
            "{:<40} {:<20}",
            model.id,
            model.owned_by.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}
