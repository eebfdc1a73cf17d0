// src/main.rs
// claude-memory - conversational memory service

mod cli;

use anyhow::Result;
use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env from ~/.claude-memory/.env only (never from CWD - a
    // malicious repo could override API keys)
    if let Some(home) = dirs::home_dir()
        && let Err(e) = dotenvy::from_path(home.join(".claude-memory/.env"))
    {
        tracing::debug!("No global .env file loaded: {}", e);
    }

    let cli = Cli::parse();

    // Logging always goes to stderr - in MCP mode stdout carries protocol
    // bytes exclusively
    let log_level = match &cli.command {
        None | Some(Commands::Serve) => Level::WARN,
        Some(Commands::Http { .. }) => Level::INFO,
        Some(Commands::Status) | Some(Commands::Health { .. }) => Level::WARN,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    match cli.command {
        None | Some(Commands::Serve) => cli::run_mcp_server().await?,
        Some(Commands::Http { addr }) => cli::run_http_server(&addr).await?,
        Some(Commands::Status) => cli::run_status().await?,
        Some(Commands::Health { detailed }) => cli::run_health(detailed).await?,
    }

    Ok(())
}
