// src/cli.rs
// Command-line entry points: MCP stdio server, HTTP API, status/health

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{info, warn};

use claude_memory::config::EnvConfig;
use claude_memory::mcp::MemoryServer;
use claude_memory::service::ServiceCore;

#[derive(Parser)]
#[command(name = "claude-memory", version, about = "Conversational memory service")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run as MCP server over stdio (default)
    Serve,
    /// Run the HTTP API server
    Http {
        /// Bind address
        #[arg(long, default_value = "127.0.0.1:8000")]
        addr: String,
    },
    /// Print a status snapshot as JSON and exit
    Status,
    /// Print a health snapshot as JSON and exit
    Health {
        /// Include per-component detail
        #[arg(long)]
        detailed: bool,
    },
}

async fn init_core() -> Result<Arc<ServiceCore>> {
    let env = EnvConfig::load();
    let validation = env.validate();
    for warning in &validation.warnings {
        warn!("{}", warning);
    }
    if !validation.is_valid() {
        anyhow::bail!("invalid configuration:\n{}", validation.report());
    }
    Ok(ServiceCore::initialize(&env).await?)
}

/// Resolves when SIGINT or SIGTERM arrives.
async fn shutdown_requested() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Run the MCP server on stdio until the transport closes or a signal
/// arrives. In-flight work gets the configured drain window after the
/// shutdown flag is set.
pub async fn run_mcp_server() -> Result<()> {
    let core = init_core().await?;
    core.spawn_background_tasks();

    let drain = core.settings.monitoring.shutdown_drain;
    let server = MemoryServer::new(core.clone());

    let transport = rmcp::transport::io::stdio();
    let service = rmcp::serve_server(server, transport).await?;
    info!("MCP server serving on stdio");

    let mut waiting = Box::pin(service.waiting());
    tokio::select! {
        result = &mut waiting => {
            result?;
            info!("MCP transport closed");
            core.shutdown();
        }
        _ = shutdown_requested() => {
            info!("Shutdown signal received");
            core.shutdown();
            // In-flight requests get the drain window to finish
            if tokio::time::timeout(drain, &mut waiting).await.is_err() {
                warn!("Drain window elapsed with requests still in flight");
            }
        }
    }

    Ok(())
}

/// Run the HTTP API server until a signal arrives.
pub async fn run_http_server(addr: &str) -> Result<()> {
    let core = init_core().await?;
    core.spawn_background_tasks();

    let app = claude_memory::api::router(core.clone());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr, "HTTP API listening");

    let drain = core.settings.monitoring.shutdown_drain;
    let (notify_tx, notify_rx) = tokio::sync::oneshot::channel::<()>();
    let server_task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = notify_rx.await;
            })
            .await
    });

    shutdown_requested().await;
    info!("Shutdown signal received");
    core.shutdown();
    let _ = notify_tx.send(());

    // In-flight connections get the drain window to finish
    match tokio::time::timeout(drain, server_task).await {
        Ok(joined) => joined??,
        Err(_) => warn!("Drain window elapsed with connections still open"),
    }
    Ok(())
}

/// Print a status snapshot (non-MCP mode; stdout is fine here).
pub async fn run_status() -> Result<()> {
    let core = init_core().await?;
    let status = core.status().await;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// Print a health snapshot.
pub async fn run_health(detailed: bool) -> Result<()> {
    let core = init_core().await?;
    let health = core.health(detailed).await;
    println!("{}", serde_json::to_string_pretty(&health)?);
    Ok(())
}
