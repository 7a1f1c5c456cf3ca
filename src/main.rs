//! MCProxy CLI - run one bridge per configured child until shutdown.

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info, warn};

use mcproxy::bridge::Bridge;
use mcproxy::config;
use mcproxy::events::{BridgeEvent, EventSender};

/// Bridge stdio MCP servers to HTTP, SSE, and streamable HTTP clients.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a JSON array of child configs.
    #[arg(short, long, env = "MCPROXY_CONFIG")]
    config: PathBuf,

    /// Emit logs as JSON.
    #[arg(long, env = "MCPROXY_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if cli.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let configs = config::load_configs(&cli.config)?;
    if configs.is_empty() {
        warn!(config = %cli.config.display(), "no child configs found, nothing to do");
        return Ok(());
    }

    let mut bridges = Vec::new();
    for child_config in configs {
        let (events, mut rx) = EventSender::channel(child_config.id.clone());

        // Logs, status, and tools are already mirrored to tracing at the
        // point of emission; the active-clients view is surfaced here.
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let BridgeEvent::ActiveClients { bridge_id, clients } = event {
                    let names: Vec<String> =
                        clients.iter().map(|c| c.display_name()).collect();
                    info!(bridge_id, clients = ?names, "active clients changed");
                }
            }
        });

        let bridge = Bridge::new(child_config, events);
        match bridge.start().await {
            Ok(port) => info!(
                bridge_id = %bridge.config().id,
                name = %bridge.config().name,
                port,
                "bridge started"
            ),
            Err(e) => error!(
                bridge_id = %bridge.config().id,
                error = %e,
                "bridge failed to start"
            ),
        }
        bridges.push(bridge);
    }

    wait_for_shutdown().await;

    info!("shutting down bridges");
    for bridge in &bridges {
        bridge.stop().await;
    }
    Ok(())
}

/// Block until SIGINT (Ctrl+C) or, on unix, SIGTERM.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    error!(error = %e, "failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received Ctrl+C");
    }
}
