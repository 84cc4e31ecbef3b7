//! Gantry: blocking handler chains behind an async HTTP/WebSocket server.
//!
//! Serves the demo gateway: plain routes run on tokio's blocking pool and
//! the `/ws` echo socket runs on a dedicated blocking worker per connection.
//!
//! Usage:
//!   gantry                              # Default port 8000
//!   gantry --port 0                     # OS-assigned port
//!   gantry --channel-capacity 8         # Smaller socket queues
//!   gantry --verbose --log-file         # Debug logs to ~/.gantry/logs/gantry.log

mod demo;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use gantry_transport::{DEFAULT_CHANNEL_CAPACITY, GatewayServer, TransportConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gantry", about = "Gantry: handler chains over HTTP and WebSocket")]
struct Cli {
    /// Port to listen on (0 for OS-assigned)
    #[arg(long, default_value = "8000")]
    port: u16,

    /// Hostname to bind to
    #[arg(long, default_value = "127.0.0.1")]
    hostname: String,

    /// Maximum concurrent WebSocket connections
    #[arg(long, default_value = "256")]
    max_connections: usize,

    /// Capacity of each socket session's inbound and outbound queues
    #[arg(long, default_value_t = DEFAULT_CHANNEL_CAPACITY)]
    channel_capacity: usize,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    /// Write logs to a file (defaults to ~/.gantry/logs/gantry.log if no path given)
    #[arg(long, default_missing_value = "DEFAULT", num_args = 0..=1)]
    log_file: Option<String>,
}

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    let Some(log_file_arg) = cli.log_file.as_deref() else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return Ok(());
    };

    let log_path = if log_file_arg == "DEFAULT" {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home).join(".gantry/logs/gantry.log")
    } else {
        PathBuf::from(log_file_arg)
    };

    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open log file {}", log_path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .init();

    eprintln!("Logging to {}", log_path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;

    let config = TransportConfig {
        port: cli.port,
        hostname: cli.hostname.clone(),
        max_connections: Some(cli.max_connections),
        channel_capacity: cli.channel_capacity,
        verbose_logging: cli.verbose,
        ..TransportConfig::default()
    };

    let gateway = Arc::new(demo::gateway());
    let [request, response, exception, finalizers] = gateway.handlers().names();
    info!(
        "handlers: request={request:?} response={response:?} exception={exception:?} finalizers={finalizers:?}"
    );

    let mut server = GatewayServer::start(config, gateway)
        .await
        .context("failed to start server")?;

    let base = format!("{}:{}", cli.hostname, server.port());
    println!("────────────────────────────────────────────────────────────────");
    println!();
    println!("  Server running!");
    println!();
    println!("  HTTP:       http://{base}/hello");
    println!("  WebSocket:  ws://{base}/ws");
    println!();
    println!("────────────────────────────────────────────────────────────────");
    println!();
    println!("  Press Ctrl+C to stop.");
    println!();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;

    println!();
    println!("  Shutting down...");
    server.stop().await;
    println!("  Server stopped.");
    Ok(())
}
