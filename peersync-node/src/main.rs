//! PeerSync demo node
//!
//! Boots a handful of simulated devices on an in-memory medium, pairs them,
//! lets each one edit the same document and syncs them until they agree.
//! With `--serve` the first device's status stays available over HTTP.
//!
//! Usage:
//!   peersync-node --devices 3 --serve --http-port 4002

use anyhow::{Context, Result, ensure};
use clap::Parser;
use peersync_node::build_router;
use peersync_node::demo::Demo;
use std::time::Duration;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "peersync-node")]
#[command(about = "PeerSync offline-first sync demo node")]
struct Args {
    /// Number of simulated devices
    #[arg(short, long, default_value = "3")]
    devices: usize,

    /// Seconds to wait for discovery and for each session
    #[arg(long, default_value = "10")]
    wait_secs: u64,

    /// Keep running and serve the first device's status over HTTP
    #[arg(short, long)]
    serve: bool,

    /// HTTP API port for the status endpoint
    #[arg(long, default_value = "4002")]
    http_port: u16,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("PeerSync node starting with {} devices...", args.devices);
    let demo = Demo::start(args.devices)
        .await?
        .with_wait(Duration::from_secs(args.wait_secs));

    demo.edit().await?;
    let sessions = demo.sync_all().await?;
    info!("Completed {} sync sessions", sessions.len());
    ensure!(demo.converged().await, "devices did not converge");

    println!("\n========================================");
    println!("  PeerSync Demo Converged");
    println!("========================================");
    for device in demo.devices() {
        let stats = device.orchestrator.get_sync_statistics().await;
        println!(
            "  {:<10} documents: {}  operations: {}  conflicts: {}",
            device.id(),
            stats.document_count,
            stats.operation_count,
            stats.total_conflicts
        );
    }
    if let Some(device) = demo.devices().first() {
        println!();
        for (document_id, fields) in device.snapshot().await {
            println!("  {document_id}: {}", serde_json::Value::Object(fields));
        }
    }
    println!("========================================\n");

    if args.serve {
        let hub = demo
            .devices()
            .first()
            .context("demo has no devices")?
            .orchestrator
            .clone();
        let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", args.http_port))
            .await
            .context("Failed to bind HTTP port")?;
        info!("HTTP status endpoint listening on port {}", args.http_port);
        axum::serve(listener, build_router(hub))
            .with_graceful_shutdown(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Failed to listen for shutdown signal: {e}");
                }
            })
            .await
            .context("HTTP server failed")?;
    }

    demo.shutdown().await?;
    info!("PeerSync node stopped");
    Ok(())
}
