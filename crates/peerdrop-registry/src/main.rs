//! peerdrop Registry - peer discovery server

use anyhow::{Context, Result};
use clap::Parser;
use peerdrop_registry::Registry;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "peerdrop-registry")]
#[command(about = "peerdrop discovery registry", long_about = None)]
struct Cli {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = peerdrop_registry::DEFAULT_PORT)]
    port: u16,

    /// Seconds without a heartbeat before a peer is dropped
    #[arg(long, default_value_t = peerdrop_core::DEFAULT_TTL_SECS)]
    ttl_secs: u64,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let addr = format!("{}:{}", cli.bind, cli.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind registry to {}", addr))?;

    let registry = Arc::new(Registry::new(Duration::from_secs(cli.ttl_secs)));
    peerdrop_registry::serve(listener, registry, async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutting down");
    })
    .await
    .context("Registry server error")?;

    Ok(())
}
