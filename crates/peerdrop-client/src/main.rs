//! peerdrop - encrypted peer-to-peer file sharing

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use peerdrop_client::config::{self, Config, SessionMode};
use peerdrop_client::discovery::{self, RegistryClient};
use peerdrop_client::downloader::PeerClient;
use peerdrop_client::server::{ChunkStore, PeerServer};
use peerdrop_core::{hash_to_hex, Identity, PeerEndpoint, RegisterRequest};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "peerdrop")]
#[command(about = "Encrypted peer-to-peer file sharing", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.peerdrop/config.toml")]
    config: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Data directory (overrides config)
    #[arg(short, long)]
    data_dir: Option<String>,

    /// Registry URL (overrides config)
    #[arg(long)]
    registry: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Share a directory and register with the registry
    Serve {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Directory to share (overrides config)
        #[arg(short, long)]
        shared_dir: Option<String>,

        /// Address to advertise to the registry
        #[arg(long)]
        advertise_ip: Option<String>,

        /// Also run a registry on this port
        #[arg(long)]
        embedded_registry: Option<u16>,

        /// Do not register with any registry
        #[arg(long)]
        no_register: bool,
    },

    /// Download a file from whichever peer has it
    Get {
        /// Name of the file
        #[arg(required = true)]
        file: String,

        #[command(flatten)]
        transfer: TransferArgs,
    },

    /// Download a file from a specific peer
    Fetch {
        /// Name of the file
        #[arg(required = true)]
        file: String,

        /// Peer address (ip:port)
        #[arg(short, long, required = true)]
        peer: String,

        #[command(flatten)]
        transfer: TransferArgs,
    },

    /// Show a peer's metadata for a file
    Meta {
        /// Name of the file
        #[arg(required = true)]
        file: String,

        /// Peer address (ip:port)
        #[arg(short, long, required = true)]
        peer: String,
    },

    /// List live peers known to the registry
    Peers {
        /// Only peers sharing this file
        #[arg(short, long)]
        file: Option<String>,
    },

    /// Show this peer's id
    Id,

    /// Initialize configuration
    Init,
}

#[derive(Args)]
struct TransferArgs {
    /// Output directory (overrides config)
    #[arg(short, long)]
    output: Option<String>,

    /// Maximum chunk fetches in flight
    #[arg(short = 'k', long)]
    concurrency: Option<usize>,

    /// Reuse a few long-lived sessions instead of one per chunk
    #[arg(long)]
    pooled: bool,
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

    let config_path = config::expand_path(&cli.config);
    let mut config = Config::load_or_default(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(url) = cli.registry {
        config.registry.url = url;
    }

    match cli.command {
        Commands::Serve {
            port,
            shared_dir,
            advertise_ip,
            embedded_registry,
            no_register,
        } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(shared_dir) = shared_dir {
                config.shared_dir = shared_dir;
            }
            if advertise_ip.is_some() {
                config.server.advertise_ip = advertise_ip;
            }
            serve(&config, embedded_registry, !no_register).await?;
        }
        Commands::Get { file, transfer } => {
            transfer.apply(&mut config);
            get_file(&config, &file).await?;
        }
        Commands::Fetch {
            file,
            peer,
            transfer,
        } => {
            transfer.apply(&mut config);
            fetch_file(&config, &file, &peer).await?;
        }
        Commands::Meta { file, peer } => {
            show_metadata(&config, &file, &peer).await?;
        }
        Commands::Peers { file } => {
            list_peers(&config, file.as_deref()).await?;
        }
        Commands::Id => {
            let identity = Identity::ensure(&config.key_dir())?;
            println!("{}", identity.peer_id());
        }
        Commands::Init => {
            init_config(&config, &config_path)?;
        }
    }

    Ok(())
}

impl TransferArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(output) = &self.output {
            config.output_dir = output.clone();
        }
        if let Some(concurrency) = self.concurrency {
            config.transfer.max_concurrent_chunks = concurrency;
        }
        if self.pooled {
            config.transfer.session_mode = SessionMode::Pooled;
        }
    }
}

async fn serve(config: &Config, embedded_registry: Option<u16>, register: bool) -> Result<()> {
    let identity = Identity::ensure(&config.key_dir())?;

    let shared_dir = config.shared_dir();
    std::fs::create_dir_all(&shared_dir)?;
    let store = ChunkStore::new(shared_dir, config.server.chunk_size)
        .context("Invalid [server] chunk_size")?;
    let files = store.list_files()?;

    let addr = format!("{}:{}", config.server.listen_addr, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind peer server to {}", addr))?;
    let port = listener.local_addr()?.port();

    let mut registry_url = config.registry.url.clone();
    if let Some(registry_port) = embedded_registry {
        let registry_addr = format!("{}:{}", config.server.listen_addr, registry_port);
        let registry_listener = TcpListener::bind(&registry_addr)
            .await
            .with_context(|| format!("Failed to bind registry to {}", registry_addr))?;
        let registry = Arc::new(peerdrop_registry::Registry::new(Duration::from_secs(
            peerdrop_core::DEFAULT_TTL_SECS,
        )));
        tokio::spawn(async move {
            if let Err(e) =
                peerdrop_registry::serve(registry_listener, registry, std::future::pending()).await
            {
                tracing::error!("Embedded registry stopped: {}", e);
            }
        });
        registry_url = format!("http://127.0.0.1:{}", registry_port);
    }

    println!("Peer id: {}", identity.peer_id());
    println!("Sharing {} file(s) on port {}", files.len(), port);
    for file in &files {
        println!("  - {}", file);
    }

    let server = PeerServer::new(store, config.server_transport());
    let server_task = tokio::spawn(async move { server.run(listener).await });

    if register {
        let registry = RegistryClient::new(&registry_url)?;
        let registration = RegisterRequest {
            peer_id: identity.peer_id().to_string(),
            public_key: identity.public_key_pem().to_string(),
            port,
            files,
            ip: config.server.advertise_ip.clone(),
        };
        if let Err(e) = registry.register(&registration).await {
            tracing::warn!("Initial registration with {} failed: {}", registry_url, e);
        }
        tokio::spawn(discovery::heartbeat_loop(
            registry,
            registration,
            Duration::from_secs(config.registry.heartbeat_interval_secs),
        ));
    }

    println!("Peer is running. Press Ctrl+C to stop.");

    tokio::select! {
        result = server_task => {
            result.context("Peer server task failed")??;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        }
    }

    Ok(())
}

fn client(config: &Config) -> Result<PeerClient> {
    let identity = Identity::ensure(&config.key_dir())?;
    Ok(PeerClient::from_config(Arc::new(identity), config))
}

async fn get_file(config: &Config, filename: &str) -> Result<()> {
    let registry = RegistryClient::new(&config.registry.url)?;
    let path = client(config)?
        .download_via_discovery(&registry, filename, &config.output_dir())
        .await?;
    println!("Downloaded: {}", path.display());
    Ok(())
}

async fn fetch_file(config: &Config, filename: &str, peer: &str) -> Result<()> {
    let peer: PeerEndpoint = peer.parse()?;
    let path = client(config)?
        .download(&peer, filename, &config.output_dir())
        .await?;
    println!("Downloaded: {}", path.display());
    Ok(())
}

async fn show_metadata(config: &Config, filename: &str, peer: &str) -> Result<()> {
    let peer: PeerEndpoint = peer.parse()?;
    let meta = client(config)?.fetch_metadata(&peer, filename).await?;

    println!("File: {}", meta.filename);
    println!("Size: {} bytes", meta.size);
    println!("Chunks: {} x {} bytes", meta.chunk_count, meta.chunk_size);
    println!("SHA-256: {}", hash_to_hex(&meta.content_hash));
    Ok(())
}

async fn list_peers(config: &Config, file: Option<&str>) -> Result<()> {
    let registry = RegistryClient::new(&config.registry.url)?;
    let peers = registry.peers(file).await?;

    if peers.is_empty() {
        println!("No live peers");
        return Ok(());
    }
    println!("{} live peer(s):", peers.len());
    for peer in peers {
        println!("{} {}", peer.endpoint(), peer.peer_id);
        for file in &peer.files {
            println!("  - {}", file);
        }
    }
    Ok(())
}

fn init_config(config: &Config, config_path: &Path) -> Result<()> {
    let data_dir = config.data_dir();
    if !data_dir.exists() {
        std::fs::create_dir_all(&data_dir)?;
        tracing::info!("Created data directory: {}", data_dir.display());
    }

    if config_path.exists() {
        println!("Config already exists at: {}", config_path.display());
    } else {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let toml = toml::to_string_pretty(&Config::default())?;
        std::fs::write(config_path, toml)?;
        println!("Wrote config: {}", config_path.display());
    }

    std::fs::create_dir_all(config.shared_dir())?;
    std::fs::create_dir_all(config.output_dir())?;
    let identity = Identity::ensure(&config.key_dir())?;

    println!("Initialized peerdrop at: {}", data_dir.display());
    println!("Peer id: {}", identity.peer_id());
    Ok(())
}
