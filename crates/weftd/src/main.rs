//! weftd - weft mesh router daemon
//!
//! Joins this host to a weft mesh: listens for peers, dials the configured
//! ones and keeps the overlay running until interrupted.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use weft_mesh::{FrameConsumer, PeerName, Router, RouterConfig};

const STATUS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "weftd")]
#[command(about = "weft mesh router daemon")]
#[command(version)]
struct Cli {
    /// Log as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the router
    Run {
        /// Path to config file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Additional peer to connect to, as host or host:port
        #[arg(long = "peer")]
        peers: Vec<String>,

        /// Port for TCP and UDP
        #[arg(long)]
        port: Option<u16>,

        /// Shared mesh password
        #[arg(long, env = "WEFT_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// Write a default config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "weft.json")]
        output: PathBuf,
    },

    /// Print a random peer name
    GenName,
}

/// Without a local network device, received frames are only logged.
struct LogFrames;

impl FrameConsumer for LogFrames {
    fn consume(&self, src: PeerName, dst: PeerName, frame: &[u8]) {
        debug!(%src, %dst, len = frame.len(), "received frame");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::from_default_env()
        .add_directive("weftd=info".parse()?)
        .add_directive("weft_mesh=info".parse()?);
    if cli.log_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    match cli.command {
        Commands::Run {
            config,
            peers,
            port,
            password,
        } => {
            let mut config = match config {
                Some(path) => RouterConfig::from_file(&path)?,
                None => RouterConfig::default(),
            };
            config.peers.extend(peers);
            if let Some(port) = port {
                config.port = port;
            }
            if password.is_some() {
                config.password = password;
            }
            config.validate()?;
            run_router(config).await?;
        }

        Commands::InitConfig { output } => {
            init_config(&output)?;
        }

        Commands::GenName => {
            println!("{}", PeerName::random());
        }
    }

    Ok(())
}

async fn run_router(config: RouterConfig) -> anyhow::Result<()> {
    let router = Router::start(config, Arc::new(LogFrames)).await?;
    info!(
        peer = %router.name(),
        addr = %router.listen_addr(),
        "weftd running"
    );

    let mut status = tokio::time::interval(STATUS_INTERVAL);
    status.tick().await;
    loop {
        tokio::select! {
            _ = status.tick() => {
                let snapshot = router.status().await;
                info!(
                    peers = snapshot.peers.len(),
                    connections = snapshot.connections.len(),
                    status = %serde_json::to_string(&snapshot)?,
                    "status"
                );
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("interrupted, shutting down");
                break;
            }
        }
    }

    router.stop();
    Ok(())
}

fn init_config(output: &Path) -> anyhow::Result<()> {
    let config = RouterConfig::default();
    std::fs::write(output, config.to_json()?)?;

    println!("Config written to {}", output.display());
    println!();
    println!("Add peers to the file, then run:");
    println!("  weftd run --config {}", output.display());

    Ok(())
}
