//! FSBridge Node
//!
//! Shares the local filesystem with paired devices on the LAN.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use node::config::Config;
use node::identity;
use node::orchestrator::{NodeEvent, NodeOrchestrator};
use tracing_subscriber::EnvFilter;

/// FSBridge node - LAN file sharing over an encrypted transport.
#[derive(Parser, Debug)]
#[command(name = "fsbridge-node")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the node.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the node until interrupted
    Start,

    /// Print the persisted device identity
    Identity,

    /// Look for other nodes on the network
    Scan {
        /// Transport port to try (defaults to the configured port)
        #[arg(long, short)]
        port: Option<u16>,

        /// Addresses to try; the local /24 when omitted
        addresses: Vec<IpAddr>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Initialize tracing
    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        config.node.log_level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    if let Some(config_path) = &cli.config {
        tracing::info!("Using config file: {:?}", config_path);
    }

    // Validate configuration
    config.validate()?;

    match cli.command {
        Commands::Start => run(config).await?,
        Commands::Identity => {
            let cipher = config.cipher()?;
            let identity = identity::load_or_generate(
                &config.identity_path(),
                &cipher,
                &config.node.display_name,
                config.network.transport_port,
            )?;
            println!("Device ID:    {}", identity.id);
            println!("Name:         {}", identity.display_name);
            println!("Platform:     {}", identity.platform);
            println!("Port:         {}", identity.port);
        }
        Commands::Scan { port, addresses } => {
            let orchestrator = NodeOrchestrator::new(config)?;
            let peers = orchestrator.scan(addresses, port).await?;
            if peers.is_empty() {
                println!("No peers found.");
            } else {
                println!("Discovered peers:");
                for peer in peers {
                    println!(
                        "  {} - {} ({}, port {})",
                        peer.id, peer.display_name, peer.platform, peer.port
                    );
                }
            }
        }
    }

    Ok(())
}

/// Run both listeners until Ctrl-C.
async fn run(config: Config) -> anyhow::Result<()> {
    let mut orchestrator = NodeOrchestrator::new(config)?;
    let mut events = orchestrator.subscribe();

    tracing::info!("Starting node (device ID: {})", orchestrator.identity().id);
    orchestrator.start().await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl-C, shutting down");
                break;
            }
            event = events.recv() => match event {
                Ok(NodeEvent::TransportListening(addr)) => println!("Transport listening on {}", addr),
                Ok(NodeEvent::HttpListening(addr)) => println!("HTTP listening on {}", addr),
                Ok(NodeEvent::Error { message }) => tracing::error!("{}", message),
                Ok(event) => tracing::debug!(?event, "Node event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("Skipped {} node events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    orchestrator.stop().await
}
