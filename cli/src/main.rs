// whoosh-node: command-line entry point for a Whoosh overlay node

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use libp2p::Multiaddr;
use std::path::PathBuf;
use whoosh_core::{IdentityStore, NodeConfig, NodeIdentity, WhooshNode};

#[derive(Parser)]
#[command(name = "whoosh-node")]
#[command(about = "Whoosh — peer-to-peer overlay node", long_about = None)]
#[command(version)]
struct Cli {
    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node and run until Ctrl-C
    Start {
        /// JSON config file (missing file = defaults)
        #[arg(short, long, default_value = "whoosh.json")]
        config: PathBuf,
        /// Override the identity key file
        #[arg(short, long)]
        identity: Option<PathBuf>,
        /// Override the listen addresses (repeatable)
        #[arg(short, long)]
        listen: Vec<String>,
        /// Disable mDNS local discovery
        #[arg(long)]
        no_mdns: bool,
    },
    /// Show the node identity
    Identity {
        #[arg(short, long, default_value = "whoosh_identity.key")]
        path: PathBuf,
        /// Generate and store a new identity if none exists
        #[arg(long)]
        create: bool,
    },
    /// Greet a remote node over the client handshake protocol
    Hello {
        /// Remote address ending in /p2p/<peer id>
        addr: Multiaddr,
        /// JSON config file; its `device_name` is the default greeting name
        #[arg(short, long, default_value = "whoosh.json")]
        config: PathBuf,
        /// Override the device name sent in the greeting
        #[arg(short, long)]
        device: Option<String>,
    },
    /// Print the default configuration as JSON
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .init();

    match cli.command {
        Commands::Start {
            config,
            identity,
            listen,
            no_mdns,
        } => cmd_start(config, identity, listen, no_mdns).await,
        Commands::Identity { path, create } => cmd_identity(path, create),
        Commands::Hello {
            addr,
            config,
            device,
        } => cmd_hello(addr, config, device).await,
        Commands::Config => cmd_config(),
    }
}

async fn cmd_start(
    config_path: PathBuf,
    identity: Option<PathBuf>,
    listen: Vec<String>,
    no_mdns: bool,
) -> Result<()> {
    let mut config = NodeConfig::load(&config_path)?;
    if let Some(identity) = identity {
        config.identity_path = identity;
    }
    if !listen.is_empty() {
        config.listen.addrs = listen;
    }
    if no_mdns {
        config.enable_mdns = false;
    }

    println!("{}", "Whoosh — Starting...".bold());
    println!();

    let node = WhooshNode::start(&config).await?;

    println!("{} Peer ID: {}", "✓".green(), node.peer_id().to_string().bright_cyan());
    for addr in node.addresses().await? {
        println!("{} Listening on: {}", "✓".green(), addr);
    }
    println!();
    println!("Press {} to stop", "Ctrl-C".bright_yellow());

    let report = node.run_until_interrupted().await?;
    println!(
        "{} Stopped ({} peers still connected)",
        "✓".green(),
        report.connectivity.connected_peers.len()
    );
    Ok(())
}

fn cmd_identity(path: PathBuf, create: bool) -> Result<()> {
    let store = IdentityStore::new(&path);
    let identity = if create {
        store.load_or_create()?
    } else {
        match store.load()? {
            Some(identity) => identity,
            None => {
                println!("{} No identity at {}", "✗".red(), path.display());
                println!(
                    "  Run with {} or start the node to create one",
                    "--create".bright_green()
                );
                return Ok(());
            }
        }
    };

    println!("{}", "Identity".bold());
    println!();
    println!("  {} {}", "Peer ID:".bright_yellow(), identity.peer_id());
    println!("  {} {}", "Key file:".bright_yellow(), path.display());
    Ok(())
}

async fn cmd_hello(addr: Multiaddr, config_path: PathBuf, device: Option<String>) -> Result<()> {
    // Throwaway client: fresh identity, no listeners, no discovery
    let mut config = NodeConfig::load(&config_path)?;
    if let Some(device) = device {
        config.device_name = device;
    }
    config.listen.addrs.clear();
    config.listen.public_addr = None;
    config.bootstrap_peers.clear();
    config.enable_mdns = false;
    config.enable_dht = false;

    let node = WhooshNode::start_with_identity(&config, NodeIdentity::generate()).await?;
    let result = node.hello(&addr).await;
    node.shutdown().await?;

    let response = result.context("Hello failed")?;
    println!("{} {}", "←".bright_blue(), response);
    Ok(())
}

fn cmd_config() -> Result<()> {
    println!("{}", NodeConfig::default().to_json()?);
    Ok(())
}
