//! chain-net CLI
//!
//! Runs a standalone P2P node over TCP.

use chain_net::config::{NetworkConfig, SeedConfig};
use chain_net::network::{Message, MessageHandler, NodeId, Server};
use chain_net::transport::TcpTransport;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// How often the running node reports its connections
const CONN_INFO_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "chain-net")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "Peer-to-peer networking node for a blockchain", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node
    Start {
        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Node id in hex
        #[arg(long)]
        id: Option<String>,

        /// Listen ip
        #[arg(long)]
        ip: Option<String>,

        /// Listen port
        #[arg(short, long)]
        port: Option<u16>,

        /// Bootstrap node as ID@IP:PORT, repeatable
        #[arg(short, long)]
        seed: Vec<String>,

        /// Route every dial through the relay server
        #[arg(long)]
        nat: bool,

        /// Map the listen port with UPnP
        #[arg(long)]
        upnp: bool,

        #[arg(long)]
        chain_id: Option<u16>,

        #[arg(long)]
        protocol_version: Option<u16>,
    },

    /// Print a fresh random node id
    GenId,

    /// Print the default configuration as JSON
    Config,
}

/// Logs everything it receives
struct LogHandler {
    name: &'static str,
}

impl MessageHandler for LogHandler {
    fn handle(&self, from: NodeId, message: Message) {
        log::info!(
            "[{}] message from {} code: {} size: {}",
            self.name,
            from,
            message.code,
            message.body.len()
        );
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::GenId => {
            println!("{}", NodeId::random());
        }

        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&NetworkConfig::default())?);
        }

        Commands::Start {
            config,
            id,
            ip,
            port,
            seed,
            nat,
            upnp,
            chain_id,
            protocol_version,
        } => {
            let mut net_config = match config {
                Some(path) => NetworkConfig::load(&path)?,
                None => NetworkConfig::default(),
            };
            if let Some(id) = id {
                net_config.id = id;
            }
            if let Some(ip) = ip {
                net_config.ip = ip;
            }
            if let Some(port) = port {
                net_config.port = port;
            }
            for s in &seed {
                net_config.seeds.push(SeedConfig::parse(s)?);
            }
            net_config.nat_traversal |= nat;
            if let Some(chain_id) = chain_id {
                net_config.chain_id = chain_id;
            }
            if let Some(protocol_version) = protocol_version {
                net_config.protocol_version = protocol_version;
            }

            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_node(net_config, upnp))?;
        }
    }

    Ok(())
}

async fn run_node(mut config: NetworkConfig, upnp: bool) -> Result<(), Box<dyn std::error::Error>> {
    let core_config = config.to_net_core_config()?;
    println!("🌐 Starting node {} on {}", core_config.id, core_config.listen_addr);

    let transport = Arc::new(TcpTransport::new(upnp)?);
    let server = Server::new(
        core_config,
        transport,
        Arc::new(LogHandler { name: "consensus" }),
        Arc::new(LogHandler { name: "chain" }),
    )?;
    server.start()?;

    let mut report = tokio::time::interval(CONN_INFO_INTERVAL);
    loop {
        tokio::select! {
            _ = report.tick() => {
                let conns = server.connection_info();
                log::info!(
                    "connections: {} kad nodes: {}",
                    conns.len(),
                    server.core().kad().len()
                );
                for conn in conns {
                    log::debug!("  {} {}:{}", conn.id, conn.ip, conn.port);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\n📴 Shutting down node...");
                server.close();
                break;
            }
        }
    }
    Ok(())
}
