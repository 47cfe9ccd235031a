//! chain-net: peer-to-peer networking for a blockchain node
//!
//! This crate provides:
//! - Kademlia node discovery over SHA-256 keys
//! - Per-peer sessions with prioritized, flow-controlled send queues
//! - Group overlays with O(sqrt n) links per member
//! - Flood, random-relay and group broadcast with deduplication
//! - Relay discovery for nodes that cannot be dialed directly
//! - Pluggable transports (TCP and an in-memory simulation hub)
//!
//! # Example
//!
//! ```rust,no_run
//! use chain_net::network::{Message, MessageHandler, NetCoreConfig, NodeId, Server};
//! use chain_net::transport::MemoryNetwork;
//! use std::sync::Arc;
//!
//! struct Print;
//!
//! impl MessageHandler for Print {
//!     fn handle(&self, from: NodeId, message: Message) {
//!         println!("{} sent code {}", from, message.code);
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let net = MemoryNetwork::new();
//! let config = NetCoreConfig::new(NodeId::random(), "127.0.0.1:3000".parse()?);
//! let server = Server::new(config, Arc::new(net.transport()), Arc::new(Print), Arc::new(Print))?;
//! server.start()?;
//! server.broadcast(&Message::new(10011, b"block".to_vec()))?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod network;
pub mod transport;

// Re-export commonly used types
pub use config::{ConfigError, NetworkConfig, SeedConfig};
pub use network::{
    ConnInfo, Inbound, Kad, Message, MessageHandler, NetCore, NetCoreConfig, NetError, Node,
    NodeId, Server, ServerError,
};
pub use transport::{MemoryNetwork, MemoryTransport, TcpTransport, TransportError, TransportEvent, TransportProvider};
