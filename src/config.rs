//! Node configuration
//!
//! Loaded from a JSON file and overridden by command-line flags.

use crate::network::net_core::{NetCoreConfig, DEFAULT_NAT_IP, DEFAULT_NAT_PORT};
use crate::network::node::{Node, NodeId};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 1122;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invalid node id: {0}")]
    InvalidId(String),
    #[error("Invalid seed: {0}")]
    InvalidSeed(String),
    #[error("Invalid listen address: {0}")]
    InvalidListen(String),
}

/// A bootstrap node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedConfig {
    pub id: String,
    pub ip: String,
    pub port: u16,
}

impl SeedConfig {
    /// Parse `ID@IP:PORT`
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let (id, addr) = s
            .split_once('@')
            .ok_or_else(|| ConfigError::InvalidSeed(s.to_string()))?;
        let addr: SocketAddr = addr
            .parse()
            .map_err(|_| ConfigError::InvalidSeed(s.to_string()))?;
        Ok(Self {
            id: id.to_string(),
            ip: addr.ip().to_string(),
            port: addr.port(),
        })
    }

    pub fn to_node(&self) -> Result<Node, ConfigError> {
        let id: NodeId = self
            .id
            .parse()
            .map_err(|_| ConfigError::InvalidId(self.id.clone()))?;
        let ip: IpAddr = self
            .ip
            .parse()
            .map_err(|_| ConfigError::InvalidSeed(format!("{}@{}:{}", self.id, self.ip, self.port)))?;
        let node = Node::new(id, Some(ip), self.port);
        node.validate_complete()
            .map_err(|e| ConfigError::InvalidSeed(format!("{}: {}", node, e)))?;
        Ok(node)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Hex node id; generated when empty
    pub id: String,
    pub ip: String,
    pub port: u16,
    pub seeds: Vec<SeedConfig>,
    pub nat_traversal: bool,
    pub nat_ip: String,
    pub nat_port: u16,
    pub chain_id: u16,
    pub protocol_version: u16,
    /// Seed nodes do not bootstrap from themselves
    pub is_super: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            ip: Ipv4Addr::UNSPECIFIED.to_string(),
            port: DEFAULT_PORT,
            seeds: Vec::new(),
            nat_traversal: false,
            nat_ip: DEFAULT_NAT_IP.to_string(),
            nat_port: DEFAULT_NAT_PORT,
            chain_id: 1,
            protocol_version: 1,
            is_super: false,
        }
    }
}

impl NetworkConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Node id, generating and remembering a fresh one when unset
    pub fn node_id(&mut self) -> Result<NodeId, ConfigError> {
        if self.id.is_empty() {
            let id = NodeId::random();
            log::info!("generated node id {}", id);
            self.id = id.to_string();
            return Ok(id);
        }
        self.id
            .parse()
            .map_err(|_| ConfigError::InvalidId(self.id.clone()))
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .ip
            .parse()
            .map_err(|_| ConfigError::InvalidListen(self.ip.clone()))?;
        if self.port == 0 {
            return Err(ConfigError::InvalidListen(format!("{}:0", self.ip)));
        }
        Ok(SocketAddr::new(ip, self.port))
    }

    /// Seed nodes, minus ourselves when running as a seed
    pub fn seed_nodes(&self, self_id: &NodeId) -> Result<Vec<Node>, ConfigError> {
        let mut nodes = Vec::with_capacity(self.seeds.len());
        for seed in &self.seeds {
            let node = seed.to_node()?;
            if self.is_super && node.id == *self_id {
                continue;
            }
            nodes.push(node);
        }
        Ok(nodes)
    }

    /// Fail fast on anything that would break startup
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.id.is_empty() {
            self.id
                .parse::<NodeId>()
                .map_err(|_| ConfigError::InvalidId(self.id.clone()))?;
        }
        self.listen_addr()?;
        if self.nat_traversal {
            self.nat_ip
                .parse::<IpAddr>()
                .map_err(|_| ConfigError::InvalidListen(self.nat_ip.clone()))?;
        }
        for seed in &self.seeds {
            seed.to_node()?;
        }
        Ok(())
    }

    pub fn to_net_core_config(&mut self) -> Result<NetCoreConfig, ConfigError> {
        self.validate()?;
        let id = self.node_id()?;
        let mut config = NetCoreConfig::new(id, self.listen_addr()?);
        config.seeds = self.seed_nodes(&id)?;
        config.nat_traversal_enable = self.nat_traversal;
        if self.nat_traversal {
            config.nat_ip = self
                .nat_ip
                .parse()
                .map_err(|_| ConfigError::InvalidListen(self.nat_ip.clone()))?;
            config.nat_port = self.nat_port;
        }
        config.chain_id = self.chain_id;
        config.protocol_version = self.protocol_version;
        Ok(config)
    }
}
