//! Wire messages and application message codes
//!
//! Defines the protocol packets exchanged between nodes and the
//! application-level [`Message`] carried inside `Data` envelopes.

use crate::network::node::{Node, NodeId};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Protocol version stamped into pings
pub const VERSION: u32 = 1;

/// Lifetime of messages carrying an expiration
pub const MESSAGE_EXPIRATION: Duration = Duration::from_secs(60);

/// Code offset for protocol control messages, above every application code
pub const P2P_MESSAGE_CODE_BASE: u32 = 1_000_000;

/// Length of an application dedup id
pub const BIZ_MESSAGE_ID_LENGTH: usize = 32;

pub type BizMessageId = [u8; BIZ_MESSAGE_ID_LENGTH];

// =============================================================================
// Packet types
// =============================================================================

/// Packet type tag, the first word of every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    None = 0,
    Ping = 1,
    FindNode = 2,
    Neighbors = 3,
    RelayTest = 4,
    RelayNode = 5,
    Data = 6,
}

impl MessageType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(MessageType::None),
            1 => Some(MessageType::Ping),
            2 => Some(MessageType::FindNode),
            3 => Some(MessageType::Neighbors),
            4 => Some(MessageType::RelayTest),
            5 => Some(MessageType::RelayNode),
            6 => Some(MessageType::Data),
            _ => None,
        }
    }

    /// Code used for send priority and flow accounting
    pub fn control_code(self) -> u32 {
        P2P_MESSAGE_CODE_BASE + self as u32
    }
}

/// Advertised endpoint of a node
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RpcEndPoint {
    pub ip: String,
    pub port: u16,
}

impl RpcEndPoint {
    pub fn from_addr(addr: Option<SocketAddr>) -> Self {
        match addr {
            Some(addr) => Self {
                ip: addr.ip().to_string(),
                port: addr.port(),
            },
            None => Self::default(),
        }
    }

    pub fn to_addr(&self) -> Option<SocketAddr> {
        let ip: IpAddr = self.ip.parse().ok()?;
        if self.port == 0 {
            return None;
        }
        Some(SocketAddr::new(ip, self.port))
    }
}

/// Node entry in a `Neighbors` reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcNode {
    pub id: NodeId,
    pub ip: String,
    pub port: u16,
}

impl RpcNode {
    pub fn from_node(node: &Node) -> Self {
        Self {
            id: node.id,
            ip: node.ip.map(|ip| ip.to_string()).unwrap_or_default(),
            port: node.port,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgPing {
    pub version: u32,
    pub from: RpcEndPoint,
    pub to: RpcEndPoint,
    pub node_id: NodeId,
    pub chain_id: u16,
    pub protocol_version: u16,
    pub expiration: i64,
    /// Set on the answer to a ping; answers are never answered
    #[serde(default)]
    pub reply: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgFindNode {
    pub target: NodeId,
    pub expiration: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgNeighbors {
    pub nodes: Vec<RpcNode>,
    pub expiration: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgRelay {
    pub node_id: NodeId,
}

/// Dissemination mode of a data envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// Unicast
    Normal,
    /// Flood to every connected peer
    Global,
    /// Epidemic relay to a random subset, bounded by the relay count
    GlobalRandom,
    /// Broadcast inside a named group overlay
    Group,
}

impl DataType {
    pub fn as_code(self) -> u32 {
        match self {
            DataType::Normal => 0,
            DataType::Global => 1,
            DataType::GlobalRandom => 2,
            DataType::Group => 3,
        }
    }
}

/// Application data envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgData {
    pub data: Vec<u8>,
    pub data_type: DataType,
    #[serde(default)]
    pub group_id: String,
    pub message_id: u64,
    pub message_code: u32,
    pub dest_node_id: Option<NodeId>,
    pub src_node_id: NodeId,
    pub biz_message_id: Option<BizMessageId>,
    /// Remaining relay hops, -1 for unlimited
    pub relay_count: i32,
    pub expiration: i64,
}

/// A decoded protocol packet
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Ping(MsgPing),
    FindNode(MsgFindNode),
    Neighbors(MsgNeighbors),
    RelayTest(MsgRelay),
    RelayNode(MsgRelay),
    Data(MsgData),
}

impl Packet {
    pub fn message_type(&self) -> MessageType {
        match self {
            Packet::Ping(_) => MessageType::Ping,
            Packet::FindNode(_) => MessageType::FindNode,
            Packet::Neighbors(_) => MessageType::Neighbors,
            Packet::RelayTest(_) => MessageType::RelayTest,
            Packet::RelayNode(_) => MessageType::RelayNode,
            Packet::Data(_) => MessageType::Data,
        }
    }

    /// Serialize the payload (without frame header)
    pub fn payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Packet::Ping(m) => serde_json::to_vec(m),
            Packet::FindNode(m) => serde_json::to_vec(m),
            Packet::Neighbors(m) => serde_json::to_vec(m),
            Packet::RelayTest(m) | Packet::RelayNode(m) => serde_json::to_vec(m),
            Packet::Data(m) => serde_json::to_vec(m),
        }
    }

    /// Parse a payload of the given type
    pub fn from_payload(ptype: MessageType, data: &[u8]) -> Result<Option<Self>, serde_json::Error> {
        let packet = match ptype {
            MessageType::Ping => Packet::Ping(serde_json::from_slice(data)?),
            MessageType::FindNode => Packet::FindNode(serde_json::from_slice(data)?),
            MessageType::Neighbors => Packet::Neighbors(serde_json::from_slice(data)?),
            MessageType::RelayTest => Packet::RelayTest(serde_json::from_slice(data)?),
            MessageType::RelayNode => Packet::RelayNode(serde_json::from_slice(data)?),
            MessageType::Data => Packet::Data(serde_json::from_slice(data)?),
            MessageType::None => return Ok(None),
        };
        Ok(Some(packet))
    }
}

/// Unix timestamp `lifetime` from now
pub fn expiration_after(lifetime: Duration) -> i64 {
    chrono::Utc::now().timestamp() + lifetime.as_secs() as i64
}

pub fn is_expired(ts: i64) -> bool {
    ts < chrono::Utc::now().timestamp()
}

// =============================================================================
// Application messages
// =============================================================================

/// Message exchanged with the consensus and chain layers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub code: u32,
    pub body: Vec<u8>,
    /// Filled in on receipt
    #[serde(skip)]
    pub chain_id: u16,
    #[serde(skip)]
    pub protocol_version: u16,
}

impl Message {
    pub fn new(code: u32, body: Vec<u8>) -> Self {
        Self {
            code,
            body,
            chain_id: 0,
            protocol_version: 0,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    pub fn is_consensus(&self) -> bool {
        self.code < codes::CHAIN_SYNC_CODE_BASE
    }
}

/// Application message codes.
///
/// Consensus codes sit below [`codes::CHAIN_SYNC_CODE_BASE`], chain-sync
/// codes at or above it.
pub mod codes {
    pub const GROUP_INIT: u32 = 0x01;
    pub const KEY_PIECE: u32 = 0x02;
    pub const SIGN_PUBKEY: u32 = 0x03;
    pub const GROUP_INIT_DONE: u32 = 0x04;
    pub const CURRENT_GROUP_CAST: u32 = 0x05;
    pub const CAST_VERIFY: u32 = 0x06;
    pub const VERIFIED_CAST: u32 = 0x07;
    pub const CREATE_GROUP_RAW: u32 = 0x19;
    pub const CREATE_GROUP_SIGN: u32 = 0x1a;
    pub const CAST_REWARD_SIGN_REQ: u32 = 0x1d;
    pub const CAST_REWARD_SIGN_GOT: u32 = 0x1e;

    pub const CHAIN_SYNC_CODE_BASE: u32 = 10000;

    pub const REQ_TRANSACTION: u32 = CHAIN_SYNC_CODE_BASE + 0x08;
    pub const TRANSACTION_GOT: u32 = CHAIN_SYNC_CODE_BASE + 0x09;
    pub const NEW_BLOCK: u32 = CHAIN_SYNC_CODE_BASE + 0x0b;
    pub const BLOCK_INFO_NOTIFY: u32 = CHAIN_SYNC_CODE_BASE + 0x10;
    pub const REQ_BLOCK: u32 = CHAIN_SYNC_CODE_BASE + 0x11;
    pub const BLOCK_RESPONSE: u32 = CHAIN_SYNC_CODE_BASE + 0x12;
    pub const GROUP_CHAIN_COUNT: u32 = CHAIN_SYNC_CODE_BASE + 0x14;
    pub const REQ_GROUP: u32 = CHAIN_SYNC_CODE_BASE + 0x15;
    pub const GROUP: u32 = CHAIN_SYNC_CODE_BASE + 0x16;
    pub const CHAIN_PIECE_INFO_REQ: u32 = CHAIN_SYNC_CODE_BASE + 0x17;
    pub const CHAIN_PIECE_INFO: u32 = CHAIN_SYNC_CODE_BASE + 0x18;
    pub const REQ_CHAIN_PIECE_BLOCK: u32 = CHAIN_SYNC_CODE_BASE + 0x22;
    pub const CHAIN_PIECE_BLOCK: u32 = CHAIN_SYNC_CODE_BASE + 0x23;
}
