//! P2P networking module
//!
//! Peer discovery, session management and message routing for a
//! blockchain node.
//!
//! # Features
//! - Kademlia routing table over SHA-256 node keys
//! - Per-peer prioritized send queues with bounded in-flight frames
//! - Group overlays with O(sqrt n) links per member
//! - Flood, random-relay and group broadcast with deduplication
//! - Relay discovery for peers that cannot be dialed directly

pub mod buffer_pool;
pub mod codec;
pub mod group;
pub mod kad;
pub mod message;
pub mod message_manager;
pub mod net_core;
pub mod node;
pub mod peer;
pub mod server;
pub mod stats;

pub use buffer_pool::{BufferPool, PoolTierStats};
pub use codec::{Frame, PacketCodec, MAX_PACKET_SIZE, PACKET_HEAD_SIZE};
pub use group::{gen_connect_nodes, Group, GroupLink, GroupManager, GroupRoute};
pub use kad::{Kad, KadRpc, NodesByDistance, ALPHA, BUCKET_SIZE};
pub use message::{codes, BizMessageId, DataType, Message, MessageType, MsgData, Packet};
pub use message_manager::MessageManager;
pub use net_core::{Inbound, NetCore, NetCoreConfig, NetError, RESP_TIMEOUT};
pub use node::{Node, NodeError, NodeId};
pub use peer::{ConnInfo, Peer, PeerError, PeerManager, PeerManagerConfig, SendList, SendPriority};
pub use server::{MessageHandler, Server, ServerError};
pub use stats::{CountStatistics, FlowItem, FlowMeter};
