//! Application facade
//!
//! [`Server`] is what the consensus and chain layers talk to. It serialises
//! [`Message`]s, maps each call onto a [`NetCore`] send primitive, and routes
//! inbound payloads to the registered handler by code range.

use crate::network::message::{BizMessageId, Message};
use crate::network::net_core::{Inbound, NetCore, NetCoreConfig, NetError};
use crate::network::node::NodeId;
use crate::network::peer::ConnInfo;
use crate::transport::TransportProvider;
use rand::Rng;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Handlers slower than this are logged
const SLOW_HANDLE_THRESHOLD: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Group members are empty")]
    EmptyGroup,
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Network error: {0}")]
    Net(#[from] NetError),
}

/// Receives messages for one code range
pub trait MessageHandler: Send + Sync {
    fn handle(&self, from: NodeId, message: Message);
}

/// Network entry point for the upper layers
pub struct Server {
    core: Arc<NetCore>,
    consensus_handler: Arc<dyn MessageHandler>,
    chain_handler: Arc<dyn MessageHandler>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    pub fn new(
        config: NetCoreConfig,
        transport: Arc<dyn TransportProvider>,
        consensus_handler: Arc<dyn MessageHandler>,
        chain_handler: Arc<dyn MessageHandler>,
    ) -> Result<Arc<Self>, ServerError> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let core = NetCore::new(config, transport, inbound_tx)?;
        Ok(Arc::new(Self {
            core,
            consensus_handler,
            chain_handler,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            dispatcher: Mutex::new(None),
        }))
    }

    /// Start the core and the inbound dispatcher
    pub fn start(self: &Arc<Self>) -> Result<(), ServerError> {
        self.core.start()?;

        let rx = match self.inbound_rx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(mut rx) = rx {
            let server = self.clone();
            let handle = tokio::spawn(async move {
                while let Some(inbound) = rx.recv().await {
                    server.handle_inbound(inbound);
                }
            });
            if let Ok(mut dispatcher) = self.dispatcher.lock() {
                *dispatcher = Some(handle);
            }
        }
        Ok(())
    }

    pub fn close(&self) {
        self.core.close();
        if let Ok(mut dispatcher) = self.dispatcher.lock() {
            if let Some(handle) = dispatcher.take() {
                handle.abort();
            }
        }
    }

    pub fn core(&self) -> &Arc<NetCore> {
        &self.core
    }

    pub fn id(&self) -> NodeId {
        self.core.id()
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Unicast; a message to ourselves never touches the network
    pub fn send(&self, to: NodeId, msg: &Message) -> Result<(), ServerError> {
        let bytes = msg.to_bytes()?;
        if to == self.core.id() {
            self.handle_message(to, &bytes);
            return Ok(());
        }
        self.core.send(to, None, &bytes, msg.code)?;
        Ok(())
    }

    /// Unicast to a group member, through the group overlay if needed
    pub fn send_to_group_member(&self, group_id: &str, to: NodeId, msg: &Message) -> Result<(), ServerError> {
        let bytes = msg.to_bytes()?;
        self.core.send_group_member(group_id, &bytes, msg.code, to)?;
        Ok(())
    }

    /// Flood inside a group we belong to
    pub fn send_to_group(&self, group_id: &str, msg: &Message) -> Result<(), ServerError> {
        let bytes = msg.to_bytes()?;
        self.core.send_group(group_id, &bytes, msg.code, true, -1)?;
        Ok(())
    }

    /// Group broadcast that stops after one extra hop
    pub fn random_spread_in_group(&self, group_id: &str, msg: &Message) -> Result<(), ServerError> {
        let bytes = msg.to_bytes()?;
        self.core.send_group(group_id, &bytes, msg.code, true, 1)?;
        Ok(())
    }

    /// Enter a foreign group at a random member
    pub fn spread_to_random_group_member(
        &self,
        group_id: &str,
        members: &[NodeId],
        msg: &Message,
    ) -> Result<(), ServerError> {
        if members.is_empty() {
            log::error!("group members is empty, group: {}", group_id);
            return Err(ServerError::EmptyGroup);
        }
        let bytes = msg.to_bytes()?;
        let entrance = rand::thread_rng().gen_range(0..members.len());
        log::debug!(
            "spread to random group member, group: {} members: {} index: {}",
            group_id,
            members.len(),
            entrance
        );
        self.core
            .group_broadcast_with_members(group_id, &bytes, msg.code, None, &members[entrance..], 1)?;
        Ok(())
    }

    /// Flood into a group we may not belong to; `digest` dedups the payload
    /// across envelopes
    pub fn spread_to_group(
        &self,
        group_id: &str,
        members: &[NodeId],
        msg: &Message,
        digest: Option<BizMessageId>,
    ) -> Result<(), ServerError> {
        let bytes = msg.to_bytes()?;
        log::debug!(
            "spread to group: {} code: {} size: {}",
            group_id,
            msg.code,
            bytes.len()
        );
        self.core
            .group_broadcast_with_members(group_id, &bytes, msg.code, digest, members, -1)?;
        Ok(())
    }

    /// One copy to each connected neighbour, not re-flooded
    pub fn transmit_to_neighbor(&self, msg: &Message) -> Result<(), ServerError> {
        let bytes = msg.to_bytes()?;
        self.core.send_all(&bytes, msg.code, false, None, -1)?;
        Ok(())
    }

    /// Epidemic relay limited to `relay_count` hops
    pub fn relay_broadcast(&self, msg: &Message, relay_count: i32) -> Result<(), ServerError> {
        let bytes = msg.to_bytes()?;
        self.core.broadcast_random(&bytes, msg.code, relay_count)?;
        Ok(())
    }

    /// Flood to the whole network
    pub fn broadcast(&self, msg: &Message) -> Result<(), ServerError> {
        let bytes = msg.to_bytes()?;
        self.core.send_all(&bytes, msg.code, true, None, -1)?;
        Ok(())
    }

    // =========================================================================
    // Groups & info
    // =========================================================================

    pub fn connection_info(&self) -> Vec<ConnInfo> {
        self.core.peer_manager().connection_info()
    }

    pub fn build_group(&self, group_id: &str, members: &[NodeId]) {
        self.core.build_group(group_id, members);
    }

    pub fn remove_group(&self, group_id: &str) {
        self.core.remove_group(group_id);
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    fn handle_inbound(&self, inbound: Inbound) {
        let from = inbound.from;
        if let Some(message) = self.decode_message(from, &inbound.data) {
            self.dispatch(from, message, Some(inbound));
        }
    }

    fn handle_message(&self, from: NodeId, data: &[u8]) {
        if let Some(message) = self.decode_message(from, data) {
            self.dispatch(from, message, None);
        }
    }

    fn decode_message(&self, from: NodeId, data: &[u8]) -> Option<Message> {
        let mut message = match Message::from_bytes(data) {
            Ok(message) => message,
            Err(e) => {
                log::error!("message decode error from {}: {}", from, e);
                return None;
            }
        };
        if let Some(peer) = self.core.peer_manager().peer_by_id(&from) {
            let st = peer.lock();
            message.chain_id = st.chain_id;
            message.protocol_version = st.protocol_version;
        }
        log::debug!(
            "receive message from {} code: {} size: {}",
            from,
            message.code,
            data.len()
        );
        self.core
            .statistics()
            .add_count("server.handle_message", message.code, data.len());
        Some(message)
    }

    /// Run the handler off the dispatcher task; `inbound` is held until the
    /// handler returns so the unhandled counter stays accurate
    fn dispatch(&self, from: NodeId, message: Message, inbound: Option<Inbound>) {
        let handler = if message.is_consensus() {
            self.consensus_handler.clone()
        } else {
            self.chain_handler.clone()
        };
        tokio::spawn(async move {
            let begin = Instant::now();
            let code = message.code;
            handler.handle(from, message);
            if begin.elapsed() > SLOW_HANDLE_THRESHOLD {
                log::debug!("handle message cost: {:?} code: {}", begin.elapsed(), code);
            }
            drop(inbound);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::codes;
    use crate::network::node::Node;
    use crate::transport::MemoryNetwork;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(NodeId, Message)>>,
    }

    impl MessageHandler for Recorder {
        fn handle(&self, from: NodeId, message: Message) {
            self.seen.lock().unwrap().push((from, message));
        }
    }

    impl Recorder {
        fn codes(&self) -> Vec<u32> {
            self.seen.lock().unwrap().iter().map(|(_, m)| m.code).collect()
        }
    }

    struct TestServer {
        server: Arc<Server>,
        consensus: Arc<Recorder>,
        chain: Arc<Recorder>,
    }

    fn start_server(net: &MemoryNetwork, port: u16) -> TestServer {
        let addr = format!("127.0.0.1:{}", port).parse().unwrap();
        let mut config = NetCoreConfig::new(NodeId::random(), addr);
        config.chain_id = 1;
        config.protocol_version = 1;
        let consensus = Arc::new(Recorder::default());
        let chain = Arc::new(Recorder::default());
        let server = Server::new(config, Arc::new(net.transport()), consensus.clone(), chain.clone()).unwrap();
        server.start().unwrap();
        TestServer {
            server,
            consensus,
            chain,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_send_to_self_is_local() {
        let net = MemoryNetwork::new();
        let node = start_server(&net, 8000);
        let id = node.server.id();

        node.server.send(id, &Message::new(codes::NEW_BLOCK, vec![1, 2])).unwrap();
        node.server.send(id, &Message::new(codes::KEY_PIECE, vec![3])).unwrap();
        settle().await;

        assert_eq!(node.chain.codes(), vec![codes::NEW_BLOCK]);
        assert_eq!(node.consensus.codes(), vec![codes::KEY_PIECE]);
        assert_eq!(node.server.core().flow_meter().get(codes::NEW_BLOCK).send_count, 0);
        node.server.close();
    }

    #[tokio::test]
    async fn test_unicast_dispatch_by_code_range() {
        let net = MemoryNetwork::new();
        let a = start_server(&net, 8100);
        let b = start_server(&net, 8101);
        let b_node = Node::with_addr(b.server.id(), "127.0.0.1:8101".parse().unwrap());
        a.server.core().ping_wait(&b_node).await.unwrap();

        a.server
            .send(b.server.id(), &Message::new(codes::CAST_VERIFY, b"cast".to_vec()))
            .unwrap();
        a.server
            .send(b.server.id(), &Message::new(codes::REQ_BLOCK, b"h".to_vec()))
            .unwrap();
        settle().await;

        let consensus = b.consensus.seen.lock().unwrap().clone();
        assert_eq!(consensus.len(), 1);
        assert_eq!(consensus[0].0, a.server.id());
        assert_eq!(consensus[0].1.body, b"cast".to_vec());
        assert_eq!(consensus[0].1.chain_id, 1);
        assert_eq!(b.chain.codes(), vec![codes::REQ_BLOCK]);
        assert_eq!(
            b.server
                .core()
                .statistics()
                .get("server.handle_message", codes::REQ_BLOCK)
                .0,
            1
        );
        assert_eq!(b.server.core().unhandled_count(), 0);
        a.server.close();
        b.server.close();
    }

    #[tokio::test]
    async fn test_group_flood_reaches_members() {
        let net = MemoryNetwork::new();
        let nodes: Vec<TestServer> = (0..4).map(|i| start_server(&net, 8200 + i)).collect();
        let members: Vec<NodeId> = nodes.iter().map(|n| n.server.id()).collect();

        // members learn each other's endpoints
        for (i, a) in nodes.iter().enumerate() {
            for (j, b) in nodes.iter().enumerate() {
                if i != j {
                    let addr = format!("127.0.0.1:{}", 8200 + j).parse().unwrap();
                    a.server.core().kad().add(Node::with_addr(b.server.id(), addr));
                }
            }
        }
        for node in &nodes {
            node.server.build_group("g1", &members);
        }
        settle().await;

        nodes[0]
            .server
            .send_to_group("g1", &Message::new(codes::CURRENT_GROUP_CAST, b"x".to_vec()))
            .unwrap();
        settle().await;

        assert!(nodes[0].consensus.codes().is_empty());
        for node in &nodes[1..] {
            assert_eq!(node.consensus.codes(), vec![codes::CURRENT_GROUP_CAST]);
        }
        for node in &nodes {
            node.server.close();
        }
    }

    #[tokio::test]
    async fn test_spread_to_random_member_rejects_empty() {
        let net = MemoryNetwork::new();
        let node = start_server(&net, 8300);
        let result = node
            .server
            .spread_to_random_group_member("g", &[], &Message::new(codes::NEW_BLOCK, vec![]));
        assert!(matches!(result, Err(ServerError::EmptyGroup)));
        node.server.close();
    }

    #[tokio::test]
    async fn test_connection_info_and_groups() {
        let net = MemoryNetwork::new();
        let a = start_server(&net, 8400);
        let b = start_server(&net, 8401);
        let b_node = Node::with_addr(b.server.id(), "127.0.0.1:8401".parse().unwrap());
        a.server.core().ping_wait(&b_node).await.unwrap();

        let info = a.server.connection_info();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].id, b.server.id());
        assert_eq!(info[0].port, 8401);

        a.server.build_group("g", &[a.server.id(), b.server.id()]);
        assert_eq!(a.server.core().group_manager().group_count(), 1);
        a.server.remove_group("g");
        assert_eq!(a.server.core().group_manager().group_count(), 0);
        a.server.close();
        b.server.close();
    }
}
