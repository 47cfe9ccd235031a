//! Networking core
//!
//! [`NetCore`] ties the pieces together. It owns the transport, the peer
//! table, the Kademlia table and the group overlays; it encodes and decodes
//! frames, correlates RPC replies, and decides for every inbound data
//! envelope whether to deliver it locally and whether to relay it onward.
//!
//! # Tasks
//! [`NetCore::start`] spawns:
//! - the pending loop: reply correlation, RPC timeouts and periodic
//!   housekeeping (message cache, flow report, group refresh)
//! - the transport event loop
//! - the decode loop, which drains peers that received bytes
//! - the Kademlia maintenance loop

use crate::network::buffer_pool::BufferPool;
use crate::network::codec::{Frame, PacketCodec, MAX_PACKET_SIZE, PACKET_HEAD_SIZE};
use crate::network::group::{Group, GroupLink, GroupManager, GroupRoute, GROUP_REFRESH_INTERVAL};
use crate::network::kad::{Kad, KadRpc, BUCKET_SIZE};
use crate::network::message::{
    expiration_after, is_expired, BizMessageId, DataType, MessageType, MsgData, MsgFindNode,
    MsgNeighbors, MsgPing, MsgRelay, Packet, RpcEndPoint, RpcNode, MESSAGE_EXPIRATION, VERSION,
};
use crate::network::message_manager::{MessageManager, CLEAR_MESSAGE_CACHE_INTERVAL};
use crate::network::node::{Node, NodeId};
use crate::network::peer::{Peer, PeerManager, PeerManagerConfig};
use crate::network::stats::{CountStatistics, FlowMeter, FLOW_METER_INTERVAL};
use crate::transport::{TransportError, TransportEvent, TransportProvider, NAT_TYPE_UNKNOWN};
use bytes::BytesMut;
use futures::future::BoxFuture;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::codec::{Decoder, Encoder};

// =============================================================================
// Constants
// =============================================================================

/// How long an RPC waits for its reply
pub const RESP_TIMEOUT: Duration = Duration::from_millis(500);

/// Delivered but not yet handled data messages before new ones are dropped
pub const MAX_UNHANDLED_MESSAGE_COUNT: usize = 10000;

/// Relay server used when NAT traversal is on and none is configured
pub const DEFAULT_NAT_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(119, 23, 205, 254));
pub const DEFAULT_NAT_PORT: u16 = 80;

/// Neighbours advertising a port at or below this are ignored
const MIN_NEIGHBOR_PORT: u16 = 1024;

/// Envelopes entering a foreign group go through this many members
const GROUP_ENTRANCE_COUNT: usize = 1;

// =============================================================================
// Errors
// =============================================================================

#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request timed out")]
    Timeout,
    #[error("Unknown node")]
    UnknownNode,
    #[error("Message expired")]
    Expired,
    #[error("Bad packet")]
    BadPacket,
    #[error("Packet too small")]
    PacketTooSmall,
    #[error("Unknown packet type: {0}")]
    UnknownType(u32),
    #[error("Network closed")]
    Closed,
    #[error("Bad bootstrap node: {0}")]
    BadBootstrap(String),
    #[error("Codec error: {0}")]
    Codec(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

// =============================================================================
// Config
// =============================================================================

#[derive(Debug, Clone)]
pub struct NetCoreConfig {
    pub id: NodeId,
    pub listen_addr: SocketAddr,
    pub seeds: Vec<Node>,
    pub nat_traversal_enable: bool,
    pub nat_ip: IpAddr,
    pub nat_port: u16,
    pub chain_id: u16,
    pub protocol_version: u16,
}

impl NetCoreConfig {
    pub fn new(id: NodeId, listen_addr: SocketAddr) -> Self {
        Self {
            id,
            listen_addr,
            seeds: Vec::new(),
            nat_traversal_enable: false,
            nat_ip: DEFAULT_NAT_IP,
            nat_port: DEFAULT_NAT_PORT,
            chain_id: 0,
            protocol_version: 0,
        }
    }
}

// =============================================================================
// Delivery
// =============================================================================

/// Decrements the unhandled-message counter when dropped
pub struct InflightGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A data payload addressed to this node.
///
/// The unhandled counter is released when this value is dropped, so the
/// consumer should hold it until it is done with the payload.
pub struct Inbound {
    pub from: NodeId,
    pub code: u32,
    pub data: Vec<u8>,
    _guard: InflightGuard,
}

// =============================================================================
// Pending RPCs
// =============================================================================

type ReplyCallback = Box<dyn FnMut(&Packet) -> bool + Send>;

struct Pending {
    from: NodeId,
    ptype: MessageType,
    deadline: Instant,
    /// Returns true once the reply completes the request
    callback: ReplyCallback,
    done: Option<oneshot::Sender<Result<(), NetError>>>,
}

impl Pending {
    fn finish(&mut self, result: Result<(), NetError>) {
        if let Some(done) = self.done.take() {
            let _ = done.send(result);
        }
    }
}

struct Reply {
    from: NodeId,
    ptype: MessageType,
    packet: Packet,
}

/// Registration and reply share one channel so a reply can never overtake
/// the pending it answers
enum LoopEvent {
    AddPending(Pending),
    Reply(Reply),
}

// =============================================================================
// NetCore
// =============================================================================

pub struct NetCore {
    me: Weak<NetCore>,
    id: NodeId,
    net_id: u64,
    config: NetCoreConfig,
    our_endpoint: Mutex<RpcEndPoint>,
    nat_type: AtomicU32,

    transport: Arc<dyn TransportProvider>,
    pool: Arc<BufferPool>,
    flow_meter: Arc<FlowMeter>,
    statistics: CountStatistics,
    message_manager: MessageManager,
    peer_manager: PeerManager,
    group_manager: GroupManager,
    kad: Arc<Kad>,

    loop_tx: mpsc::UnboundedSender<LoopEvent>,
    loop_rx: Mutex<Option<mpsc::UnboundedReceiver<LoopEvent>>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    unhandled_tx: mpsc::UnboundedSender<Arc<Peer>>,
    unhandled_rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<Peer>>>>,
    deliver_tx: mpsc::UnboundedSender<Inbound>,
    unhandled_count: Arc<AtomicUsize>,
    shutdown: watch::Sender<bool>,
}

/// Kademlia RPCs backed by the core
struct NetRpc {
    core: OnceLock<Weak<NetCore>>,
}

impl NetRpc {
    fn core(&self) -> Option<Arc<NetCore>> {
        self.core.get().and_then(|weak| weak.upgrade())
    }
}

impl KadRpc for NetRpc {
    fn ping(&self, node: &Node) {
        if let Some(core) = self.core() {
            core.ping(node.id, node.addr());
        }
    }

    fn ping_wait(&self, node: &Node) -> BoxFuture<'static, Result<(), NetError>> {
        match self.core() {
            Some(core) => core.ping_wait(node),
            None => Box::pin(async { Err(NetError::Closed) }),
        }
    }

    fn find_node(&self, node: &Node, target: NodeId) -> BoxFuture<'static, Result<Vec<Node>, NetError>> {
        match self.core() {
            Some(core) => core.find_node(node, target),
            None => Box::pin(async { Err(NetError::Closed) }),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl NetCore {
    /// Build the core and register with the transport. Nothing runs until
    /// [`NetCore::start`].
    pub fn new(
        config: NetCoreConfig,
        transport: Arc<dyn TransportProvider>,
        deliver_tx: mpsc::UnboundedSender<Inbound>,
    ) -> Result<Arc<Self>, NetError> {
        let id = config.id;
        let net_id = id.net_id();
        log::info!("kad id: {}", id);
        log::info!("net id: {}", net_id);

        let rpc = Arc::new(NetRpc {
            core: OnceLock::new(),
        });
        let self_node = Node::with_addr(id, config.listen_addr);
        let kad = Kad::new(self_node, config.seeds.clone(), rpc.clone())?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        transport.configure(net_id, events_tx)?;

        let (loop_tx, loop_rx) = mpsc::unbounded_channel();
        let (unhandled_tx, unhandled_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let pool = Arc::new(BufferPool::new());
        let flow_meter = Arc::new(FlowMeter::new("p2p"));

        let nat_server = config
            .nat_traversal_enable
            .then(|| SocketAddr::new(config.nat_ip, config.nat_port));
        let peer_manager = PeerManager::new(
            transport.clone(),
            pool.clone(),
            flow_meter.clone(),
            PeerManagerConfig {
                chain_id: config.chain_id,
                protocol_version: config.protocol_version,
                nat_server,
            },
        );

        let core = Arc::new_cyclic(|me: &Weak<NetCore>| {
            let link: Weak<dyn GroupLink> = me.clone();
            NetCore {
                me: me.clone(),
                id,
                net_id,
                our_endpoint: Mutex::new(RpcEndPoint::from_addr(Some(config.listen_addr))),
                nat_type: AtomicU32::new(NAT_TYPE_UNKNOWN),
                transport,
                pool: pool.clone(),
                flow_meter,
                statistics: CountStatistics::new(),
                message_manager: MessageManager::new(id),
                peer_manager,
                group_manager: GroupManager::new(link, pool),
                kad,
                loop_tx,
                loop_rx: Mutex::new(Some(loop_rx)),
                events_rx: Mutex::new(Some(events_rx)),
                unhandled_tx,
                unhandled_rx: Mutex::new(Some(unhandled_rx)),
                deliver_tx,
                unhandled_count: Arc::new(AtomicUsize::new(0)),
                shutdown,
                config,
            }
        });
        let _ = rpc.core.set(Arc::downgrade(&core));
        Ok(core)
    }

    /// Listen and spawn the background tasks
    pub fn start(self: &Arc<Self>) -> Result<(), NetError> {
        if self.config.nat_traversal_enable {
            log::info!("listen via relay {}:{}", self.config.nat_ip, self.config.nat_port);
            self.transport
                .listen_via_relay(self.config.nat_ip, self.config.nat_port)?;
        } else {
            log::info!("listen on {}", self.config.listen_addr);
            self.transport
                .listen_direct(self.config.listen_addr.ip(), self.config.listen_addr.port())?;
        }

        let loop_rx = lock(&self.loop_rx).take();
        let events_rx = lock(&self.events_rx).take();
        let unhandled_rx = lock(&self.unhandled_rx).take();
        let (Some(loop_rx), Some(events_rx), Some(unhandled_rx)) = (loop_rx, events_rx, unhandled_rx)
        else {
            log::warn!("net core already started");
            return Ok(());
        };

        let core = self.clone();
        let shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move { core.run_loop(loop_rx, shutdown_rx).await });
        let core = self.clone();
        let shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move { core.run_events(events_rx, shutdown_rx).await });
        let core = self.clone();
        let shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move { core.run_decode(unhandled_rx, shutdown_rx).await });

        self.kad.start();
        Ok(())
    }

    /// Stop everything; pending RPCs fail with [`NetError::Closed`]
    pub fn close(&self) {
        log::info!("net core closing");
        self.shutdown.send_replace(true);
        self.kad.close();
        self.transport.close();
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn net_id(&self) -> u64 {
        self.net_id
    }

    pub fn chain_id(&self) -> u16 {
        self.config.chain_id
    }

    pub fn protocol_version(&self) -> u16 {
        self.config.protocol_version
    }

    pub fn nat_type(&self) -> u32 {
        self.nat_type.load(Ordering::SeqCst)
    }

    pub fn our_endpoint(&self) -> RpcEndPoint {
        lock(&self.our_endpoint).clone()
    }

    pub fn kad(&self) -> &Arc<Kad> {
        &self.kad
    }

    pub fn peer_manager(&self) -> &PeerManager {
        &self.peer_manager
    }

    pub fn group_manager(&self) -> &GroupManager {
        &self.group_manager
    }

    pub fn message_manager(&self) -> &MessageManager {
        &self.message_manager
    }

    pub fn flow_meter(&self) -> &FlowMeter {
        &self.flow_meter
    }

    pub fn statistics(&self) -> &CountStatistics {
        &self.statistics
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn unhandled_count(&self) -> usize {
        self.unhandled_count.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Background tasks
    // =========================================================================

    async fn run_loop(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<LoopEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let start = Instant::now();
        let mut clear_cache = tokio::time::interval_at(
            start + CLEAR_MESSAGE_CACHE_INTERVAL,
            CLEAR_MESSAGE_CACHE_INTERVAL,
        );
        let mut flow_report = tokio::time::interval_at(start + FLOW_METER_INTERVAL, FLOW_METER_INTERVAL);
        let mut group_refresh =
            tokio::time::interval_at(start + GROUP_REFRESH_INTERVAL, GROUP_REFRESH_INTERVAL);
        let mut pendings: Vec<Pending> = Vec::new();

        loop {
            let next_deadline = pendings.iter().map(|p| p.deadline).min();
            let timeout = async move {
                match next_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                event = rx.recv() => match event {
                    Some(LoopEvent::AddPending(pending)) => pendings.push(pending),
                    Some(LoopEvent::Reply(reply)) => {
                        let matched = Self::match_reply(&mut pendings, &reply);
                        if !matched && reply.ptype == MessageType::Neighbors {
                            log::debug!("unsolicited neighbors from {}", reply.from);
                        }
                    }
                    None => break,
                },
                _ = timeout => {
                    let now = Instant::now();
                    pendings.retain_mut(|p| {
                        if p.deadline <= now {
                            p.finish(Err(NetError::Timeout));
                            false
                        } else {
                            true
                        }
                    });
                }
                _ = clear_cache.tick() => self.message_manager.clear(),
                _ = flow_report.tick() => {
                    self.flow_meter.print();
                    self.flow_meter.reset();
                    self.peer_manager.check_peers();
                    self.pool.print();
                }
                _ = group_refresh.tick() => self.group_manager.do_refresh(),
                _ = shutdown_rx.wait_for(|stop| *stop) => break,
            }
        }

        for mut pending in pendings.drain(..) {
            pending.finish(Err(NetError::Closed));
        }
        log::info!("net core loop stopped");
    }

    fn match_reply(pendings: &mut Vec<Pending>, reply: &Reply) -> bool {
        let mut matched = false;
        pendings.retain_mut(|p| {
            if p.from != reply.from || p.ptype != reply.ptype {
                return true;
            }
            matched = true;
            if (p.callback)(&reply.packet) {
                p.finish(Ok(()));
                return false;
            }
            true
        });
        matched
    }

    async fn run_events(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.on_transport_event(event),
                    None => break,
                },
                _ = shutdown_rx.wait_for(|stop| *stop) => break,
            }
        }
    }

    fn on_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Received { net_id, session, data } => {
                let peer = self.peer_manager.add_recv_data(net_id, session, &data);
                let _ = self.unhandled_tx.send(peer);
            }
            TransportEvent::Connected { net_id, session } => self.on_connected(net_id, session, false),
            TransportEvent::Accepted { net_id, session } => self.on_connected(net_id, session, true),
            TransportEvent::Disconnected { net_id, session } => {
                self.peer_manager.on_disconnected(net_id, session)
            }
            TransportEvent::SendQueueDrained { net_id, .. } => self.peer_manager.on_send_waited(net_id),
            TransportEvent::NatTypeChecked {
                nat_type,
                private_ip,
                public_ip,
            } => self.on_checked(nat_type, private_ip, public_ip),
        }
    }

    fn on_connected(&self, net_id: u64, session: u32, accepted: bool) {
        if let Some(id) = self.peer_manager.new_connection(net_id, session, accepted) {
            self.ping(id, None);
        }
    }

    fn on_checked(&self, nat_type: u32, private_ip: Option<IpAddr>, public_ip: Option<IpAddr>) {
        log::info!(
            "nat checked, type: {} public ip: {:?} private ip: {:?}",
            nat_type,
            public_ip,
            private_ip
        );
        self.nat_type.store(nat_type, Ordering::SeqCst);
        if let Some(ip) = public_ip {
            let port = self.config.listen_addr.port();
            *lock(&self.our_endpoint) = RpcEndPoint::from_addr(Some(SocketAddr::new(ip, port)));
        }
    }

    async fn run_decode(
        self: Arc<Self>,
        mut unhandled: mpsc::UnboundedReceiver<Arc<Peer>>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                peer = unhandled.recv() => match peer {
                    Some(peer) => self.drain_peer(&peer),
                    None => break,
                },
                _ = shutdown_rx.wait_for(|stop| *stop) => break,
            }
        }
    }

    /// Handle every complete frame buffered on `peer`
    fn drain_peer(&self, peer: &Arc<Peer>) {
        while !peer.is_empty() {
            match self.handle_message(peer) {
                Ok(()) => {}
                Err(NetError::PacketTooSmall) | Err(NetError::BadPacket) => break,
                Err(e) => log::debug!("handle message from {} failed: {}", peer.id(), e),
            }
        }
    }

    // =========================================================================
    // Decoding
    // =========================================================================

    /// Pull one frame out of the peer's receive queue.
    ///
    /// Fragments are joined until a whole frame is present; leftover bytes go
    /// back to the head of the queue. An oversized header discards everything
    /// buffered for the peer.
    fn decode_packet(&self, peer: &Peer) -> Result<Frame, NetError> {
        let Some(mut buf) = peer.pop_data() else {
            return Err(NetError::PacketTooSmall);
        };

        loop {
            if let Some((_, len)) = PacketCodec::peek_header(&buf) {
                let packet_size = len + PACKET_HEAD_SIZE;
                if packet_size > MAX_PACKET_SIZE {
                    log::info!("bad packet from {}, size {}, reset data", peer.id(), packet_size);
                    self.pool.free_buffer(buf);
                    peer.reset_data(&self.pool);
                    return Err(NetError::BadPacket);
                }
                if buf.len() >= packet_size {
                    break;
                }
            }
            match peer.pop_data() {
                Some(next) => {
                    buf.extend_from_slice(&next);
                    self.pool.free_buffer(next);
                }
                None => {
                    peer.push_front(buf);
                    return Err(NetError::PacketTooSmall);
                }
            }
        }

        let result = PacketCodec.decode(&mut buf);
        if buf.is_empty() {
            self.pool.free_buffer(buf);
        } else {
            peer.push_front(buf);
        }
        result?.ok_or(NetError::PacketTooSmall)
    }

    fn handle_message(&self, peer: &Peer) -> Result<(), NetError> {
        let frame = self.decode_packet(peer)?;
        let from = peer.id();
        let size = frame.size();

        match frame.packet {
            Packet::Ping(ping) => {
                self.flow_meter.recv(MessageType::Ping.control_code(), size);
                if ping.node_id != from {
                    peer.set_id(ping.node_id);
                }
                self.handle_ping(peer, ping)
            }
            Packet::FindNode(req) => {
                self.flow_meter.recv(MessageType::FindNode.control_code(), size);
                self.handle_find_node(from, req)
            }
            Packet::Neighbors(resp) => {
                self.flow_meter.recv(MessageType::Neighbors.control_code(), size);
                self.handle_neighbors(from, resp)
            }
            Packet::RelayTest(req) => {
                self.flow_meter.recv(MessageType::RelayTest.control_code(), size);
                self.handle_relay_test(from, req)
            }
            Packet::RelayNode(req) => {
                self.flow_meter.recv(MessageType::RelayNode.control_code(), size);
                self.handle_relay_node(from, req)
            }
            Packet::Data(data) => self.handle_data(data, frame.raw, from),
        }
    }

    // =========================================================================
    // Control messages
    // =========================================================================

    fn offer_reply(&self, from: NodeId, packet: Packet) {
        let ptype = packet.message_type();
        let _ = self.loop_tx.send(LoopEvent::Reply(Reply { from, ptype, packet }));
    }

    fn add_pending(&self, from: NodeId, ptype: MessageType, callback: ReplyCallback) -> oneshot::Receiver<Result<(), NetError>> {
        let (done, rx) = oneshot::channel();
        let pending = Pending {
            from,
            ptype,
            deadline: Instant::now() + RESP_TIMEOUT,
            callback,
            done: Some(done),
        };
        if let Err(mpsc::error::SendError(event)) = self.loop_tx.send(LoopEvent::AddPending(pending)) {
            if let LoopEvent::AddPending(mut pending) = event {
                pending.finish(Err(NetError::Closed));
            }
        }
        rx
    }

    fn handle_ping(&self, peer: &Peer, ping: MsgPing) -> Result<(), NetError> {
        if is_expired(ping.expiration) {
            return Err(NetError::Expired);
        }
        let from = ping.node_id;
        let endpoint = ping.from.to_addr();
        log::info!("[ping] id: {} addr: {:?} reply: {}", from, endpoint, ping.reply);

        peer.set_chain_info(ping.chain_id, ping.protocol_version);
        if let Some(addr) = endpoint {
            peer.set_addr(addr);
            self.kad.on_ping_node(Node::with_addr(from, addr));
        }
        peer.lock().pinged = true;

        let reply = ping.reply;
        self.offer_reply(from, Packet::Ping(ping));
        if !reply {
            self.send_ping(from, None, true);
        }
        Ok(())
    }

    fn handle_find_node(&self, from: NodeId, req: MsgFindNode) -> Result<(), NetError> {
        if is_expired(req.expiration) {
            return Err(NetError::Expired);
        }
        if !from.is_valid() {
            return Err(NetError::UnknownNode);
        }

        let closest = self.kad.closest(&req.target.sha(), BUCKET_SIZE);
        let nodes = closest
            .entries
            .iter()
            .filter(|n| n.addr().is_some())
            .map(RpcNode::from_node)
            .collect();
        let resp = MsgNeighbors {
            nodes,
            expiration: expiration_after(MESSAGE_EXPIRATION),
        };
        self.send_message(from, None, &Packet::Neighbors(resp));
        Ok(())
    }

    fn handle_neighbors(&self, from: NodeId, resp: MsgNeighbors) -> Result<(), NetError> {
        if is_expired(resp.expiration) {
            return Err(NetError::Expired);
        }
        self.offer_reply(from, Packet::Neighbors(resp));
        Ok(())
    }

    fn handle_relay_test(&self, from: NodeId, req: MsgRelay) -> Result<(), NetError> {
        let reachable = self
            .peer_manager
            .peer_by_id(&req.node_id)
            .map(|p| p.is_connected())
            .unwrap_or(false);
        if reachable {
            log::info!("[relay] relay test for {} answered yes", req.node_id);
            self.send_message(from, None, &Packet::RelayNode(req));
        }
        Ok(())
    }

    fn handle_relay_node(&self, from: NodeId, req: MsgRelay) -> Result<(), NetError> {
        if let Some(peer) = self.peer_manager.peer_by_id(&req.node_id) {
            log::info!("[relay] {} reachable via {}", req.node_id, from);
            peer.set_relay(from);
        }
        Ok(())
    }

    /// Route a data envelope: deliver, dedup, relay
    fn handle_data(&self, mut data: MsgData, raw: BytesMut, from: NodeId) -> Result<(), NetError> {
        log::debug!(
            "data from: {} src: {} len: {} type: {:?} message id: {:X} relay count: {} code: {}",
            from,
            data.src_node_id,
            data.data.len(),
            data.data_type,
            data.message_id,
            data.relay_count,
            data.message_code
        );
        self.statistics
            .add_count("net.handle_data", data.data_type.as_code(), data.data.len());

        if is_expired(data.expiration) {
            return Err(NetError::Expired);
        }

        if data.data_type == DataType::Normal {
            match data.dest_node_id {
                Some(dest) if dest.is_valid() && dest != self.id => {
                    log::debug!("[relay] forward message {:X} to {}", data.message_id, dest);
                    self.peer_manager.write(dest, None, &raw, data.message_code, false);
                }
                _ => self.deliver(data.src_node_id, data.message_code, data.data),
            }
            return Ok(());
        }

        if !self
            .message_manager
            .accept(data.message_id, data.biz_message_id.as_ref())
        {
            return Ok(());
        }

        let for_me = data.dest_node_id.map(|d| d == self.id).unwrap_or(true);
        let rebroadcast = data.dest_node_id != Some(self.id) && data.relay_count != 0;
        let code = data.message_code;
        if for_me {
            self.deliver(data.src_node_id, code, data.data.clone());
        }
        if !rebroadcast {
            return Ok(());
        }

        let packet = if data.relay_count > 0 {
            data.relay_count -= 1;
            data.expiration = expiration_after(MESSAGE_EXPIRATION);
            self.encode_packet(&Packet::Data(data.clone()))?
        } else {
            raw
        };
        log::debug!(
            "forward message type: {:?} id: {:X} relay count: {}",
            data.data_type,
            data.message_id,
            data.relay_count
        );

        match data.data_type {
            DataType::Group => {
                self.group_manager.send_group(&data.group_id, &packet, code);
            }
            DataType::Global => self.peer_manager.send_all(&packet, code),
            DataType::GlobalRandom => {
                self.peer_manager
                    .broadcast_random(&packet, code, |id| self.kad.contains(id))
            }
            DataType::Normal => {}
        }
        Ok(())
    }

    fn deliver(&self, from: NodeId, code: u32, data: Vec<u8>) {
        if self.unhandled_count.load(Ordering::SeqCst) >= MAX_UNHANDLED_MESSAGE_COUNT {
            log::error!("unhandled message too much, drop message code: {}", code);
            return;
        }
        self.unhandled_count.fetch_add(1, Ordering::SeqCst);
        self.flow_meter.recv(code, data.len());
        let inbound = Inbound {
            from,
            code,
            data,
            _guard: InflightGuard {
                counter: self.unhandled_count.clone(),
            },
        };
        if self.deliver_tx.send(inbound).is_err() {
            log::debug!("no consumer for inbound message code: {}", code);
        }
    }

    // =========================================================================
    // Encoding
    // =========================================================================

    pub fn encode_packet(&self, packet: &Packet) -> Result<BytesMut, NetError> {
        let mut buf = BytesMut::new();
        PacketCodec.encode(packet, &mut buf)?;
        Ok(buf)
    }

    /// Wrap an application payload in a fresh data envelope
    #[allow(clippy::too_many_arguments)]
    pub fn encode_data_packet(
        &self,
        data: &[u8],
        data_type: DataType,
        code: u32,
        group_id: &str,
        dest: Option<NodeId>,
        biz_id: Option<BizMessageId>,
        relay_count: i32,
    ) -> Result<BytesMut, NetError> {
        let message_id = self.message_manager.gen_message_id();
        if let Some(biz) = biz_id {
            self.message_manager.forward_biz(biz);
        }
        let msg = MsgData {
            data: data.to_vec(),
            data_type,
            group_id: group_id.to_string(),
            message_id,
            message_code: code,
            dest_node_id: dest,
            src_node_id: self.id,
            biz_message_id: biz_id,
            relay_count,
            expiration: expiration_after(MESSAGE_EXPIRATION),
        };
        log::debug!(
            "encode data packet type: {:?} id: {:X} relay count: {} code: {}",
            data_type,
            message_id,
            relay_count,
            code
        );
        self.encode_packet(&Packet::Data(msg))
    }

    // =========================================================================
    // RPCs
    // =========================================================================

    fn send_ping(&self, to: NodeId, addr: Option<SocketAddr>, reply: bool) {
        let ping = MsgPing {
            version: VERSION,
            from: self.our_endpoint(),
            to: RpcEndPoint::from_addr(addr),
            node_id: self.id,
            chain_id: self.config.chain_id,
            protocol_version: self.config.protocol_version,
            expiration: expiration_after(MESSAGE_EXPIRATION),
            reply,
        };
        log::debug!("[send ping] to: {} addr: {:?} reply: {}", to, addr, reply);
        self.send_message(to, addr, &Packet::Ping(ping));
    }

    /// Fire-and-forget ping
    pub fn ping(&self, to: NodeId, addr: Option<SocketAddr>) {
        if to == self.id {
            return;
        }
        self.send_ping(to, addr, false);
    }

    /// Ping and wait for the peer's answer
    pub fn ping_wait(&self, node: &Node) -> BoxFuture<'static, Result<(), NetError>> {
        let rx = self.add_pending(node.id, MessageType::Ping, Box::new(|_| true));
        self.ping(node.id, node.addr());
        Box::pin(async move { rx.await.unwrap_or(Err(NetError::Closed)) })
    }

    /// Ask `node` for its neighbours of `target`
    pub fn find_node(&self, node: &Node, target: NodeId) -> BoxFuture<'static, Result<Vec<Node>, NetError>> {
        let found: Arc<Mutex<Vec<Node>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = found.clone();
        let callback: ReplyCallback = Box::new(move |packet| {
            if let Packet::Neighbors(resp) = packet {
                let mut sink = lock(&sink);
                sink.extend(resp.nodes.iter().filter_map(node_from_rpc));
            }
            true
        });
        let rx = self.add_pending(node.id, MessageType::Neighbors, callback);
        let req = MsgFindNode {
            target,
            expiration: expiration_after(MESSAGE_EXPIRATION),
        };
        self.send_message(node.id, node.addr(), &Packet::FindNode(req));

        Box::pin(async move {
            rx.await.unwrap_or(Err(NetError::Closed))?;
            let nodes = std::mem::take(&mut *lock(&found));
            Ok(nodes)
        })
    }

    /// Ask every connected peer whether it can reach `to`
    pub fn relay_test(&self, to: NodeId) {
        log::info!("[relay] test node id: {}", to);
        let packet = Packet::RelayTest(MsgRelay { node_id: to });
        match self.encode_packet(&packet) {
            Ok(buf) => self
                .peer_manager
                .send_all(&buf, MessageType::RelayTest.control_code()),
            Err(e) => log::warn!("encode relay test failed: {}", e),
        }
    }

    /// Send a control packet
    pub fn send_message(&self, to: NodeId, addr: Option<SocketAddr>, packet: &Packet) {
        let code = packet.message_type().control_code();
        match self.encode_packet(packet) {
            Ok(buf) => {
                if self.peer_manager.write(to, addr, &buf, code, false) {
                    self.relay_test(to);
                }
            }
            Err(e) => log::warn!("encode {:?} failed: {}", packet.message_type(), e),
        }
    }

    // =========================================================================
    // Data sends
    // =========================================================================

    /// Unicast, relayed through a known relay node when direct dialing fails
    pub fn send(&self, to: NodeId, addr: Option<SocketAddr>, data: &[u8], code: u32) -> Result<(), NetError> {
        let packet = self.encode_data_packet(data, DataType::Normal, code, "", Some(to), None, -1)?;
        if self.peer_manager.write(to, addr, &packet, code, true) {
            self.relay_test(to);
        }
        Ok(())
    }

    /// Envelope to every connected peer; `broadcast` makes receivers
    /// re-flood it
    pub fn send_all(
        &self,
        data: &[u8],
        code: u32,
        broadcast: bool,
        biz_id: Option<BizMessageId>,
        relay_count: i32,
    ) -> Result<(), NetError> {
        let data_type = if broadcast { DataType::Global } else { DataType::Normal };
        let packet = self.encode_data_packet(data, data_type, code, "", None, biz_id, relay_count)?;
        self.peer_manager.send_all(&packet, code);
        Ok(())
    }

    /// Epidemic relay over a random peer subset
    pub fn broadcast_random(&self, data: &[u8], code: u32, relay_count: i32) -> Result<(), NetError> {
        let packet =
            self.encode_data_packet(data, DataType::GlobalRandom, code, "", None, None, relay_count)?;
        self.peer_manager
            .broadcast_random(&packet, code, |id| self.kad.contains(id));
        Ok(())
    }

    /// Send through a group overlay this node belongs to
    pub fn send_group(
        &self,
        group_id: &str,
        data: &[u8],
        code: u32,
        broadcast: bool,
        relay_count: i32,
    ) -> Result<(), NetError> {
        let data_type = if broadcast { DataType::Group } else { DataType::Normal };
        let packet = self.encode_data_packet(data, data_type, code, group_id, None, None, relay_count)?;
        self.group_manager.send_group(group_id, &packet, code);
        Ok(())
    }

    /// Broadcast into a group from outside, entering through one member,
    /// connected members first
    #[allow(clippy::too_many_arguments)]
    pub fn group_broadcast_with_members(
        &self,
        group_id: &str,
        data: &[u8],
        code: u32,
        biz_id: Option<BizMessageId>,
        members: &[NodeId],
        relay_count: i32,
    ) -> Result<(), NetError> {
        let packet =
            self.encode_data_packet(data, DataType::Group, code, group_id, None, biz_id, relay_count)?;

        let mut sent: Vec<NodeId> = Vec::new();
        for id in members {
            if sent.len() >= GROUP_ENTRANCE_COUNT {
                break;
            }
            let connected = self
                .peer_manager
                .peer_by_id(id)
                .map(|p| p.is_connected())
                .unwrap_or(false);
            if connected {
                self.peer_manager.write(*id, None, &packet, code, false);
                sent.push(*id);
            }
        }
        for id in members {
            if sent.len() >= GROUP_ENTRANCE_COUNT {
                break;
            }
            if *id != self.id && !sent.contains(id) {
                let addr = self.kad.find(id).and_then(|n| n.addr());
                self.peer_manager.write(*id, addr, &packet, code, false);
                sent.push(*id);
            }
        }
        Ok(())
    }

    /// Unicast to a group member, falling back to the group overlay when the
    /// member cannot be reached directly
    pub fn send_group_member(
        &self,
        group_id: &str,
        data: &[u8],
        code: u32,
        member: NodeId,
    ) -> Result<(), NetError> {
        let connected = self
            .peer_manager
            .peer_by_id(&member)
            .map(|p| p.is_connected())
            .unwrap_or(false);
        if connected || self.peer_manager.nat_traversal_enabled() {
            return self.send(member, None, data, code);
        }
        if let Some(addr) = self.kad.find(&member).and_then(|n| n.addr()) {
            return self.send(member, Some(addr), data, code);
        }

        let packet =
            self.encode_data_packet(data, DataType::Group, code, group_id, Some(member), None, -1)?;
        self.group_manager.send_group(group_id, &packet, code);
        Ok(())
    }

    // =========================================================================
    // Groups
    // =========================================================================

    pub fn build_group(&self, group_id: &str, members: &[NodeId]) -> Option<Arc<Group>> {
        self.group_manager.build_group(group_id, members)
    }

    pub fn remove_group(&self, group_id: &str) {
        self.group_manager.remove_group(group_id)
    }
}

impl GroupLink for NetCore {
    fn self_id(&self) -> NodeId {
        self.id
    }

    fn route(&self, id: &NodeId) -> GroupRoute {
        if let Some(peer) = self.peer_manager.peer_by_id(id) {
            let st = peer.lock();
            if st.session > 0 {
                return GroupRoute::Peer(st.addr);
            }
        }
        match self.kad.find(id).and_then(|n| n.addr()) {
            Some(addr) => GroupRoute::Kad(addr),
            None => GroupRoute::Unknown,
        }
    }

    fn write(&self, id: NodeId, addr: Option<SocketAddr>, packet: &[u8], code: u32) {
        self.peer_manager.write(id, addr, packet, code, false);
    }

    fn ping(&self, id: NodeId, addr: Option<SocketAddr>) {
        NetCore::ping(self, id, addr);
    }

    fn resolve(&self, id: NodeId) {
        let Some(core) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            match core.kad.resolve(id).await {
                Some(node) => core.ping(node.id, node.addr()),
                None => log::debug!("resolve {} found nothing", id),
            }
        });
    }
}

/// A neighbour entry we are willing to dial
fn node_from_rpc(rn: &RpcNode) -> Option<Node> {
    if rn.port <= MIN_NEIGHBOR_PORT || !rn.id.is_valid() {
        return None;
    }
    let ip: IpAddr = rn.ip.parse().ok()?;
    let node = Node::new(rn.id, Some(ip), rn.port);
    node.validate_complete().ok()?;
    Some(node)
}
