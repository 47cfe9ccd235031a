//! Peer sessions and flow control
//!
//! A [`Peer`] is created lazily on first send or inbound connection and is
//! keyed by the numeric transport id derived from its [`NodeId`], so it
//! survives reconnects. Outbound traffic goes through a [`SendList`]: three
//! priority tiers scheduled by weighted round-robin with a bound on
//! in-flight sends.

use crate::network::buffer_pool::BufferPool;
use crate::network::message::codes;
use crate::network::node::NodeId;
use crate::network::stats::FlowMeter;
use crate::transport::{SessionId, TransportError, TransportProvider};
use bytes::BytesMut;
use rand::seq::index::sample;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Number of priority tiers
pub const MAX_SEND_PRIORITY: usize = 3;

/// Per round quota of each tier, High to Low
pub const PRIORITY_QUOTA: [usize; MAX_SEND_PRIORITY] = [5, 3, 2];

/// In-flight sends allowed before waiting for a drain signal
pub const MAX_PENDING_SEND: usize = 10;

/// Capacity of one tier queue
pub const MAX_SEND_LIST_SIZE: usize = 256;

/// In-flight counter is reset if no drain signal arrived for this long
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(3);

/// Minimum spacing between relay tests for one peer
pub const RELAY_TEST_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// A dial that has not completed by then may be retried
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

// =============================================================================
// Errors
// =============================================================================

/// Peer session errors
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Send queue full, message dropped")]
    SendQueueFull,
    #[error("Peer not connected")]
    NotConnected,
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

// =============================================================================
// Send priority
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPriority {
    High = 0,
    Medium = 1,
    Low = 2,
}

/// Static priority of a message code, Low unless listed
pub fn send_priority(code: u32) -> SendPriority {
    match code {
        codes::BLOCK_INFO_NOTIFY
        | codes::NEW_BLOCK
        | codes::REQ_BLOCK
        | codes::BLOCK_RESPONSE
        | codes::GROUP_CHAIN_COUNT
        | codes::REQ_GROUP
        | codes::GROUP
        | codes::REQ_CHAIN_PIECE_BLOCK
        | codes::CHAIN_PIECE_BLOCK
        | codes::CAST_VERIFY
        | codes::VERIFIED_CAST => SendPriority::High,
        codes::CAST_REWARD_SIGN_REQ | codes::CAST_REWARD_SIGN_GOT => SendPriority::Medium,
        _ => SendPriority::Low,
    }
}

// =============================================================================
// SendList
// =============================================================================

struct SendTier {
    /// Packets with the message code they carry
    queue: VecDeque<(u32, BytesMut)>,
    quota: usize,
    cur_quota: usize,
}

/// Priority-tiered outbound queue.
///
/// Each drain walks High to Low, letting a tier send until its round quota
/// is used. When the tiers together have sent the aggregate quota (10) all
/// round counters reset. A round in which no tier could send while items
/// remain also resets, so a lone busy tier is never held back by idle ones.
pub struct SendList {
    tiers: [SendTier; MAX_SEND_PRIORITY],
    pending_send: usize,
    total_quota: usize,
    cur_quota: usize,
    last_on_wait: Instant,
}

impl SendList {
    pub fn new() -> Self {
        let tier = |quota| SendTier {
            queue: VecDeque::new(),
            quota,
            cur_quota: 0,
        };
        Self {
            tiers: [
                tier(PRIORITY_QUOTA[0]),
                tier(PRIORITY_QUOTA[1]),
                tier(PRIORITY_QUOTA[2]),
            ],
            pending_send: 0,
            total_quota: PRIORITY_QUOTA.iter().sum(),
            cur_quota: 0,
            last_on_wait: Instant::now(),
        }
    }

    pub fn is_full(&self, priority: SendPriority) -> bool {
        self.tiers[priority as usize].queue.len() >= MAX_SEND_LIST_SIZE
    }

    /// Enqueue at the tail; a full tier drops the new item
    pub fn push(&mut self, priority: SendPriority, code: u32, packet: BytesMut) -> Result<(), PeerError> {
        if self.is_full(priority) {
            return Err(PeerError::SendQueueFull);
        }
        self.tiers[priority as usize].queue.push_back((code, packet));
        Ok(())
    }

    pub fn len(&self, priority: SendPriority) -> usize {
        self.tiers[priority as usize].queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.iter().all(|t| t.queue.is_empty())
    }

    pub fn is_send_available(&self) -> bool {
        self.pending_send < MAX_PENDING_SEND
    }

    pub fn pending_send(&self) -> usize {
        self.pending_send
    }

    /// Reset the in-flight counter if the drain signal is overdue
    pub fn check_wait_timeout(&mut self, now: Instant) -> bool {
        if now.duration_since(self.last_on_wait) > WAIT_TIMEOUT {
            self.pending_send = 0;
            return true;
        }
        false
    }

    /// The transport flushed its queue
    pub fn on_send_waited(&mut self) {
        self.last_on_wait = Instant::now();
        self.pending_send = 0;
    }

    /// A fresh session starts with nothing in flight
    pub fn on_connected(&mut self) {
        self.last_on_wait = Instant::now();
        self.pending_send = 0;
    }

    fn reset_quota(&mut self) {
        self.cur_quota = 0;
        for tier in self.tiers.iter_mut() {
            tier.cur_quota = 0;
        }
    }

    /// Hand queued packets to `sink` in schedule order; returns how many
    pub fn drain<F: FnMut(u32, BytesMut)>(&mut self, mut sink: F) -> usize {
        let mut sent = 0;
        while self.is_send_available() && !self.is_empty() {
            let mut progressed = false;
            for i in 0..MAX_SEND_PRIORITY {
                while self.pending_send < MAX_PENDING_SEND {
                    let tier = &mut self.tiers[i];
                    if tier.cur_quota >= tier.quota {
                        break;
                    }
                    let Some((code, packet)) = tier.queue.pop_front() else {
                        break;
                    };
                    tier.cur_quota += 1;
                    self.cur_quota += 1;
                    self.pending_send += 1;
                    sent += 1;
                    progressed = true;
                    sink(code, packet);
                }
                if self.cur_quota >= self.total_quota {
                    self.reset_quota();
                }
            }
            if !progressed {
                self.reset_quota();
            }
        }
        sent
    }

    /// Drop everything, handing buffers to `release`
    pub fn clear<F: FnMut(BytesMut)>(&mut self, mut release: F) {
        for tier in self.tiers.iter_mut() {
            for (_, packet) in tier.queue.drain(..) {
                release(packet);
            }
        }
    }

    pub fn data_size(&self) -> usize {
        self.tiers
            .iter()
            .flat_map(|t| t.queue.iter())
            .map(|(_, b)| b.len())
            .sum()
    }
}

impl Default for SendList {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Peer
// =============================================================================

/// How a connected peer became known
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSource {
    Unknown,
    Kad,
    Group,
}

/// Mutable state of a peer
pub struct PeerState {
    /// Zero until the peer identified itself
    pub id: NodeId,
    pub session: SessionId,
    pub addr: Option<SocketAddr>,
    pub send_list: SendList,
    recv_list: VecDeque<BytesMut>,
    pub connecting: bool,
    pub connect_started: Option<Instant>,
    pub pinged: bool,
    pub source: PeerSource,
    pub relay_id: Option<NodeId>,
    pub relay_test_time: Option<Instant>,
    pub bytes_received: usize,
    pub bytes_sent: usize,
    pub disconnect_count: u32,
    pub send_wait_count: u32,
    pub chain_id: u16,
    pub protocol_version: u16,
}

/// One remote node and its session
pub struct Peer {
    net_id: u64,
    state: Mutex<PeerState>,
}

impl Peer {
    pub fn new(id: NodeId, net_id: u64, session: SessionId) -> Self {
        Self {
            net_id,
            state: Mutex::new(PeerState {
                id,
                session,
                addr: None,
                send_list: SendList::new(),
                recv_list: VecDeque::new(),
                connecting: false,
                connect_started: None,
                pinged: false,
                source: PeerSource::Unknown,
                relay_id: None,
                relay_test_time: None,
                bytes_received: 0,
                bytes_sent: 0,
                disconnect_count: 0,
                send_wait_count: 0,
                chain_id: 0,
                protocol_version: 0,
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, PeerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn net_id(&self) -> u64 {
        self.net_id
    }

    pub fn id(&self) -> NodeId {
        self.lock().id
    }

    pub fn session(&self) -> SessionId {
        self.lock().session
    }

    pub fn is_connected(&self) -> bool {
        self.session() != 0
    }

    pub fn set_id(&self, id: NodeId) {
        let mut st = self.lock();
        if st.id != id {
            st.id = id;
        }
    }

    /// Record what the peer announced about itself
    pub fn set_chain_info(&self, chain_id: u16, protocol_version: u16) {
        let mut st = self.lock();
        st.chain_id = chain_id;
        st.protocol_version = protocol_version;
    }

    pub fn set_addr(&self, addr: SocketAddr) {
        self.lock().addr = Some(addr);
    }

    pub fn set_relay(&self, relay: NodeId) {
        self.lock().relay_id = Some(relay);
    }

    /// Append received bytes to the reassembly queue
    pub fn add_recv_data(&self, pool: &BufferPool, data: &[u8]) {
        let buf = pool.copy_from(data);
        let mut st = self.lock();
        st.recv_list.push_back(buf);
        st.bytes_received += data.len();
    }

    pub fn pop_data(&self) -> Option<BytesMut> {
        self.lock().recv_list.pop_front()
    }

    /// Put back unconsumed bytes so they are read first
    pub fn push_front(&self, data: BytesMut) {
        self.lock().recv_list.push_front(data);
    }

    /// Discard everything buffered for reassembly
    pub fn reset_data(&self, pool: &BufferPool) {
        let drained: Vec<BytesMut> = self.lock().recv_list.drain(..).collect();
        for buf in drained {
            pool.free_buffer(buf);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lock().recv_list.is_empty()
    }

    pub fn recv_data_size(&self) -> usize {
        self.lock().recv_list.iter().map(|b| b.len()).sum()
    }
}

/// Connected peer as reported to the application
#[derive(Debug, Clone, PartialEq)]
pub struct ConnInfo {
    pub id: NodeId,
    pub ip: String,
    pub port: u16,
}

// =============================================================================
// PeerManager
// =============================================================================

#[derive(Debug, Clone)]
pub struct PeerManagerConfig {
    pub chain_id: u16,
    pub protocol_version: u16,
    /// Relay server to dial through when NAT traversal is on
    pub nat_server: Option<SocketAddr>,
}

/// Owns all peers and their sessions
pub struct PeerManager {
    peers: RwLock<HashMap<u64, Arc<Peer>>>,
    transport: Arc<dyn TransportProvider>,
    pool: Arc<BufferPool>,
    flow_meter: Arc<FlowMeter>,
    config: PeerManagerConfig,
}

impl PeerManager {
    pub fn new(
        transport: Arc<dyn TransportProvider>,
        pool: Arc<BufferPool>,
        flow_meter: Arc<FlowMeter>,
        config: PeerManagerConfig,
    ) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            transport,
            pool,
            flow_meter,
            config,
        }
    }

    pub fn nat_traversal_enabled(&self) -> bool {
        self.config.nat_server.is_some()
    }

    fn is_compatible(&self, st: &PeerState) -> bool {
        st.chain_id == self.config.chain_id && st.protocol_version == self.config.protocol_version
    }

    pub fn peer_by_net_id(&self, net_id: u64) -> Option<Arc<Peer>> {
        match self.peers.read() {
            Ok(peers) => peers.get(&net_id).cloned(),
            Err(poisoned) => poisoned.into_inner().get(&net_id).cloned(),
        }
    }

    pub fn peer_by_id(&self, id: &NodeId) -> Option<Arc<Peer>> {
        self.peer_by_net_id(id.net_id())
    }

    pub fn add_peer(&self, net_id: u64, peer: Arc<Peer>) {
        match self.peers.write() {
            Ok(mut peers) => peers.insert(net_id, peer),
            Err(poisoned) => poisoned.into_inner().insert(net_id, peer),
        };
    }

    fn get_or_create(&self, net_id: u64, id: NodeId, session: SessionId) -> Arc<Peer> {
        let mut peers = match self.peers.write() {
            Ok(peers) => peers,
            Err(poisoned) => poisoned.into_inner(),
        };
        peers
            .entry(net_id)
            .or_insert_with(|| Arc::new(Peer::new(id, net_id, session)))
            .clone()
    }

    fn all_peers(&self) -> Vec<Arc<Peer>> {
        match self.peers.read() {
            Ok(peers) => peers.values().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().values().cloned().collect(),
        }
    }

    pub fn peer_count(&self) -> usize {
        match self.peers.read() {
            Ok(peers) => peers.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Queue a packet on a peer and flush what the scheduler allows
    fn enqueue(&self, st: &mut PeerState, packet: &[u8], code: u32) {
        let priority = send_priority(code);
        if st.send_list.is_full(priority) {
            log::info!(
                "send list full, drop message! id: {} session: {} code: {}",
                st.id,
                st.session,
                code
            );
            return;
        }
        if st.send_list.check_wait_timeout(Instant::now()) {
            log::info!("send list wait timeout, id: {} session: {}", st.id, st.session);
        }

        let buf = self.pool.copy_from(packet);
        if st.send_list.push(priority, code, buf).is_err() {
            return;
        }
        self.auto_send(st);
    }

    fn auto_send(&self, st: &mut PeerState) {
        if st.session == 0 {
            return;
        }
        let session = st.session;
        let transport = &self.transport;
        let pool = &self.pool;
        let flow_meter = &self.flow_meter;
        let mut bytes_sent = 0;
        st.send_list.drain(|code, buf| {
            match transport.send_chunked(session, &buf) {
                Ok(()) => {
                    bytes_sent += buf.len();
                    flow_meter.send(code, buf.len());
                }
                Err(e) => log::debug!("send on session {} failed: {}", session, e),
            }
            pool.free_buffer(buf);
        });
        st.bytes_sent += bytes_sent;
    }

    /// Send `packet` to `to`, dialing if needed.
    ///
    /// With `relay` set and a relay known for the target, the packet goes to
    /// the relay instead. Returns `true` when the caller should issue a relay
    /// test for `to`.
    pub fn write(
        &self,
        to: NodeId,
        addr: Option<SocketAddr>,
        packet: &[u8],
        code: u32,
        relay: bool,
    ) -> bool {
        let net_id = to.net_id();
        let peer = self.get_or_create(net_id, to, 0);

        if relay {
            let relay_id = peer.lock().relay_id;
            if let Some(relay_id) = relay_id {
                let relay_up = self
                    .peer_by_id(&relay_id)
                    .map(|p| p.is_connected())
                    .unwrap_or(false);
                if relay_up {
                    log::info!("[relay] send to {} via relay {}", to, relay_id);
                    self.write(relay_id, None, packet, code, false);
                    return false;
                }
            }
        }

        let mut st = peer.lock();
        if !st.id.is_valid() {
            st.id = to;
        }
        self.enqueue(&mut st, packet, code);
        if st.session != 0 {
            return false;
        }

        let now = Instant::now();
        if let Some(addr) = addr {
            st.addr = Some(addr);
        }
        let stale_dial = st
            .connect_started
            .map(|t| now.duration_since(t) > CONNECT_TIMEOUT)
            .unwrap_or(true);
        let target = self.config.nat_server.or(st.addr);
        if let Some(target) = target {
            if !st.connecting || stale_dial {
                st.connecting = true;
                st.connect_started = Some(now);
                match self.transport.connect(net_id, target.ip(), target.port()) {
                    Ok(()) => log::info!(
                        "connect node [{}]: id: {} addr: {}",
                        if self.nat_traversal_enabled() { "nat" } else { "direct" },
                        to,
                        target
                    ),
                    Err(e) => {
                        st.connecting = false;
                        log::warn!("connect to {} failed: {}", to, e);
                    }
                }
            }
        }

        let relay_test_due = st
            .relay_test_time
            .map(|t| now.duration_since(t) > RELAY_TEST_TIMEOUT)
            .unwrap_or(true);
        if relay
            && st.relay_id.is_none()
            && st.disconnect_count > 1
            && st.bytes_received == 0
            && relay_test_due
        {
            st.relay_test_time = Some(now);
            return true;
        }
        false
    }

    /// A session came up. Returns the id to ping if the peer is known but
    /// has not been pinged yet.
    pub fn new_connection(&self, net_id: u64, session: SessionId, accepted: bool) -> Option<NodeId> {
        let peer = self.get_or_create(net_id, NodeId::default(), session);
        let mut st = peer.lock();
        if session > 0 {
            if st.session == 0 {
                let stale: Vec<BytesMut> = st.recv_list.drain(..).collect();
                for buf in stale {
                    self.pool.free_buffer(buf);
                }
            }
            st.session = session;
        }
        st.connecting = false;

        let ping = if st.id.is_valid() && !st.pinged {
            st.pinged = true;
            Some(st.id)
        } else {
            None
        };

        st.send_list.on_connected();
        self.auto_send(&mut st);
        log::info!(
            "new connection, node id: {} net id: {} session: {} accepted: {}",
            st.id,
            net_id,
            session,
            accepted
        );
        ping
    }

    /// Transport flushed a session's queue
    pub fn on_send_waited(&self, net_id: u64) {
        if let Some(peer) = self.peer_by_net_id(net_id) {
            let mut st = peer.lock();
            st.send_list.on_send_waited();
            st.send_wait_count += 1;
            self.auto_send(&mut st);
        }
    }

    /// A session closed; stale sessions are ignored
    pub fn on_disconnected(&self, net_id: u64, session: SessionId) {
        match self.peer_by_net_id(net_id) {
            Some(peer) => {
                let mut st = peer.lock();
                log::info!(
                    "disconnected id: {} session: {} addr: {:?}",
                    st.id,
                    session,
                    st.addr
                );
                st.disconnect_count += 1;
                st.connecting = false;
                if st.session == session {
                    st.session = 0;
                }
            }
            None => log::info!("disconnected net id: {} session: {}", net_id, session),
        }
    }

    /// Forget a peer entirely
    pub fn disconnect(&self, id: &NodeId) {
        let removed = match self.peers.write() {
            Ok(mut peers) => peers.remove(&id.net_id()),
            Err(poisoned) => poisoned.into_inner().remove(&id.net_id()),
        };
        if let Some(peer) = removed {
            let mut st = peer.lock();
            log::info!("disconnect {} addr: {:?}", id, st.addr);
            if st.session != 0 {
                self.transport.shutdown(st.session);
            }
            let pool = &self.pool;
            st.send_list.clear(|buf| pool.free_buffer(buf));
        }
    }

    /// Bytes arrived for `net_id`; returns the peer to decode from
    pub fn add_recv_data(&self, net_id: u64, session: SessionId, data: &[u8]) -> Arc<Peer> {
        let peer = self.get_or_create(net_id, NodeId::default(), session);
        peer.add_recv_data(&self.pool, data);
        peer
    }

    /// Log peers that never sent us anything
    pub fn check_peers(&self) {
        for peer in self.all_peers() {
            let st = peer.lock();
            if st.bytes_received == 0 {
                log::info!(
                    "[check peers] addr: {:?} recv: {} sent: {} disconnects: {} send waits: {}",
                    st.addr,
                    st.bytes_received,
                    st.bytes_sent,
                    st.disconnect_count,
                    st.send_wait_count
                );
            }
        }
    }

    /// Flood to every connected, compatible peer
    pub fn send_all(&self, packet: &[u8], code: u32) {
        let peers = self.all_peers();
        log::debug!("send all, total peers: {} code: {}", peers.len(), code);
        for peer in peers {
            let mut st = peer.lock();
            if st.session > 0 && self.is_compatible(&st) {
                self.enqueue(&mut st, packet, code);
            }
        }
    }

    fn check_peer_source<F: Fn(&NodeId) -> bool>(&self, peers: &[Arc<Peer>], is_kad_known: F) {
        for peer in peers {
            let mut st = peer.lock();
            if st.session > 0 && st.source == PeerSource::Unknown && st.id.is_valid() {
                st.source = if is_kad_known(&st.id) {
                    PeerSource::Kad
                } else {
                    PeerSource::Group
                };
            }
        }
    }

    /// Send to a random subset of max(2, ceil(sqrt(n))) compatible peers
    pub fn broadcast_random<F: Fn(&NodeId) -> bool>(&self, packet: &[u8], code: u32, is_kad_known: F) {
        let peers = self.all_peers();
        self.check_peer_source(&peers, is_kad_known);

        let available: Vec<Arc<Peer>> = peers
            .into_iter()
            .filter(|p| {
                let st = p.lock();
                st.session > 0 && self.is_compatible(&st)
            })
            .collect();
        let count = random_fanout(available.len());
        log::debug!(
            "broadcast random, available: {} fanout: {} code: {}",
            available.len(),
            count,
            code
        );

        if available.len() <= count {
            for peer in &available {
                self.enqueue(&mut peer.lock(), packet, code);
            }
            return;
        }
        let mut rng = rand::thread_rng();
        for index in sample(&mut rng, available.len(), count) {
            self.enqueue(&mut available[index].lock(), packet, code);
        }
    }

    /// Connected peers with a known identity and address
    pub fn connection_info(&self) -> Vec<ConnInfo> {
        self.all_peers()
            .iter()
            .filter_map(|peer| {
                let st = peer.lock();
                match st.addr {
                    Some(addr) if st.session > 0 && st.id.is_valid() => Some(ConnInfo {
                        id: st.id,
                        ip: addr.ip().to_string(),
                        port: addr.port(),
                    }),
                    _ => None,
                }
            })
            .collect()
    }
}

/// Fan-out of a random relay over `n` peers
pub fn random_fanout(n: usize) -> usize {
    let root = (n as f64).sqrt().ceil() as usize;
    root.max(2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::EventSender;
    use std::net::IpAddr;

    fn packet(tag: u8) -> BytesMut {
        BytesMut::from(&[tag][..])
    }

    #[test]
    fn test_priority_table() {
        assert_eq!(send_priority(codes::NEW_BLOCK), SendPriority::High);
        assert_eq!(send_priority(codes::CAST_REWARD_SIGN_REQ), SendPriority::Medium);
        assert_eq!(send_priority(codes::KEY_PIECE), SendPriority::Low);
        assert_eq!(send_priority(123456), SendPriority::Low);
    }

    #[test]
    fn test_send_list_tail_drop() {
        let mut list = SendList::new();
        let mut rejected = 0;
        for i in 0..300 {
            if list.push(SendPriority::Low, 0, packet(i as u8)).is_err() {
                rejected += 1;
            }
        }
        assert_eq!(list.len(SendPriority::Low), MAX_SEND_LIST_SIZE);
        assert_eq!(rejected, 300 - MAX_SEND_LIST_SIZE);

        // the survivors are the first 256, in order
        let mut first = None;
        list.drain(|_, p| {
            if first.is_none() {
                first = Some(p[0]);
            }
        });
        assert_eq!(first, Some(0));
    }

    #[test]
    fn test_send_list_ratio_converges() {
        let mut list = SendList::new();
        for _ in 0..100 {
            list.push(SendPriority::High, 0, packet(0)).unwrap();
            list.push(SendPriority::Medium, 0, packet(1)).unwrap();
            list.push(SendPriority::Low, 0, packet(2)).unwrap();
        }

        let mut counts = [0usize; 3];
        let mut total = 0;
        while total < 200 {
            let sent = list.drain(|_, p| counts[p[0] as usize] += 1);
            assert!(sent <= MAX_PENDING_SEND);
            total += sent;
            list.on_send_waited();
        }
        assert_eq!(counts, [100, 60, 40]);
    }

    #[test]
    fn test_send_list_in_flight_bound() {
        let mut list = SendList::new();
        for _ in 0..50 {
            list.push(SendPriority::High, 0, packet(0)).unwrap();
        }
        assert_eq!(list.drain(|_, _| {}), MAX_PENDING_SEND);
        assert!(!list.is_send_available());
        assert_eq!(list.drain(|_, _| {}), 0);
        list.on_send_waited();
        assert_eq!(list.drain(|_, _| {}), MAX_PENDING_SEND);
    }

    #[test]
    fn test_send_list_lone_tier_not_starved() {
        let mut list = SendList::new();
        for _ in 0..25 {
            list.push(SendPriority::Low, 0, packet(2)).unwrap();
        }
        let mut total = 0;
        for _ in 0..3 {
            total += list.drain(|_, _| {});
            list.on_send_waited();
        }
        assert_eq!(total, 25);
        assert!(list.is_empty());
    }

    #[test]
    fn test_send_list_wait_timeout() {
        let mut list = SendList::new();
        for _ in 0..20 {
            list.push(SendPriority::Low, 0, packet(2)).unwrap();
        }
        list.drain(|_, _| {});
        assert_eq!(list.pending_send(), MAX_PENDING_SEND);
        assert!(!list.check_wait_timeout(Instant::now()));
        assert!(list.check_wait_timeout(Instant::now() + WAIT_TIMEOUT + Duration::from_millis(1)));
        assert_eq!(list.pending_send(), 0);
    }

    #[test]
    fn test_random_fanout() {
        assert_eq!(random_fanout(0), 2);
        assert_eq!(random_fanout(3), 2);
        assert_eq!(random_fanout(5), 3);
        assert_eq!(random_fanout(16), 4);
        assert_eq!(random_fanout(17), 5);
    }

    #[derive(Default)]
    struct FakeTransport {
        sends: Mutex<Vec<(SessionId, usize)>>,
        dials: Mutex<Vec<(u64, SocketAddr)>>,
        shutdowns: Mutex<Vec<SessionId>>,
    }

    impl TransportProvider for FakeTransport {
        fn configure(&self, _: u64, _: EventSender) -> Result<(), TransportError> {
            Ok(())
        }
        fn listen_direct(&self, _: IpAddr, _: u16) -> Result<(), TransportError> {
            Ok(())
        }
        fn listen_via_relay(&self, _: IpAddr, _: u16) -> Result<(), TransportError> {
            Ok(())
        }
        fn connect(&self, net_id: u64, ip: IpAddr, port: u16) -> Result<(), TransportError> {
            self.dials.lock().unwrap().push((net_id, SocketAddr::new(ip, port)));
            Ok(())
        }
        fn send(&self, session: SessionId, data: &[u8]) -> Result<(), TransportError> {
            self.sends.lock().unwrap().push((session, data.len()));
            Ok(())
        }
        fn shutdown(&self, session: SessionId) {
            self.shutdowns.lock().unwrap().push(session);
        }
        fn outbound_queue_depth(&self, _: SessionId) -> usize {
            0
        }
        fn close(&self) {}
    }

    fn manager(nat_server: Option<SocketAddr>) -> (PeerManager, Arc<FakeTransport>) {
        let transport = Arc::new(FakeTransport::default());
        let pm = PeerManager::new(
            transport.clone(),
            Arc::new(BufferPool::new()),
            Arc::new(FlowMeter::new("test")),
            PeerManagerConfig {
                chain_id: 1,
                protocol_version: 1,
                nat_server,
            },
        );
        (pm, transport)
    }

    fn connect_peer(pm: &PeerManager, id: NodeId, session: SessionId) {
        pm.new_connection(id.net_id(), session, false);
        let peer = pm.peer_by_id(&id).unwrap();
        peer.set_id(id);
        peer.set_chain_info(1, 1);
    }

    #[test]
    fn test_write_dials_once_then_flushes_on_connect() {
        let (pm, transport) = manager(None);
        let id = NodeId::random();
        let addr: SocketAddr = "10.0.0.2:3000".parse().unwrap();

        assert!(!pm.write(id, Some(addr), b"one", 1, false));
        assert!(!pm.write(id, Some(addr), b"two", 1, false));
        assert_eq!(transport.dials.lock().unwrap().len(), 1);
        assert_eq!(transport.dials.lock().unwrap()[0], (id.net_id(), addr));
        assert!(transport.sends.lock().unwrap().is_empty());

        let ping = pm.new_connection(id.net_id(), 7, false);
        assert_eq!(ping, Some(id));
        assert_eq!(transport.sends.lock().unwrap().len(), 2);
        assert!(pm.peer_by_id(&id).unwrap().is_connected());
    }

    #[test]
    fn test_nat_traversal_dials_relay_server() {
        let server: SocketAddr = "119.23.205.254:80".parse().unwrap();
        let (pm, transport) = manager(Some(server));
        let id = NodeId::random();
        pm.write(id, None, b"x", 1, false);
        assert_eq!(transport.dials.lock().unwrap()[0], (id.net_id(), server));
    }

    #[test]
    fn test_no_address_no_dial() {
        let (pm, transport) = manager(None);
        pm.write(NodeId::random(), None, b"x", 1, false);
        assert!(transport.dials.lock().unwrap().is_empty());
        assert_eq!(pm.peer_count(), 1);
    }

    #[test]
    fn test_stale_disconnect_ignored() {
        let (pm, _) = manager(None);
        let id = NodeId::random();
        connect_peer(&pm, id, 5);
        pm.new_connection(id.net_id(), 6, true);

        pm.on_disconnected(id.net_id(), 5);
        assert_eq!(pm.peer_by_id(&id).unwrap().session(), 6);

        pm.on_disconnected(id.net_id(), 6);
        assert_eq!(pm.peer_by_id(&id).unwrap().session(), 0);
        assert_eq!(pm.peer_by_id(&id).unwrap().lock().disconnect_count, 2);
    }

    #[test]
    fn test_relay_test_after_repeated_failures() {
        let (pm, _) = manager(None);
        let id = NodeId::random();
        let addr: SocketAddr = "10.0.0.3:3000".parse().unwrap();
        pm.write(id, Some(addr), b"x", 1, true);
        pm.on_disconnected(id.net_id(), 0);
        pm.on_disconnected(id.net_id(), 0);

        assert!(pm.write(id, Some(addr), b"x", 1, true));
        // cooldown
        assert!(!pm.write(id, Some(addr), b"x", 1, true));
    }

    #[test]
    fn test_relay_test_only_for_relayable_writes() {
        let (pm, _) = manager(None);
        let id = NodeId::random();
        let addr: SocketAddr = "10.0.0.4:3000".parse().unwrap();
        pm.write(id, Some(addr), b"x", 1, false);
        pm.on_disconnected(id.net_id(), 0);
        pm.on_disconnected(id.net_id(), 0);

        assert!(!pm.write(id, Some(addr), b"x", 1, false));
        // a direct-only write must not start the cooldown
        assert!(pm.write(id, Some(addr), b"x", 1, true));
    }

    #[test]
    fn test_send_accounted_when_handed_to_transport() {
        let (pm, transport) = manager(None);
        let id = NodeId::random();
        let addr: SocketAddr = "10.0.0.5:3000".parse().unwrap();
        pm.write(id, Some(addr), b"queued", 1, false);

        assert_eq!(pm.flow_meter.get(1).send_count, 0);
        assert_eq!(pm.peer_by_id(&id).unwrap().lock().bytes_sent, 0);

        // dropped with the peer, never counted
        pm.disconnect(&id);
        assert_eq!(pm.flow_meter.get(1).send_count, 0);

        let other = NodeId::random();
        pm.write(other, Some(addr), b"later", 2, false);
        connect_peer(&pm, other, 4);
        assert_eq!(*transport.sends.lock().unwrap(), vec![(4, 5)]);
        assert_eq!(pm.flow_meter.get(2).send_count, 1);
        assert_eq!(pm.peer_by_id(&other).unwrap().lock().bytes_sent, 5);
    }

    #[test]
    fn test_relay_route_used_when_relay_connected() {
        let (pm, transport) = manager(None);
        let target = NodeId::random();
        let relay = NodeId::random();
        connect_peer(&pm, relay, 3);
        pm.write(target, None, b"x", 1, true);
        pm.peer_by_id(&target).unwrap().set_relay(relay);

        let before = transport.sends.lock().unwrap().len();
        pm.write(target, None, b"hello", 1, true);
        let sends = transport.sends.lock().unwrap();
        assert_eq!(sends.len(), before + 1);
        assert_eq!(sends.last(), Some(&(3, 5)));
    }

    #[test]
    fn test_send_all_skips_incompatible_and_offline() {
        let (pm, transport) = manager(None);
        let a = NodeId::random();
        let b = NodeId::random();
        let c = NodeId::random();
        connect_peer(&pm, a, 1);
        connect_peer(&pm, b, 2);
        pm.peer_by_id(&b).unwrap().set_chain_info(9, 1);
        pm.write(c, None, b"queued", 1, false);
        transport.sends.lock().unwrap().clear();

        pm.send_all(b"flood", 1);
        let sends = transport.sends.lock().unwrap();
        assert_eq!(*sends, vec![(1, 5)]);
    }

    #[test]
    fn test_broadcast_random_fanout() {
        let (pm, transport) = manager(None);
        let ids: Vec<NodeId> = (0..16).map(|_| NodeId::random()).collect();
        for (i, id) in ids.iter().enumerate() {
            connect_peer(&pm, *id, i as SessionId + 1);
        }
        let first = ids[0];
        pm.broadcast_random(b"gossip", 1, |id| *id == first);

        let sends = transport.sends.lock().unwrap();
        assert_eq!(sends.len(), 4);
        let mut sessions: Vec<_> = sends.iter().map(|s| s.0).collect();
        sessions.dedup();
        assert_eq!(sessions.len(), 4);
        assert_eq!(pm.peer_by_id(&first).unwrap().lock().source, PeerSource::Kad);
        assert_eq!(pm.peer_by_id(&ids[1]).unwrap().lock().source, PeerSource::Group);
    }

    #[test]
    fn test_disconnect_removes_peer_and_shuts_session() {
        let (pm, transport) = manager(None);
        let id = NodeId::random();
        connect_peer(&pm, id, 4);
        pm.disconnect(&id);
        assert!(pm.peer_by_id(&id).is_none());
        assert_eq!(*transport.shutdowns.lock().unwrap(), vec![4]);
    }

    #[test]
    fn test_connection_info() {
        let (pm, _) = manager(None);
        let id = NodeId::random();
        connect_peer(&pm, id, 4);
        assert!(pm.connection_info().is_empty());
        pm.peer_by_id(&id).unwrap().set_addr("10.0.0.9:4000".parse().unwrap());
        assert_eq!(
            pm.connection_info(),
            vec![ConnInfo {
                id,
                ip: "10.0.0.9".to_string(),
                port: 4000
            }]
        );
    }

    #[test]
    fn test_recv_queue_reassembly_helpers() {
        let (pm, _) = manager(None);
        let peer = pm.add_recv_data(42, 1, b"abc");
        pm.add_recv_data(42, 1, b"def");
        assert_eq!(peer.recv_data_size(), 6);
        let first = peer.pop_data().unwrap();
        assert_eq!(&first[..], b"abc");
        peer.push_front(first);
        assert_eq!(&peer.pop_data().unwrap()[..], b"abc");
        peer.reset_data(&BufferPool::new());
        assert!(peer.is_empty());
        assert_eq!(peer.lock().bytes_received, 6);
    }
}
