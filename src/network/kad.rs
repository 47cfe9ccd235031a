//! Kademlia routing table
//!
//! Nodes are placed into buckets by the XOR distance between the SHA-256 of
//! their id and ours. Only the closest part of the id space is tracked in
//! detail: every distance up to [`BUCKET_MIN_DISTANCE`] shares bucket 0.
//!
//! The table drives itself from a background loop started with
//! [`Kad::start`]: periodic refresh lookups, liveness checks of the least
//! recently seen entry of a random bucket, and explicit refresh requests.
//! Network I/O goes through the [`KadRpc`] seam.

use crate::network::net_core::NetError;
use crate::network::node::{distance_cmp, log_distance, Node, NodeId, HASH_BITS};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};

// =============================================================================
// Constants
// =============================================================================

/// Concurrent find_node requests during a lookup
pub const ALPHA: usize = 3;

/// Live entries per bucket
pub const BUCKET_SIZE: usize = 16;

/// Replacement candidates per bucket
pub const MAX_REPLACEMENTS: usize = 10;

pub const N_BUCKETS: usize = HASH_BITS / 15;

/// Distances up to this share the first bucket
pub const BUCKET_MIN_DISTANCE: usize = HASH_BITS - N_BUCKETS;

pub const REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const CHECK_INTERVAL: Duration = Duration::from_secs(12);

/// Checks that still force a refresh after startup
pub const MAX_SETUP_CHECK_COUNT: u32 = 12;

/// A node is pinged again at most this often
pub const NODE_PING_EXPIRATION: Duration = Duration::from_secs(5);

/// Random lookups per refresh, after the self lookup
const RANDOM_LOOKUPS: usize = 3;

// =============================================================================
// RPC seam
// =============================================================================

/// Network operations the table needs
pub trait KadRpc: Send + Sync {
    /// Fire-and-forget ping
    fn ping(&self, node: &Node);

    /// Ping and wait for the answer
    fn ping_wait(&self, node: &Node) -> BoxFuture<'static, Result<(), NetError>>;

    /// Ask `node` for the nodes it knows closest to `target`
    fn find_node(&self, node: &Node, target: NodeId) -> BoxFuture<'static, Result<Vec<Node>, NetError>>;
}

// =============================================================================
// Buckets
// =============================================================================

#[derive(Default)]
struct Bucket {
    /// Most recently active first
    entries: Vec<Node>,
    replacements: Vec<Node>,
}

impl Bucket {
    fn position(&self, id: &NodeId) -> Option<usize> {
        self.entries.iter().position(|n| n.id == *id)
    }

    /// Move an existing entry to the front, refreshing its endpoint
    fn bump(&mut self, node: &Node) -> bool {
        let Some(pos) = self.position(&node.id) else {
            return false;
        };
        let mut existing = self.entries.remove(pos);
        if node.ip.is_some() {
            existing.ip = node.ip;
            existing.port = node.port;
        }
        self.entries.insert(0, existing);
        true
    }

    fn add_front(&mut self, mut node: Node) {
        node.added_at = Some(Instant::now());
        self.replacements.retain(|r| r.id != node.id);
        self.entries.insert(0, node);
    }

    fn add_replacement(&mut self, node: Node) {
        if self.replacements.iter().any(|r| r.id == node.id) {
            return;
        }
        self.replacements.insert(0, node);
        self.replacements.truncate(MAX_REPLACEMENTS);
    }
}

/// Nodes ordered by distance to a target, closest first
#[derive(Debug, Clone)]
pub struct NodesByDistance {
    pub target: [u8; 32],
    pub entries: Vec<Node>,
}

impl NodesByDistance {
    pub fn new(target: [u8; 32]) -> Self {
        Self {
            target,
            entries: Vec::new(),
        }
    }

    /// Insert keeping order, holding at most `max` entries
    pub fn push(&mut self, node: Node, max: usize) {
        let pos = self
            .entries
            .iter()
            .position(|e| distance_cmp(&self.target, &e.sha, &node.sha).is_gt())
            .unwrap_or(self.entries.len());
        if pos >= max {
            return;
        }
        self.entries.insert(pos, node);
        self.entries.truncate(max);
    }
}

struct Table {
    buckets: Vec<Bucket>,
    setup_check_count: u32,
}

// =============================================================================
// Kad
// =============================================================================

pub struct Kad {
    self_node: Node,
    seeds: Vec<Node>,
    rpc: Arc<dyn KadRpc>,
    table: Mutex<Table>,
    refresh_tx: mpsc::UnboundedSender<oneshot::Sender<()>>,
    refresh_rx: Mutex<Option<mpsc::UnboundedReceiver<oneshot::Sender<()>>>>,
    started: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Kad {
    /// Create a table; every seed must carry a dialable endpoint
    pub fn new(self_node: Node, seeds: Vec<Node>, rpc: Arc<dyn KadRpc>) -> Result<Arc<Self>, NetError> {
        for seed in &seeds {
            seed.validate_complete()
                .map_err(|e| NetError::BadBootstrap(format!("{}: {}", seed, e)))?;
        }
        let seeds = seeds.into_iter().filter(|s| s.id != self_node.id).collect();

        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let buckets = (0..N_BUCKETS).map(|_| Bucket::default()).collect();

        Ok(Arc::new(Self {
            self_node,
            seeds,
            rpc,
            table: Mutex::new(Table {
                buckets,
                setup_check_count: 0,
            }),
            refresh_tx,
            refresh_rx: Mutex::new(Some(refresh_rx)),
            started: AtomicBool::new(false),
            shutdown,
        }))
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        match self.table.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn self_node(&self) -> &Node {
        &self.self_node
    }

    pub fn seeds(&self) -> &[Node] {
        &self.seeds
    }

    fn bucket_index(&self, sha: &[u8; 32]) -> usize {
        let d = log_distance(&self.self_node.sha, sha);
        if d <= BUCKET_MIN_DISTANCE {
            0
        } else {
            d - BUCKET_MIN_DISTANCE - 1
        }
    }

    /// Spawn the maintenance loop
    pub fn start(self: &Arc<Self>) {
        let refresh_rx = match self.refresh_rx.lock() {
            Ok(mut rx) => rx.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(refresh_rx) = refresh_rx else {
            log::warn!("kad already started");
            return;
        };
        self.started.store(true, Ordering::SeqCst);
        let kad = self.clone();
        let shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move { kad.run(refresh_rx, shutdown_rx).await });
    }

    async fn run(
        self: Arc<Self>,
        mut refresh_rx: mpsc::UnboundedReceiver<oneshot::Sender<()>>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut refresh_tick =
            tokio::time::interval_at(tokio::time::Instant::now() + REFRESH_INTERVAL, REFRESH_INTERVAL);
        let mut check_tick = tokio::time::interval(CHECK_INTERVAL);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<()>();
        let mut waiting: Vec<oneshot::Sender<()>> = Vec::new();
        let mut refreshing = false;

        loop {
            let mut start_refresh = false;
            tokio::select! {
                _ = refresh_tick.tick() => start_refresh = true,
                Some(waiter) = refresh_rx.recv() => {
                    waiting.push(waiter);
                    start_refresh = true;
                }
                Some(()) = done_rx.recv() => {
                    refreshing = false;
                    for waiter in waiting.drain(..) {
                        let _ = waiter.send(());
                    }
                }
                _ = check_tick.tick() => {
                    start_refresh = self.do_check();
                }
                _ = shutdown_rx.wait_for(|stop| *stop) => break,
            }

            if start_refresh && !refreshing {
                refreshing = true;
                let kad = self.clone();
                let done = done_tx.clone();
                tokio::spawn(async move {
                    kad.do_refresh().await;
                    let _ = done.send(());
                });
            }
        }
        log::info!("kad loop stopped");
    }

    /// Periodic check; returns whether a refresh is wanted
    fn do_check(self: &Arc<Self>) -> bool {
        let need_refresh = {
            let mut table = self.lock();
            if table.setup_check_count < MAX_SETUP_CHECK_COUNT {
                table.setup_check_count += 1;
            }
            let len: usize = table.buckets.iter().map(|b| b.entries.len()).sum();
            len <= self.seeds.len() || table.setup_check_count < MAX_SETUP_CHECK_COUNT
        };

        if let Some((index, last)) = self.revalidate_target() {
            let kad = self.clone();
            let check = self.rpc.ping_wait(&last);
            tokio::spawn(async move {
                match check.await {
                    Ok(()) => kad.on_revalidated(index, &last),
                    Err(e) => {
                        log::debug!("revalidate {} failed: {}", last, e);
                        kad.on_revalidate_failed(index, &last);
                    }
                }
            });
        }
        need_refresh
    }

    /// Last entry of a random non-empty bucket
    fn revalidate_target(&self) -> Option<(usize, Node)> {
        let table = self.lock();
        let candidates: Vec<usize> = table
            .buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.entries.is_empty())
            .map(|(i, _)| i)
            .collect();
        let index = *candidates.choose(&mut rand::thread_rng())?;
        table.buckets[index].entries.last().cloned().map(|n| (index, n))
    }

    fn on_revalidated(&self, index: usize, node: &Node) {
        let mut table = self.lock();
        let bucket = &mut table.buckets[index];
        if let Some(pos) = bucket.position(&node.id) {
            let mut entry = bucket.entries.remove(pos);
            entry.fails = 0;
            bucket.entries.insert(0, entry);
        }
    }

    fn on_revalidate_failed(&self, index: usize, node: &Node) {
        let mut table = self.lock();
        if let Some(pos) = table.buckets[index].position(&node.id) {
            table.buckets[index].entries[pos].fails += 1;
        }
        Self::replace(&mut table.buckets[index], node);
    }

    /// Swap the dead `last` entry for a random replacement, or drop it
    fn replace(bucket: &mut Bucket, last: &Node) {
        match bucket.entries.last() {
            Some(n) if n.id == last.id => {}
            _ => return,
        }
        if bucket.replacements.is_empty() {
            bucket.entries.pop();
            return;
        }
        let i = rand::thread_rng().gen_range(0..bucket.replacements.len());
        let mut r = bucket.replacements.remove(i);
        r.added_at = Some(Instant::now());
        let end = bucket.entries.len() - 1;
        log::debug!("kad replace {} with {}", last, r);
        bucket.entries[end] = r;
    }

    async fn do_refresh(&self) {
        for seed in &self.seeds {
            self.rpc.ping(seed);
        }
        for seed in &self.seeds {
            self.add(seed.clone());
        }

        self.lookup_inner(self.self_node.id, false).await;
        for _ in 0..RANDOM_LOOKUPS {
            self.lookup_inner(NodeId::random(), false).await;
        }
    }

    /// Ask the loop for a refresh and wait until one completes
    pub async fn refresh(&self) {
        if !self.started.load(Ordering::SeqCst) {
            return;
        }
        let (tx, rx) = oneshot::channel();
        if self.refresh_tx.send(tx).is_err() {
            return;
        }
        let _ = rx.await;
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Iteratively find the nodes closest to `target`
    pub async fn lookup(&self, target: NodeId) -> Vec<Node> {
        self.lookup_inner(target, true).await
    }

    async fn lookup_inner(&self, target: NodeId, refresh_if_empty: bool) -> Vec<Node> {
        let target_sha = target.sha();
        let mut seen: HashSet<NodeId> = HashSet::new();
        let mut asked: HashSet<NodeId> = HashSet::new();
        seen.insert(self.self_node.id);
        asked.insert(self.self_node.id);

        let mut result = self.closest(&target_sha, BUCKET_SIZE);
        if result.entries.is_empty() && refresh_if_empty {
            self.refresh().await;
            result = self.closest(&target_sha, BUCKET_SIZE);
        }
        for n in &result.entries {
            seen.insert(n.id);
        }

        let mut pending = FuturesUnordered::new();
        loop {
            for n in &result.entries {
                if pending.len() >= ALPHA {
                    break;
                }
                if asked.insert(n.id) {
                    let node = n.clone();
                    let reply = self.rpc.find_node(&node, target);
                    pending.push(async move { (node, reply.await) });
                }
            }

            let Some((from, reply)) = pending.next().await else {
                break;
            };
            match reply {
                Ok(nodes) => {
                    for n in nodes {
                        if !n.id.is_valid() || !seen.insert(n.id) {
                            continue;
                        }
                        self.stuff(n.clone());
                        self.ping_node(&n);
                        result.push(n, BUCKET_SIZE);
                    }
                }
                Err(e) => log::debug!("find node {} at {} failed: {}", target, from, e),
            }
        }
        result.entries
    }

    /// Locate a node by id, searching the network if it is not in the table
    pub async fn resolve(&self, id: NodeId) -> Option<Node> {
        if let Some(node) = self.find(&id) {
            return Some(node);
        }
        self.lookup(id).await.into_iter().find(|n| n.id == id)
    }

    // =========================================================================
    // Table operations
    // =========================================================================

    pub fn find(&self, id: &NodeId) -> Option<Node> {
        let index = self.bucket_index(&id.sha());
        let table = self.lock();
        let bucket = &table.buckets[index];
        bucket.position(id).map(|pos| bucket.entries[pos].clone())
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.find(id).is_some()
    }

    /// Bump a known node to the front, else insert it or keep it as a
    /// replacement when the bucket is full
    pub fn add(&self, node: Node) {
        if node.id == self.self_node.id || !node.id.is_valid() {
            return;
        }
        let index = self.bucket_index(&node.sha);
        let mut table = self.lock();
        let bucket = &mut table.buckets[index];
        if bucket.bump(&node) {
            return;
        }
        if bucket.entries.len() < BUCKET_SIZE {
            log::debug!("kad add {}", node);
            bucket.add_front(node);
        } else {
            bucket.add_replacement(node);
        }
    }

    /// Insert only where there is room; known nodes are left untouched
    pub fn stuff(&self, node: Node) {
        if node.id == self.self_node.id || !node.id.is_valid() {
            return;
        }
        let index = self.bucket_index(&node.sha);
        let mut table = self.lock();
        let bucket = &mut table.buckets[index];
        if bucket.position(&node.id).is_none() && bucket.entries.len() < BUCKET_SIZE {
            bucket.add_front(node);
        }
    }

    pub fn delete(&self, id: &NodeId) {
        let index = self.bucket_index(&id.sha());
        let mut table = self.lock();
        table.buckets[index].entries.retain(|n| n.id != *id);
    }

    /// Ping unless pinged recently; nodes that failed before are always retried
    pub fn ping_node(&self, node: &Node) {
        let index = self.bucket_index(&node.sha);
        let known = {
            let mut table = self.lock();
            let bucket = &mut table.buckets[index];
            match bucket.position(&node.id) {
                None => None,
                Some(pos) => {
                    let entry = &mut bucket.entries[pos];
                    let expired = entry
                        .ping_at
                        .map(|t| t.elapsed() >= NODE_PING_EXPIRATION)
                        .unwrap_or(true);
                    if entry.pinged || !(entry.fails > 0 || expired) {
                        return;
                    }
                    entry.ping_at = Some(Instant::now());
                    Some(entry.clone())
                }
            }
        };
        self.rpc.ping(known.as_ref().unwrap_or(node));
    }

    pub fn ping_all(&self) {
        for node in self.nodes() {
            self.ping_node(&node);
        }
    }

    /// The node pinged us from `node`'s endpoint
    pub fn on_ping_node(&self, node: Node) {
        if node.id == self.self_node.id || !node.id.is_valid() {
            return;
        }
        let index = self.bucket_index(&node.sha);
        let mut table = self.lock();
        let bucket = &mut table.buckets[index];
        if let Some(pos) = bucket.position(&node.id) {
            bucket.entries[pos].pinged = true;
            return;
        }
        let mut node = node;
        node.pinged = true;
        if bucket.entries.len() < BUCKET_SIZE {
            bucket.add_front(node);
        } else {
            bucket.add_replacement(node);
        }
    }

    pub fn has_pinged(&self, id: &NodeId) -> bool {
        self.find(id).map(|n| n.pinged).unwrap_or(false)
    }

    /// The `n` known nodes closest to `target`
    pub fn closest(&self, target: &[u8; 32], n: usize) -> NodesByDistance {
        let mut result = NodesByDistance::new(*target);
        let table = self.lock();
        for bucket in &table.buckets {
            for entry in &bucket.entries {
                result.push(entry.clone(), n);
            }
        }
        result
    }

    pub fn len(&self) -> usize {
        self.lock().buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.lock()
            .buckets
            .iter()
            .flat_map(|b| b.entries.iter().cloned())
            .collect()
    }

    /// Stop the maintenance loop; pending refresh waiters are released
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }
}
