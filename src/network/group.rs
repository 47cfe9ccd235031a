//! Group overlay
//!
//! A group is a named member set (a consensus committee, say). Instead of a
//! full mesh each member connects to a small, deterministic subset of the
//! others: its two ring successors in sorted order plus a few
//! "accelerate" links spread evenly around the ring. Broadcasting to that
//! subset and letting every member re-broadcast reaches the whole group in
//! few hops.

use crate::network::buffer_pool::BufferPool;
use crate::network::node::NodeId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Ring successors every member links to
pub const GROUP_BASE_CONNECT_NODE_COUNT: usize = 2;

/// Groups this small only use ring links
pub const GROUP_MIN_ACCELERATE_SIZE: usize = 5;

/// How often connect targets are re-checked
pub const GROUP_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Minimum spacing between two resolves of the same member
pub const RESOLVE_COOLDOWN: Duration = Duration::from_secs(3 * 60);

/// How a member can be reached right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupRoute {
    /// A peer entry already exists
    Peer(Option<SocketAddr>),
    /// Not a peer yet, but the routing table knows its address
    Kad(SocketAddr),
    Unknown,
}

/// What the overlay needs from the node it runs on
pub trait GroupLink: Send + Sync {
    fn self_id(&self) -> NodeId;
    fn route(&self, id: &NodeId) -> GroupRoute;
    fn write(&self, id: NodeId, addr: Option<SocketAddr>, packet: &[u8], code: u32);
    fn ping(&self, id: NodeId, addr: Option<SocketAddr>);
    /// Start a background network lookup for `id`
    fn resolve(&self, id: NodeId);
}

/// Compute the connect set of `self_id` within `members`.
///
/// Returns the sorted, de-duplicated members, our index in them (0 when we
/// are not a member) and the ids to connect to.
pub fn gen_connect_nodes(members: &[NodeId], self_id: &NodeId) -> (Vec<NodeId>, usize, Vec<NodeId>) {
    let mut sorted = members.to_vec();
    sorted.sort();
    sorted.dedup();

    let n = sorted.len();
    let cur_index = sorted.iter().position(|m| m == self_id).unwrap_or(0);
    let mut need_connect: Vec<NodeId> = Vec::new();
    if n < 2 {
        return (sorted, cur_index, need_connect);
    }

    let push = |index: usize, out: &mut Vec<NodeId>| {
        let id = sorted[index];
        if id != *self_id && !out.contains(&id) {
            out.push(id);
        }
    };

    let mut next_index = cur_index;
    for _ in 0..GROUP_BASE_CONNECT_NODE_COUNT.min(n - 1) {
        next_index = (next_index + 1) % n;
        push(next_index, &mut need_connect);
    }

    if n >= GROUP_MIN_ACCELERATE_SIZE {
        let max_count = ((n as f64).sqrt() * 0.8) as usize;
        let max_count = max_count.saturating_sub(need_connect.len());
        if max_count > 0 {
            let step = n / max_count;
            for _ in 0..max_count {
                next_index = (next_index + step) % n;
                push(next_index, &mut need_connect);
            }
        }
    }

    (sorted, cur_index, need_connect)
}

struct GroupState {
    members: Vec<NodeId>,
    cur_index: usize,
    need_connect: Vec<NodeId>,
    resolving: HashMap<NodeId, Instant>,
}

/// One named overlay
pub struct Group {
    id: String,
    self_id: NodeId,
    state: Mutex<GroupState>,
}

impl Group {
    pub fn new(id: &str, members: &[NodeId], self_id: NodeId) -> Self {
        let (members, cur_index, need_connect) = gen_connect_nodes(members, &self_id);
        Self {
            id: id.to_string(),
            self_id,
            state: Mutex::new(GroupState {
                members,
                cur_index,
                need_connect,
                resolving: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GroupState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Replace the member list and regenerate the connect set
    pub fn rebuild(&self, members: &[NodeId]) {
        let (members, cur_index, need_connect) = gen_connect_nodes(members, &self.self_id);
        let mut state = self.lock();
        state.members = members;
        state.cur_index = cur_index;
        state.need_connect = need_connect;
    }

    pub fn members(&self) -> Vec<NodeId> {
        self.lock().members.clone()
    }

    pub fn need_connect(&self) -> Vec<NodeId> {
        self.lock().need_connect.clone()
    }

    pub fn cur_index(&self) -> usize {
        self.lock().cur_index
    }

    pub fn is_member(&self, id: &NodeId) -> bool {
        self.lock().members.binary_search(id).is_ok()
    }

    /// Dial connect targets that have no peer yet
    pub fn do_refresh(&self, link: &dyn GroupLink) {
        let mut state = self.lock();
        let targets = state.need_connect.clone();
        for id in targets {
            if id == self.self_id {
                continue;
            }
            match link.route(&id) {
                GroupRoute::Peer(_) => {}
                GroupRoute::Kad(addr) => {
                    log::debug!("group {} refresh: {} found in kad at {}", self.id, id, addr);
                    link.ping(id, Some(addr));
                }
                GroupRoute::Unknown => {
                    link.ping(id, None);
                    let due = state
                        .resolving
                        .get(&id)
                        .map(|t| t.elapsed() >= RESOLVE_COOLDOWN)
                        .unwrap_or(true);
                    if due {
                        log::debug!("group {} refresh: resolving {}", self.id, id);
                        state.resolving.insert(id, Instant::now());
                        link.resolve(id);
                    }
                }
            }
        }
    }

    /// Write `packet` to every connect target, one task per target each
    /// holding its own pooled copy
    pub fn send(
        &self,
        link: &Arc<dyn GroupLink>,
        pool: &Arc<BufferPool>,
        packet: &[u8],
        code: u32,
    ) -> Vec<JoinHandle<()>> {
        log::debug!("group send, id: {} code: {}", self.id, code);
        let targets = self.need_connect();
        targets
            .into_iter()
            .filter(|id| *id != self.self_id)
            .map(|id| {
                let buf = pool.copy_from(packet);
                let link = link.clone();
                let pool = pool.clone();
                tokio::spawn(async move {
                    let addr = match link.route(&id) {
                        GroupRoute::Peer(addr) => addr,
                        GroupRoute::Kad(addr) => Some(addr),
                        GroupRoute::Unknown => None,
                    };
                    link.write(id, addr, &buf, code);
                    pool.free_buffer(buf);
                })
            })
            .collect()
    }
}

/// All groups this node takes part in
pub struct GroupManager {
    groups: RwLock<HashMap<String, Arc<Group>>>,
    link: Weak<dyn GroupLink>,
    pool: Arc<BufferPool>,
}

impl GroupManager {
    pub fn new(link: Weak<dyn GroupLink>, pool: Arc<BufferPool>) -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            link,
            pool,
        }
    }

    pub fn group(&self, id: &str) -> Option<Arc<Group>> {
        match self.groups.read() {
            Ok(groups) => groups.get(id).cloned(),
            Err(poisoned) => poisoned.into_inner().get(id).cloned(),
        }
    }

    fn all_groups(&self) -> Vec<Arc<Group>> {
        match self.groups.read() {
            Ok(groups) => groups.values().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().values().cloned().collect(),
        }
    }

    pub fn group_count(&self) -> usize {
        self.all_groups().len()
    }

    /// Create a group, or rebuild it if it exists, then refresh its links
    pub fn build_group(&self, id: &str, members: &[NodeId]) -> Option<Arc<Group>> {
        let link = self.link.upgrade()?;
        log::info!("build group, id: {}, count: {}", id, members.len());

        let group = {
            let mut groups = match self.groups.write() {
                Ok(groups) => groups,
                Err(poisoned) => poisoned.into_inner(),
            };
            match groups.get(id) {
                Some(group) => {
                    group.rebuild(members);
                    group.clone()
                }
                None => {
                    let group = Arc::new(Group::new(id, members, link.self_id()));
                    groups.insert(id.to_string(), group.clone());
                    group
                }
            }
        };
        group.do_refresh(link.as_ref());
        Some(group)
    }

    pub fn remove_group(&self, id: &str) {
        log::info!("remove group, id: {}", id);
        match self.groups.write() {
            Ok(mut groups) => groups.remove(id),
            Err(poisoned) => poisoned.into_inner().remove(id),
        };
    }

    pub fn do_refresh(&self) {
        let Some(link) = self.link.upgrade() else {
            return;
        };
        for group in self.all_groups() {
            group.do_refresh(link.as_ref());
        }
    }

    /// Broadcast into a group this node is a member of
    pub fn send_group(&self, id: &str, packet: &[u8], code: u32) -> Vec<JoinHandle<()>> {
        let Some(group) = self.group(id) else {
            log::info!("group broadcast, group {} not found", id);
            return Vec::new();
        };
        let Some(link) = self.link.upgrade() else {
            return Vec::new();
        };
        log::debug!("group broadcast, id: {} code: {}", id, code);
        group.send(&link, &self.pool, packet, code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashSet, VecDeque};

    fn sorted_ids(n: usize) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = (0..n).map(|_| NodeId::random()).collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_six_members_self_at_two() {
        let ids = sorted_ids(6);
        let mut shuffled = ids.clone();
        shuffled.reverse();

        let (members, cur, need) = gen_connect_nodes(&shuffled, &ids[2]);
        assert_eq!(members, ids);
        assert_eq!(cur, 2);
        // floor(sqrt(6) * 0.8) = 1 leaves no room for accelerate links
        assert_eq!(need, vec![ids[3], ids[4]]);
    }

    #[test]
    fn test_small_groups() {
        let ids = sorted_ids(2);
        let (_, _, need) = gen_connect_nodes(&ids, &ids[1]);
        assert_eq!(need, vec![ids[0]]);

        let ids = sorted_ids(1);
        let (_, _, need) = gen_connect_nodes(&ids, &ids[0]);
        assert!(need.is_empty());

        let ids = sorted_ids(4);
        let (_, _, need) = gen_connect_nodes(&ids, &ids[3]);
        assert_eq!(need, vec![ids[0], ids[1]]);
    }

    #[test]
    fn test_accelerate_links_stride() {
        let ids = sorted_ids(25);
        let (_, _, need) = gen_connect_nodes(&ids, &ids[0]);
        // floor(5 * 0.8) - 2 = 2 extra links, stride 25 / 2 = 12; the
        // second one wraps onto ids[1] and is skipped
        assert_eq!(need, vec![ids[1], ids[2], ids[14]]);
    }

    #[test]
    fn test_non_member_uses_index_zero() {
        let ids = sorted_ids(3);
        let outsider = NodeId::random();
        let (_, cur, need) = gen_connect_nodes(&ids, &outsider);
        assert_eq!(cur, 0);
        assert_eq!(need, vec![ids[1], ids[2]]);
    }

    #[test]
    fn test_connect_set_bounded_and_connected() {
        for n in 5..60 {
            let ids = sorted_ids(n);
            let mut edges: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
            for id in &ids {
                let (_, _, need) = gen_connect_nodes(&ids, id);
                let bound = ((n as f64).sqrt() * 0.8) as usize;
                assert!(need.len() <= bound.max(GROUP_BASE_CONNECT_NODE_COUNT));
                assert!(!need.contains(id));
                for other in need {
                    edges.entry(*id).or_default().push(other);
                    edges.entry(other).or_default().push(*id);
                }
            }

            let mut seen = HashSet::new();
            let mut queue = VecDeque::from([ids[0]]);
            seen.insert(ids[0]);
            while let Some(cur) = queue.pop_front() {
                for next in edges.get(&cur).into_iter().flatten() {
                    if seen.insert(*next) {
                        queue.push_back(*next);
                    }
                }
            }
            assert_eq!(seen.len(), n, "group of {} not connected", n);
        }
    }

    #[derive(Default)]
    struct FakeLink {
        me: NodeId,
        routes: HashMap<NodeId, GroupRoute>,
        writes: Mutex<Vec<(NodeId, Option<SocketAddr>)>>,
        pings: Mutex<Vec<(NodeId, Option<SocketAddr>)>>,
        resolves: Mutex<Vec<NodeId>>,
    }

    impl GroupLink for FakeLink {
        fn self_id(&self) -> NodeId {
            self.me
        }
        fn route(&self, id: &NodeId) -> GroupRoute {
            self.routes.get(id).copied().unwrap_or(GroupRoute::Unknown)
        }
        fn write(&self, id: NodeId, addr: Option<SocketAddr>, _packet: &[u8], _code: u32) {
            self.writes.lock().unwrap().push((id, addr));
        }
        fn ping(&self, id: NodeId, addr: Option<SocketAddr>) {
            self.pings.lock().unwrap().push((id, addr));
        }
        fn resolve(&self, id: NodeId) {
            self.resolves.lock().unwrap().push(id);
        }
    }

    fn link_for(ids: &[NodeId], me: usize) -> Arc<FakeLink> {
        let addr: SocketAddr = "10.1.1.1:7000".parse().unwrap();
        let mut routes = HashMap::new();
        routes.insert(ids[(me + 1) % ids.len()], GroupRoute::Peer(None));
        routes.insert(ids[(me + 2) % ids.len()], GroupRoute::Kad(addr));
        Arc::new(FakeLink {
            me: ids[me],
            routes,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_group_send_prefers_peer_then_kad() {
        let ids = sorted_ids(4);
        let link = link_for(&ids, 0);
        let dyn_link: Arc<dyn GroupLink> = link.clone();
        let pool = Arc::new(BufferPool::new());
        let manager = GroupManager::new(Arc::downgrade(&dyn_link), pool);

        manager.build_group("g1", &ids).unwrap();
        futures::future::join_all(manager.send_group("g1", b"payload", 7)).await;

        let mut writes = link.writes.lock().unwrap().clone();
        writes.sort_by_key(|w| w.0);
        assert_eq!(
            writes,
            vec![(ids[1], None), (ids[2], Some("10.1.1.1:7000".parse::<SocketAddr>().unwrap()))]
        );

        assert!(manager.send_group("missing", b"x", 7).is_empty());
    }

    #[tokio::test]
    async fn test_refresh_resolves_with_cooldown() {
        let ids = sorted_ids(4);
        let addr: SocketAddr = "10.1.1.1:7000".parse().unwrap();
        let mut routes = HashMap::new();
        routes.insert(ids[1], GroupRoute::Kad(addr));
        let link = Arc::new(FakeLink {
            me: ids[0],
            routes,
            ..Default::default()
        });
        let dyn_link: Arc<dyn GroupLink> = link.clone();
        let manager = GroupManager::new(Arc::downgrade(&dyn_link), Arc::new(BufferPool::new()));

        manager.build_group("g1", &ids).unwrap();
        manager.do_refresh();

        // ids[1] is dialled through kad both times, ids[2] resolved only once
        assert_eq!(*link.resolves.lock().unwrap(), vec![ids[2]]);
        let pings = link.pings.lock().unwrap();
        assert_eq!(pings.iter().filter(|p| p.0 == ids[1]).count(), 2);
        assert!(pings.contains(&(ids[1], Some(addr))));
    }

    #[tokio::test]
    async fn test_rebuild_and_remove() {
        let ids = sorted_ids(6);
        let link = link_for(&ids, 0);
        let dyn_link: Arc<dyn GroupLink> = link.clone();
        let manager = GroupManager::new(Arc::downgrade(&dyn_link), Arc::new(BufferPool::new()));

        let group = manager.build_group("g1", &ids[..3]).unwrap();
        assert_eq!(group.members().len(), 3);
        manager.build_group("g1", &ids).unwrap();
        assert_eq!(group.members().len(), 6);
        assert!(group.is_member(&ids[5]));
        assert_eq!(manager.group_count(), 1);

        manager.remove_group("g1");
        assert!(manager.group("g1").is_none());
    }
}
