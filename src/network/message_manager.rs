//! Message id generation and flood deduplication

use crate::network::message::{BizMessageId, BIZ_MESSAGE_ID_LENGTH};
use crate::network::node::{fnv32a, NodeId};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// How long a seen id is remembered
pub const MESSAGE_CACHE_TIME: Duration = Duration::from_secs(5 * 60);

/// Interval between cache sweeps
pub const CLEAR_MESSAGE_CACHE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Default)]
struct SeenSets {
    messages: HashMap<u64, Instant>,
    biz_messages: HashMap<BizMessageId, Instant>,
    index: u32,
}

/// Generates unique message ids and remembers forwarded ones.
///
/// Ids are `(fnv32a(self id) << 32) | counter`, so two nodes never collide
/// unless their id hashes do.
pub struct MessageManager {
    forward_node_id: u32,
    seen: Mutex<SeenSets>,
}

impl MessageManager {
    pub fn new(id: NodeId) -> Self {
        Self {
            forward_node_id: fnv32a(id.as_bytes()),
            seen: Mutex::new(SeenSets::default()),
        }
    }

    fn seen(&self) -> std::sync::MutexGuard<'_, SeenSets> {
        match self.seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// New id for an outgoing envelope; it is marked as seen immediately
    pub fn gen_message_id(&self) -> u64 {
        let mut seen = self.seen();
        seen.index = seen.index.wrapping_add(1);
        let id = (u64::from(self.forward_node_id) << 32) | u64::from(seen.index);
        seen.messages.insert(id, Instant::now());
        id
    }

    pub fn forward(&self, message_id: u64) {
        self.seen().messages.insert(message_id, Instant::now());
    }

    pub fn is_forwarded(&self, message_id: u64) -> bool {
        self.seen().messages.contains_key(&message_id)
    }

    pub fn forward_biz(&self, biz_id: BizMessageId) {
        self.seen().biz_messages.insert(biz_id, Instant::now());
    }

    pub fn is_forwarded_biz(&self, biz_id: &BizMessageId) -> bool {
        self.seen().biz_messages.contains_key(biz_id)
    }

    /// Check-and-mark in one step.
    ///
    /// The biz id decides when present, otherwise the wire id does. Returns
    /// `false` if the envelope was already seen; otherwise marks both ids and
    /// returns `true`.
    pub fn accept(&self, message_id: u64, biz_id: Option<&BizMessageId>) -> bool {
        let mut seen = self.seen();
        let forwarded = match biz_id {
            Some(biz) => seen.biz_messages.contains_key(biz),
            None => seen.messages.contains_key(&message_id),
        };
        if forwarded {
            return false;
        }

        let now = Instant::now();
        seen.messages.insert(message_id, now);
        if let Some(biz) = biz_id {
            seen.biz_messages.insert(*biz, now);
        }
        true
    }

    /// Drop entries older than [`MESSAGE_CACHE_TIME`]
    pub fn clear(&self) {
        self.clear_older_than(MESSAGE_CACHE_TIME);
    }

    pub fn clear_older_than(&self, ttl: Duration) {
        let mut seen = self.seen();
        let now = Instant::now();
        seen.messages.retain(|_, t| now.duration_since(*t) <= ttl);
        seen.biz_messages.retain(|_, t| now.duration_since(*t) <= ttl);
    }

    pub fn seen_counts(&self) -> (usize, usize) {
        let seen = self.seen();
        (seen.messages.len(), seen.biz_messages.len())
    }
}

/// Left-aligned, zero padded biz id from arbitrary bytes
pub fn biz_id_from_bytes(bytes: &[u8]) -> BizMessageId {
    let mut id = [0u8; BIZ_MESSAGE_ID_LENGTH];
    let n = bytes.len().min(BIZ_MESSAGE_ID_LENGTH);
    id[..n].copy_from_slice(&bytes[..n]);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_ids_unique_and_prefixed() {
        let id = NodeId::random();
        let mm = MessageManager::new(id);
        let a = mm.gen_message_id();
        let b = mm.gen_message_id();
        assert_ne!(a, b);
        assert_eq!((a >> 32) as u32, fnv32a(id.as_bytes()));
        assert_eq!(b & 0xffff_ffff, 2);
        assert!(mm.is_forwarded(a));
    }

    #[test]
    fn test_accept_is_idempotent() {
        let mm = MessageManager::new(NodeId::random());
        assert!(mm.accept(7, None));
        assert!(!mm.accept(7, None));
        assert!(mm.accept(8, None));
    }

    #[test]
    fn test_biz_id_takes_precedence() {
        let mm = MessageManager::new(NodeId::random());
        let biz = biz_id_from_bytes(b"block-hash");
        assert!(mm.accept(1, Some(&biz)));
        // same payload re-wrapped under a new wire id is still a duplicate
        assert!(!mm.accept(2, Some(&biz)));
        assert!(mm.is_forwarded(1));
        assert!(!mm.is_forwarded(2));
        assert!(mm.is_forwarded_biz(&biz));
    }

    #[test]
    fn test_clear_evicts_old_entries() {
        let mm = MessageManager::new(NodeId::random());
        mm.forward(1);
        mm.forward_biz([1u8; 32]);
        mm.clear();
        assert_eq!(mm.seen_counts(), (1, 1));

        std::thread::sleep(Duration::from_millis(20));
        mm.clear_older_than(Duration::from_millis(5));
        assert_eq!(mm.seen_counts(), (0, 0));
    }
}
