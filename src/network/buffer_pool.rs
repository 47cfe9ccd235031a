//! Tiered byte-buffer pool
//!
//! Inbound chunks and outbound frames churn through many short-lived
//! buffers, so they are recycled through five size tiers.
//!
//! # Ownership contract
//!
//! - [`BufferPool::get_buffer`] hands out an empty `BytesMut` whose capacity
//!   is the smallest tier that fits the request (or exactly the request when
//!   it is larger than every tier).
//! - The caller owns the buffer until it passes it back to
//!   [`BufferPool::free_buffer`]. A buffer must be freed at most once and
//!   must not be used afterwards.
//! - A buffer whose capacity no longer matches its tier (it was grown,
//!   split or advanced) is dropped instead of being pooled.
//! - Forgetting to free is not a leak, it only makes the pool fall back to
//!   fresh allocations.

use bytes::BytesMut;
use std::sync::Mutex;

// =============================================================================
// Constants
// =============================================================================

/// (buffer size, max pooled buffers) per tier
pub const POOL_TIERS: [(usize, usize); 5] = [
    (1024, 1024),
    (4 * 1024, 512),
    (32 * 1024, 256),
    (512 * 1024, 64),
    (1536 * 1024, 32),
];

struct PoolTier {
    size: usize,
    max: usize,
    free: Vec<BytesMut>,
    in_use: usize,
}

impl PoolTier {
    fn new(size: usize, max: usize) -> Self {
        Self {
            size,
            max,
            free: Vec::new(),
            in_use: 0,
        }
    }

    fn get(&mut self) -> BytesMut {
        self.in_use += 1;
        match self.free.pop() {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None => BytesMut::with_capacity(self.size),
        }
    }

    fn put(&mut self, mut buf: BytesMut) {
        self.in_use = self.in_use.saturating_sub(1);
        if buf.capacity() == self.size && self.free.len() < self.max {
            buf.clear();
            self.free.push(buf);
        }
    }
}

/// Snapshot of one tier
#[derive(Debug, Clone, PartialEq)]
pub struct PoolTierStats {
    pub size: usize,
    pub free: usize,
    pub in_use: usize,
}

/// Thread-safe tiered buffer pool
pub struct BufferPool {
    tiers: Mutex<Vec<PoolTier>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            tiers: Mutex::new(
                POOL_TIERS
                    .iter()
                    .map(|(size, max)| PoolTier::new(*size, *max))
                    .collect(),
            ),
        }
    }

    /// Acquire an empty buffer able to hold `size` bytes
    pub fn get_buffer(&self, size: usize) -> BytesMut {
        let mut tiers = match self.tiers.lock() {
            Ok(tiers) => tiers,
            Err(poisoned) => poisoned.into_inner(),
        };
        match tiers.iter_mut().find(|t| t.size >= size) {
            Some(tier) => tier.get(),
            None => BytesMut::with_capacity(size),
        }
    }

    /// Return a buffer obtained from [`BufferPool::get_buffer`]
    pub fn free_buffer(&self, buf: BytesMut) {
        let mut tiers = match self.tiers.lock() {
            Ok(tiers) => tiers,
            Err(poisoned) => poisoned.into_inner(),
        };
        let cap = buf.capacity();
        if let Some(tier) = tiers.iter_mut().find(|t| t.size >= cap) {
            tier.put(buf);
        }
    }

    /// Copy `data` into a pooled buffer
    pub fn copy_from(&self, data: &[u8]) -> BytesMut {
        let mut buf = self.get_buffer(data.len());
        buf.extend_from_slice(data);
        buf
    }

    pub fn stats(&self) -> Vec<PoolTierStats> {
        let tiers = match self.tiers.lock() {
            Ok(tiers) => tiers,
            Err(poisoned) => poisoned.into_inner(),
        };
        tiers
            .iter()
            .map(|t| PoolTierStats {
                size: t.size,
                free: t.free.len(),
                in_use: t.in_use,
            })
            .collect()
    }

    pub fn print(&self) {
        for tier in self.stats() {
            log::debug!(
                "[buffer pool] size: {} free: {} in use: {}",
                tier.size,
                tier.free,
                tier.in_use
            );
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}
