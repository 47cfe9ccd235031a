//! Traffic accounting
//!
//! [`FlowMeter`] tracks per-code send/receive volume between periodic
//! reports; [`CountStatistics`] keeps named per-code counters.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

/// Interval between flow reports
pub const FLOW_METER_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlowItem {
    pub send_count: u64,
    pub send_size: u64,
    pub recv_count: u64,
    pub recv_size: u64,
}

/// Per message code traffic meter
pub struct FlowMeter {
    name: String,
    items: Mutex<BTreeMap<u32, FlowItem>>,
}

impl FlowMeter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            items: Mutex::new(BTreeMap::new()),
        }
    }

    fn with_item<F: FnOnce(&mut FlowItem)>(&self, code: u32, f: F) {
        let mut items = match self.items.lock() {
            Ok(items) => items,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(items.entry(code).or_default());
    }

    pub fn send(&self, code: u32, size: usize) {
        self.with_item(code, |item| {
            item.send_count += 1;
            item.send_size += size as u64;
        });
    }

    pub fn recv(&self, code: u32, size: usize) {
        self.with_item(code, |item| {
            item.recv_count += 1;
            item.recv_size += size as u64;
        });
    }

    pub fn snapshot(&self) -> BTreeMap<u32, FlowItem> {
        match self.items.lock() {
            Ok(items) => items.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn get(&self, code: u32) -> FlowItem {
        self.snapshot().remove(&code).unwrap_or_default()
    }

    pub fn print(&self) {
        let items = self.snapshot();
        let (mut send_total, mut recv_total) = (0u64, 0u64);
        for (code, item) in &items {
            send_total += item.send_size;
            recv_total += item.recv_size;
            log::info!(
                "[{}] code: {} send: {} ({} bytes) recv: {} ({} bytes)",
                self.name,
                code,
                item.send_count,
                item.send_size,
                item.recv_count,
                item.recv_size
            );
        }
        log::info!(
            "[{}] total send: {} bytes, total recv: {} bytes",
            self.name,
            send_total,
            recv_total
        );
    }

    pub fn reset(&self) {
        match self.items.lock() {
            Ok(mut items) => items.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }
}

/// Named counters keyed by code
#[derive(Default)]
pub struct CountStatistics {
    counters: Mutex<HashMap<(String, u32), (u64, u64)>>,
}

impl CountStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one occurrence of `size` bytes under `name`/`code`
    pub fn add_count(&self, name: &str, code: u32, size: usize) {
        let mut counters = match self.counters.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = counters.entry((name.to_string(), code)).or_insert((0, 0));
        entry.0 += 1;
        entry.1 += size as u64;
    }

    /// (count, bytes) for `name`/`code`
    pub fn get(&self, name: &str, code: u32) -> (u64, u64) {
        let counters = match self.counters.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        counters
            .get(&(name.to_string(), code))
            .copied()
            .unwrap_or((0, 0))
    }
}
