//! # Quota Selector
//!
//! Load-based fallback for smart balancing. The status poller publishes a
//! table of `(port, quota)` entries sorted ascending by quota, so the last
//! entry is always the least busy worker. Dispatches without a usable
//! session route drain the table from the tail, one quota unit per request;
//! once the table is empty, selection falls back to a uniformly random
//! registry member until the next poll publishes a fresh table.

use crate::registry::WorkerRegistry;
use crate::status::WorkerStatus;
use rand::Rng;
use std::sync::Mutex;

/// One worker's remaining share of deficit traffic for the current poll
/// interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaEntry {
    pub port: u16,
    pub quota: u32,
}

/// The drainable quota table. Publication replaces the table wholesale;
/// consumption decrements the tail entry inside a single critical section so
/// each quota unit is spent exactly once.
#[derive(Default)]
pub struct QuotaSelector {
    table: Mutex<Vec<QuotaEntry>>,
}

impl QuotaSelector {
    /// Replace the table with a freshly rebuilt one. In-flight dispatches
    /// keep draining whichever table they already locked.
    pub fn publish(&self, entries: Vec<QuotaEntry>) {
        *self.table.lock().unwrap() = entries;
    }

    pub fn snapshot(&self) -> Vec<QuotaEntry> {
        self.table.lock().unwrap().clone()
    }

    /// Consume one quota unit from the least-busy worker, or fall back to a
    /// uniform random registry member when the table is drained. Returns
    /// `None` only when the table is empty and the registry has no workers.
    pub fn choose_target_port(&self, registry: &WorkerRegistry) -> Option<u16> {
        {
            let mut table = self.table.lock().unwrap();
            if let Some(entry) = table.last_mut() {
                entry.quota -= 1;
                let port = entry.port;
                if entry.quota < 1 {
                    table.pop();
                }
                return Some(port);
            }
        }
        self.random_port(registry)
    }

    /// Uniform random registry member. Used directly for WebSocket upgrades
    /// whose session names a port outside the registry.
    pub fn random_port(&self, registry: &WorkerRegistry) -> Option<u16> {
        if registry.is_empty() {
            return None;
        }
        let index = rand::rng().random_range(0..registry.len());
        registry.port_at(index)
    }
}

/// Rebuild the quota table from one completed poll cycle.
///
/// The busiest worker is the baseline and receives no entry; every other
/// known worker is offered its deficit divided by `balancer_count`, so N
/// cooperating balancers together deliver roughly one deficit's worth of
/// traffic before the next refresh. Unknown workers count as infinitely busy
/// and never receive an entry. The result is sorted ascending so the tail is
/// the least busy pick.
pub fn rebuild(cycle: &[(u16, WorkerStatus)], balancer_count: u32) -> Vec<QuotaEntry> {
    let divisor = balancer_count.max(1) as f64;
    let max_clients = cycle
        .iter()
        .filter_map(|(_, status)| status.client_count())
        .max()
        .unwrap_or(0);

    let mut entries: Vec<QuotaEntry> = cycle
        .iter()
        .filter_map(|(port, status)| {
            let clients = status.client_count()?;
            let quota = (((max_clients - clients) as f64) / divisor).round() as i64;
            (quota > 0).then(|| QuotaEntry {
                port: *port,
                quota: quota as u32,
            })
        })
        .collect();
    entries.sort_by_key(|entry| entry.quota);
    entries
}
