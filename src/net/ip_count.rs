//! Per-IP connection accounting for admission control.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Mutex;

/// Concurrent map from client address to its live connection count.
///
/// Ordered by `(family, addr)` through the natural `IpAddr` ordering.
/// Entries are removed the moment their count drops to zero, so the table
/// only ever holds addresses with active connections.
#[derive(Debug, Default)]
pub(crate) struct IpCounter {
    inner: Mutex<BTreeMap<IpAddr, usize>>,
}

impl IpCounter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Counts a new connection from `addr` unless it would exceed `limit`.
    /// A `limit` of zero means unlimited.
    pub(crate) fn try_acquire(&self, addr: IpAddr, limit: usize) -> bool {
        let mut map = self.inner.lock().expect("ip counter poisoned");
        let count = map.entry(addr).or_insert(0);

        if limit != 0 && *count >= limit {
            if *count == 0 {
                map.remove(&addr);
            }
            return false;
        }

        *count += 1;
        true
    }

    /// Counts a connection for `addr` unconditionally, bypassing the cap.
    /// Used when a resumed connection reclaims the slot it gave up while
    /// suspended; the cap may transiently be exceeded.
    pub(crate) fn acquire(&self, addr: IpAddr) {
        let mut map = self.inner.lock().expect("ip counter poisoned");
        *map.entry(addr).or_insert(0) += 1;
    }

    /// Releases one connection for `addr`.
    pub(crate) fn release(&self, addr: IpAddr) {
        let mut map = self.inner.lock().expect("ip counter poisoned");
        if let Some(count) = map.get_mut(&addr) {
            *count -= 1;
            if *count == 0 {
                map.remove(&addr);
            }
        }
    }

    /// Live connections currently counted for `addr`.
    pub(crate) fn count(&self, addr: IpAddr) -> usize {
        self.inner
            .lock()
            .expect("ip counter poisoned")
            .get(&addr)
            .copied()
            .unwrap_or(0)
    }

    /// Sum over all addresses.
    pub(crate) fn total(&self) -> usize {
        self.inner
            .lock()
            .expect("ip counter poisoned")
            .values()
            .sum()
    }
}
