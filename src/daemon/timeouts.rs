//! Idle-timeout bookkeeping.
//!
//! Two lists per daemon core: connections on the daemon-wide default
//! timeout sit in an LRU-ordered list whose tail is always the
//! longest-idle entry, so the expiry sweep inspects the tail and stops at
//! the first survivor. Connections with a bespoke timeout sit in a second
//! list that is scanned fully.

use crate::daemon::slots::{ConnKey, ConnList, ListId, SlotArena};
use once_cell::sync::Lazy;
use std::time::{Duration, Instant};

/// Monotonic milliseconds since the first call in this process.
pub(crate) fn now_ms() -> u64 {
    static BASE: Lazy<Instant> = Lazy::new(Instant::now);
    BASE.elapsed().as_millis() as u64
}

pub(crate) struct TimeoutQueues {
    pub(crate) normal: ConnList,
    pub(crate) manual: ConnList,
}

impl TimeoutQueues {
    pub(crate) fn new() -> Self {
        Self {
            normal: ConnList::new(ListId::NormalTimeout),
            manual: ConnList::new(ListId::ManualTimeout),
        }
    }

    /// Adds a connection to the list matching its timeout source.
    pub(crate) fn enroll(&mut self, arena: &mut SlotArena, key: ConnKey) {
        let Some(conn) = arena.get(key) else { return };
        match conn.timeout_override() {
            Some(_) => self.manual.push_front(arena, key),
            None => self.normal.push_front(arena, key),
        }
    }

    /// Records activity: LRU entries move to the head.
    pub(crate) fn touch(&mut self, arena: &mut SlotArena, key: ConnKey) {
        if self.normal.contains(arena, key) {
            self.normal.move_to_front(arena, key);
        }
    }

    pub(crate) fn remove(&mut self, arena: &mut SlotArena, key: ConnKey) {
        self.normal.unlink(arena, key);
        self.manual.unlink(arena, key);
    }

    /// Moves a connection between lists after its timeout override changed.
    pub(crate) fn re_enroll(&mut self, arena: &mut SlotArena, key: ConnKey) {
        self.remove(arena, key);
        self.enroll(arena, key);
    }

    /// Collects expired connections. The LRU list is walked from the tail
    /// and abandoned at the first live entry; the manual list is scanned in
    /// full.
    pub(crate) fn sweep(
        &self,
        arena: &SlotArena,
        default_timeout: Duration,
        now: u64,
    ) -> Vec<ConnKey> {
        let mut expired = Vec::new();

        if !default_timeout.is_zero() {
            let mut cursor = self.normal.tail();
            while let Some(key) = cursor {
                let Some(conn) = arena.get(key) else { break };
                if !is_expired(conn.last_activity_ms(), default_timeout, now) {
                    break;
                }
                expired.push(key);
                cursor = self.normal.prev_of(arena, key);
            }
        }

        let mut cursor = self.manual.tail();
        while let Some(key) = cursor {
            let Some(conn) = arena.get(key) else { break };
            if let Some(timeout) = conn.timeout_override() {
                if !timeout.is_zero() && is_expired(conn.last_activity_ms(), timeout, now) {
                    expired.push(key);
                }
            }
            cursor = self.manual.prev_of(arena, key);
        }

        expired
    }

    /// Shortest wait until some connection could expire, used as the poll
    /// timeout bound.
    pub(crate) fn next_deadline(
        &self,
        arena: &SlotArena,
        default_timeout: Duration,
        now: u64,
    ) -> Option<Duration> {
        let mut shortest: Option<u64> = None;

        if !default_timeout.is_zero() {
            if let Some(conn) = self.normal.tail().and_then(|k| arena.get(k)) {
                shortest = Some(remaining_ms(
                    conn.last_activity_ms(),
                    default_timeout,
                    now,
                ));
            }
        }

        let mut cursor = self.manual.tail();
        while let Some(key) = cursor {
            let Some(conn) = arena.get(key) else { break };
            if let Some(timeout) = conn.timeout_override() {
                if !timeout.is_zero() {
                    let left = remaining_ms(conn.last_activity_ms(), timeout, now);
                    shortest = Some(shortest.map_or(left, |s| s.min(left)));
                }
            }
            cursor = self.manual.prev_of(arena, key);
        }

        shortest.map(Duration::from_millis)
    }
}

fn is_expired(last_activity: u64, timeout: Duration, now: u64) -> bool {
    now.saturating_sub(last_activity) >= timeout.as_millis() as u64
}

fn remaining_ms(last_activity: u64, timeout: Duration, now: u64) -> u64 {
    (last_activity + timeout.as_millis() as u64).saturating_sub(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::connection::Connection;

    fn arena_with(n: usize) -> (SlotArena, Vec<ConnKey>) {
        let mut arena = SlotArena::new();
        let keys = (0..n).map(|_| arena.insert(Connection::for_tests())).collect();
        (arena, keys)
    }

    #[test]
    fn clock_is_monotonic() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
    }

    #[test]
    fn lru_sweep_stops_at_first_live_entry() {
        let (mut arena, keys) = arena_with(3);
        let mut queues = TimeoutQueues::new();

        for &key in &keys {
            queues.enroll(&mut arena, key);
        }
        // keys[2] is at the head (most recent), keys[0] at the tail.

        arena.get_mut(keys[0]).unwrap().set_last_activity_ms(0);
        arena.get_mut(keys[1]).unwrap().set_last_activity_ms(1_000);
        arena.get_mut(keys[2]).unwrap().set_last_activity_ms(10_000);

        let expired = queues.sweep(&arena, Duration::from_secs(5), 7_000);
        assert_eq!(expired, vec![keys[0], keys[1]]);

        // Touching the tail entry rescues it from the next sweep.
        arena.get_mut(keys[0]).unwrap().set_last_activity_ms(7_000);
        queues.touch(&mut arena, keys[0]);
        let expired = queues.sweep(&arena, Duration::from_secs(5), 7_000);
        assert_eq!(expired, vec![keys[1]]);
    }

    #[test]
    fn zero_default_means_no_expiry() {
        let (mut arena, keys) = arena_with(1);
        let mut queues = TimeoutQueues::new();
        queues.enroll(&mut arena, keys[0]);
        arena.get_mut(keys[0]).unwrap().set_last_activity_ms(0);

        assert!(queues.sweep(&arena, Duration::ZERO, u64::MAX / 2).is_empty());
        assert_eq!(queues.next_deadline(&arena, Duration::ZERO, 0), None);
    }

    #[test]
    fn manual_list_is_scanned_fully() {
        let (mut arena, keys) = arena_with(2);
        let mut queues = TimeoutQueues::new();

        arena
            .get_mut(keys[0])
            .unwrap()
            .set_timeout_override(Some(Duration::from_secs(1)));
        arena
            .get_mut(keys[1])
            .unwrap()
            .set_timeout_override(Some(Duration::from_secs(60)));

        for &key in &keys {
            queues.enroll(&mut arena, key);
        }
        assert_eq!(queues.manual.len(), 2);
        assert_eq!(queues.normal.len(), 0);

        arena.get_mut(keys[0]).unwrap().set_last_activity_ms(0);
        arena.get_mut(keys[1]).unwrap().set_last_activity_ms(0);

        let expired = queues.sweep(&arena, Duration::ZERO, 2_000);
        assert_eq!(expired, vec![keys[0]]);
    }

    #[test]
    fn re_enroll_moves_between_lists() {
        let (mut arena, keys) = arena_with(1);
        let mut queues = TimeoutQueues::new();
        queues.enroll(&mut arena, keys[0]);
        assert_eq!(queues.normal.len(), 1);

        arena
            .get_mut(keys[0])
            .unwrap()
            .set_timeout_override(Some(Duration::from_secs(9)));
        queues.re_enroll(&mut arena, keys[0]);

        assert_eq!(queues.normal.len(), 0);
        assert_eq!(queues.manual.len(), 1);
    }

    #[test]
    fn deadline_tracks_oldest_entry() {
        let (mut arena, keys) = arena_with(2);
        let mut queues = TimeoutQueues::new();
        for &key in &keys {
            queues.enroll(&mut arena, key);
        }

        arena.get_mut(keys[0]).unwrap().set_last_activity_ms(1_000);
        arena.get_mut(keys[1]).unwrap().set_last_activity_ms(4_000);

        let deadline = queues
            .next_deadline(&arena, Duration::from_secs(5), 4_000)
            .unwrap();
        assert_eq!(deadline, Duration::from_millis(2_000));

        // Already-expired entries yield a zero wait.
        let deadline = queues
            .next_deadline(&arena, Duration::from_secs(5), 60_000)
            .unwrap();
        assert_eq!(deadline, Duration::ZERO);
    }
}
