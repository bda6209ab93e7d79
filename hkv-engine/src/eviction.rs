//! # Eviction Policy
//!
//! Purpose: Decide which entry to reclaim under memory pressure without the
//! store itself knowing the policy's internals — a capability set
//! (`on_insert`/`on_access`/`on_delete`/`next_candidate`/`should_evict`)
//! rather than an inheritance hierarchy, per the design notes.
//!
//! ## Design Principles
//! 1. **Index-Based Intrusive List**: both policies below use a
//!    dense-arena LRU pattern (indices instead of pointers) for
//!    O(1) `on_access`/`on_insert`/`on_delete`.
//! 2. **Session-Aware by Default**: an entry is eligible for eviction only
//!    after a grace period since its last access, unless pressure is
//!    already at the high threshold, in which case the grace period is
//!    ignored so the store can still make room.
//! 3. **Bounded Scan for `next_candidate`**: rather than an unconditional
//!    head-of-list pop, a bounded scan skips entries still inside their
//!    grace window and relinks them to the tail, keeping the list roughly
//!    LRU-ordered while staying O(1) amortized. Among the eligible entries
//!    seen within the scan window, the one with the smallest
//!    `(last_accessed, access_count)` wins, so two entries touched at the
//!    same instant are broken by access count rather than raw list
//!    position.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::Mutex;

/// Maximum number of head-of-list entries scanned by one `next_candidate`
/// call before giving up (keeps the call O(1) amortized under churn).
const SCAN_BOUND: usize = 64;

#[derive(Debug, Clone)]
struct Node {
    key: Arc<[u8]>,
    session: Arc<str>,
    last_accessed: Instant,
    access_count: u64,
    prev: Option<usize>,
    next: Option<usize>,
}

struct ListInner {
    map: HashMap<Arc<[u8]>, usize, RandomState>,
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl ListInner {
    fn new() -> Self {
        ListInner {
            map: HashMap::with_hasher(RandomState::new()),
            nodes: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
        }
    }

    fn lru_remove(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.nodes[idx].as_ref().expect("node exists");
            (node.prev, node.next)
        };
        if let Some(prev_idx) = prev {
            self.nodes[prev_idx].as_mut().unwrap().next = next;
        } else {
            self.head = next;
        }
        if let Some(next_idx) = next {
            self.nodes[next_idx].as_mut().unwrap().prev = prev;
        } else {
            self.tail = prev;
        }
        let node = self.nodes[idx].as_mut().unwrap();
        node.prev = None;
        node.next = None;
    }

    fn push_back(&mut self, idx: usize) {
        let tail = self.tail;
        {
            let node = self.nodes[idx].as_mut().unwrap();
            node.prev = tail;
            node.next = None;
        }
        if let Some(tail_idx) = tail {
            self.nodes[tail_idx].as_mut().unwrap().next = Some(idx);
        } else {
            self.head = Some(idx);
        }
        self.tail = Some(idx);
    }

    fn touch(&mut self, idx: usize) {
        if self.tail == Some(idx) {
            return;
        }
        self.lru_remove(idx);
        self.push_back(idx);
    }

    fn insert_new(&mut self, key: Arc<[u8]>, session: Arc<str>, now: Instant) {
        if let Some(&idx) = self.map.get(&key) {
            let node = self.nodes[idx].as_mut().unwrap();
            node.session = session;
            node.last_accessed = now;
            node.access_count = 0;
            self.touch(idx);
            return;
        }

        let idx = self.free.pop().unwrap_or_else(|| {
            self.nodes.push(None);
            self.nodes.len() - 1
        });
        self.nodes[idx] = Some(Node {
            key: Arc::clone(&key),
            session,
            last_accessed: now,
            access_count: 0,
            prev: None,
            next: None,
        });
        self.push_back(idx);
        self.map.insert(key, idx);
    }

    fn remove_key(&mut self, key: &[u8]) {
        if let Some(idx) = self.map.get(key).copied() {
            self.lru_remove(idx);
            self.nodes[idx] = None;
            self.map.remove(key);
            self.free.push(idx);
        }
    }

    fn access(&mut self, key: &[u8], now: Instant) {
        if let Some(&idx) = self.map.get(key) {
            {
                let node = self.nodes[idx].as_mut().unwrap();
                node.last_accessed = now;
                node.access_count += 1;
            }
            self.touch(idx);
        }
    }
}

/// Capability set a store uses to drive eviction decisions.
pub trait EvictionPolicy: Send + Sync {
    /// Called after a new entry is inserted.
    fn on_insert(&self, key: &[u8], session: &str, now: Instant);
    /// Called after an existing entry is read or re-inserted.
    fn on_access(&self, key: &[u8], now: Instant);
    /// Called after an entry is removed (explicit delete, eviction, expiry).
    fn on_delete(&self, key: &[u8]);
    /// Returns the next key the store should evict under `pressure`
    /// (0.0-1.0), or `None` if no entry is currently eligible.
    fn next_candidate(&self, pressure: f64, now: Instant) -> Option<Arc<[u8]>>;
    /// Reports whether a specific key is eligible for eviction right now.
    fn should_evict(&self, key: &[u8], pressure: f64, now: Instant) -> bool;
    /// Human-readable policy name, surfaced via stats/HSTATS.
    fn policy_name(&self) -> &'static str;
}

/// Session-aware policy: entries are protected by a recency grace period
/// unless pressure has reached the high threshold.
pub struct SessionAwarePolicy {
    inner: Mutex<ListInner>,
    grace_period: Duration,
    high_threshold: f64,
}

impl SessionAwarePolicy {
    pub fn new(grace_period: Duration, high_threshold: f64) -> Self {
        SessionAwarePolicy {
            inner: Mutex::new(ListInner::new()),
            grace_period,
            high_threshold,
        }
    }

    fn eligible(&self, last_accessed: Instant, pressure: f64, now: Instant) -> bool {
        if pressure >= self.high_threshold {
            return true;
        }
        now.saturating_duration_since(last_accessed) >= self.grace_period
    }
}

impl EvictionPolicy for SessionAwarePolicy {
    fn on_insert(&self, key: &[u8], session: &str, now: Instant) {
        self.inner
            .lock()
            .insert_new(Arc::from(key), Arc::from(session), now);
    }

    fn on_access(&self, key: &[u8], now: Instant) {
        self.inner.lock().access(key, now);
    }

    fn on_delete(&self, key: &[u8]) {
        self.inner.lock().remove_key(key);
    }

    fn next_candidate(&self, pressure: f64, now: Instant) -> Option<Arc<[u8]>> {
        let mut inner = self.inner.lock();
        let mut scanned = 0usize;
        let mut cursor = inner.head;
        // Smallest (last_accessed, access_count) seen so far among eligible
        // entries in the scan window; ties on last_accessed are broken by
        // access_count per the session-aware eviction contract.
        let mut best: Option<(Arc<[u8]>, Instant, u64)> = None;

        while let Some(idx) = cursor {
            if scanned >= SCAN_BOUND {
                break;
            }
            scanned += 1;
            let (key, last_accessed, next, access_count) = {
                let node = inner.nodes[idx].as_ref().unwrap();
                (
                    Arc::clone(&node.key),
                    node.last_accessed,
                    node.next,
                    node.access_count,
                )
            };

            if self.eligible(last_accessed, pressure, now) {
                let is_better = match &best {
                    None => true,
                    Some((_, best_last, best_count)) => {
                        (last_accessed, access_count) < (*best_last, *best_count)
                    }
                };
                if is_better {
                    best = Some((key, last_accessed, access_count));
                }
            } else {
                // Not eligible yet: bump to the tail so the next scan makes
                // progress instead of re-examining the same blocked head.
                inner.touch(idx);
            }
            cursor = next;
        }

        best.map(|(key, _, _)| key)
    }

    fn should_evict(&self, key: &[u8], pressure: f64, now: Instant) -> bool {
        let inner = self.inner.lock();
        match inner.map.get(key) {
            Some(&idx) => {
                let node = inner.nodes[idx].as_ref().unwrap();
                self.eligible(node.last_accessed, pressure, now)
            }
            None => false,
        }
    }

    fn policy_name(&self) -> &'static str {
        "session-aware"
    }
}

/// Plain least-recently-used policy, ignoring session and pressure.
pub struct LruPolicy {
    inner: Mutex<ListInner>,
}

impl LruPolicy {
    pub fn new() -> Self {
        LruPolicy {
            inner: Mutex::new(ListInner::new()),
        }
    }
}

impl Default for LruPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl EvictionPolicy for LruPolicy {
    fn on_insert(&self, key: &[u8], session: &str, now: Instant) {
        self.inner
            .lock()
            .insert_new(Arc::from(key), Arc::from(session), now);
    }

    fn on_access(&self, key: &[u8], now: Instant) {
        self.inner.lock().access(key, now);
    }

    fn on_delete(&self, key: &[u8]) {
        self.inner.lock().remove_key(key);
    }

    fn next_candidate(&self, _pressure: f64, _now: Instant) -> Option<Arc<[u8]>> {
        let inner = self.inner.lock();
        let idx = inner.head?;
        Some(Arc::clone(&inner.nodes[idx].as_ref().unwrap().key))
    }

    fn should_evict(&self, key: &[u8], _pressure: f64, _now: Instant) -> bool {
        self.inner.lock().map.contains_key(key)
    }

    fn policy_name(&self) -> &'static str {
        "lru"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn lru_next_candidate_is_oldest() {
        let policy = LruPolicy::new();
        let now = Instant::now();
        policy.on_insert(b"a", "s1", now);
        policy.on_insert(b"b", "s1", now);
        assert_eq!(policy.next_candidate(0.0, now).unwrap().as_ref(), b"a");
        policy.on_access(b"a", now);
        assert_eq!(policy.next_candidate(0.0, now).unwrap().as_ref(), b"b");
    }

    #[test]
    fn session_aware_respects_grace_period() {
        let policy = SessionAwarePolicy::new(Duration::from_secs(60), 0.95);
        let now = Instant::now();
        policy.on_insert(b"a", "s1", now);
        assert!(policy.next_candidate(0.5, now).is_none());
    }

    #[test]
    fn session_aware_ignores_grace_period_under_high_pressure() {
        let policy = SessionAwarePolicy::new(Duration::from_secs(60), 0.9);
        let now = Instant::now();
        policy.on_insert(b"a", "s1", now);
        assert_eq!(policy.next_candidate(0.95, now).unwrap().as_ref(), b"a");
    }

    #[test]
    fn session_aware_tie_break_prefers_lower_access_count() {
        let policy = SessionAwarePolicy::new(Duration::from_secs(0), 1.1);
        let now = Instant::now();
        policy.on_insert(b"a", "s1", now);
        policy.on_insert(b"b", "s1", now);
        // Both entries now share the same last_accessed instant; "a" racks
        // up more accesses than "b", so the tie must resolve to "b".
        policy.on_access(b"a", now);
        policy.on_access(b"a", now);
        policy.on_access(b"b", now);
        assert_eq!(policy.next_candidate(0.0, now).unwrap().as_ref(), b"b");
    }

    #[test]
    fn on_delete_removes_from_consideration() {
        let policy = LruPolicy::new();
        let now = Instant::now();
        policy.on_insert(b"a", "s1", now);
        policy.on_delete(b"a");
        assert!(policy.next_candidate(0.0, now).is_none());
    }
}
