//! # Consistent Hash Ring
//!
//! Purpose: Map a key to the physical node(s) that own it, with stable
//! ownership as nodes join/leave so only a fraction of keys reshuffle per
//! membership change.
//!
//! ## Design Principles
//! 1. **Immutable Snapshot Swap**: every mutation builds a brand new
//!    `RingSnapshot` and installs it via `ArcSwap::store`, so concurrent
//!    `route()` calls never observe a half-updated ring (the same
//!    lock-free reload pattern used elsewhere for config hot-swap).
//! 2. **Virtual Nodes**: each physical node contributes `V` positions on the
//!    ring (`hash(id || ":" || i)`), smoothing load distribution across
//!    heterogeneous key patterns.
//! 3. **Dead Nodes Stay In The Ring**: a status filter skips `Dead` members
//!    during routing without removing their virtual nodes, so a transient
//!    flap doesn't force a second reshuffle when the node recovers.
//! 4. **Slots, Not Raw Keys**: ownership is resolved from the same CRC16
//!    slot the RESP frontend puts in a `MOVED` reply (`route()` is a thin
//!    wrapper over `route_by_slot`), so every caller agrees on who owns a
//!    key regardless of which one computed the slot first.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use hkv_common::hash::{slot_for_key, xxhash64};

use crate::member::{ClusterMember, MemberStatus};

/// Virtual nodes contributed per physical node.
pub const DEFAULT_VIRTUAL_NODES: usize = 256;

const RING_HASH_SEED: u64 = 0x4859_4b56; // "HYKV" as a fixed seed.

const LOOKUP_CACHE_CAPACITY: usize = 4096;

#[derive(Debug, Clone)]
struct VirtualNode {
    hash: u64,
    node_id: Arc<str>,
}

struct RingSnapshot {
    virtual_nodes: Vec<VirtualNode>,
    members: HashMap<Arc<str>, ClusterMember>,
    generation: u64,
}

impl RingSnapshot {
    fn empty() -> Self {
        RingSnapshot {
            virtual_nodes: Vec::new(),
            members: HashMap::new(),
            generation: 0,
        }
    }

    /// Index of the first virtual node whose hash is >= `key_hash`, wrapping
    /// to the first entry when every hash is smaller.
    fn locate(&self, key_hash: u64) -> Option<usize> {
        if self.virtual_nodes.is_empty() {
            return None;
        }
        match self.virtual_nodes.binary_search_by(|vn| vn.hash.cmp(&key_hash)) {
            Ok(idx) => Some(idx),
            Err(idx) if idx < self.virtual_nodes.len() => Some(idx),
            Err(_) => Some(0),
        }
    }

    fn is_routable(&self, node_id: &str) -> bool {
        self.members
            .get(node_id)
            .map(|m| m.is_routable())
            .unwrap_or(false)
    }
}

/// Per-node virtual node counts and ring size, surfaced via HSTATS/CLUSTER.
#[derive(Debug, Clone, Default)]
pub struct DistributionStats {
    pub physical_nodes: usize,
    pub virtual_nodes: usize,
    pub virtual_nodes_per_physical: HashMap<String, usize>,
}

/// Consistent-hash ring with virtual nodes and an LRU lookup cache.
///
/// Must be held behind `Arc` when shared across connection-handler threads;
/// `route`/`replicas`/`is_local` take `&self` and never block on a mutation.
pub struct HashRing {
    snapshot: ArcSwap<RingSnapshot>,
    lookup_cache: Mutex<lru::LruCache<u16, Arc<str>>>,
    virtual_nodes: usize,
    replication_factor: usize,
}

impl HashRing {
    pub fn new(replication_factor: usize) -> Self {
        Self::with_virtual_nodes(replication_factor, DEFAULT_VIRTUAL_NODES)
    }

    pub fn with_virtual_nodes(replication_factor: usize, virtual_nodes: usize) -> Self {
        HashRing {
            snapshot: ArcSwap::from_pointee(RingSnapshot::empty()),
            lookup_cache: Mutex::new(lru::LruCache::new(
                std::num::NonZeroUsize::new(LOOKUP_CACHE_CAPACITY).unwrap(),
            )),
            virtual_nodes,
            replication_factor,
        }
    }

    /// Adds (or replaces, if already present) a physical node and installs a
    /// new ring snapshot atomically.
    pub fn add_node(&self, member: ClusterMember) {
        let current = self.snapshot.load();
        let node_id: Arc<str> = Arc::from(member.node_id.as_str());

        let mut members = current.members.clone();
        members.insert(Arc::clone(&node_id), member);

        let mut virtual_nodes: Vec<VirtualNode> = current
            .virtual_nodes
            .iter()
            .filter(|vn| vn.node_id != node_id)
            .cloned()
            .collect();
        for i in 0..self.virtual_nodes {
            let seed_key = format!("{}:{}", node_id, i);
            let hash = xxhash64(RING_HASH_SEED, seed_key.as_bytes());
            virtual_nodes.push(VirtualNode {
                hash,
                node_id: Arc::clone(&node_id),
            });
        }
        virtual_nodes.sort_by_key(|vn| vn.hash);

        self.install(RingSnapshot {
            virtual_nodes,
            members,
            generation: current.generation + 1,
        });
    }

    /// Removes a physical node (and its virtual nodes) from the ring.
    pub fn remove_node(&self, node_id: &str) {
        let current = self.snapshot.load();
        if !current.members.contains_key(node_id) {
            return;
        }
        let mut members = current.members.clone();
        members.remove(node_id);
        let virtual_nodes: Vec<VirtualNode> = current
            .virtual_nodes
            .iter()
            .filter(|vn| vn.node_id.as_ref() != node_id)
            .cloned()
            .collect();

        self.install(RingSnapshot {
            virtual_nodes,
            members,
            generation: current.generation + 1,
        });
    }

    /// Updates a member's status in place (e.g. gossip marking it suspect or
    /// dead) without touching its virtual node placements.
    pub fn set_status(&self, node_id: &str, status: MemberStatus) {
        let current = self.snapshot.load();
        let Some(existing) = current.members.get(node_id) else {
            return;
        };
        let mut updated = existing.clone();
        updated.status = status;
        let mut members = current.members.clone();
        members.insert(Arc::from(node_id), updated);

        self.install(RingSnapshot {
            virtual_nodes: current.virtual_nodes.clone(),
            members,
            generation: current.generation + 1,
        });
    }

    fn install(&self, snapshot: RingSnapshot) {
        self.lookup_cache.lock().clear();
        self.snapshot.store(Arc::new(snapshot));
    }

    /// Returns the node-id that owns `key`, or `None` if the ring is empty
    /// or every owning candidate is dead. Equivalent to
    /// `route_by_slot(slot_for_key(key))`.
    pub fn route(&self, key: &[u8]) -> Option<String> {
        self.route_by_slot(slot_for_key(key))
    }

    /// Returns the node-id that owns cluster `slot` (0..16384). The RESP
    /// frontend computes `slot = crc16(key) mod 16384` itself (it needs the
    /// slot number for the `MOVED` reply regardless), then calls this
    /// directly so a key's owner only ever depends on its slot, never on
    /// which hash of the raw key bytes happened to be taken.
    pub fn route_by_slot(&self, slot: u16) -> Option<String> {
        if let Some(cached) = self.lookup_cache.lock().get(&slot) {
            return Some(cached.to_string());
        }

        let snapshot = self.snapshot.load();
        let key_hash = xxhash64(RING_HASH_SEED, &slot.to_le_bytes());
        let owner = self.find_owner(&snapshot, key_hash)?;
        self.lookup_cache.lock().put(slot, Arc::clone(&owner));
        Some(owner.to_string())
    }

    fn find_owner(&self, snapshot: &RingSnapshot, key_hash: u64) -> Option<Arc<str>> {
        let start = snapshot.locate(key_hash)?;
        let len = snapshot.virtual_nodes.len();
        for step in 0..len {
            let idx = (start + step) % len;
            let node_id = &snapshot.virtual_nodes[idx].node_id;
            if snapshot.is_routable(node_id) {
                return Some(Arc::clone(node_id));
            }
        }
        None
    }

    /// Returns up to `n` distinct physical nodes holding replicas of `key`,
    /// walking clockwise from the owner and skipping dead nodes.
    pub fn replicas(&self, key: &[u8], n: usize) -> Vec<String> {
        let slot = slot_for_key(key);
        let key_hash = xxhash64(RING_HASH_SEED, &slot.to_le_bytes());
        let snapshot = self.snapshot.load();
        let Some(start) = snapshot.locate(key_hash) else {
            return Vec::new();
        };
        let len = snapshot.virtual_nodes.len();
        let mut seen: Vec<String> = Vec::with_capacity(n);
        for step in 0..len {
            if seen.len() >= n {
                break;
            }
            let idx = (start + step) % len;
            let node_id = &snapshot.virtual_nodes[idx].node_id;
            if !snapshot.is_routable(node_id) {
                continue;
            }
            let node_id_str = node_id.to_string();
            if !seen.contains(&node_id_str) {
                seen.push(node_id_str);
            }
        }
        seen
    }

    /// Returns `true` when `local_node_id` is the current owner of `key`.
    pub fn is_local(&self, key: &[u8], local_node_id: &str) -> bool {
        self.route(key).as_deref() == Some(local_node_id)
    }

    /// Resolves the advertised RESP address for `node_id`, if known.
    pub fn resp_addr_of(&self, node_id: &str) -> Option<String> {
        self.snapshot.load().members.get(node_id).map(|m| m.resp_addr())
    }

    /// Resolves the advertised HTTP address for `node_id`, if known.
    pub fn http_addr_of(&self, node_id: &str) -> Option<String> {
        self.snapshot.load().members.get(node_id).map(|m| m.http_addr())
    }

    pub fn members(&self) -> Vec<ClusterMember> {
        self.snapshot.load().members.values().cloned().collect()
    }

    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    pub fn distribution_stats(&self) -> DistributionStats {
        let snapshot = self.snapshot.load();
        let mut per_node: HashMap<String, usize> = HashMap::new();
        for vn in &snapshot.virtual_nodes {
            *per_node.entry(vn.node_id.to_string()).or_insert(0) += 1;
        }
        DistributionStats {
            physical_nodes: snapshot.members.len(),
            virtual_nodes: snapshot.virtual_nodes.len(),
            virtual_nodes_per_physical: per_node,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: &str) -> ClusterMember {
        ClusterMember::new(id, format!("10.0.0.{}", id.len()), 7946, 6380, 8080)
    }

    #[test]
    fn empty_ring_routes_nowhere() {
        let ring = HashRing::new(2);
        assert!(ring.route(b"key").is_none());
    }

    #[test]
    fn single_node_owns_every_key() {
        let ring = HashRing::new(2);
        ring.add_node(member("node-1"));
        for key in [b"a".as_slice(), b"hello", b"another-key"] {
            assert_eq!(ring.route(key).as_deref(), Some("node-1"));
        }
    }

    #[test]
    fn removing_a_node_redistributes_its_keys() {
        let ring = HashRing::new(2);
        ring.add_node(member("node-1"));
        ring.add_node(member("node-2"));
        ring.add_node(member("node-3"));

        let before: Vec<String> = (0..200)
            .map(|i| ring.route(format!("key-{i}").as_bytes()).unwrap())
            .collect();

        ring.remove_node("node-2");
        let after: Vec<String> = (0..200)
            .map(|i| ring.route(format!("key-{i}").as_bytes()).unwrap())
            .collect();

        assert!(after.iter().all(|n| n != "node-2"));
        // Most keys that were not on node-2 should be unaffected.
        let unchanged = before
            .iter()
            .zip(after.iter())
            .filter(|(b, a)| b == a)
            .count();
        assert!(unchanged > 0);
    }

    #[test]
    fn dead_nodes_are_skipped_but_stay_in_ring() {
        let ring = HashRing::new(2);
        ring.add_node(member("node-1"));
        ring.add_node(member("node-2"));
        ring.set_status("node-1", MemberStatus::Dead);

        for i in 0..50 {
            assert_eq!(
                ring.route(format!("key-{i}").as_bytes()).as_deref(),
                Some("node-2")
            );
        }
        assert_eq!(ring.distribution_stats().physical_nodes, 2);
    }

    #[test]
    fn replicas_are_distinct_physical_nodes() {
        let ring = HashRing::new(3);
        for id in ["node-1", "node-2", "node-3", "node-4"] {
            ring.add_node(member(id));
        }
        let replicas = ring.replicas(b"some-key", 3);
        assert_eq!(replicas.len(), 3);
        let mut sorted = replicas.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), 3);
    }

    #[test]
    fn distribution_is_reasonably_balanced() {
        let ring = HashRing::new(2);
        for id in ["node-1", "node-2", "node-3", "node-4"] {
            ring.add_node(member(id));
        }
        let stats = ring.distribution_stats();
        assert_eq!(stats.virtual_nodes, 4 * DEFAULT_VIRTUAL_NODES);
        for count in stats.virtual_nodes_per_physical.values() {
            assert_eq!(*count, DEFAULT_VIRTUAL_NODES);
        }
    }

    #[test]
    fn is_local_matches_route() {
        let ring = HashRing::new(2);
        ring.add_node(member("node-1"));
        assert!(ring.is_local(b"key", "node-1"));
        assert!(!ring.is_local(b"key", "node-2"));
    }

    #[test]
    fn route_agrees_with_route_by_slot() {
        let ring = HashRing::new(2);
        for id in ["node-1", "node-2", "node-3"] {
            ring.add_node(member(id));
        }
        for key in [b"a".as_slice(), b"hello", b"user:{42}:profile"] {
            let slot = hkv_common::hash::slot_for_key(key);
            assert_eq!(ring.route(key), ring.route_by_slot(slot));
        }
    }

    #[test]
    fn hash_tagged_keys_route_to_the_same_owner() {
        let ring = HashRing::new(2);
        for id in ["node-1", "node-2", "node-3", "node-4"] {
            ring.add_node(member(id));
        }
        let a = ring.route(b"user:{42}:profile");
        let b = ring.route(b"user:{42}:orders");
        assert_eq!(a, b);
    }
}
