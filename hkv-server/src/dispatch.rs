//! # RESP Command Dispatch
//!
//! Purpose: Turn one parsed command (`Vec<Vec<u8>>` from `protocol::RespParser`)
//! into a RESP-encoded response, routing key-bearing commands to their owner
//! and redirecting with `MOVED` otherwise.
//!
//! ## Design Principles
//! 1. **Route Before Execute**: every key-bearing command computes
//!    `slot_for_key` first; a non-owner never touches the local store.
//! 2. **One Store Per Connection**: RESP has no per-request store selector
//!    (unlike HSTATS/HFILTER, which take a store name explicitly), so
//!    GET/SET/DEL/... always address `Node::primary_store`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hkv_common::hash::slot_for_key;
use hkv_common::{HkvError, Value};

use crate::node::Node;
use crate::protocol::{
    eq_ignore_ascii_case, parse_u64, resp_array, resp_bulk, resp_error, resp_integer, resp_moved,
    resp_null, resp_simple,
};

const ERR_WRONG_ARGS: &str = "ERR wrong number of arguments";
const ERR_SYNTAX: &str = "ERR syntax error";

pub struct Dispatcher {
    node: Arc<Node>,
}

impl Dispatcher {
    pub fn new(node: Arc<Node>) -> Self {
        Dispatcher { node }
    }

    /// Dispatches one already-parsed command, returning its full RESP-encoded
    /// reply (including trailing `\r\n`). Wraps `dispatch_inner` with the
    /// node's request/latency/error counters.
    pub fn dispatch(&self, args: &[Vec<u8>]) -> Vec<u8> {
        let metrics = &self.node.metrics;
        metrics.record_request_start();
        let started = Instant::now();
        let response = self.dispatch_inner(args);
        metrics.record_request_end(started.elapsed());
        if response.first() == Some(&b'-') {
            metrics.record_error();
        }
        response
    }

    fn dispatch_inner(&self, args: &[Vec<u8>]) -> Vec<u8> {
        if args.is_empty() {
            return resp_error(ERR_WRONG_ARGS);
        }
        let cmd = args[0].as_slice();

        if eq_ignore_ascii_case(cmd, b"PING") {
            return self.cmd_ping(args);
        }
        if eq_ignore_ascii_case(cmd, b"GET") {
            return self.cmd_get(args);
        }
        if eq_ignore_ascii_case(cmd, b"SET") {
            return self.cmd_set(args);
        }
        if eq_ignore_ascii_case(cmd, b"DEL") {
            return self.cmd_del(args);
        }
        if eq_ignore_ascii_case(cmd, b"EXISTS") {
            return self.cmd_exists(args);
        }
        if eq_ignore_ascii_case(cmd, b"EXPIRE") {
            return self.cmd_expire(args);
        }
        if eq_ignore_ascii_case(cmd, b"TTL") {
            return self.cmd_ttl(args);
        }
        if eq_ignore_ascii_case(cmd, b"INFO") {
            return self.cmd_info();
        }
        if eq_ignore_ascii_case(cmd, b"DBSIZE") {
            return self.cmd_dbsize();
        }
        if eq_ignore_ascii_case(cmd, b"FLUSHALL") {
            return self.cmd_flushall();
        }
        if eq_ignore_ascii_case(cmd, b"CLUSTER") {
            return self.cmd_cluster(args);
        }
        if eq_ignore_ascii_case(cmd, b"HSTATS") {
            return self.cmd_hstats(args);
        }
        if eq_ignore_ascii_case(cmd, b"HFILTER") {
            return self.cmd_hfilter(args);
        }

        resp_error(&format!("ERR unknown command '{}'", String::from_utf8_lossy(cmd)))
    }

    fn cmd_ping(&self, args: &[Vec<u8>]) -> Vec<u8> {
        match args.len() {
            1 => resp_simple("PONG"),
            2 => resp_bulk(&args[1]),
            _ => resp_error(ERR_WRONG_ARGS),
        }
    }

    /// Resolves `key`'s owner; returns `Some(reply)` when the local node
    /// isn't it (a `MOVED` redirect), `None` when the command should proceed
    /// locally.
    fn redirect_if_remote(&self, key: &[u8]) -> Option<Vec<u8>> {
        if self.node.coordinator.is_local(key) {
            return None;
        }
        let slot = slot_for_key(key);
        let owner = self.node.coordinator.route(key)?;
        let addr = self.node.coordinator.resp_addr_of(&owner)?;
        Some(resp_moved(slot, &addr))
    }

    fn store(&self) -> Option<Arc<hkv_engine::Store>> {
        self.node.coordinator.store(&self.node.primary_store)
    }

    fn cmd_get(&self, args: &[Vec<u8>]) -> Vec<u8> {
        if args.len() != 2 {
            return resp_error(ERR_WRONG_ARGS);
        }
        let key = &args[1];
        if let Some(moved) = self.redirect_if_remote(key) {
            return moved;
        }
        let Some(store) = self.store() else {
            return resp_error("ERR internal");
        };
        match store.get(key) {
            Ok(value) => resp_bulk(&value.as_bulk_bytes()),
            Err(HkvError::NotFound) | Err(HkvError::Expired) => resp_null(),
            Err(err) => encode_error(&err),
        }
    }

    fn cmd_set(&self, args: &[Vec<u8>]) -> Vec<u8> {
        if args.len() < 3 {
            return resp_error(ERR_WRONG_ARGS);
        }
        let key = &args[1];
        if let Some(moved) = self.redirect_if_remote(key) {
            return moved;
        }
        let Some(store) = self.store() else {
            return resp_error("ERR internal");
        };

        let mut ttl: Option<Duration> = None;
        let mut nx = false;
        let mut xx = false;
        let mut i = 3;
        while i < args.len() {
            let opt = args[i].as_slice();
            if eq_ignore_ascii_case(opt, b"EX") {
                let Some(secs) = args.get(i + 1).and_then(|a| parse_u64(a).ok()) else {
                    return resp_error(ERR_SYNTAX);
                };
                ttl = Some(Duration::from_secs(secs));
                i += 2;
            } else if eq_ignore_ascii_case(opt, b"PX") {
                let Some(ms) = args.get(i + 1).and_then(|a| parse_u64(a).ok()) else {
                    return resp_error(ERR_SYNTAX);
                };
                ttl = Some(Duration::from_millis(ms));
                i += 2;
            } else if eq_ignore_ascii_case(opt, b"NX") {
                nx = true;
                i += 1;
            } else if eq_ignore_ascii_case(opt, b"XX") {
                xx = true;
                i += 1;
            } else {
                return resp_error(ERR_SYNTAX);
            }
        }
        if nx && xx {
            return resp_error(ERR_SYNTAX);
        }

        let exists = store.get(key).is_ok();
        if nx && exists {
            return resp_null();
        }
        if xx && !exists {
            return resp_null();
        }

        let value = Value::Bytes(args[2].clone());
        match store.set(key, value.clone(), "resp", ttl) {
            Ok(()) => {
                self.node.coordinator.publish_set(&self.node.primary_store, key, &value, "resp", ttl);
                resp_simple("OK")
            }
            Err(err) => encode_error(&err),
        }
    }

    fn cmd_del(&self, args: &[Vec<u8>]) -> Vec<u8> {
        if args.len() < 2 {
            return resp_error(ERR_WRONG_ARGS);
        }
        let Some(store) = self.store() else {
            return resp_error("ERR internal");
        };
        let mut deleted = 0i64;
        for key in &args[1..] {
            if let Some(moved) = self.redirect_if_remote(key) {
                if deleted == 0 && args.len() == 2 {
                    return moved;
                }
                continue;
            }
            if store.delete(key).is_ok() {
                self.node.coordinator.publish_del(&self.node.primary_store, key);
                deleted += 1;
            }
        }
        resp_integer(deleted)
    }

    fn cmd_exists(&self, args: &[Vec<u8>]) -> Vec<u8> {
        if args.len() < 2 {
            return resp_error(ERR_WRONG_ARGS);
        }
        let Some(store) = self.store() else {
            return resp_error("ERR internal");
        };
        let mut count = 0i64;
        for key in &args[1..] {
            if !self.node.coordinator.is_local(key) {
                continue;
            }
            if store.get(key).is_ok() {
                count += 1;
            }
        }
        resp_integer(count)
    }

    fn cmd_expire(&self, args: &[Vec<u8>]) -> Vec<u8> {
        if args.len() != 3 {
            return resp_error(ERR_WRONG_ARGS);
        }
        let key = &args[1];
        if let Some(moved) = self.redirect_if_remote(key) {
            return moved;
        }
        let Some(secs) = parse_u64(&args[2]).ok() else {
            return resp_error(ERR_SYNTAX);
        };
        let Some(store) = self.store() else {
            return resp_error("ERR internal");
        };
        match store.expire(key, Duration::from_secs(secs)) {
            Ok(()) => resp_integer(1),
            Err(HkvError::NotFound) => resp_integer(0),
            Err(err) => encode_error(&err),
        }
    }

    fn cmd_ttl(&self, args: &[Vec<u8>]) -> Vec<u8> {
        if args.len() != 2 {
            return resp_error(ERR_WRONG_ARGS);
        }
        let key = &args[1];
        if let Some(moved) = self.redirect_if_remote(key) {
            return moved;
        }
        let Some(store) = self.store() else {
            return resp_error("ERR internal");
        };
        use hkv_engine::TtlStatus;
        match store.ttl(key) {
            Ok(TtlStatus::Missing) => resp_integer(-2),
            Ok(TtlStatus::NoExpiry) => resp_integer(-1),
            Ok(TtlStatus::ExpiresIn(remaining)) => resp_integer(remaining.as_secs() as i64),
            Err(err) => encode_error(&err),
        }
    }

    fn cmd_dbsize(&self) -> Vec<u8> {
        let Some(store) = self.store() else {
            return resp_error("ERR internal");
        };
        resp_integer(store.stats().entry_count as i64)
    }

    fn cmd_flushall(&self) -> Vec<u8> {
        let Some(store) = self.store() else {
            return resp_error("ERR internal");
        };
        match store.clear() {
            Ok(()) => {
                self.node.coordinator.publish_clear(&self.node.primary_store);
                resp_simple("OK")
            }
            Err(err) => encode_error(&err),
        }
    }

    fn cmd_info(&self) -> Vec<u8> {
        let cfg = &self.node.config;
        let text = format!(
            "# Server\r\nnode_id:{}\r\nresp_port:{}\r\nhttp_port:{}\r\n# Cluster\r\ncluster_known_nodes:{}\r\nreplication_factor:{}\r\n",
            cfg.node.id,
            cfg.network.resp_port,
            cfg.network.http_port,
            self.node.coordinator.members().len(),
            cfg.cluster.replication_factor,
        );
        resp_bulk(text.as_bytes())
    }

    fn cmd_cluster(&self, args: &[Vec<u8>]) -> Vec<u8> {
        if args.len() < 2 {
            return resp_error(ERR_WRONG_ARGS);
        }
        let sub = args[1].as_slice();
        if eq_ignore_ascii_case(sub, b"NODES") {
            self.cmd_cluster_nodes()
        } else if eq_ignore_ascii_case(sub, b"INFO") {
            self.cmd_cluster_info()
        } else if eq_ignore_ascii_case(sub, b"SLOTS") {
            self.cmd_cluster_slots()
        } else {
            resp_error(&format!("ERR unknown CLUSTER subcommand '{}'", String::from_utf8_lossy(sub)))
        }
    }

    fn cmd_cluster_nodes(&self) -> Vec<u8> {
        let local = self.node.coordinator.local_node_id().to_string();
        let ranges = owned_slot_ranges(&self.node);
        let mut lines = String::new();
        for member in self.node.coordinator.members() {
            let flags = if member.node_id == local { "myself,master" } else { "master" };
            let own: Vec<String> = ranges
                .iter()
                .filter(|(_, _, owner)| *owner == member.node_id)
                .map(|(start, end, _)| if start == end { start.to_string() } else { format!("{start}-{end}") })
                .collect();
            lines.push_str(&format!(
                "{} {} {} {} 0 0 0 connected {}\r\n",
                member.node_id,
                member.gossip_addr(),
                flags,
                member.status,
                own.join(" "),
            ));
        }
        resp_bulk(lines.as_bytes())
    }

    fn cmd_cluster_info(&self) -> Vec<u8> {
        let members = self.node.coordinator.members();
        let text = format!(
            "cluster_enabled:1\r\ncluster_state:ok\r\ncluster_slots_assigned:16384\r\ncluster_known_nodes:{}\r\ncluster_size:{}\r\n",
            members.len(),
            members.len(),
        );
        resp_bulk(text.as_bytes())
    }

    fn cmd_cluster_slots(&self) -> Vec<u8> {
        let members: std::collections::HashMap<String, hkv_cluster::ClusterMember> = self
            .node
            .coordinator
            .members()
            .into_iter()
            .map(|m| (m.node_id.clone(), m))
            .collect();
        let ranges = owned_slot_ranges(&self.node);
        let items: Vec<Vec<u8>> = ranges
            .into_iter()
            .filter_map(|(start, end, owner)| {
                let member = members.get(&owner)?;
                let parts = vec![
                    resp_integer(start as i64),
                    resp_integer(end as i64),
                    resp_array(&[
                        resp_bulk(member.advertise_addr.as_bytes()),
                        resp_integer(member.resp_port as i64),
                        resp_bulk(member.node_id.as_bytes()),
                    ]),
                ];
                Some(resp_array(&parts))
            })
            .collect();
        resp_array(&items)
    }

    fn cmd_hstats(&self, args: &[Vec<u8>]) -> Vec<u8> {
        if args.len() != 2 {
            return resp_error(ERR_WRONG_ARGS);
        }
        let name = String::from_utf8_lossy(&args[1]).into_owned();
        let Some(store) = self.node.coordinator.store(&name) else {
            return resp_error("ERR no such store");
        };
        let stats = store.stats();
        let pool = store.pool_stats();
        let text = format!(
            "hits:{}\r\nmisses:{}\r\nevictions:{}\r\nexpirations:{}\r\nerrors:{}\r\nentry_count:{}\r\ncurrent_bytes:{}\r\nmax_bytes:{}\r\npool_total_allocs:{}\r\npool_total_frees:{}\r\npool_failures:{}\r\n",
            stats.hits,
            stats.misses,
            stats.evictions,
            stats.expirations,
            stats.errors,
            stats.entry_count,
            stats.current_bytes,
            stats.max_bytes,
            pool.total_allocs,
            pool.total_frees,
            pool.failures,
        );
        resp_bulk(text.as_bytes())
    }

    fn cmd_hfilter(&self, args: &[Vec<u8>]) -> Vec<u8> {
        if args.len() < 2 {
            return resp_error(ERR_WRONG_ARGS);
        }
        let name = String::from_utf8_lossy(&args[1]).into_owned();
        let Some(store) = self.node.coordinator.store(&name) else {
            return resp_error("ERR no such store");
        };
        if args.len() == 3 {
            return resp_error("ERR cuckoo filter cannot be toggled at runtime, set cache.stores[].cuckoo_filter.enabled and restart");
        }
        if !store.filter_enabled() {
            return resp_bulk(b"enabled:0\r\n");
        }
        let stats = store.filter_stats().expect("filter_enabled implies filter_stats");
        let text = format!(
            "enabled:1\r\ninserts:{}\r\ndeletes:{}\r\nlookups:{}\r\nfull_failures:{}\r\nitems:{}\r\n",
            stats.inserts, stats.deletes, stats.lookups, stats.full_failures, stats.items,
        );
        resp_bulk(text.as_bytes())
    }
}

fn encode_error(err: &HkvError) -> Vec<u8> {
    match err {
        HkvError::Moved { slot, owner_addr } => resp_moved(*slot, owner_addr),
        HkvError::NoSpace => resp_error("ERR no-space"),
        HkvError::InvalidArgument(msg) => resp_error(&format!("ERR {msg}")),
        HkvError::NotFound => resp_error("ERR not found"),
        HkvError::Expired => resp_error("ERR expired"),
        _ => resp_error("ERR internal"),
    }
}

/// Scans every cluster slot to group contiguous ranges by owning node, for
/// `CLUSTER NODES`/`CLUSTER SLOTS`. O(16384) per call; these commands are
/// administrative, not hot-path.
fn owned_slot_ranges(node: &Node) -> Vec<(u16, u16, String)> {
    let ring = node.coordinator.ring();
    let mut ranges: Vec<(u16, u16, String)> = Vec::new();
    for slot in 0..hkv_common::hash::SLOT_COUNT {
        let Some(owner) = ring.route_by_slot(slot) else {
            continue;
        };
        match ranges.last_mut() {
            Some((_, end, last_owner)) if *last_owner == owner && *end + 1 == slot => {
                *end = slot;
            }
            _ => ranges.push((slot, slot, owner)),
        }
    }
    ranges
}
