//! # Node Bootstrap
//!
//! Purpose: Turn a parsed `NodeConfig` into a running node: the hash ring,
//! gossip membership, coordinator, and one `Store` (plus optional
//! persistence) per configured cache section.
//!
//! ## Design Principles
//! 1. **Replay Before Attach**: a store's recovered entries are applied via
//!    plain `Store::set`/`delete`/`clear` calls *before* `set_persistence` is
//!    called, so replay never re-appends what it just replayed.
//! 2. **One Snapshot Trigger Thread Per Persisted Store**: mirrors the
//!    sweeper/pressure-worker pattern elsewhere in the workspace rather than
//!    a single shared scheduler, so one slow snapshot never delays another
//!    store's sweep.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{info, warn};

use hkv_cluster::{ClusterMember, Coordinator, GossipTransport, HashRing, MembershipService, UdpGossipTransport};
use hkv_common::config::{EvictionPolicyKind, NodeConfig, StoreConfig};
use hkv_common::Value;
use hkv_engine::{CuckooFilter, CuckooFilterConfig, EvictionPolicy, LruPolicy, MemoryPool, SessionAwarePolicy, Store, SweeperHandle};
use hkv_persist::{PersistenceEngine, RecoveredState, SnapshotEntry};

use crate::metrics::Metrics;

/// Grace period before an idle entry becomes eligible for eviction under the
/// session-aware policy. Not exposed in `StoreConfig`; this value mirrors
/// the policy's own doc-comment example and the pool's high-pressure
/// threshold below it.
const SESSION_GRACE_PERIOD: Duration = Duration::from_secs(60);
/// Pressure fraction at which the session-aware policy ignores the grace
/// period entirely, matching `MemoryPool`'s default high-pressure threshold.
const SESSION_HIGH_THRESHOLD: f64 = 0.95;

/// How often a store's snapshot trigger thread checks whether it's time to
/// write a new snapshot.
const SNAPSHOT_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// How often the TTL sweeper runs per store.
const SWEEP_INTERVAL: Duration = Duration::from_millis(500);

fn unix_nanos_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

struct PersistedStore {
    store: Arc<Store>,
    engine: Arc<PersistenceEngine>,
    snapshot_interval: Duration,
    snapshot_threshold: u64,
}

/// A running node: ring, membership, coordinator, and every configured
/// store, wired together and ready to serve RESP/HTTP traffic.
pub struct Node {
    pub config: NodeConfig,
    pub coordinator: Arc<Coordinator>,
    pub metrics: Arc<Metrics>,
    /// Store RESP key-bearing commands (GET/SET/DEL/...) operate against.
    /// RESP has no per-request store selector, so the first configured
    /// store is the implicit target; HSTATS/HFILTER still address any
    /// store by name.
    pub primary_store: String,
    persistence: HashMap<String, Arc<PersistenceEngine>>,
    sweepers: Mutex<Vec<SweeperHandle>>,
    snapshot_stop: Vec<Arc<AtomicBool>>,
    snapshot_threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Wires up ring + membership + coordinator + stores from `config`,
    /// replays any persisted state, and starts background workers. Does not
    /// join the cluster or start listening for client traffic; the caller
    /// does that once its own frontends are ready to accept requests.
    pub fn bootstrap(config: NodeConfig) -> Result<Arc<Node>> {
        let local = ClusterMember::new(
            config.node.id.clone(),
            config.node.advertise_addr.clone(),
            config.network.gossip_port,
            config.network.resp_port,
            config.network.http_port,
        );

        let ring = Arc::new(HashRing::new(config.cluster.replication_factor));
        let gossip_bind = format!("{}:{}", config.network.resp_bind_addr, config.network.gossip_port);
        let transport: Arc<dyn GossipTransport> = Arc::new(
            UdpGossipTransport::bind(&gossip_bind)
                .with_context(|| format!("binding gossip transport on {gossip_bind}"))?,
        );
        let membership = MembershipService::new(local, Arc::clone(&ring), transport);

        let coordinator = Coordinator::new(
            config.node.id.clone(),
            Arc::clone(&ring),
            Arc::clone(&membership),
            config.persistence.persist_replicated,
        );

        let mut persistence = HashMap::new();
        let mut sweepers = Vec::new();
        let mut snapshot_stop = Vec::new();
        let mut snapshot_threads = Vec::new();

        for store_cfg in &config.cache.stores {
            let store = build_store(store_cfg);

            if config.persistence.enabled {
                let persisted = attach_persistence(&config, store_cfg, Arc::clone(&store))?;
                persistence.insert(store_cfg.name.clone(), Arc::clone(&persisted.engine));
                let (stop, handle) = spawn_snapshot_trigger(persisted);
                snapshot_stop.push(stop);
                snapshot_threads.push(handle);
            }

            sweepers.push(store.start_sweeper(SWEEP_INTERVAL));
            coordinator.register_store(store);
        }

        coordinator.start_replication();

        let primary_store = config
            .cache
            .stores
            .first()
            .map(|s| s.name.clone())
            .unwrap_or_else(|| "default".to_string());

        info!(node_id = %config.node.id, stores = config.cache.stores.len(), "node bootstrapped");

        Ok(Arc::new(Node {
            config,
            coordinator,
            metrics: Arc::new(Metrics::new()),
            primary_store,
            persistence,
            sweepers: Mutex::new(sweepers),
            snapshot_stop,
            snapshot_threads: Mutex::new(snapshot_threads),
        }))
    }

    /// Joins the cluster via the configured gossip seeds.
    pub fn join_cluster(&self) {
        self.coordinator.join(&self.config.cluster.seeds);
    }

    pub fn persistence_for(&self, store: &str) -> Option<Arc<PersistenceEngine>> {
        self.persistence.get(store).cloned()
    }

    pub fn persistence_stats(&self) -> HashMap<String, hkv_persist::PersistenceStats> {
        self.persistence.iter().map(|(name, engine)| (name.clone(), engine.stats())).collect()
    }

    /// Leaves the cluster, stops replication, and joins every background
    /// thread this node owns (sweepers, snapshot triggers, persistence fsync
    /// workers). Intended for graceful shutdown.
    pub fn shutdown(&self) {
        self.coordinator.stop_replication();
        self.coordinator.leave();

        for stop in &self.snapshot_stop {
            stop.store(true, Ordering::Release);
        }
        for handle in self.snapshot_threads.lock().drain(..) {
            let _ = handle.join();
        }
        for sweeper in self.sweepers.lock().drain(..) {
            sweeper.stop();
        }
        for engine in self.persistence.values() {
            engine.stop();
        }
    }
}

fn build_store(store_cfg: &StoreConfig) -> Arc<Store> {
    let pool = MemoryPool::new(store_cfg.name.clone(), store_cfg.max_memory as usize);

    let filter = store_cfg.cuckoo_filter.enabled.then(|| {
        CuckooFilter::new(CuckooFilterConfig {
            expected_items: store_cfg.cuckoo_filter.capacity,
            fingerprint_bits: fingerprint_bits_for_fpp(store_cfg.cuckoo_filter.fpp),
            ..CuckooFilterConfig::default()
        })
    });

    let eviction: Box<dyn EvictionPolicy> = match store_cfg.eviction_policy {
        EvictionPolicyKind::SessionAware => {
            Box::new(SessionAwarePolicy::new(SESSION_GRACE_PERIOD, SESSION_HIGH_THRESHOLD))
        }
        EvictionPolicyKind::Lru => Box::new(LruPolicy::new()),
    };

    let default_ttl = store_cfg.default_ttl_secs.map(Duration::from_secs);
    Store::new(store_cfg.name.clone(), pool, filter, eviction, default_ttl)
}

/// Picks a fingerprint width whose theoretical false-positive rate
/// (`2 * slots_per_bucket / 2^bits`) is at or below the configured target,
/// clamped to the filter's supported range.
fn fingerprint_bits_for_fpp(fpp: f64) -> u32 {
    let slots = CuckooFilterConfig::default().slots_per_bucket as f64;
    let fpp = fpp.clamp(1e-6, 0.5);
    let bits = (2.0 * slots / fpp).log2().ceil() as i32;
    bits.clamp(4, 16) as u32
}

fn attach_persistence(config: &NodeConfig, store_cfg: &StoreConfig, store: Arc<Store>) -> Result<PersistedStore> {
    let dir = std::path::Path::new(&config.persistence.directory)
        .join(&config.node.id)
        .join(&store_cfg.name);
    let (engine, recovered) = PersistenceEngine::start(&dir, &config.persistence)
        .with_context(|| format!("starting persistence engine for store '{}'", store_cfg.name))?;

    replay_recovered_state(&store, recovered);
    store.set_persistence(Some(Arc::clone(&engine) as Arc<dyn hkv_engine::PersistenceSink>));

    Ok(PersistedStore {
        store,
        engine,
        snapshot_interval: Duration::from_secs(config.persistence.snapshot_interval_secs.max(1)),
        snapshot_threshold: config.persistence.snapshot_threshold_entries,
    })
}

fn replay_recovered_state(store: &Arc<Store>, recovered: RecoveredState) {
    let now_ns = unix_nanos_now();

    if let Some(snapshot) = recovered.snapshot {
        if !recovered.snapshot_superseded_by_clear {
            for entry in snapshot.entries {
                apply_snapshot_entry(store, entry, now_ns);
            }
        }
    }

    for entry in recovered.entries {
        apply_log_entry(store, entry, now_ns);
    }

    info!(
        entries = recovered.recovery_entry_count,
        duration_ms = recovered.recovery_duration.as_millis() as u64,
        "replayed persisted state"
    );
}

fn apply_snapshot_entry(store: &Store, entry: SnapshotEntry, now_ns: u64) {
    let session = String::from_utf8_lossy(&entry.session).into_owned();
    let ttl = remaining_ttl(entry.expires_at_ns, now_ns);
    if entry.expires_at_ns != 0 && ttl.is_none() {
        return; // already expired by the time we recovered.
    }
    match Value::decode(&entry.tagged_value) {
        Ok(value) => {
            if let Err(err) = store.set(&entry.key, value, &session, ttl) {
                warn!(error = %err, "failed to apply snapshot entry during recovery");
            }
        }
        Err(err) => warn!(error = %err, "failed to decode snapshot entry during recovery"),
    }
}

fn apply_log_entry(store: &Store, entry: hkv_persist::LogEntry, now_ns: u64) {
    use hkv_persist::Op;
    let session = String::from_utf8_lossy(&entry.session).into_owned();
    match entry.op {
        Op::Set => {
            let absolute_expiry_ns = if entry.ttl_secs > 0 {
                Some(entry.timestamp_ns.saturating_add(entry.ttl_secs.saturating_mul(1_000_000_000)))
            } else {
                None
            };
            let ttl = match absolute_expiry_ns {
                None => None,
                Some(expiry) => match remaining_ttl(expiry, now_ns) {
                    Some(d) => Some(d),
                    None => return, // expired since it was written.
                },
            };
            match Value::decode(&entry.value) {
                Ok(value) => {
                    if let Err(err) = store.set(&entry.key, value, &session, ttl) {
                        warn!(error = %err, "failed to apply log entry during recovery");
                    }
                }
                Err(err) => warn!(error = %err, "failed to decode log entry during recovery"),
            }
        }
        Op::Del => {
            let _ = store.delete(&entry.key);
        }
        Op::Clear => {
            let _ = store.clear();
        }
    }
}

fn remaining_ttl(expires_at_ns: u64, now_ns: u64) -> Option<Duration> {
    if expires_at_ns <= now_ns {
        None
    } else {
        Some(Duration::from_nanos(expires_at_ns - now_ns))
    }
}

fn spawn_snapshot_trigger(persisted: PersistedStore) -> (Arc<AtomicBool>, JoinHandle<()>) {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_thread = Arc::clone(&stop);
    let name = persisted.store.name().to_string();

    let handle = std::thread::Builder::new()
        .name(format!("hkv-snapshot-{name}"))
        .spawn(move || {
            let mut last_snapshot = Instant::now();
            while !stop_thread.load(Ordering::Acquire) {
                std::thread::sleep(SNAPSHOT_POLL_INTERVAL);
                if stop_thread.load(Ordering::Acquire) {
                    break;
                }
                let entry_count = persisted.store.stats().entry_count as u64;
                let due = last_snapshot.elapsed() >= persisted.snapshot_interval
                    || entry_count >= persisted.snapshot_threshold;
                if !due {
                    continue;
                }

                let entries: Vec<SnapshotEntry> = persisted
                    .store
                    .snapshot_all()
                    .into_iter()
                    .map(|e| SnapshotEntry {
                        key: e.key,
                        tagged_value: e.value_bytes,
                        expires_at_ns: e.expires_at_ns,
                        session: e.session,
                    })
                    .collect();
                let last_applied_sequence = persisted.engine.current_sequence();

                if let Err(err) = persisted.engine.create_snapshot(entries, last_applied_sequence) {
                    warn!(store = %name, error = %err, "periodic snapshot failed");
                } else {
                    last_snapshot = Instant::now();
                }
            }
        })
        .expect("failed to spawn snapshot trigger thread");

    (stop, handle)
}
