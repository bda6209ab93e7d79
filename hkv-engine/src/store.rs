//! # Key/Value Store
//!
//! Purpose: The memory-accounted, TTL-aware, eviction-backed store behind a
//! single node's partition of the keyspace. One `Store` per configured
//! cache section; the node process holds a registry of them by name.
//!
//! ## Design Principles
//! 1. **Single Reader/Writer Lock**: the entry map lives behind one
//!    `parking_lot::RwLock`, not per-shard locks — required so
//!    `Σ entry.size == pool.current_bytes` can be checked and maintained
//!    under one critical section instead of reasoning across shards.
//! 2. **Inline Eviction on Out-of-Room**: `Set` detects `NoSpace` from the
//!    pool synchronously and asks the eviction policy for candidates while
//!    still holding the write lock, so a pressure callback reaching back
//!    into the store (see `pool::MemoryPool`) can never deadlock against it.
//! 3. **Replication Bypass**: `apply_remote_*` mutate state the same way as
//!    their public counterparts but never call back into persistence
//!    publication or ring routing, matching the loop-prevention rule for
//!    inbound `data-mutation` events.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::RwLock;
use tracing::warn;

use hkv_common::{HkvError, HkvResult, Value};

use crate::eviction::EvictionPolicy;
use crate::filter::CuckooFilter;
use crate::pool::{AllocationHandle, MemoryPool};

/// Maximum entries the TTL sweeper removes in one tick, bounding pause time.
const SWEEP_BATCH: usize = 1024;

/// Sink a store hands its mutations to for durability; implemented by
/// `hkv-persist::PersistenceEngine`. Kept as a trait here (rather than a
/// direct dependency on `hkv-persist`) so `hkv-engine` stays a leaf crate.
pub trait PersistenceSink: Send + Sync {
    fn append_set(
        &self,
        key: &[u8],
        value_bytes: &[u8],
        ttl_secs: u64,
        session: &str,
    ) -> HkvResult<()>;
    fn append_del(&self, key: &[u8]) -> HkvResult<()>;
    fn append_clear(&self) -> HkvResult<()>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    handle: AllocationHandle,
    byte_size: usize,
    created_at: SystemTime,
    expires_at: Option<SystemTime>,
    session: Arc<str>,
    access_count: u64,
    last_accessed: Instant,
}

impl Entry {
    fn is_expired(&self, now: SystemTime) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// TTL state of a key, mirroring Redis's `TTL` command semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlStatus {
    /// Key does not exist (or already expired).
    Missing,
    /// Key exists with no expiration set.
    NoExpiry,
    /// Key expires after the given duration.
    ExpiresIn(Duration),
}

/// One live entry captured for a periodic snapshot, shaped to drop directly
/// into `hkv-persist::SnapshotEntry` without this crate depending on it.
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    pub key: Vec<u8>,
    pub value_bytes: Vec<u8>,
    pub expires_at_ns: u64,
    pub session: Vec<u8>,
}

/// Point-in-time counters for a store.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub errors: u64,
    pub entry_count: usize,
    pub current_bytes: usize,
    pub max_bytes: usize,
}

struct StoreInner {
    map: HashMap<Arc<[u8]>, Entry, RandomState>,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
    errors: u64,
}

impl StoreInner {
    fn new() -> Self {
        StoreInner {
            map: HashMap::with_hasher(RandomState::new()),
            hits: 0,
            misses: 0,
            evictions: 0,
            expirations: 0,
            errors: 0,
        }
    }
}

/// Handle to the background TTL sweeper; stop it to avoid leaking the
/// thread.
pub struct SweeperHandle {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// A memory-bounded, TTL-aware, eviction-backed key/value namespace.
pub struct Store {
    name: String,
    pool: Arc<MemoryPool>,
    filter: Option<CuckooFilter>,
    eviction: Box<dyn EvictionPolicy>,
    default_ttl: Option<Duration>,
    persistence: RwLock<Option<Arc<dyn PersistenceSink>>>,
    inner: RwLock<StoreInner>,
    filter_full_warnings: AtomicU64,
}

impl Store {
    pub fn new(
        name: impl Into<String>,
        pool: Arc<MemoryPool>,
        filter: Option<CuckooFilter>,
        eviction: Box<dyn EvictionPolicy>,
        default_ttl: Option<Duration>,
    ) -> Arc<Self> {
        Arc::new(Store {
            name: name.into(),
            pool,
            filter,
            eviction,
            default_ttl,
            persistence: RwLock::new(None),
            inner: RwLock::new(StoreInner::new()),
            filter_full_warnings: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attaches (or detaches with `None`) the persistence sink used by
    /// `Set`/`Delete`/`Clear` to append log entries.
    pub fn set_persistence(&self, sink: Option<Arc<dyn PersistenceSink>>) {
        *self.persistence.write() = sink;
    }

    /// Starts the periodic TTL sweeper on a dedicated thread.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> SweeperHandle {
        let interval = if interval.is_zero() {
            Duration::from_millis(1)
        } else {
            interval
        };
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = Arc::clone(&stop);
        let store = Arc::clone(self);

        let join = std::thread::Builder::new()
            .name(format!("hkv-sweep-{}", store.name))
            .spawn(move || {
                while !stop_thread.load(Ordering::Acquire) {
                    std::thread::sleep(interval);
                    store.sweep_expired();
                }
            })
            .expect("failed to spawn ttl sweeper");

        SweeperHandle {
            stop,
            join: Some(join),
        }
    }

    /// Removes up to `SWEEP_BATCH` expired entries per call.
    fn sweep_expired(&self) {
        let now = SystemTime::now();
        let mut inner = self.inner.write();
        let expired: Vec<Arc<[u8]>> = inner
            .map
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .take(SWEEP_BATCH)
            .map(|(key, _)| Arc::clone(key))
            .collect();

        for key in &expired {
            if let Some(entry) = inner.map.remove(key) {
                let _ = self.pool.free(entry.handle);
                self.eviction.on_delete(key);
                if let Some(filter) = &self.filter {
                    filter.delete(key);
                }
                inner.expirations += 1;
            }
        }
    }

    /// Stores `value` under `key`, attributed to `session`, expiring after
    /// `ttl` (falling back to the store's default TTL, or no TTL).
    pub fn set(
        &self,
        key: &[u8],
        value: Value,
        session: &str,
        ttl: Option<Duration>,
    ) -> HkvResult<()> {
        if key.is_empty() {
            return Err(HkvError::InvalidArgument("key must not be empty".into()));
        }
        let encoded = value.encode();
        let ttl = ttl.or(self.default_ttl);
        let now = SystemTime::now();
        let expires_at = ttl.map(|d| now + d);
        let ttl_secs = ttl.map(|d| d.as_secs()).unwrap_or(0);

        let handle = self.allocate_with_eviction(encoded.len())?;
        let key_arc: Arc<[u8]> = Arc::from(key);
        let entry = Entry {
            value,
            handle,
            byte_size: encoded.len(),
            created_at: now,
            expires_at,
            session: Arc::from(session),
            access_count: 0,
            last_accessed: Instant::now(),
        };

        {
            let mut inner = self.inner.write();
            if let Some(prior) = inner.map.insert(Arc::clone(&key_arc), entry) {
                let _ = self.pool.free(prior.handle);
                self.eviction.on_delete(&key_arc);
            }
        }
        self.eviction.on_insert(&key_arc, session, Instant::now());
        self.insert_into_filter(&key_arc);

        if let Some(sink) = self.persistence.read().as_ref() {
            if let Err(err) = sink.append_set(key, &encoded, ttl_secs, session) {
                warn!(store = %self.name, error = %err, "persistence write failed on set");
                self.inner.write().errors += 1;
                return Err(err);
            }
        }

        Ok(())
    }

    /// Looks up `key`, lazily expiring it and consulting the filter first.
    pub fn get(&self, key: &[u8]) -> HkvResult<Value> {
        if let Some(filter) = &self.filter {
            if !filter.contains(key) {
                self.inner.write().misses += 1;
                return Err(HkvError::NotFound);
            }
        }

        let now = SystemTime::now();
        let mut inner = self.inner.write();
        let Some(entry) = inner.map.get_mut(key) else {
            inner.misses += 1;
            return Err(HkvError::NotFound);
        };

        if entry.is_expired(now) {
            let entry = inner.map.remove(key).expect("entry present");
            let _ = self.pool.free(entry.handle);
            self.eviction.on_delete(key);
            if let Some(filter) = &self.filter {
                filter.delete(key);
            }
            inner.expirations += 1;
            return Err(HkvError::Expired);
        }

        entry.access_count += 1;
        entry.last_accessed = Instant::now();
        let value = entry.value.clone();
        inner.hits += 1;
        drop(inner);
        self.eviction.on_access(key, Instant::now());
        Ok(value)
    }

    /// Removes `key`, returning `Ok(())` if it was present.
    pub fn delete(&self, key: &[u8]) -> HkvResult<()> {
        let removed = {
            let mut inner = self.inner.write();
            inner.map.remove(key)
        };
        let Some(entry) = removed else {
            return Err(HkvError::NotFound);
        };
        let _ = self.pool.free(entry.handle);
        self.eviction.on_delete(key);
        if let Some(filter) = &self.filter {
            filter.delete(key);
        }

        if let Some(sink) = self.persistence.read().as_ref() {
            if let Err(err) = sink.append_del(key) {
                warn!(store = %self.name, error = %err, "persistence write failed on delete");
                self.inner.write().errors += 1;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Sets (or replaces) a key's expiration, returning `Ok(())` if the key
    /// was present. Re-appends a SET record so recovery replays the new TTL.
    pub fn expire(&self, key: &[u8], ttl: Duration) -> HkvResult<()> {
        let now = SystemTime::now();
        let expires_at = now + ttl;
        let (encoded, session, ttl_secs) = {
            let mut inner = self.inner.write();
            let Some(entry) = inner.map.get_mut(key) else {
                return Err(HkvError::NotFound);
            };
            if entry.is_expired(now) {
                let entry = inner.map.remove(key).expect("entry present");
                drop(inner);
                let _ = self.pool.free(entry.handle);
                self.eviction.on_delete(key);
                if let Some(filter) = &self.filter {
                    filter.delete(key);
                }
                return Err(HkvError::NotFound);
            }
            entry.expires_at = Some(expires_at);
            (entry.value.encode(), entry.session.to_string(), ttl.as_secs())
        };

        if let Some(sink) = self.persistence.read().as_ref() {
            if let Err(err) = sink.append_set(key, &encoded, ttl_secs, &session) {
                warn!(store = %self.name, error = %err, "persistence write failed on expire");
                self.inner.write().errors += 1;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Returns the TTL status of `key`, lazily expiring it first.
    pub fn ttl(&self, key: &[u8]) -> HkvResult<TtlStatus> {
        let now = SystemTime::now();
        let mut inner = self.inner.write();
        let Some(entry) = inner.map.get(key) else {
            return Ok(TtlStatus::Missing);
        };

        if entry.is_expired(now) {
            let entry = inner.map.remove(key).expect("entry present");
            drop(inner);
            let _ = self.pool.free(entry.handle);
            self.eviction.on_delete(key);
            if let Some(filter) = &self.filter {
                filter.delete(key);
            }
            return Ok(TtlStatus::Missing);
        }

        match entry.expires_at {
            None => Ok(TtlStatus::NoExpiry),
            Some(at) => {
                let remaining = at.duration_since(now).unwrap_or(Duration::ZERO);
                Ok(TtlStatus::ExpiresIn(remaining))
            }
        }
    }

    /// Removes every key, returning all allocations to the pool.
    pub fn clear(&self) -> HkvResult<()> {
        let keys: Vec<Arc<[u8]>> = {
            let mut inner = self.inner.write();
            let keys: Vec<Arc<[u8]>> = inner.map.keys().cloned().collect();
            for (_, entry) in inner.map.drain() {
                let _ = self.pool.free(entry.handle);
            }
            keys
        };
        for key in &keys {
            self.eviction.on_delete(key);
        }
        if let Some(filter) = &self.filter {
            filter.clear();
        }

        if let Some(sink) = self.persistence.read().as_ref() {
            if let Err(err) = sink.append_clear() {
                warn!(store = %self.name, error = %err, "persistence write failed on clear");
                self.inner.write().errors += 1;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Applies a replicated SET without republishing or touching the log
    /// unless the store was configured to persist replicated writes.
    pub fn apply_remote_set(
        &self,
        key: &[u8],
        value: Value,
        session: &str,
        ttl: Option<Duration>,
        persist_replicated: bool,
    ) -> HkvResult<()> {
        let encoded = value.encode();
        let now = SystemTime::now();
        let expires_at = ttl.map(|d| now + d);
        let handle = self.allocate_with_eviction(encoded.len())?;
        let key_arc: Arc<[u8]> = Arc::from(key);
        let entry = Entry {
            value,
            handle,
            byte_size: encoded.len(),
            created_at: now,
            expires_at,
            session: Arc::from(session),
            access_count: 0,
            last_accessed: Instant::now(),
        };

        {
            let mut inner = self.inner.write();
            if let Some(prior) = inner.map.insert(Arc::clone(&key_arc), entry) {
                let _ = self.pool.free(prior.handle);
                self.eviction.on_delete(&key_arc);
            }
        }
        self.eviction.on_insert(&key_arc, session, Instant::now());
        self.insert_into_filter(&key_arc);

        if persist_replicated {
            if let Some(sink) = self.persistence.read().as_ref() {
                let ttl_secs = ttl.map(|d| d.as_secs()).unwrap_or(0);
                let _ = sink.append_set(key, &encoded, ttl_secs, session);
            }
        }
        Ok(())
    }

    /// Applies a replicated DEL, mirroring `delete` without re-publication.
    pub fn apply_remote_delete(&self, key: &[u8], persist_replicated: bool) -> HkvResult<()> {
        let removed = self.inner.write().map.remove(key);
        if let Some(entry) = removed {
            let _ = self.pool.free(entry.handle);
            self.eviction.on_delete(key);
            if let Some(filter) = &self.filter {
                filter.delete(key);
            }
        }
        if persist_replicated {
            if let Some(sink) = self.persistence.read().as_ref() {
                let _ = sink.append_del(key);
            }
        }
        Ok(())
    }

    /// Applies a replicated CLEAR.
    pub fn apply_remote_clear(&self, persist_replicated: bool) -> HkvResult<()> {
        self.clear_without_log()?;
        if persist_replicated {
            if let Some(sink) = self.persistence.read().as_ref() {
                let _ = sink.append_clear();
            }
        }
        Ok(())
    }

    fn clear_without_log(&self) -> HkvResult<()> {
        let keys: Vec<Arc<[u8]>> = {
            let mut inner = self.inner.write();
            let keys: Vec<Arc<[u8]>> = inner.map.keys().cloned().collect();
            for (_, entry) in inner.map.drain() {
                let _ = self.pool.free(entry.handle);
            }
            keys
        };
        for key in &keys {
            self.eviction.on_delete(key);
        }
        if let Some(filter) = &self.filter {
            filter.clear();
        }
        Ok(())
    }

    /// Dumps every live (non-expired) entry for a point-in-time snapshot.
    /// Lazily-expired entries are skipped rather than swept here; the
    /// sweeper and lookup paths remain the only places that mutate state.
    pub fn snapshot_all(&self) -> Vec<EntrySnapshot> {
        let now = SystemTime::now();
        let inner = self.inner.read();
        inner
            .map
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(key, entry)| EntrySnapshot {
                key: key.to_vec(),
                value_bytes: entry.value.encode(),
                expires_at_ns: entry.expires_at.map(unix_nanos).unwrap_or(0),
                session: entry.session.as_bytes().to_vec(),
            })
            .collect()
    }

    /// Underlying pool allocation counters (`total_allocs`/`failures`/etc),
    /// a superset of what `stats()` surfaces.
    pub fn pool_stats(&self) -> crate::pool::PoolStats {
        self.pool.stats()
    }

    /// Whether this store was configured with a cuckoo filter.
    pub fn filter_enabled(&self) -> bool {
        self.filter.is_some()
    }

    /// Filter counters, if a cuckoo filter is configured. Filter sizing is
    /// fixed at construction (rebuilding it would mean re-inserting every
    /// live key), so there's no corresponding `set_filter_enabled`.
    pub fn filter_stats(&self) -> Option<crate::filter::FilterStats> {
        self.filter.as_ref().map(|f| f.stats())
    }

    /// Returns a snapshot of store counters and pool usage.
    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.read();
        StoreStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            expirations: inner.expirations,
            errors: inner.errors,
            entry_count: inner.map.len(),
            current_bytes: self.pool.current(),
            max_bytes: self.pool.max(),
        }
    }

    /// Allocates `n` bytes, evicting candidates inline when the pool
    /// reports `NoSpace`, until room is freed or no candidate remains.
    fn allocate_with_eviction(&self, n: usize) -> HkvResult<AllocationHandle> {
        match self.pool.allocate(n) {
            Ok(handle) => return Ok(handle),
            Err(HkvError::NoSpace) => {}
            Err(other) => return Err(other),
        }

        loop {
            let pressure = self.pool.pressure();
            let Some(candidate) = self.eviction.next_candidate(pressure, Instant::now()) else {
                return Err(HkvError::NoSpace);
            };

            let removed = self.inner.write().map.remove(candidate.as_ref());
            match removed {
                Some(entry) => {
                    let _ = self.pool.free(entry.handle);
                    self.eviction.on_delete(&candidate);
                    if let Some(filter) = &self.filter {
                        filter.delete(&candidate);
                    }
                    self.inner.write().evictions += 1;
                }
                None => {
                    // Candidate already gone (expired/deleted concurrently);
                    // keep scanning rather than giving up immediately.
                }
            }

            match self.pool.allocate(n) {
                Ok(handle) => return Ok(handle),
                Err(HkvError::NoSpace) => continue,
                Err(other) => return Err(other),
            }
        }
    }

    fn insert_into_filter(&self, key: &[u8]) {
        if let Some(filter) = &self.filter {
            if !filter.add(key) {
                let warned = self.filter_full_warnings.fetch_add(1, Ordering::Relaxed);
                if warned % 1000 == 0 {
                    warn!(store = %self.name, "cuckoo filter full, tolerating as over-approximation");
                }
            }
        }
    }
}

/// Converts a `SystemTime` to unix-epoch nanoseconds, saturating at zero for
/// times before the epoch (used by the persistence record format).
pub fn unix_nanos(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eviction::LruPolicy;

    fn test_store(max_bytes: usize) -> Arc<Store> {
        let pool = MemoryPool::new("test", max_bytes);
        Store::new("test", pool, None, Box::new(LruPolicy::new()), None)
    }

    #[test]
    fn set_then_get_round_trips() {
        let store = test_store(1024);
        store
            .set(b"foo", Value::String("bar".into()), "s1", None)
            .unwrap();
        assert_eq!(store.get(b"foo").unwrap(), Value::String("bar".into()));
    }

    #[test]
    fn delete_removes_and_frees() {
        let store = test_store(1024);
        store
            .set(b"foo", Value::String("bar".into()), "s1", None)
            .unwrap();
        store.delete(b"foo").unwrap();
        assert_eq!(store.get(b"foo").unwrap_err(), HkvError::NotFound);
        assert_eq!(store.stats().current_bytes, 0);
    }

    #[test]
    fn delete_missing_key_is_not_found() {
        let store = test_store(1024);
        assert_eq!(store.delete(b"missing").unwrap_err(), HkvError::NotFound);
    }

    #[test]
    fn ttl_expiry_returns_expired_then_not_found() {
        let store = test_store(1024);
        store
            .set(
                b"k",
                Value::String("v".into()),
                "s1",
                Some(Duration::from_millis(1)),
            )
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(store.get(b"k").unwrap_err(), HkvError::Expired);
        assert_eq!(store.get(b"k").unwrap_err(), HkvError::NotFound);
    }

    #[test]
    fn clear_frees_all_allocations() {
        let store = test_store(1024);
        for i in 0..10 {
            store
                .set(
                    format!("k{i}").as_bytes(),
                    Value::I64(i),
                    "s1",
                    None,
                )
                .unwrap();
        }
        store.clear().unwrap();
        assert_eq!(store.stats().entry_count, 0);
        assert_eq!(store.stats().current_bytes, 0);
    }

    #[test]
    fn set_evicts_under_pressure_instead_of_failing_immediately() {
        // Each Value::I64 encodes to 9 bytes (tag + 8). A 40-byte budget
        // fits 4 entries; a 5th insert must evict rather than error.
        let store = test_store(40);
        for i in 0..5 {
            store
                .set(format!("k{i}").as_bytes(), Value::I64(i), "s1", None)
                .unwrap();
        }
        let stats = store.stats();
        assert!(stats.current_bytes <= 40);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.entry_count, 4);
    }

    #[test]
    fn ttl_reports_no_expiry_then_expires_in_after_expire_call() {
        let store = test_store(1024);
        store
            .set(b"k", Value::String("v".into()), "s1", None)
            .unwrap();
        assert_eq!(store.ttl(b"k").unwrap(), TtlStatus::NoExpiry);

        store.expire(b"k", Duration::from_secs(30)).unwrap();
        match store.ttl(b"k").unwrap() {
            TtlStatus::ExpiresIn(remaining) => assert!(remaining <= Duration::from_secs(30)),
            other => panic!("expected ExpiresIn, got {other:?}"),
        }
    }

    #[test]
    fn ttl_on_missing_key_is_missing() {
        let store = test_store(1024);
        assert_eq!(store.ttl(b"nope").unwrap(), TtlStatus::Missing);
    }

    #[test]
    fn expire_on_missing_key_is_not_found() {
        let store = test_store(1024);
        assert_eq!(
            store.expire(b"nope", Duration::from_secs(1)).unwrap_err(),
            HkvError::NotFound
        );
    }

    #[test]
    fn apply_remote_set_does_not_touch_persistence_by_default() {
        let store = test_store(1024);
        store
            .apply_remote_set(b"k", Value::String("v".into()), "s1", None, false)
            .unwrap();
        assert_eq!(store.get(b"k").unwrap(), Value::String("v".into()));
    }

    #[test]
    fn replication_idempotence_reapplying_set_is_stable() {
        let store = test_store(1024);
        store
            .apply_remote_set(b"k", Value::String("v".into()), "s1", None, false)
            .unwrap();
        store
            .apply_remote_set(b"k", Value::String("v".into()), "s1", None, false)
            .unwrap();
        assert_eq!(store.get(b"k").unwrap(), Value::String("v".into()));
        assert_eq!(store.stats().entry_count, 1);
    }

    #[test]
    fn invariant_pool_bytes_match_entry_sizes_after_mixed_ops() {
        let store = test_store(4096);
        for i in 0..20 {
            store
                .set(format!("k{i}").as_bytes(), Value::I64(i), "s1", None)
                .unwrap();
        }
        for i in 0..10 {
            store.delete(format!("k{i}").as_bytes()).unwrap();
        }
        let stats = store.stats();
        assert_eq!(stats.entry_count, 10);
        assert_eq!(stats.current_bytes, stats.entry_count * 9);
    }
}
