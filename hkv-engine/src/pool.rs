//! # Memory Pool
//!
//! Purpose: Byte-accounted allocator backing a single store, with pressure
//! thresholds that let eviction react to memory headroom instead of only to
//! a hard allocation failure.
//!
//! ## Design Principles
//! 1. **Atomic Fast Path**: `allocate`/`free` only touch an atomic counter
//!    and a small table; no store-level lock is acquired here.
//! 2. **Callbacks Never On the Allocator Path**: threshold-crossing
//!    callbacks run on a dedicated worker thread fed by a channel, so a
//!    callback that reaches back into the owning store's write lock can
//!    never deadlock with `allocate()` itself (see `hkv-engine::store`).
//! 3. **Fire-Once Semantics**: a level's callback runs when pressure climbs
//!    into it, not on every allocation while pressure stays elevated.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Mutex, RwLock};

use hkv_common::{HkvError, HkvResult};

/// Opaque handle returned by `allocate`, required by `free`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocationHandle(u64);

/// Pressure levels a pool can notify callbacks about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PressureLevel {
    Low = 1,
    Medium = 2,
    High = 3,
}

impl PressureLevel {
    fn from_rank(rank: u8) -> Option<Self> {
        match rank {
            1 => Some(PressureLevel::Low),
            2 => Some(PressureLevel::Medium),
            3 => Some(PressureLevel::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Thresholds {
    low: f64,
    medium: f64,
    high: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds {
            low: 0.85,
            medium: 0.90,
            high: 0.95,
        }
    }
}

/// Point-in-time counters for a pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub current_bytes: usize,
    pub max_bytes: usize,
    pub total_allocs: u64,
    pub total_frees: u64,
    pub failures: u64,
}

type PressureCallback = Box<dyn Fn() + Send + Sync>;

/// Byte-accounted allocator with pressure notifications.
///
/// Must be held behind an `Arc` (via [`MemoryPool::new`]) because the
/// pressure worker thread keeps its own clone alive for the pool's lifetime.
pub struct MemoryPool {
    name: String,
    max_bytes: usize,
    current_bytes: AtomicUsize,
    next_handle: AtomicU64,
    table: Mutex<hashbrown::HashMap<u64, usize>>,
    thresholds: RwLock<Thresholds>,
    last_level_rank: AtomicUsize,
    callbacks: RwLock<Vec<(PressureLevel, PressureCallback)>>,
    worker_tx: Sender<PressureLevel>,
    total_allocs: AtomicU64,
    total_frees: AtomicU64,
    failures: AtomicU64,
}

impl MemoryPool {
    /// Creates a pool with the given byte budget and spawns its dedicated
    /// pressure-callback worker thread.
    pub fn new(name: impl Into<String>, max_bytes: usize) -> Arc<Self> {
        let (tx, rx) = unbounded::<PressureLevel>();
        let pool = Arc::new(MemoryPool {
            name: name.into(),
            max_bytes,
            current_bytes: AtomicUsize::new(0),
            next_handle: AtomicU64::new(1),
            table: Mutex::new(hashbrown::HashMap::new()),
            thresholds: RwLock::new(Thresholds::default()),
            last_level_rank: AtomicUsize::new(0),
            callbacks: RwLock::new(Vec::new()),
            worker_tx: tx,
            total_allocs: AtomicU64::new(0),
            total_frees: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        });

        let worker_pool = Arc::clone(&pool);
        thread::Builder::new()
            .name(format!("hkv-pool-{}", worker_pool.name))
            .spawn(move || {
                while let Ok(level) = rx.recv() {
                    let callbacks = worker_pool.callbacks.read();
                    for (cb_level, cb) in callbacks.iter() {
                        if *cb_level == level {
                            cb();
                        }
                    }
                }
            })
            .expect("failed to spawn pool pressure worker");

        pool
    }

    /// Allocates `n` bytes, returning a handle to track the allocation.
    ///
    /// O(1): a single atomic compare-exchange loop plus a table insert.
    pub fn allocate(&self, n: usize) -> HkvResult<AllocationHandle> {
        if n == 0 {
            return Err(HkvError::InvalidArgument("allocation size must be > 0".into()));
        }

        loop {
            let current = self.current_bytes.load(Ordering::Acquire);
            if current.saturating_add(n) > self.max_bytes {
                self.failures.fetch_add(1, Ordering::Relaxed);
                return Err(HkvError::NoSpace);
            }
            if self
                .current_bytes
                .compare_exchange_weak(current, current + n, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.table.lock().insert(id, n);
        self.total_allocs.fetch_add(1, Ordering::Relaxed);
        self.maybe_signal_pressure();
        Ok(AllocationHandle(id))
    }

    /// Releases a previously allocated handle back to the pool.
    pub fn free(&self, handle: AllocationHandle) -> HkvResult<()> {
        let size = self
            .table
            .lock()
            .remove(&handle.0)
            .ok_or(HkvError::InvalidFree)?;
        self.current_bytes.fetch_sub(size, Ordering::AcqRel);
        self.total_frees.fetch_add(1, Ordering::Relaxed);
        // A free can also cross a threshold downward and back up later; we
        // only reset `last_level_rank` here so a later allocate can re-fire.
        self.reconcile_level_after_free();
        Ok(())
    }

    /// Current bytes in use.
    pub fn current(&self) -> usize {
        self.current_bytes.load(Ordering::Acquire)
    }

    /// Configured byte budget.
    pub fn max(&self) -> usize {
        self.max_bytes
    }

    /// Fraction of the budget currently in use.
    pub fn pressure(&self) -> f64 {
        self.current() as f64 / self.max_bytes.max(1) as f64
    }

    /// Updates the low/medium/high pressure thresholds (fractions of `max`).
    pub fn set_thresholds(&self, low: f64, medium: f64, high: f64) {
        *self.thresholds.write() = Thresholds { low, medium, high };
    }

    /// Registers a callback to run (on the dedicated worker thread) the
    /// first time pressure climbs into `level`.
    pub fn on_pressure(&self, level: PressureLevel, callback: impl Fn() + Send + Sync + 'static) {
        self.callbacks.write().push((level, Box::new(callback)));
    }

    /// Returns a snapshot of allocator counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            current_bytes: self.current(),
            max_bytes: self.max_bytes,
            total_allocs: self.total_allocs.load(Ordering::Relaxed),
            total_frees: self.total_frees.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    fn level_for_pressure(&self, pressure: f64) -> u8 {
        let thresholds = *self.thresholds.read();
        if pressure >= thresholds.high {
            3
        } else if pressure >= thresholds.medium {
            2
        } else if pressure >= thresholds.low {
            1
        } else {
            0
        }
    }

    fn maybe_signal_pressure(&self) {
        let rank = self.level_for_pressure(self.pressure());
        if rank == 0 {
            return;
        }
        let previous = self.last_level_rank.fetch_max(rank as usize, Ordering::AcqRel);
        if (previous as u8) < rank {
            if let Some(level) = PressureLevel::from_rank(rank) {
                let _ = self.worker_tx.send(level);
            }
        }
    }

    fn reconcile_level_after_free(&self) {
        let rank = self.level_for_pressure(self.pressure());
        // Allow re-firing once pressure has dropped below the previously
        // reached level; a later allocate() can then cross upward again.
        self.last_level_rank
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if (rank as usize) < current {
                    Some(rank as usize)
                } else {
                    None
                }
            })
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[test]
    fn allocate_and_free_track_bytes() {
        let pool = MemoryPool::new("test", 1024);
        let handle = pool.allocate(100).unwrap();
        assert_eq!(pool.current(), 100);
        pool.free(handle).unwrap();
        assert_eq!(pool.current(), 0);
    }

    #[test]
    fn allocate_beyond_budget_fails() {
        let pool = MemoryPool::new("test", 10);
        assert_eq!(pool.allocate(11).unwrap_err(), HkvError::NoSpace);
        assert_eq!(pool.stats().failures, 1);
    }

    #[test]
    fn freeing_unknown_handle_is_invalid_free() {
        let pool = MemoryPool::new("test", 10);
        let other_pool = MemoryPool::new("other", 10);
        let handle = other_pool.allocate(5).unwrap();
        assert_eq!(pool.free(handle).unwrap_err(), HkvError::InvalidFree);
    }

    #[test]
    fn pressure_callback_fires_once_on_worker_thread() {
        let pool = MemoryPool::new("test", 100);
        pool.set_thresholds(0.5, 0.7, 0.9);
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = Arc::clone(&fired);
        pool.on_pressure(PressureLevel::Low, move || {
            fired_clone.store(true, Ordering::SeqCst);
        });

        pool.allocate(60).unwrap();
        // The callback runs asynchronously; give the worker thread a moment.
        for _ in 0..50 {
            if fired.load(Ordering::SeqCst) {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(fired.load(Ordering::SeqCst));
    }
}
