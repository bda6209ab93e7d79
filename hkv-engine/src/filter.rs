//! # Cuckoo Filter
//!
//! Purpose: Per-store probabilistic membership test with delete support, so
//! `Get` on a definitely-absent key can skip the map lookup entirely.
//!
//! ## Design Principles
//! 1. **Two Candidate Buckets**: `h1` and `h2 = h1 XOR hash(fingerprint)`
//!    are symmetric, so a fingerprint stored in either bucket can be found
//!    by computing both candidates from the key alone.
//! 2. **Bounded Displacement**: insertion kicks an existing occupant and
//!    retries up to a fixed bound rather than growing unboundedly; beyond
//!    that bound the filter reports itself full and the caller falls back
//!    to "treat as a miss" (the key is still inserted into the store).
//! 3. **Reader/Writer Lock**: `contains` is the hot path and should not
//!    contend with concurrent inserts/deletes any more than necessary.
//! 4. **Bucket Width Tracks Config**: each bucket is a `Vec` sized to
//!    `config.slots_per_bucket` rather than a hardcoded array, so sizing,
//!    displacement, and the false-positive-rate formula all agree on the
//!    same slot count.

use std::hash::Hasher;

use ahash::AHasher;
use parking_lot::RwLock;
use rand::Rng;

/// Default fingerprint width in bits.
pub const DEFAULT_FINGERPRINT_BITS: u32 = 12;
/// Default slots per bucket.
pub const DEFAULT_SLOTS_PER_BUCKET: usize = 4;
/// Default bound on kick-chain length before an insert gives up.
pub const DEFAULT_MAX_DISPLACEMENTS: usize = 500;
/// Target load factor used to size the bucket array.
const LOAD_FACTOR: f64 = 0.95;

type Fingerprint = u16;

/// Snapshot of filter counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterStats {
    pub inserts: u64,
    pub deletes: u64,
    pub lookups: u64,
    pub full_failures: u64,
    pub items: u64,
}

struct FilterInner {
    buckets: Vec<Vec<Option<Fingerprint>>>,
    bucket_mask: usize,
    items: u64,
}

/// Configuration used to size a new filter.
#[derive(Debug, Clone, Copy)]
pub struct CuckooFilterConfig {
    pub expected_items: usize,
    pub fingerprint_bits: u32,
    pub slots_per_bucket: usize,
    pub max_displacements: usize,
}

impl Default for CuckooFilterConfig {
    fn default() -> Self {
        CuckooFilterConfig {
            expected_items: 1 << 16,
            fingerprint_bits: DEFAULT_FINGERPRINT_BITS,
            slots_per_bucket: DEFAULT_SLOTS_PER_BUCKET,
            max_displacements: DEFAULT_MAX_DISPLACEMENTS,
        }
    }
}

/// Space-efficient probabilistic set with insert, delete, and membership.
pub struct CuckooFilter {
    config: CuckooFilterConfig,
    fingerprint_mask: u16,
    inner: RwLock<FilterInner>,
    stats: parking_lot::Mutex<FilterStats>,
}

impl CuckooFilter {
    /// Builds a filter sized for `config.expected_items` at the configured
    /// load factor, rounded up to the next power of two bucket count.
    pub fn new(config: CuckooFilterConfig) -> Self {
        let bucket_count = next_power_of_two(
            ((config.expected_items as f64) / (LOAD_FACTOR * config.slots_per_bucket as f64)).ceil() as usize,
        )
        .max(1);

        let fingerprint_mask: u16 = if config.fingerprint_bits >= 16 {
            0xFFFF
        } else {
            (1u16 << config.fingerprint_bits) - 1
        };

        CuckooFilter {
            config,
            fingerprint_mask,
            inner: RwLock::new(FilterInner {
                buckets: vec![vec![None; config.slots_per_bucket.max(1)]; bucket_count],
                bucket_mask: bucket_count - 1,
                items: 0,
            }),
            stats: parking_lot::Mutex::new(FilterStats::default()),
        }
    }

    /// Theoretical false-positive rate for the configured fingerprint width.
    pub fn expected_false_positive_rate(&self) -> f64 {
        (2.0 * self.config.slots_per_bucket as f64) / (1u64 << self.config.fingerprint_bits) as f64
    }

    fn fingerprint_of(&self, key: &[u8]) -> Fingerprint {
        let mut hasher = AHasher::default();
        hasher.write(key);
        hasher.write_u8(0xF1);
        let raw = (hasher.finish() as u16) & self.fingerprint_mask;
        // Fingerprints of 0 are reserved to mean "empty slot".
        if raw == 0 {
            1
        } else {
            raw
        }
    }

    fn primary_bucket(&self, key: &[u8], bucket_mask: usize) -> usize {
        let mut hasher = AHasher::default();
        hasher.write(key);
        (hasher.finish() as usize) & bucket_mask
    }

    fn alternate_bucket(&self, bucket: usize, fingerprint: Fingerprint, bucket_mask: usize) -> usize {
        let mut hasher = AHasher::default();
        hasher.write_u16(fingerprint);
        let fp_hash = hasher.finish() as usize;
        (bucket ^ fp_hash) & bucket_mask
    }

    /// Attempts to add `key`. Returns `false` when displacement was
    /// exhausted (the filter is considered full for this insert).
    pub fn add(&self, key: &[u8]) -> bool {
        let fingerprint = self.fingerprint_of(key);
        let mut inner = self.inner.write();
        let bucket_mask = inner.bucket_mask;
        let b1 = self.primary_bucket(key, bucket_mask);
        let b2 = self.alternate_bucket(b1, fingerprint, bucket_mask);

        if try_insert_into(&mut inner.buckets[b1], fingerprint)
            || try_insert_into(&mut inner.buckets[b2], fingerprint)
        {
            inner.items += 1;
            let mut stats = self.stats.lock();
            stats.inserts += 1;
            stats.items = inner.items;
            return true;
        }

        let mut rng = rand::thread_rng();
        let mut bucket = if rng.gen_bool(0.5) { b1 } else { b2 };
        let mut displaced = fingerprint;

        for _ in 0..self.config.max_displacements {
            let slot = rng.gen_range(0..inner.buckets[bucket].len());
            match inner.buckets[bucket][slot].replace(displaced) {
                None => {
                    inner.items += 1;
                    let mut stats = self.stats.lock();
                    stats.inserts += 1;
                    stats.items = inner.items;
                    return true;
                }
                Some(evicted) => {
                    displaced = evicted;
                    bucket = self.alternate_bucket(bucket, displaced, bucket_mask);
                }
            }
        }

        self.stats.lock().full_failures += 1;
        false
    }

    /// Returns true when `key` may be in the set (possibly a false
    /// positive); false means `key` is definitely absent.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.stats.lock().lookups += 1;
        let fingerprint = self.fingerprint_of(key);
        let inner = self.inner.read();
        let bucket_mask = inner.bucket_mask;
        let b1 = self.primary_bucket(key, bucket_mask);
        let b2 = self.alternate_bucket(b1, fingerprint, bucket_mask);
        bucket_has(&inner.buckets[b1], fingerprint) || bucket_has(&inner.buckets[b2], fingerprint)
    }

    /// Removes one matching fingerprint for `key`, if present.
    pub fn delete(&self, key: &[u8]) -> bool {
        let fingerprint = self.fingerprint_of(key);
        let mut inner = self.inner.write();
        let bucket_mask = inner.bucket_mask;
        let b1 = self.primary_bucket(key, bucket_mask);
        let b2 = self.alternate_bucket(b1, fingerprint, bucket_mask);

        if remove_from(&mut inner.buckets[b1], fingerprint)
            || remove_from(&mut inner.buckets[b2], fingerprint)
        {
            inner.items = inner.items.saturating_sub(1);
            self.stats.lock().deletes += 1;
            self.stats.lock().items = inner.items;
            true
        } else {
            false
        }
    }

    /// Clears every bucket.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        for bucket in inner.buckets.iter_mut() {
            bucket.iter_mut().for_each(|slot| *slot = None);
        }
        inner.items = 0;
        self.stats.lock().items = 0;
    }

    /// Returns a snapshot of filter counters.
    pub fn stats(&self) -> FilterStats {
        *self.stats.lock()
    }
}

fn try_insert_into(bucket: &mut [Option<Fingerprint>], fingerprint: Fingerprint) -> bool {
    for slot in bucket.iter_mut() {
        if slot.is_none() {
            *slot = Some(fingerprint);
            return true;
        }
    }
    false
}

fn bucket_has(bucket: &[Option<Fingerprint>], fingerprint: Fingerprint) -> bool {
    bucket.iter().any(|slot| *slot == Some(fingerprint))
}

fn remove_from(bucket: &mut [Option<Fingerprint>], fingerprint: Fingerprint) -> bool {
    for slot in bucket.iter_mut() {
        if *slot == Some(fingerprint) {
            *slot = None;
            return true;
        }
    }
    false
}

fn next_power_of_two(value: usize) -> usize {
    value.max(1).next_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_contains() {
        let filter = CuckooFilter::new(CuckooFilterConfig {
            expected_items: 1024,
            ..Default::default()
        });
        assert!(filter.add(b"alpha"));
        assert!(filter.contains(b"alpha"));
        assert!(!filter.contains(b"beta"));
    }

    #[test]
    fn delete_removes_membership() {
        let filter = CuckooFilter::new(CuckooFilterConfig {
            expected_items: 1024,
            ..Default::default()
        });
        filter.add(b"alpha");
        assert!(filter.delete(b"alpha"));
        assert!(!filter.contains(b"alpha"));
        assert!(!filter.delete(b"alpha"));
    }

    #[test]
    fn clear_empties_filter() {
        let filter = CuckooFilter::new(CuckooFilterConfig {
            expected_items: 1024,
            ..Default::default()
        });
        for i in 0..100 {
            filter.add(format!("key-{i}").as_bytes());
        }
        filter.clear();
        assert_eq!(filter.stats().items, 0);
        for i in 0..100 {
            assert!(!filter.contains(format!("key-{i}").as_bytes()));
        }
    }

    #[test]
    fn false_positive_rate_is_bounded_on_random_sample() {
        let capacity = 4096;
        let filter = CuckooFilter::new(CuckooFilterConfig {
            expected_items: capacity,
            ..Default::default()
        });
        let mut inserted = Vec::new();
        for i in 0..capacity / 2 {
            let key = format!("present-{i}");
            if filter.add(key.as_bytes()) {
                inserted.push(key);
            }
        }

        let sample_size = capacity * 10;
        let mut false_positives = 0usize;
        for i in 0..sample_size {
            let key = format!("absent-{i}");
            if filter.contains(key.as_bytes()) {
                false_positives += 1;
            }
        }

        let observed_rate = false_positives as f64 / sample_size as f64;
        let bound = 2.0 * filter.expected_false_positive_rate();
        assert!(
            observed_rate <= bound,
            "observed {observed_rate} exceeded bound {bound}"
        );
    }

    #[test]
    fn custom_slots_per_bucket_is_honored() {
        let filter = CuckooFilter::new(CuckooFilterConfig {
            expected_items: 1024,
            slots_per_bucket: 8,
            ..Default::default()
        });
        for i in 0..500 {
            filter.add(format!("wide-{i}").as_bytes());
        }
        for i in 0..500 {
            assert!(filter.contains(format!("wide-{i}").as_bytes()));
        }
        assert!(filter.delete(b"wide-0"));
        assert!(!filter.contains(b"wide-0"));
    }

    #[test]
    fn all_live_keys_report_present() {
        let filter = CuckooFilter::new(CuckooFilterConfig {
            expected_items: 2048,
            ..Default::default()
        });
        let mut keys = Vec::new();
        for i in 0..1000 {
            let key = format!("live-{i}");
            if filter.add(key.as_bytes()) {
                keys.push(key);
            }
        }
        for key in &keys {
            assert!(filter.contains(key.as_bytes()));
        }
    }
}
