//! # Persistence Engine
//!
//! Purpose: Own the on-disk append log and snapshot files for a single
//! node's data directory, replaying them into a store at startup and
//! serializing every mutation afterward.
//!
//! ## Design Principles
//! 1. **Single Writer**: all appends go through one `parking_lot::Mutex`
//!    around the open file handle and sequence counter — log file and
//!    snapshot rotation are both owned exclusively by this engine.
//! 2. **Sync Policy Drives Durability, Not Correctness**: `always` fsyncs
//!    inline; `every-second` hands fsync to a dedicated background thread
//!    (mirrors the store's pressure-worker/TTL-sweeper thread pattern);
//!    `never` leaves flushing to the OS. All three produce the same bytes.
//! 3. **Fail Degraded, Not Silent**: once a write fails, the engine stops
//!    accepting further writes rather than risk a gap the CRC check can't
//!    detect.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{error, warn};

use hkv_common::config::{PersistenceSection, SyncPolicy};
use hkv_common::{HkvError, HkvResult};
use hkv_engine::store::PersistenceSink;

use crate::record::{decode_record, encode_record, DecodeOutcome, LogEntry, Op};
use crate::snapshot::{decode_snapshot, encode_snapshot, Snapshot, SnapshotEntry};

fn unix_nanos_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Point-in-time counters for a persistence engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct PersistenceStats {
    pub entries_written: u64,
    pub bytes_written: u64,
    pub snapshots_created: u64,
    pub last_snapshot_at_ns: u64,
    pub recovery_entry_count: u64,
    pub recovery_duration: Duration,
}

/// Outcome of replaying the log and newest valid snapshot at startup.
pub struct RecoveredState {
    pub entries: Vec<LogEntry>,
    pub snapshot: Option<Snapshot>,
    /// True when a CLEAR was replayed after the snapshot's
    /// last-applied-sequence: the snapshot's entries must then be discarded
    /// rather than applied, since the clear supersedes them too.
    pub snapshot_superseded_by_clear: bool,
    pub recovery_entry_count: u64,
    pub recovery_duration: Duration,
}

struct WriterState {
    file: File,
    next_sequence: u64,
    dirty: bool,
}

/// AOF + snapshot persistence for one store's data directory.
pub struct PersistenceEngine {
    data_dir: PathBuf,
    sync_policy: SyncPolicy,
    degraded: AtomicBool,
    writer: Mutex<WriterState>,
    entries_written: AtomicU64,
    bytes_written: AtomicU64,
    snapshots_created: AtomicU64,
    last_snapshot_at_ns: AtomicU64,
    recovery_entry_count: AtomicU64,
    recovery_duration_nanos: AtomicU64,
    fsync_stop: Mutex<Option<Arc<AtomicBool>>>,
    fsync_join: Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceEngine {
    /// Opens (creating if absent) the log file under `data_dir`, replays it
    /// plus the newest valid snapshot, and returns both the engine and the
    /// recovered state the caller should apply to its store before serving
    /// traffic.
    pub fn start(data_dir: impl AsRef<Path>, config: &PersistenceSection) -> HkvResult<(Arc<Self>, RecoveredState)> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)?;
        fs::create_dir_all(data_dir.join("snapshots"))?;

        let aof_path = data_dir.join("hypercache.aof");
        let started = Instant::now();

        let snapshot = load_newest_valid_snapshot(&data_dir)?;
        let snapshot_floor = snapshot.as_ref().map(|s| s.last_applied_sequence).unwrap_or(0);

        let (entries, max_sequence, snapshot_superseded_by_clear) = replay_log(&aof_path, snapshot_floor)?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&aof_path)?;

        let recovery_entry_count = entries.len() as u64;
        let recovery_duration = started.elapsed();

        let engine = Arc::new(PersistenceEngine {
            data_dir,
            sync_policy: config.sync_policy,
            degraded: AtomicBool::new(false),
            writer: Mutex::new(WriterState {
                file,
                next_sequence: max_sequence + 1,
                dirty: false,
            }),
            entries_written: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            snapshots_created: AtomicU64::new(0),
            last_snapshot_at_ns: AtomicU64::new(0),
            recovery_entry_count: AtomicU64::new(recovery_entry_count),
            recovery_duration_nanos: AtomicU64::new(recovery_duration.as_nanos() as u64),
            fsync_stop: Mutex::new(None),
            fsync_join: Mutex::new(None),
        });

        if config.sync_policy == SyncPolicy::EverySecond {
            engine.start_fsync_worker();
        }

        Ok((
            engine,
            RecoveredState {
                entries,
                snapshot,
                snapshot_superseded_by_clear,
                recovery_entry_count,
                recovery_duration,
            },
        ))
    }

    /// Stops the background fsync worker (if any) and releases file handles.
    pub fn stop(&self) {
        if let Some(stop) = self.fsync_stop.lock().take() {
            stop.store(true, Ordering::Release);
        }
        if let Some(join) = self.fsync_join.lock().take() {
            let _ = join.join();
        }
    }

    fn start_fsync_worker(self: &Arc<Self>) {
        let stop = Arc::new(AtomicBool::new(false));
        *self.fsync_stop.lock() = Some(Arc::clone(&stop));
        let engine = Arc::clone(self);

        let join = std::thread::Builder::new()
            .name("hkv-persist-fsync".to_string())
            .spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    std::thread::sleep(Duration::from_secs(1));
                    let mut writer = engine.writer.lock();
                    if writer.dirty {
                        if let Err(err) = writer.file.sync_data() {
                            error!(error = %err, "background fsync failed");
                            engine.degraded.store(true, Ordering::Release);
                        }
                        writer.dirty = false;
                    }
                }
            })
            .expect("failed to spawn persistence fsync worker");
        *self.fsync_join.lock() = Some(join);
    }

    /// Appends one record under the write mutex, applying the sync policy.
    pub fn write_entry(&self, mut entry: LogEntry) -> HkvResult<()> {
        if self.degraded.load(Ordering::Acquire) {
            return Err(HkvError::PersistenceDegraded);
        }

        let mut writer = self.writer.lock();
        entry.sequence = writer.next_sequence;
        let record = encode_record(&entry);

        if let Err(err) = writer.file.write_all(&record) {
            self.degraded.store(true, Ordering::Release);
            error!(error = %err, "aof write failed, engine degraded");
            return Err(HkvError::Io(err.to_string()));
        }

        if self.sync_policy == SyncPolicy::Always {
            if let Err(err) = writer.file.sync_data() {
                self.degraded.store(true, Ordering::Release);
                error!(error = %err, "aof fsync failed, engine degraded");
                return Err(HkvError::Io(err.to_string()));
            }
        } else {
            writer.dirty = true;
        }

        writer.next_sequence += 1;
        self.entries_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written
            .fetch_add(record.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Writes a new snapshot file and truncates the log to entries with a
    /// sequence greater than `last_applied_sequence`.
    pub fn create_snapshot(&self, entries: Vec<SnapshotEntry>, last_applied_sequence: u64) -> HkvResult<()> {
        let snapshot = Snapshot {
            created_at_ns: unix_nanos_now(),
            last_applied_sequence,
            entries,
        };
        let encoded = encode_snapshot(&snapshot);

        let file_name = format!("{}.snap", snapshot.created_at_ns);
        let path = self.data_dir.join("snapshots").join(file_name);
        let tmp_path = path.with_extension("snap.tmp");
        fs::write(&tmp_path, &encoded)?;
        fs::rename(&tmp_path, &path)?;

        self.rotate_log(last_applied_sequence)?;

        self.snapshots_created.fetch_add(1, Ordering::Relaxed);
        self.last_snapshot_at_ns
            .store(snapshot.created_at_ns, Ordering::Relaxed);
        Ok(())
    }

    fn rotate_log(&self, last_applied_sequence: u64) -> HkvResult<()> {
        let aof_path = self.data_dir.join("hypercache.aof");
        let tmp_path = self.data_dir.join("hypercache.aof.tmp");

        let mut writer = self.writer.lock();
        writer.file.flush()?;

        let (retained, _, _) = replay_log(&aof_path, last_applied_sequence)?;
        let mut tmp_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        for entry in &retained {
            tmp_file.write_all(&encode_record(entry))?;
        }
        tmp_file.sync_data()?;
        drop(tmp_file);
        fs::rename(&tmp_path, &aof_path)?;

        writer.file = OpenOptions::new().create(true).read(true).append(true).open(&aof_path)?;
        Ok(())
    }

    /// Returns the highest sequence number assigned so far, i.e. the
    /// `last_applied_sequence` a caller should pass to `create_snapshot` for
    /// a snapshot covering every record written up to this point.
    pub fn current_sequence(&self) -> u64 {
        self.writer.lock().next_sequence.saturating_sub(1)
    }

    /// Returns a snapshot of persistence counters.
    pub fn stats(&self) -> PersistenceStats {
        PersistenceStats {
            entries_written: self.entries_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            snapshots_created: self.snapshots_created.load(Ordering::Relaxed),
            last_snapshot_at_ns: self.last_snapshot_at_ns.load(Ordering::Relaxed),
            recovery_entry_count: self.recovery_entry_count.load(Ordering::Relaxed),
            recovery_duration: Duration::from_nanos(self.recovery_duration_nanos.load(Ordering::Relaxed)),
        }
    }

    fn next_entry(&self, op: Op, key: &[u8], value: &[u8], ttl_secs: u64, session: &str) -> LogEntry {
        LogEntry {
            sequence: 0, // assigned under the write lock in write_entry
            timestamp_ns: unix_nanos_now(),
            op,
            key: key.to_vec(),
            value: value.to_vec(),
            ttl_secs,
            session: session.as_bytes().to_vec(),
        }
    }
}

impl PersistenceSink for PersistenceEngine {
    fn append_set(&self, key: &[u8], value_bytes: &[u8], ttl_secs: u64, session: &str) -> HkvResult<()> {
        let entry = self.next_entry(Op::Set, key, value_bytes, ttl_secs, session);
        self.write_entry(entry)
    }

    fn append_del(&self, key: &[u8]) -> HkvResult<()> {
        let entry = self.next_entry(Op::Del, key, &[], 0, "");
        self.write_entry(entry)
    }

    fn append_clear(&self) -> HkvResult<()> {
        let entry = self.next_entry(Op::Clear, &[], &[], 0, "");
        self.write_entry(entry)
    }
}

/// Replays the AOF, returning entries with `sequence > floor` plus the
/// highest sequence number observed (even below `floor`, so the writer can
/// resume numbering correctly) and whether a CLEAR was replayed past
/// `floor` (meaning a prior snapshot's entries must be discarded too, since
/// the clear supersedes them). A CRC mismatch truncates the read at that
/// point (`tail-corruption-truncated`); a CLEAR resets the accumulated
/// entries but not the running max-sequence tracking.
fn replay_log(path: &Path, floor: u64) -> HkvResult<(Vec<LogEntry>, u64, bool)> {
    if !path.exists() {
        return Ok((Vec::new(), floor, false));
    }
    let mut file = File::open(path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    let mut entries = Vec::new();
    let mut max_sequence = floor;
    let mut offset = 0usize;
    let mut superseded_by_clear = false;

    while offset < buf.len() {
        match decode_record(&buf[offset..]) {
            DecodeOutcome::Record(entry, consumed) => {
                max_sequence = max_sequence.max(entry.sequence);
                if entry.op == Op::Clear {
                    entries.clear();
                    if entry.sequence > floor {
                        superseded_by_clear = true;
                    }
                } else if entry.sequence > floor {
                    entries.push(entry);
                }
                offset += consumed;
            }
            DecodeOutcome::Incomplete => {
                warn!(path = %path.display(), offset, "aof tail incomplete, truncating");
                truncate_at(path, offset)?;
                break;
            }
            DecodeOutcome::CrcMismatch => {
                warn!(path = %path.display(), offset, "aof tail-corruption-truncated");
                truncate_at(path, offset)?;
                break;
            }
        }
    }

    Ok((entries, max_sequence, superseded_by_clear))
}

fn truncate_at(path: &Path, offset: usize) -> HkvResult<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(offset as u64)?;
    Ok(())
}

fn load_newest_valid_snapshot(data_dir: &Path) -> HkvResult<Option<Snapshot>> {
    let snapshots_dir = data_dir.join("snapshots");
    if !snapshots_dir.exists() {
        return Ok(None);
    }

    let mut candidates: Vec<PathBuf> = fs::read_dir(&snapshots_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("snap"))
        .collect();
    candidates.sort();
    candidates.reverse(); // timestamp-named files: newest first

    for path in candidates {
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(_) => continue,
        };
        let mut buf = Vec::new();
        if file.read_to_end(&mut buf).is_err() {
            continue;
        }
        match decode_snapshot(&buf) {
            Ok(snapshot) => return Ok(Some(snapshot)),
            Err(_) => {
                warn!(path = %path.display(), "corrupted snapshot skipped, trying older");
                continue;
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hkv_common::config::PersistenceSection;
    use tempfile::tempdir;

    fn config(sync: SyncPolicy) -> PersistenceSection {
        PersistenceSection {
            enabled: true,
            directory: "ignored".into(),
            strategy: hkv_common::config::PersistenceStrategy::Aof,
            sync_policy: sync,
            snapshot_interval_secs: 300,
            snapshot_threshold_entries: 100_000,
            persist_replicated: false,
        }
    }

    #[test]
    fn write_then_restart_replays_entries() {
        let dir = tempdir().unwrap();
        {
            let (engine, recovered) = PersistenceEngine::start(dir.path(), &config(SyncPolicy::Always)).unwrap();
            assert!(recovered.entries.is_empty());
            engine.append_set(b"k1", b"v1", 0, "s1").unwrap();
            engine.append_set(b"k2", b"v2", 0, "s1").unwrap();
            engine.stop();
        }
        let (_, recovered) = PersistenceEngine::start(dir.path(), &config(SyncPolicy::Always)).unwrap();
        assert_eq!(recovered.entries.len(), 2);
        assert_eq!(recovered.entries[0].key, b"k1");
        assert_eq!(recovered.entries[1].key, b"k2");
    }

    #[test]
    fn clear_during_replay_drops_prior_entries() {
        let dir = tempdir().unwrap();
        {
            let (engine, _) = PersistenceEngine::start(dir.path(), &config(SyncPolicy::Always)).unwrap();
            engine.append_set(b"k1", b"v1", 0, "s1").unwrap();
            engine.append_clear().unwrap();
            engine.append_set(b"k2", b"v2", 0, "s1").unwrap();
            engine.stop();
        }
        let (_, recovered) = PersistenceEngine::start(dir.path(), &config(SyncPolicy::Always)).unwrap();
        assert_eq!(recovered.entries.len(), 1);
        assert_eq!(recovered.entries[0].key, b"k2");
    }

    #[test]
    fn snapshot_then_restart_recovers_from_snapshot() {
        let dir = tempdir().unwrap();
        let (engine, _) = PersistenceEngine::start(dir.path(), &config(SyncPolicy::Always)).unwrap();
        engine.append_set(b"k1", b"v1", 0, "s1").unwrap();
        engine.append_set(b"k2", b"v2", 0, "s1").unwrap();
        engine
            .create_snapshot(
                vec![
                    SnapshotEntry {
                        key: b"k1".to_vec(),
                        tagged_value: b"v1".to_vec(),
                        expires_at_ns: 0,
                        session: b"s1".to_vec(),
                    },
                    SnapshotEntry {
                        key: b"k2".to_vec(),
                        tagged_value: b"v2".to_vec(),
                        expires_at_ns: 0,
                        session: b"s1".to_vec(),
                    },
                ],
                2,
            )
            .unwrap();
        engine.append_set(b"k3", b"v3", 0, "s1").unwrap();
        engine.stop();

        let (_, recovered) = PersistenceEngine::start(dir.path(), &config(SyncPolicy::Always)).unwrap();
        let snapshot = recovered.snapshot.expect("snapshot should be recovered");
        assert_eq!(snapshot.entries.len(), 2);
        assert_eq!(recovered.entries.len(), 1);
        assert_eq!(recovered.entries[0].key, b"k3");
    }

    #[test]
    fn corrupted_tail_record_is_truncated_on_replay() {
        let dir = tempdir().unwrap();
        let aof_path;
        {
            let (engine, _) = PersistenceEngine::start(dir.path(), &config(SyncPolicy::Always)).unwrap();
            engine.append_set(b"k1", b"v1", 0, "s1").unwrap();
            aof_path = dir.path().join("hypercache.aof");
            engine.stop();
        }

        {
            let mut file = OpenOptions::new().append(true).open(&aof_path).unwrap();
            file.write_all(&[1, 2, 3, 4, 5]).unwrap();
        }

        let (_, recovered) = PersistenceEngine::start(dir.path(), &config(SyncPolicy::Always)).unwrap();
        assert_eq!(recovered.entries.len(), 1);

        let mut file = File::open(&aof_path).unwrap();
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).unwrap();
        let expected_len = encode_record(&recovered.entries[0]).len();
        assert_eq!(buf.len(), expected_len);
    }

    #[test]
    fn writes_after_degraded_fail_fast() {
        let dir = tempdir().unwrap();
        let (engine, _) = PersistenceEngine::start(dir.path(), &config(SyncPolicy::Always)).unwrap();
        engine.degraded.store(true, Ordering::Release);
        assert_eq!(
            engine.append_set(b"k", b"v", 0, "s1").unwrap_err(),
            HkvError::PersistenceDegraded
        );
    }
}
