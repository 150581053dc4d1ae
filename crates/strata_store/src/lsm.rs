//! LSM-tree storage engine: WAL → active memtable → immutable memtable →
//! level-0 tables → leveled compaction.
//!
//! Locking follows the narrow-scope rule: the write mutex (the WAL guard)
//! covers one WAL append plus one memtable insert; the version mutex covers
//! only reading or replacing the current `Arc<Version>`; flush and compaction
//! serialize against each other on a maintenance mutex and never block the
//! write path.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;

use crate::backend::StorageBackend;
use crate::memtable::{InternalKey, Lookup, MemTable, ValueKind};
use crate::sstable::{TableBuilder, TableLookup, TableReader};
use crate::wal::{self, WalRecord, WalRecordKind, WalWriter};

const MAINTENANCE_INTERVAL: Duration = Duration::from_millis(100);

/// Split threshold for compaction output tables.
const OUTPUT_TARGET_BYTES: usize = 2 * 1024 * 1024;

/// Engine configuration; every field has a serviceable default.
#[derive(Clone, Debug)]
pub struct LsmConfig {
    pub data_dir: PathBuf,
    pub memtable_size: usize,
    pub block_size: usize,
    pub max_levels: usize,
    pub level0_compaction_trigger: usize,
    pub level0_stop_writes: usize,
}

impl LsmConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            memtable_size: 4 * 1024 * 1024,
            block_size: 4096,
            max_levels: 7,
            level0_compaction_trigger: 4,
            level0_stop_writes: 8,
        }
    }
}

/// Metadata for one open table file, including its ready reader.
#[derive(Clone)]
pub struct SstMeta {
    pub level: usize,
    pub file_number: u64,
    pub smallest: Vec<u8>,
    pub largest: Vec<u8>,
    pub file_size: u64,
    pub entry_count: u64,
    pub path: PathBuf,
    pub reader: Arc<TableReader>,
}

/// Immutable snapshot of the table manifest. Installed wholesale on every
/// flush or compaction; readers take a snapshot and probe it unlocked.
pub struct Version {
    levels: Vec<Vec<SstMeta>>,
}

impl Version {
    fn empty(max_levels: usize) -> Self {
        Self {
            levels: vec![Vec::new(); max_levels],
        }
    }

    pub fn files_at(&self, level: usize) -> &[SstMeta] {
        &self.levels[level]
    }

    pub fn files_per_level(&self) -> Vec<usize> {
        self.levels.iter().map(|l| l.len()).collect()
    }
}

#[derive(Default)]
struct LsmStats {
    wal_bytes: AtomicU64,
    memtable_size: AtomicU64,
    memtable_entries: AtomicU64,
    compactions_done: AtomicU64,
    total_puts: AtomicU64,
    total_gets: AtomicU64,
    total_deletes: AtomicU64,
    bloom_filter_hits: AtomicU64,
}

/// Point-in-time stats view, serialized for the stats surface.
#[derive(Clone, Debug, Serialize)]
pub struct LsmStatsSnapshot {
    pub wal_bytes: u64,
    pub memtable_size: u64,
    pub memtable_entries: u64,
    pub files_per_level: Vec<usize>,
    pub sstable_count: usize,
    pub compactions_done: u64,
    pub total_puts: u64,
    pub total_gets: u64,
    pub total_deletes: u64,
    pub bloom_filter_hits: u64,
}

pub struct LsmEngine {
    config: LsmConfig,
    /// The write mutex: one WAL append + one memtable insert per hold.
    wal: Mutex<WalWriter>,
    sequence: AtomicU64,
    next_file_number: AtomicU64,
    active: RwLock<Arc<MemTable>>,
    immutable: Mutex<Option<Arc<MemTable>>>,
    version: Mutex<Arc<Version>>,
    /// Serializes flush and compaction so version installs never interleave.
    maintenance: Mutex<()>,
    stats: LsmStats,
    shutdown: AtomicBool,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl LsmEngine {
    /// Open the engine: rebuild the version from disk, replay WALs into a
    /// fresh memtable, and start the maintenance worker.
    pub fn open(config: LsmConfig) -> anyhow::Result<Arc<Self>> {
        fs::create_dir_all(config.data_dir.join("wal")).context("create wal dir")?;
        for level in 0..config.max_levels {
            fs::create_dir_all(level_dir(&config.data_dir, level)).context("create sst dir")?;
        }

        let mut levels = vec![Vec::new(); config.max_levels];
        let mut max_file_number = 0u64;
        let mut max_sequence = 0u64;
        let mut recovered_any = false;
        for (level, slot) in levels.iter_mut().enumerate() {
            *slot = load_level(&config.data_dir, level)?;
            for meta in slot.iter() {
                max_file_number = max_file_number.max(meta.file_number);
                // The sequence counter must restart past every persisted
                // entry or compaction would resurrect stale versions.
                meta.reader.for_each_entry(|key, _| {
                    max_sequence = max_sequence.max(key.sequence);
                    recovered_any = true;
                })?;
            }
        }

        let memtable = Arc::new(MemTable::new(config.memtable_size));
        let mut replayed = 0usize;
        for path in wal_replay_order(&config.data_dir)? {
            replayed += wal::replay(&path, |record| {
                max_sequence = max_sequence.max(record.sequence);
                recovered_any = true;
                match record.kind {
                    WalRecordKind::Put => memtable.put(&record.key, &record.value, record.sequence),
                    WalRecordKind::Delete => memtable.delete(&record.key, record.sequence),
                }
            })?;
        }
        if replayed > 0 {
            tracing::info!(records = replayed, "replayed write-ahead log");
        }

        let writer = WalWriter::open(current_wal_path(&config.data_dir))?;
        let engine = Arc::new(Self {
            sequence: AtomicU64::new(if recovered_any { max_sequence + 1 } else { 0 }),
            next_file_number: AtomicU64::new(max_file_number + 1),
            active: RwLock::new(memtable),
            immutable: Mutex::new(None),
            version: Mutex::new(Arc::new(Version { levels })),
            maintenance: Mutex::new(()),
            stats: LsmStats::default(),
            shutdown: AtomicBool::new(false),
            worker: Mutex::new(None),
            wal: Mutex::new(writer),
            config,
        });

        let worker = {
            // The worker holds a weak handle so dropping the engine tears it
            // down even without an explicit close().
            let engine = Arc::downgrade(&engine);
            thread::Builder::new()
                .name("lsm-maintenance".to_string())
                .spawn(move || loop {
                    thread::sleep(MAINTENANCE_INTERVAL);
                    let Some(engine) = engine.upgrade() else {
                        break;
                    };
                    if engine.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    engine.maintenance_pass();
                })
                .context("spawn lsm maintenance thread")?
        };
        *engine.worker.lock().unwrap() = Some(worker);
        Ok(engine)
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        anyhow::ensure!(!key.is_empty(), "empty key");
        self.check_write_capacity()?;

        let mut wal = self.wal.lock().unwrap();
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let written = wal.append(&WalRecord::put(key.to_vec(), value.to_vec(), sequence))?;
        self.stats.wal_bytes.fetch_add(written, Ordering::Relaxed);

        let active = self.active.read().unwrap().clone();
        active.put(key, value, sequence);
        self.stats.total_puts.fetch_add(1, Ordering::Relaxed);
        self.note_memtable(&active);
        drop(active);

        self.maybe_rotate(&mut wal)
    }

    pub fn delete(&self, key: &[u8]) -> anyhow::Result<()> {
        anyhow::ensure!(!key.is_empty(), "empty key");
        self.check_write_capacity()?;

        let mut wal = self.wal.lock().unwrap();
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let written = wal.append(&WalRecord::delete(key.to_vec(), sequence))?;
        self.stats.wal_bytes.fetch_add(written, Ordering::Relaxed);

        let active = self.active.read().unwrap().clone();
        active.delete(key, sequence);
        self.stats.total_deletes.fetch_add(1, Ordering::Relaxed);
        self.note_memtable(&active);
        drop(active);

        self.maybe_rotate(&mut wal)
    }

    /// Append every entry as one WAL frame run with a single flush, then
    /// insert the batch into the memtable.
    pub fn batch_put(&self, entries: &[(Vec<u8>, Vec<u8>)]) -> anyhow::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        for (key, _) in entries {
            anyhow::ensure!(!key.is_empty(), "empty key");
        }
        self.check_write_capacity()?;

        let mut wal = self.wal.lock().unwrap();
        let mut records = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
            records.push(WalRecord::put(key.clone(), value.clone(), sequence));
        }
        let written = wal.append_batch(&records)?;
        self.stats.wal_bytes.fetch_add(written, Ordering::Relaxed);

        let active = self.active.read().unwrap().clone();
        for record in &records {
            active.put(&record.key, &record.value, record.sequence);
        }
        self.stats
            .total_puts
            .fetch_add(records.len() as u64, Ordering::Relaxed);
        self.note_memtable(&active);
        drop(active);

        self.maybe_rotate(&mut wal)
    }

    /// Probe memtables then tables, newest data first. `None` covers both
    /// absence and a deletion marker.
    pub fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        self.stats.total_gets.fetch_add(1, Ordering::Relaxed);

        let active = self.active.read().unwrap().clone();
        match active.get(key) {
            Lookup::Found(value) => return Ok(Some(value)),
            Lookup::Deleted => return Ok(None),
            Lookup::Missing => {}
        }

        let immutable = self.immutable.lock().unwrap().clone();
        if let Some(immutable) = immutable {
            match immutable.get(key) {
                Lookup::Found(value) => return Ok(Some(value)),
                Lookup::Deleted => return Ok(None),
                Lookup::Missing => {}
            }
        }

        let version = self.current_version();
        // Level 0 may overlap: probe every table, newest first.
        for meta in version.files_at(0).iter().rev() {
            match meta.reader.get(key)? {
                TableLookup::Filtered => {
                    self.stats.bloom_filter_hits.fetch_add(1, Ordering::Relaxed);
                }
                TableLookup::Missing => {}
                TableLookup::Found(value) => return Ok(Some(value)),
                TableLookup::Deleted => return Ok(None),
            }
        }
        // Deeper levels are sorted and non-overlapping: at most one candidate.
        for level in 1..self.config.max_levels {
            let files = version.files_at(level);
            let idx = files.partition_point(|m| m.largest.as_slice() < key);
            if idx == files.len() || files[idx].smallest.as_slice() > key {
                continue;
            }
            match files[idx].reader.get(key)? {
                TableLookup::Filtered => {
                    self.stats.bloom_filter_hits.fetch_add(1, Ordering::Relaxed);
                }
                TableLookup::Missing => {}
                TableLookup::Found(value) => return Ok(Some(value)),
                TableLookup::Deleted => return Ok(None),
            }
        }
        Ok(None)
    }

    /// Drain everything in memory to level 0: pending immutable first, then
    /// the active memtable (rotated regardless of size).
    pub fn flush(&self) -> anyhow::Result<()> {
        self.flush_immutable()?;
        self.force_rotate()?;
        self.flush_immutable()?;
        Ok(())
    }

    /// Flush, then compact level 0 into level 1. After this no level-0
    /// files remain.
    pub fn compact(&self) -> anyhow::Result<()> {
        self.flush()?;
        self.compact_level(0)?;
        Ok(())
    }

    pub fn stats(&self) -> LsmStatsSnapshot {
        let version = self.current_version();
        let files_per_level = version.files_per_level();
        LsmStatsSnapshot {
            wal_bytes: self.stats.wal_bytes.load(Ordering::Relaxed),
            memtable_size: self.stats.memtable_size.load(Ordering::Relaxed),
            memtable_entries: self.stats.memtable_entries.load(Ordering::Relaxed),
            sstable_count: files_per_level.iter().sum(),
            files_per_level,
            compactions_done: self.stats.compactions_done.load(Ordering::Relaxed),
            total_puts: self.stats.total_puts.load(Ordering::Relaxed),
            total_gets: self.stats.total_gets.load(Ordering::Relaxed),
            total_deletes: self.stats.total_deletes.load(Ordering::Relaxed),
            bloom_filter_hits: self.stats.bloom_filter_hits.load(Ordering::Relaxed),
        }
    }

    pub fn current_version(&self) -> Arc<Version> {
        self.version.lock().unwrap().clone()
    }

    /// Stop the worker, drain memory to disk, and close the WAL.
    pub fn close(&self) -> anyhow::Result<()> {
        self.shutdown.store(true, Ordering::Release);
        if let Some(worker) = self.worker.lock().unwrap().take() {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
        self.flush()?;
        self.wal.lock().unwrap().close()
    }

    // ── Write-path internals ──

    fn check_write_capacity(&self) -> anyhow::Result<()> {
        let l0 = self.current_version().files_at(0).len();
        anyhow::ensure!(
            l0 < self.config.level0_stop_writes,
            "writes stopped: {l0} level-0 files awaiting compaction"
        );
        Ok(())
    }

    fn note_memtable(&self, active: &MemTable) {
        self.stats
            .memtable_size
            .store(active.approximate_size() as u64, Ordering::Relaxed);
        self.stats
            .memtable_entries
            .store(active.entry_count() as u64, Ordering::Relaxed);
    }

    /// Hand the active memtable over as the immutable and rotate the WAL,
    /// provided the flush threshold is crossed and no immutable is queued.
    fn maybe_rotate(&self, wal: &mut WalWriter) -> anyhow::Result<()> {
        let should = self.active.read().unwrap().should_flush();
        if !should {
            return Ok(());
        }
        let mut immutable = self.immutable.lock().unwrap();
        if immutable.is_some() {
            // A flush is already pending; keep absorbing writes.
            return Ok(());
        }
        let fresh = Arc::new(MemTable::new(self.config.memtable_size));
        let old = {
            let mut active = self.active.write().unwrap();
            std::mem::replace(&mut *active, fresh)
        };
        *immutable = Some(old);
        drop(immutable);
        self.rotate_wal(wal)
    }

    fn force_rotate(&self) -> anyhow::Result<()> {
        let mut wal = self.wal.lock().unwrap();
        let mut immutable = self.immutable.lock().unwrap();
        if immutable.is_some() {
            return Ok(());
        }
        if self.active.read().unwrap().entry_count() == 0 {
            return Ok(());
        }
        let fresh = Arc::new(MemTable::new(self.config.memtable_size));
        let old = {
            let mut active = self.active.write().unwrap();
            std::mem::replace(&mut *active, fresh)
        };
        *immutable = Some(old);
        drop(immutable);
        self.rotate_wal(&mut wal)
    }

    fn rotate_wal(&self, wal: &mut WalWriter) -> anyhow::Result<()> {
        wal.close()?;
        let current = current_wal_path(&self.config.data_dir);
        let rotated = self.config.data_dir.join("wal").join(format!(
            "rotating_{}.wal",
            self.sequence.load(Ordering::Relaxed)
        ));
        fs::rename(&current, &rotated).context("rotate wal")?;
        *wal = WalWriter::open(&current)?;
        Ok(())
    }

    // ── Maintenance ──

    fn maintenance_pass(&self) {
        if let Err(err) = self.flush_immutable() {
            tracing::error!(error = ?err, "memtable flush failed");
        }
        let l0 = self.current_version().files_at(0).len();
        if l0 >= self.config.level0_compaction_trigger {
            if let Err(err) = self.compact_level(0) {
                tracing::error!(error = ?err, "level-0 compaction failed");
            }
        }
    }

    /// Serialize the pending immutable memtable into a level-0 table and
    /// install it. Rotated WAL files become obsolete once the table is down.
    fn flush_immutable(&self) -> anyhow::Result<bool> {
        let _guard = self.maintenance.lock().unwrap();
        let Some(immutable) = self.immutable.lock().unwrap().clone() else {
            return Ok(false);
        };
        if immutable.entry_count() == 0 {
            *self.immutable.lock().unwrap() = None;
            return Ok(false);
        }

        let file_number = self.next_file_number.fetch_add(1, Ordering::Relaxed);
        let path = sst_path(&self.config.data_dir, 0, file_number);
        let mut builder =
            TableBuilder::create(&path, self.config.block_size, immutable.entry_count())?;
        let mut build_err: Option<anyhow::Error> = None;
        immutable.for_each(|key, value| {
            if build_err.is_none() {
                if let Err(err) = builder.add(key, value) {
                    build_err = Some(err);
                }
            }
        });
        if let Some(err) = build_err {
            let _ = fs::remove_file(&path);
            return Err(err);
        }
        let build = builder.finish()?;
        let reader = Arc::new(TableReader::open(&path)?);
        let meta = SstMeta {
            level: 0,
            file_number,
            smallest: build.smallest,
            largest: build.largest,
            file_size: build.file_size,
            entry_count: build.entry_count,
            path,
            reader,
        };
        tracing::debug!(
            file_number,
            entries = meta.entry_count,
            bytes = meta.file_size,
            "flushed memtable to level 0"
        );

        self.install_version(|levels| levels[0].push(meta.clone()));
        *self.immutable.lock().unwrap() = None;
        self.cleanup_rotated_wals();
        Ok(true)
    }

    /// Merge `level` into `level + 1`. Level 0 compacts as a whole (its
    /// files overlap); deeper levels move their oldest file down.
    pub fn compact_level(&self, level: usize) -> anyhow::Result<bool> {
        let _guard = self.maintenance.lock().unwrap();
        if level + 1 >= self.config.max_levels {
            return Ok(false);
        }
        let version = self.current_version();
        let sources: Vec<SstMeta> = if level == 0 {
            version.files_at(0).to_vec()
        } else {
            version
                .files_at(level)
                .iter()
                .min_by_key(|m| m.file_number)
                .cloned()
                .into_iter()
                .collect()
        };
        if sources.is_empty() {
            return Ok(false);
        }

        let range_smallest = sources.iter().map(|m| m.smallest.clone()).min().unwrap();
        let range_largest = sources.iter().map(|m| m.largest.clone()).max().unwrap();
        let overlaps: Vec<SstMeta> = version
            .files_at(level + 1)
            .iter()
            .filter(|m| m.smallest <= range_largest && m.largest >= range_smallest)
            .cloned()
            .collect();

        let mut entries: Vec<(InternalKey, Vec<u8>)> = Vec::new();
        for meta in sources.iter().chain(overlaps.iter()) {
            meta.reader
                .for_each_entry(|key, value| entries.push((key, value)))?;
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        // Highest sequence wins per user key; a surviving tombstone becomes a
        // true removal once the output sits at the deepest level.
        let deepest = level + 1 == self.config.max_levels - 1;
        let mut outputs = Vec::new();
        let mut builder: Option<(TableBuilder, PathBuf, u64, usize)> = None;
        let mut previous_key: Option<Vec<u8>> = None;
        for (key, value) in entries {
            if previous_key.as_deref() == Some(key.user_key.as_slice()) {
                continue;
            }
            previous_key = Some(key.user_key.clone());
            if deepest && key.kind == ValueKind::Deletion {
                continue;
            }

            if builder.is_none() {
                let file_number = self.next_file_number.fetch_add(1, Ordering::Relaxed);
                let path = sst_path(&self.config.data_dir, level + 1, file_number);
                builder = Some((
                    TableBuilder::create(&path, self.config.block_size, 1024)?,
                    path,
                    file_number,
                    0,
                ));
            }
            let (b, _, _, bytes) = builder.as_mut().unwrap();
            b.add(&key, &value)?;
            *bytes += key.user_key.len() + value.len() + 13;
            if *bytes >= OUTPUT_TARGET_BYTES {
                let (b, path, file_number, _) = builder.take().unwrap();
                outputs.push(finish_output(b, path, file_number, level + 1)?);
            }
        }
        if let Some((b, path, file_number, _)) = builder.take() {
            outputs.push(finish_output(b, path, file_number, level + 1)?);
        }

        let source_numbers: Vec<u64> = sources.iter().map(|m| m.file_number).collect();
        let overlap_numbers: Vec<u64> = overlaps.iter().map(|m| m.file_number).collect();
        self.install_version(|levels| {
            levels[level].retain(|m| !source_numbers.contains(&m.file_number));
            levels[level + 1].retain(|m| !overlap_numbers.contains(&m.file_number));
            levels[level + 1].extend(outputs.iter().cloned());
            levels[level + 1].sort_by(|a, b| a.smallest.cmp(&b.smallest));
        });
        self.stats.compactions_done.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            level,
            inputs = sources.len() + overlaps.len(),
            outputs = outputs.len(),
            "compaction installed"
        );

        // Inputs are garbage only after the version swap.
        for meta in sources.iter().chain(overlaps.iter()) {
            if let Err(err) = fs::remove_file(&meta.path) {
                tracing::warn!(error = ?err, path = %meta.path.display(), "obsolete table removal failed");
            }
        }
        Ok(true)
    }

    fn install_version(&self, mutate: impl FnOnce(&mut Vec<Vec<SstMeta>>)) {
        let mut version = self.version.lock().unwrap();
        let mut levels = version.levels.clone();
        mutate(&mut levels);
        *version = Arc::new(Version { levels });
    }

    fn cleanup_rotated_wals(&self) {
        let wal_dir = self.config.data_dir.join("wal");
        let Ok(dir) = fs::read_dir(&wal_dir) else {
            return;
        };
        for entry in dir.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("rotating_") && name.ends_with(".wal") {
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

impl Drop for LsmEngine {
    fn drop(&mut self) {
        if !self.shutdown.load(Ordering::Acquire) {
            let _ = self.close();
        }
    }
}

impl StorageBackend for LsmEngine {
    fn load(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        self.get(key)
    }

    fn store(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        self.put(key, value)
    }

    fn remove(&self, key: &[u8]) -> anyhow::Result<()> {
        self.delete(key)
    }

    fn batch_store(&self, entries: &[(Vec<u8>, Vec<u8>)]) -> anyhow::Result<()> {
        self.batch_put(entries)
    }

    fn ping(&self) -> bool {
        !self.shutdown.load(Ordering::Acquire)
    }
}

fn finish_output(
    builder: TableBuilder,
    path: PathBuf,
    file_number: u64,
    level: usize,
) -> anyhow::Result<SstMeta> {
    let build = builder.finish()?;
    let reader = Arc::new(TableReader::open(&path)?);
    Ok(SstMeta {
        level,
        file_number,
        smallest: build.smallest,
        largest: build.largest,
        file_size: build.file_size,
        entry_count: build.entry_count,
        path,
        reader,
    })
}

fn current_wal_path(data_dir: &Path) -> PathBuf {
    data_dir.join("wal").join("current.wal")
}

fn level_dir(data_dir: &Path, level: usize) -> PathBuf {
    data_dir.join("sst").join(format!("L{level}"))
}

fn sst_path(data_dir: &Path, level: usize, file_number: u64) -> PathBuf {
    level_dir(data_dir, level).join(format!("sst_{file_number}.sst"))
}

/// Open every table under one level directory, skipping corrupt files.
fn load_level(data_dir: &Path, level: usize) -> anyhow::Result<Vec<SstMeta>> {
    let dir = level_dir(data_dir, level);
    let mut metas = Vec::new();
    let Ok(entries) = fs::read_dir(&dir) else {
        return Ok(metas);
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy().into_owned();
        let Some(file_number) = name
            .strip_prefix("sst_")
            .and_then(|rest| rest.strip_suffix(".sst"))
            .and_then(|digits| digits.parse::<u64>().ok())
        else {
            continue;
        };
        match TableReader::open(&path) {
            Ok(reader) => {
                let reader = Arc::new(reader);
                metas.push(SstMeta {
                    level,
                    file_number,
                    smallest: reader.smallest().to_vec(),
                    largest: reader.largest().to_vec(),
                    file_size: reader.file_size(),
                    entry_count: reader.entry_count(),
                    path,
                    reader,
                });
            }
            Err(err) => {
                tracing::warn!(error = ?err, path = %path.display(), "skipping corrupt sstable");
            }
        }
    }
    if level == 0 {
        metas.sort_by_key(|m| m.file_number);
    } else {
        metas.sort_by(|a, b| a.smallest.cmp(&b.smallest));
    }
    Ok(metas)
}

/// Rotated files in suffix order, then the current file.
fn wal_replay_order(data_dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let wal_dir = data_dir.join("wal");
    let mut rotated: Vec<(u64, PathBuf)> = Vec::new();
    if let Ok(entries) = fs::read_dir(&wal_dir) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy().into_owned();
            if let Some(seq) = name
                .strip_prefix("rotating_")
                .and_then(|rest| rest.strip_suffix(".wal"))
                .and_then(|digits| digits.parse::<u64>().ok())
            {
                rotated.push((seq, entry.path()));
            }
        }
    }
    rotated.sort_by_key(|(seq, _)| *seq);
    let mut order: Vec<PathBuf> = rotated.into_iter().map(|(_, path)| path).collect();
    order.push(current_wal_path(data_dir));
    Ok(order)
}
