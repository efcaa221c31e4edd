use crate::core::memtable::MemTable;
use crate::core::record::Record;
use crate::infra::config::LsmConfig;
use crate::infra::error::{LsmError, Result};
use crate::storage::merge::MergeIterator;
use crate::storage::sstable::SsTable;

use serde::Serialize;
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{info, warn};

#[derive(Debug, Serialize)]
pub struct EngineStats {
    pub memtable_records: usize,
    pub memtable_bytes: usize,
    pub sstable_count: usize,
    pub sstable_records: u64,
    pub sstable_bytes: u64,
}

/// Log-structured merge engine owning one data directory.
///
/// Writes land in a writer-locked [`MemTable`]; when it reaches the
/// configured byte limit it is rotated out under the lock and persisted to
/// an immutable segment outside it, so the map lock is never held across
/// disk I/O. The segment list is copy-on-write: flush and compaction
/// publish a new list under a short write lock while readers keep working
/// off the snapshot they cloned.
///
/// There is no write-ahead log: records not yet flushed at a crash are
/// lost. Durability on clean shutdown comes from [`close`](Self::close),
/// and partially written segments are removed by the temp-file rule the
/// next time the directory is opened.
pub struct LsmEngine {
    memtable: RwLock<MemTable>,
    /// Current segments, newest first.
    sstables: RwLock<Vec<Arc<SsTable>>>,
    next_seq: AtomicU64,
    /// Serializes segment-set mutations (flush, compaction).
    maintenance: Mutex<()>,
    config: LsmConfig,
}

impl LsmEngine {
    pub fn open(config: LsmConfig) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.dir_path)?;

        let (sstables, next_seq) = SsTable::load_dir(&config.dir_path)?;
        info!(
            "LSM engine opened: dir={}, sstables={}, next_seq={}",
            config.dir_path.display(),
            sstables.len(),
            next_seq
        );

        Ok(Self {
            memtable: RwLock::new(MemTable::new()),
            sstables: RwLock::new(sstables),
            next_seq: AtomicU64::new(next_seq),
            maintenance: Mutex::new(()),
            config,
        })
    }

    /// Inserts one record, last-write-wins: the highest timestamp for a
    /// key survives no matter the arrival order, with tombstones winning
    /// timestamp ties. When the memtable crosses the configured limit it
    /// is rotated and flushed before returning.
    pub fn upsert(&self, record: Record) -> Result<()> {
        let rotated = {
            let mut memtable = self.memtable_write()?;

            // The memtable gates against its own entry; when it has none,
            // gate against the newest segment holding the key, so a stale
            // replica hop cannot revive a key a flush carried away. The
            // probe reads mapped segments, not the flush path, so the
            // writer lock is never held across a flush.
            if memtable.get(&record.key).is_none() {
                let tables = self.sstables_snapshot()?;
                for table in tables.iter() {
                    if let Some(existing) = table.get(&record.key)? {
                        if !record.supersedes(&existing) {
                            return Ok(());
                        }
                        break;
                    }
                }
            }

            memtable.insert(record);
            if memtable.size_bytes() >= self.config.memtable_max_size {
                Some(std::mem::take(&mut *memtable))
            } else {
                None
            }
        };

        match rotated {
            Some(full) => self.persist(full),
            None => Ok(()),
        }
    }

    /// Newest record for `key` across all layers, tombstones included.
    /// Memtable first, then segments newest to oldest; first hit wins.
    pub fn get_record(&self, key: &[u8]) -> Result<Option<Record>> {
        if let Some(record) = self.memtable_read()?.get(key) {
            return Ok(Some(record.clone()));
        }

        for table in self.sstables_snapshot()?.iter() {
            if let Some(record) = table.get(key)? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Live records with keys in `[from, to)`, ascending, each key once,
    /// newest version wins, tombstones excluded. The scan sees a
    /// consistent snapshot of the segment set plus the memtable contents
    /// at call time.
    pub fn range(&self, from: Option<&[u8]>, to: Option<&[u8]>) -> Result<MergeIterator> {
        let mem_records: Vec<Record> = self
            .memtable_read()?
            .range(from, to)
            .cloned()
            .collect();

        let tables = self.sstables_snapshot()?;
        let mut sources: Vec<Box<dyn Iterator<Item = Result<Record>>>> =
            Vec::with_capacity(1 + tables.len());
        sources.push(Box::new(mem_records.into_iter().map(Ok)));
        for table in tables.iter() {
            sources.push(Box::new(SsTable::range(table, from, to)?));
        }

        MergeIterator::new(sources)
    }

    /// Rotates and persists the current memtable, if non-empty.
    pub fn flush(&self) -> Result<()> {
        let rotated = std::mem::take(&mut *self.memtable_write()?);
        self.persist(rotated)
    }

    /// Merges every segment plus the current memtable into one new
    /// segment and deletes the superseded files. The merge suppresses
    /// tombstones, which shadow nothing once every layer is merged. Upserts
    /// racing with compaction land in a fresh memtable and are kept.
    pub fn compact(&self) -> Result<()> {
        let _guard = self.maintenance_lock()?;

        let rotated = std::mem::take(&mut *self.memtable_write()?);
        let old_tables = self.sstables_snapshot()?;
        if old_tables.is_empty() && rotated.is_empty() {
            return Ok(());
        }

        let expected =
            rotated.len() + old_tables.iter().map(|t| t.record_count()).sum::<usize>();
        let mem_records: Vec<Record> = rotated.iter().cloned().collect();

        let mut sources: Vec<Box<dyn Iterator<Item = Result<Record>>>> =
            Vec::with_capacity(1 + old_tables.len());
        sources.push(Box::new(mem_records.into_iter().map(Ok)));
        for table in old_tables.iter() {
            sources.push(Box::new(SsTable::iter(table)?));
        }
        let merged = MergeIterator::new(sources)?;

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let compacted = SsTable::create(
            &self.config.dir_path,
            seq,
            expected,
            self.config.bloom_false_positive_rate,
            merged,
        )?;

        {
            let mut tables = self.sstables_write()?;
            *tables = compacted.into_iter().collect();
        }

        for table in old_tables.iter() {
            if let Err(e) = fs::remove_file(table.path()) {
                warn!(
                    "Failed to remove compacted segment {}: {}",
                    table.path().display(),
                    e
                );
            }
        }

        info!(
            "Compaction done: {} segments merged, {} records in",
            old_tables.len(),
            expected
        );
        Ok(())
    }

    /// Flushes any buffered records and releases the mapped segments.
    /// Terminal: the engine serves no reads after close; reopen the
    /// directory with [`open`](Self::open) instead.
    pub fn close(&self) -> Result<()> {
        self.flush()?;
        self.sstables_write()?.clear();
        info!("LSM engine closed: dir={}", self.config.dir_path.display());
        Ok(())
    }

    pub fn stats(&self) -> Result<EngineStats> {
        let memtable = self.memtable_read()?;
        let tables = self.sstables_snapshot()?;
        Ok(EngineStats {
            memtable_records: memtable.len(),
            memtable_bytes: memtable.size_bytes(),
            sstable_count: tables.len(),
            sstable_records: tables.iter().map(|t| t.record_count() as u64).sum(),
            sstable_bytes: tables.iter().map(|t| t.size_bytes()).sum(),
        })
    }

    pub fn config(&self) -> &LsmConfig {
        &self.config
    }

    /// Writes a rotated memtable out as a new segment.
    fn persist(&self, rotated: MemTable) -> Result<()> {
        if rotated.is_empty() {
            return Ok(());
        }
        let _guard = self.maintenance_lock()?;

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let Some(table) = SsTable::create(
            &self.config.dir_path,
            seq,
            rotated.len(),
            self.config.bloom_false_positive_rate,
            rotated.iter().cloned().map(Ok),
        )?
        else {
            return Ok(());
        };

        let mut tables = self.sstables_write()?;
        tables.insert(0, table);
        info!(
            "Memtable flushed: {} records, segments total={}",
            rotated.len(),
            tables.len()
        );
        Ok(())
    }

    fn memtable_read(&self) -> Result<RwLockReadGuard<'_, MemTable>> {
        self.memtable
            .read()
            .map_err(|_| LsmError::LockPoisoned("memtable"))
    }

    fn memtable_write(&self) -> Result<RwLockWriteGuard<'_, MemTable>> {
        self.memtable
            .write()
            .map_err(|_| LsmError::LockPoisoned("memtable"))
    }

    fn sstables_snapshot(&self) -> Result<Vec<Arc<SsTable>>> {
        Ok(self
            .sstables
            .read()
            .map_err(|_| LsmError::LockPoisoned("sstables"))?
            .clone())
    }

    fn sstables_write(&self) -> Result<RwLockWriteGuard<'_, Vec<Arc<SsTable>>>> {
        self.sstables
            .write()
            .map_err(|_| LsmError::LockPoisoned("sstables"))
    }

    fn maintenance_lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.maintenance
            .lock()
            .map_err(|_| LsmError::LockPoisoned("maintenance"))
    }
}
