//! Immutable on-disk segments.
//!
//! File layout, all integers little-endian:
//!
//! ```text
//! [DATA]   per record: key_len(u32) | key | timestamp(u64) | value_len(i32) | value?
//!          value_len == -1 marks a tombstone (no value bytes); 0 is a
//!          legal empty value. Keys are strictly increasing.
//! [BLOOM]  len(u32) | serialized bloom filter
//! [INDEX]  data-region offset(u64) per record, in key order
//! [META]   len(u32) | bincode(SstableMeta)
//! [FOOTER] meta_offset(u64) | magic "QKVSST01"
//! ```
//!
//! Creation is crash-safe: the segment is written as `tmp_<n>`, fsynced,
//! atomically renamed to `sst_<n>`, and the parent directory is synced so
//! the new entry survives a crash. Leftover `tmp_` files are deleted
//! when a data directory is opened. Readers memory-map the file once; an
//! in-flight scan keeps its map (and the inode) alive even after
//! compaction unlinks the path.

use crate::core::record::Record;
use crate::infra::error::{LsmError, Result};

use bloomfilter::Bloom;
use bytes::Bytes;
use memmap2::Mmap;
use serde::{Deserialize, Serialize};

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

const MAGIC: &[u8; 8] = b"QKVSST01";
const FOOTER_BYTES: usize = 8 + MAGIC.len();
const TOMBSTONE_LEN: i32 = -1;

pub const SST_PREFIX: &str = "sst_";
pub const TMP_PREFIX: &str = "tmp_";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SstableMeta {
    pub record_count: u32,
    pub data_len: u64,
    pub bloom_offset: u64,
    pub index_offset: u64,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
    /// CRC32 over the whole data region, verified at open.
    pub checksum: u32,
}

pub struct SsTable {
    seq: u64,
    path: PathBuf,
    map: Mmap,
    meta: SstableMeta,
    bloom: Bloom<[u8]>,
}

impl std::fmt::Debug for SsTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SsTable")
            .field("seq", &self.seq)
            .field("path", &self.path)
            .field("record_count", &self.meta.record_count)
            .field("size_bytes", &self.map.len())
            .finish()
    }
}

fn invalid(path: &Path, reason: &'static str) -> LsmError {
    LsmError::InvalidSstable {
        path: path.to_path_buf(),
        reason,
    }
}

impl SsTable {
    /// Streams sorted records into a new segment numbered `seq`.
    ///
    /// Returns `None` without creating a file when the iterator is empty
    /// (compaction can merge everything away). `expected_count` only sizes
    /// the bloom filter; overestimating is safe.
    pub fn create<I>(
        dir: &Path,
        seq: u64,
        expected_count: usize,
        bloom_fp_rate: f64,
        records: I,
    ) -> Result<Option<Arc<SsTable>>>
    where
        I: Iterator<Item = Result<Record>>,
    {
        let tmp_path = dir.join(format!("{TMP_PREFIX}{seq}"));
        let final_path = dir.join(format!("{SST_PREFIX}{seq}"));

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut out = BufWriter::new(file);

        let mut bloom = Bloom::<[u8]>::new_for_fp_rate(expected_count.max(1), bloom_fp_rate)
            .map_err(|_| invalid(&tmp_path, "bloom filter allocation failed"))?;

        let mut hasher = crc32fast::Hasher::new();
        let mut offsets: Vec<u64> = Vec::new();
        let mut buf: Vec<u8> = Vec::with_capacity(256);
        let mut data_len: u64 = 0;
        let mut min_key: Vec<u8> = Vec::new();
        let mut max_key: Vec<u8> = Vec::new();

        for item in records {
            let record = item?;
            if !offsets.is_empty() && record.key.as_ref() <= max_key.as_slice() {
                drop(out);
                let _ = fs::remove_file(&tmp_path);
                return Err(invalid(&tmp_path, "records out of order"));
            }

            buf.clear();
            encode_record(&mut buf, &record);
            hasher.update(&buf);
            out.write_all(&buf)?;

            bloom.set(&record.key);
            offsets.push(data_len);
            data_len += buf.len() as u64;

            if offsets.len() == 1 {
                min_key = record.key.to_vec();
            }
            max_key = record.key.to_vec();
        }

        if offsets.is_empty() {
            drop(out);
            let _ = fs::remove_file(&tmp_path);
            return Ok(None);
        }

        let bloom_offset = data_len;
        let bloom_bytes = bloom.into_bytes();
        out.write_all(&(bloom_bytes.len() as u32).to_le_bytes())?;
        out.write_all(&bloom_bytes)?;

        let index_offset = bloom_offset + 4 + bloom_bytes.len() as u64;
        for off in &offsets {
            out.write_all(&off.to_le_bytes())?;
        }

        let meta = SstableMeta {
            record_count: offsets.len() as u32,
            data_len,
            bloom_offset,
            index_offset,
            min_key,
            max_key,
            checksum: hasher.finalize(),
        };
        let meta_bytes = bincode::serialize(&meta)?;
        let meta_offset = index_offset + 8 * offsets.len() as u64;
        out.write_all(&(meta_bytes.len() as u32).to_le_bytes())?;
        out.write_all(&meta_bytes)?;

        out.write_all(&meta_offset.to_le_bytes())?;
        out.write_all(MAGIC)?;

        out.flush()?;
        out.get_ref().sync_all()?;
        drop(out);

        fs::rename(&tmp_path, &final_path)?;

        // Sync the parent directory so the rename itself is durable; on
        // ext4/XFS a crash after rename but before dir sync can lose the
        // entry even though the file's bytes are on disk.
        if let Ok(parent) = File::open(dir) {
            let _ = parent.sync_all();
        }

        debug!(
            "SSTable created: {}, records={}, bytes={}",
            final_path.display(),
            meta.record_count,
            meta_offset as usize + meta_bytes.len() + 4 + FOOTER_BYTES
        );

        Ok(Some(Arc::new(Self::open(&final_path)?)))
    }

    /// Maps and validates an existing `sst_<n>` file.
    pub fn open(path: &Path) -> Result<SsTable> {
        let seq = parse_seq(path, SST_PREFIX).ok_or_else(|| invalid(path, "bad file name"))?;

        let file = File::open(path)?;
        let map = unsafe { Mmap::map(&file)? };

        if map.len() < FOOTER_BYTES {
            return Err(invalid(path, "file too short"));
        }
        if &map[map.len() - MAGIC.len()..] != MAGIC {
            return Err(invalid(path, "bad magic"));
        }

        let meta_offset = read_u64(&map, map.len() - FOOTER_BYTES)? as usize;
        if meta_offset + 4 > map.len() - MAGIC.len() {
            return Err(invalid(path, "meta offset out of bounds"));
        }
        let meta_len = read_u32(&map, meta_offset)? as usize;
        let meta_end = meta_offset + 4 + meta_len;
        if meta_end > map.len() - FOOTER_BYTES {
            return Err(invalid(path, "meta region out of bounds"));
        }
        let meta: SstableMeta = bincode::deserialize(&map[meta_offset + 4..meta_end])?;

        let data_len = meta.data_len as usize;
        if data_len > map.len() {
            return Err(invalid(path, "data region out of bounds"));
        }
        if crc32fast::hash(&map[..data_len]) != meta.checksum {
            return Err(invalid(path, "checksum mismatch"));
        }

        let bloom_at = meta.bloom_offset as usize;
        let bloom_len = read_u32(&map, bloom_at)? as usize;
        if bloom_at + 4 + bloom_len > map.len() {
            return Err(invalid(path, "bloom region out of bounds"));
        }
        let bloom = Bloom::from_bytes(map[bloom_at + 4..bloom_at + 4 + bloom_len].to_vec())
            .map_err(|_| invalid(path, "bloom filter corrupt"))?;

        if meta.index_offset as usize + 8 * meta.record_count as usize > map.len() {
            return Err(invalid(path, "index region out of bounds"));
        }

        Ok(Self {
            seq,
            path: path.to_path_buf(),
            map,
            meta,
            bloom,
        })
    }

    /// Scans `dir` for segments: deletes leftover `tmp_` files, opens
    /// every `sst_<n>` newest-first, and returns the next free number.
    /// Unreadable segments are skipped with a warning, like any other
    /// partially written artifact.
    pub fn load_dir(dir: &Path) -> Result<(Vec<Arc<SsTable>>, u64)> {
        let mut tables: Vec<Arc<SsTable>> = Vec::new();
        let mut next_seq: u64 = 0;

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if name.starts_with(TMP_PREFIX) {
                debug!("Removing leftover temp file {}", path.display());
                fs::remove_file(&path)?;
                continue;
            }
            if let Some(seq) = parse_seq(&path, SST_PREFIX) {
                match Self::open(&path) {
                    Ok(table) => {
                        next_seq = next_seq.max(seq + 1);
                        tables.push(Arc::new(table));
                    }
                    Err(e) => warn!("Failed to load SSTable {}: {}", path.display(), e),
                }
            }
        }

        tables.sort_by(|a, b| b.seq.cmp(&a.seq));
        Ok((tables, next_seq))
    }

    /// Newest record for `key`, tombstones included. Bloom-gated binary
    /// search over the index.
    pub fn get(&self, key: &[u8]) -> Result<Option<Record>> {
        if !self.bloom.check(key) {
            return Ok(None);
        }
        if key < self.meta.min_key.as_slice() || key > self.meta.max_key.as_slice() {
            return Ok(None);
        }

        let mut lo = 0usize;
        let mut hi = self.meta.record_count as usize;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.key_at(mid)?.cmp(key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => {
                    let (record, _) = self.record_at(mid)?;
                    return Ok(Some(record));
                }
            }
        }
        Ok(None)
    }

    /// Lazy ordered scan over records with keys in `[from, to)`,
    /// tombstones included. The scan owns an `Arc` of the table, so it
    /// stays valid after the table is unlinked by compaction.
    pub fn range(
        table: &Arc<SsTable>,
        from: Option<&[u8]>,
        to: Option<&[u8]>,
    ) -> Result<SsTableScan> {
        let start = match from {
            None => 0,
            Some(from) => table.lower_bound(from)?,
        };
        Ok(SsTableScan {
            table: Arc::clone(table),
            next: start,
            end_key: to.map(Bytes::copy_from_slice),
        })
    }

    /// Full scan in key order.
    pub fn iter(table: &Arc<SsTable>) -> Result<SsTableScan> {
        Self::range(table, None, None)
    }

    pub fn record_count(&self) -> usize {
        self.meta.record_count as usize
    }

    pub fn size_bytes(&self) -> u64 {
        self.map.len() as u64
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// First index whose key is `>= key`, or `record_count` if none.
    fn lower_bound(&self, key: &[u8]) -> Result<usize> {
        let mut lo = 0usize;
        let mut hi = self.meta.record_count as usize;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.key_at(mid)? < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    fn offset_at(&self, idx: usize) -> Result<usize> {
        Ok(read_u64(&self.map, self.meta.index_offset as usize + 8 * idx)? as usize)
    }

    fn key_at(&self, idx: usize) -> Result<&[u8]> {
        let off = self.offset_at(idx)?;
        let key_len = read_u32(&self.map, off)? as usize;
        self.map
            .get(off + 4..off + 4 + key_len)
            .ok_or_else(|| invalid(&self.path, "record key out of bounds"))
    }

    fn record_at(&self, idx: usize) -> Result<(Record, usize)> {
        let off = self.offset_at(idx)?;
        decode_record(&self.map, off).map_err(|reason| invalid(&self.path, reason))
    }
}

/// Lazy record scan; see [`SsTable::range`].
pub struct SsTableScan {
    table: Arc<SsTable>,
    next: usize,
    end_key: Option<Bytes>,
}

impl Iterator for SsTableScan {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.table.record_count() {
            return None;
        }
        match self.table.record_at(self.next) {
            Ok((record, _)) => {
                if let Some(end) = &self.end_key {
                    if record.key.as_ref() >= end.as_ref() {
                        self.next = self.table.record_count();
                        return None;
                    }
                }
                self.next += 1;
                Some(Ok(record))
            }
            Err(e) => {
                self.next = self.table.record_count();
                Some(Err(e))
            }
        }
    }
}

fn encode_record(buf: &mut Vec<u8>, record: &Record) {
    buf.extend_from_slice(&(record.key.len() as u32).to_le_bytes());
    buf.extend_from_slice(&record.key);
    buf.extend_from_slice(&record.timestamp.to_le_bytes());
    match &record.value {
        Some(value) => {
            buf.extend_from_slice(&(value.len() as i32).to_le_bytes());
            buf.extend_from_slice(value);
        }
        None => buf.extend_from_slice(&TOMBSTONE_LEN.to_le_bytes()),
    }
}

fn decode_record(
    data: &[u8],
    off: usize,
) -> std::result::Result<(Record, usize), &'static str> {
    const TRUNCATED: &str = "truncated record";

    let key_len = u32::from_le_bytes(
        data.get(off..off + 4)
            .ok_or(TRUNCATED)?
            .try_into()
            .unwrap(),
    ) as usize;
    let key_end = off + 4 + key_len;
    let key = Bytes::copy_from_slice(data.get(off + 4..key_end).ok_or(TRUNCATED)?);

    let timestamp = u64::from_le_bytes(
        data.get(key_end..key_end + 8)
            .ok_or(TRUNCATED)?
            .try_into()
            .unwrap(),
    );

    let value_len = i32::from_le_bytes(
        data.get(key_end + 8..key_end + 12)
            .ok_or(TRUNCATED)?
            .try_into()
            .unwrap(),
    );

    if value_len == TOMBSTONE_LEN {
        return Ok((Record::tombstone(key, timestamp), key_end + 12));
    }
    if value_len < 0 {
        return Err("negative value length");
    }

    let value_end = key_end + 12 + value_len as usize;
    let value = Bytes::copy_from_slice(data.get(key_end + 12..value_end).ok_or(TRUNCATED)?);
    Ok((Record::present(key, value, timestamp), value_end))
}

/// `sst_<n>` / `tmp_<n>` file-name parsing; returns the numeric suffix.
fn parse_seq(path: &Path, prefix: &str) -> Option<u64> {
    path.file_name()?
        .to_str()?
        .strip_prefix(prefix)?
        .parse()
        .ok()
}

fn read_u32(data: &[u8], off: usize) -> Result<u32> {
    let bytes = data.get(off..off + 4).ok_or_else(|| {
        LsmError::InvalidSstable {
            path: PathBuf::new(),
            reason: "short read",
        }
    })?;
    Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
}

fn read_u64(data: &[u8], off: usize) -> Result<u64> {
    let bytes = data.get(off..off + 8).ok_or_else(|| {
        LsmError::InvalidSstable {
            path: PathBuf::new(),
            reason: "short read",
        }
    })?;
    Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
}
