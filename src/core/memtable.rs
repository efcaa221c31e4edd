use crate::core::record::Record;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::ops::Bound;

/// Fixed per-entry overhead added to the byte-size estimate, covering map
/// node and record bookkeeping beyond the raw key/value bytes.
const ENTRY_OVERHEAD: usize = 32;

/// In-memory ordered write buffer, keyed lexicographically on raw key
/// bytes. Every write lands here first; the engine rotates a full memtable
/// out and flushes it to an immutable on-disk segment.
///
/// Tombstones are stored as ordinary records, not removals: they must
/// travel to disk to shadow older values in lower layers.
#[derive(Debug, Default)]
pub struct MemTable {
    data: BTreeMap<Bytes, Record>,
    size_bytes: usize,
}

impl MemTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts the record for its key, last-write-wins: a record that does
    /// not supersede the stored one (lower timestamp, or losing the
    /// tombstone tie break) is silently dropped. Replica hops can deliver
    /// racing writes in either arrival order; the timestamp, not the
    /// arrival, must decide.
    pub fn insert(&mut self, record: Record) {
        if let Some(existing) = self.data.get(&record.key) {
            if !record.supersedes(existing) {
                return;
            }
        }
        let added = Self::estimate_size(&record);
        if let Some(old) = self.data.insert(record.key.clone(), record) {
            self.size_bytes = self.size_bytes.saturating_sub(Self::estimate_size(&old));
        }
        self.size_bytes += added;
    }

    pub fn get(&self, key: &[u8]) -> Option<&Record> {
        self.data.get(key)
    }

    /// Ordered records with keys in `[from, to)`; `None` endpoints mean
    /// unbounded. Includes tombstones; filtering is the merge layer's job.
    pub fn range<'a>(
        &'a self,
        from: Option<&'a [u8]>,
        to: Option<&'a [u8]>,
    ) -> impl Iterator<Item = &'a Record> + 'a {
        let lo: Bound<&[u8]> = from.map_or(Bound::Unbounded, Bound::Included);
        let hi: Bound<&[u8]> = to.map_or(Bound::Unbounded, Bound::Excluded);
        self.data.range::<[u8], _>((lo, hi)).map(|(_, r)| r)
    }

    /// All records in ascending key order, tombstones included.
    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.data.values()
    }

    /// Sum of key and value lengths plus a small per-entry overhead. This
    /// is the only signal the engine uses to decide when to flush.
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.size_bytes = 0;
    }

    fn estimate_size(record: &Record) -> usize {
        record.key.len() + record.value.as_ref().map_or(0, |v| v.len()) + ENTRY_OVERHEAD
    }
}
