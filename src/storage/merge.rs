//! K-way merge over sorted record sources.
//!
//! Sources are ordered newest-first (memtable, then segments newest to
//! oldest). The merged output is strictly ascending by key; for duplicate
//! keys only the record from the newest source is emitted, and tombstones
//! are suppressed entirely. This one primitive backs both engine range
//! scans and compaction.

use crate::core::record::Record;
use crate::infra::error::Result;

use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// One source's current head, keyed for heap ordering.
struct HeapEntry {
    record: Record,
    /// Rank of the source this record came from; lower is newer.
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.record.key == other.record.key && self.source == other.source
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the smallest key pops
        // first, and on key ties the newest source (lowest rank).
        other
            .record
            .key
            .cmp(&self.record.key)
            .then_with(|| other.source.cmp(&self.source))
    }
}

type Source = Box<dyn Iterator<Item = Result<Record>>>;

/// Merges sorted record streams; see the module docs for semantics.
pub struct MergeIterator {
    sources: Vec<Source>,
    heap: BinaryHeap<HeapEntry>,
}

impl MergeIterator {
    /// `sources` must each yield strictly ascending keys, ordered
    /// newest-first across the list.
    pub fn new(sources: Vec<Source>) -> Result<Self> {
        let mut merged = Self {
            heap: BinaryHeap::with_capacity(sources.len()),
            sources,
        };
        for rank in 0..merged.sources.len() {
            merged.advance(rank)?;
        }
        Ok(merged)
    }

    /// Pulls the next head from one source onto the heap.
    fn advance(&mut self, source: usize) -> Result<()> {
        if let Some(item) = self.sources[source].next() {
            self.heap.push(HeapEntry {
                record: item?,
                source,
            });
        }
        Ok(())
    }
}

impl Iterator for MergeIterator {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let top = self.heap.pop()?;
            if let Err(e) = self.advance(top.source) {
                return Some(Err(e));
            }

            // Drop every older source's record for the same key and move
            // those sources past it. The tie-break above guarantees `top`
            // came from the newest source holding the key.
            while let Some(peek) = self.heap.peek() {
                if peek.record.key != top.record.key {
                    break;
                }
                let dup = self.heap.pop().expect("peeked entry");
                if let Err(e) = self.advance(dup.source) {
                    return Some(Err(e));
                }
            }

            if top.record.is_tombstone() {
                continue;
            }
            return Some(Ok(top.record));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn source(records: Vec<Record>) -> Source {
        Box::new(records.into_iter().map(Ok))
    }

    fn put(key: &str, value: &str, ts: u64) -> Record {
        Record::present(
            Bytes::copy_from_slice(key.as_bytes()),
            Bytes::copy_from_slice(value.as_bytes()),
            ts,
        )
    }

    fn del(key: &str, ts: u64) -> Record {
        Record::tombstone(Bytes::copy_from_slice(key.as_bytes()), ts)
    }

    fn collect(sources: Vec<Source>) -> Vec<Record> {
        MergeIterator::new(sources)
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn merges_disjoint_sources_in_order() {
        let out = collect(vec![
            source(vec![put("b", "2", 1), put("d", "4", 1)]),
            source(vec![put("a", "1", 1), put("c", "3", 1)]),
        ]);
        let keys: Vec<_> = out.iter().map(|r| r.key.clone()).collect();
        assert_eq!(keys, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn newest_source_wins_duplicate_keys() {
        let out = collect(vec![
            source(vec![put("k", "new", 9)]),
            source(vec![put("k", "old", 1)]),
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value.as_deref(), Some(&b"new"[..]));
    }

    #[test]
    fn tombstone_in_newest_source_hides_key() {
        let out = collect(vec![
            source(vec![del("k", 9)]),
            source(vec![put("k", "old", 1), put("live", "v", 1)]),
        ]);
        let keys: Vec<_> = out.iter().map(|r| r.key.clone()).collect();
        assert_eq!(keys, vec!["live"]);
    }

    #[test]
    fn shadowed_tombstone_does_not_hide_newer_value() {
        // A newer layer re-created the key after an older layer deleted it.
        let out = collect(vec![
            source(vec![put("k", "recreated", 9)]),
            source(vec![del("k", 5)]),
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value.as_deref(), Some(&b"recreated"[..]));
    }

    #[test]
    fn three_way_duplicate_resolution() {
        let out = collect(vec![
            source(vec![put("a", "newest", 9), put("z", "zz", 9)]),
            source(vec![put("a", "mid", 5)]),
            source(vec![put("a", "oldest", 1), put("m", "mm", 1)]),
        ]);
        let pairs: Vec<(Bytes, Option<Bytes>)> =
            out.into_iter().map(|r| (r.key, r.value)).collect();
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0].0, "a");
        assert_eq!(pairs[0].1.as_deref(), Some(&b"newest"[..]));
        assert_eq!(pairs[1].0, "m");
        assert_eq!(pairs[2].0, "z");
    }

    #[test]
    fn empty_sources_yield_nothing() {
        let out = collect(vec![source(vec![]), source(vec![])]);
        assert!(out.is_empty());
    }
}
