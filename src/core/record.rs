use bytes::Bytes;
use std::time::{SystemTime, UNIX_EPOCH};

/// A single versioned key-value pair.
///
/// `value == None` marks a tombstone: the key was deleted at `timestamp`.
/// Tombstones are stored like any other record and filtered out at read
/// time, so deletes shadow older values in lower layers.
///
/// Keys and values are [`Bytes`]: cheap to clone, immutable once built, so
/// readers can never mutate buffers handed out by the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub key: Bytes,
    pub value: Option<Bytes>,
    pub timestamp: u64,
}

impl Record {
    pub fn present(key: Bytes, value: Bytes, timestamp: u64) -> Self {
        Self {
            key,
            value: Some(value),
            timestamp,
        }
    }

    pub fn tombstone(key: Bytes, timestamp: u64) -> Self {
        Self {
            key,
            value: None,
            timestamp,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Last-write-wins ordering: the higher timestamp wins; at equal
    /// timestamps a tombstone beats a present value.
    pub fn supersedes(&self, other: &Record) -> bool {
        if self.timestamp != other.timestamp {
            return self.timestamp > other.timestamp;
        }
        self.is_tombstone() && !other.is_tombstone()
    }
}

/// Wall-clock milliseconds since the Unix epoch. Write timestamps are
/// assigned exactly once, at the coordinator that receives the external
/// request, and travel verbatim on internal hops.
pub fn wall_clock_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
