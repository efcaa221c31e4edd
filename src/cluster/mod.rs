pub mod coordinator;
pub mod topology;

/// Marks a request as an internal replica hop: the receiver operates on
/// its local engine and never re-replicates.
pub const INTERNAL_HEADER: &str = "X-Internal";
/// Coordinator-assigned write timestamp (decimal u64 milliseconds);
/// carried on internal writes and echoed on GET responses.
pub const TIMESTAMP_HEADER: &str = "X-Timestamp";
/// Marks an internal GET response as a tombstone (404 with a timestamp).
pub const TOMBSTONE_HEADER: &str = "X-Tombstone";
