//! # Quorum KV Store
//!
//! A replicated key-value store. Each node runs a log-structured
//! merge-tree storage engine; a fixed cluster of nodes shards keys by
//! rendezvous hashing and coordinates reads and writes under tunable
//! `ack/from` quorums with last-write-wins conflict resolution.
//!
//! Layers, bottom up:
//! - [`core`]: records, the in-memory memtable, the LSM engine.
//! - [`storage`]: immutable on-disk segments and the k-way merge.
//! - [`cluster`]: key-to-replica topology and the quorum coordinator.
//! - [`api`]: the per-node HTTP surface (`/v0/entity`, `/v0/status`).
//! - [`infra`]: configuration and the error taxonomy.

pub mod api;
pub mod cluster;
pub mod core;
pub mod infra;
pub mod storage;

pub use crate::cluster::coordinator::{Coordinator, Quorum, ReadOutcome, WriteOutcome};
pub use crate::core::engine::LsmEngine;
pub use crate::core::record::Record;
pub use crate::infra::config::{ClusterConfig, LsmConfig};
pub use crate::infra::error::{LsmError, Result};
