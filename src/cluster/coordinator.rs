//! Quorum replication coordinator.
//!
//! The node that receives an external request computes the key's replica
//! set, fans the operation out (its own engine for the local replica,
//! internal HTTP hops for peers) and gathers acknowledgements. The gather
//! completes as soon as the outcome is decided (`ack` successes, or
//! enough failures that `ack` is unreachable) and the remaining in-flight
//! requests are dropped. Failed replicas are logged and counted as
//! not-acked; the coordinator never retries and never partially succeeds.

use crate::cluster::topology::Topology;
use crate::cluster::{INTERNAL_HEADER, TIMESTAMP_HEADER, TOMBSTONE_HEADER};
use crate::core::engine::LsmEngine;
use crate::core::record::{wall_clock_millis, Record};
use crate::infra::config::ClusterConfig;
use crate::infra::error::LsmError;

use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Hard cap on the per-request replica deadline.
const MAX_DEADLINE: Duration = Duration::from_secs(60);

/// A request's `ack`/`from` pair: how many replicas are addressed and how
/// many must answer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Quorum {
    pub ack: usize,
    pub from: usize,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum QuorumError {
    #[error("malformed replicas parameter: {0:?}")]
    Malformed(String),

    #[error("replicas {ack}/{from} out of range for cluster of {cluster_size}")]
    OutOfRange {
        ack: usize,
        from: usize,
        cluster_size: usize,
    },
}

impl Quorum {
    /// Parses an optional `ack/from` clause. Omitted means `from = N`,
    /// `ack = N/2 + 1`. Rejects `ack = 0`, `ack > from` and `from > N`.
    pub fn parse(raw: Option<&str>, cluster_size: usize) -> Result<Self, QuorumError> {
        let quorum = match raw {
            None => Self {
                ack: cluster_size / 2 + 1,
                from: cluster_size,
            },
            Some(s) => {
                let (ack, from) = s
                    .split_once('/')
                    .ok_or_else(|| QuorumError::Malformed(s.to_string()))?;
                Self {
                    ack: ack
                        .parse()
                        .map_err(|_| QuorumError::Malformed(s.to_string()))?,
                    from: from
                        .parse()
                        .map_err(|_| QuorumError::Malformed(s.to_string()))?,
                }
            }
        };

        if quorum.ack == 0 || quorum.ack > quorum.from || quorum.from > cluster_size {
            return Err(QuorumError::OutOfRange {
                ack: quorum.ack,
                from: quorum.from,
                cluster_size,
            });
        }
        Ok(quorum)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Found { timestamp: u64, body: Bytes },
    NotFound,
    QuorumUnmet,
}

#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Acked,
    QuorumUnmet,
}

/// One replica's answer to a read.
#[derive(Debug, PartialEq, Eq)]
enum ReplicaRead {
    Value { timestamp: u64, body: Bytes },
    Tombstone { timestamp: u64 },
    Absent,
}

impl ReplicaRead {
    /// (timestamp, deleted): the last-write-wins sort key. Absent ranks
    /// below everything real.
    fn rank(&self) -> (u64, bool) {
        match self {
            Self::Value { timestamp, .. } => (*timestamp, false),
            Self::Tombstone { timestamp } => (*timestamp, true),
            Self::Absent => (0, true),
        }
    }

    /// Higher timestamp wins; tombstone beats value at the same timestamp.
    fn supersedes(&self, other: &ReplicaRead) -> bool {
        let (ts, deleted) = self.rank();
        let (other_ts, other_deleted) = other.rank();
        ts > other_ts || (ts == other_ts && deleted && !other_deleted)
    }
}

#[derive(Error, Debug)]
enum ReplicaError {
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("local storage: {0}")]
    Storage(#[from] LsmError),

    #[error("peer answered {0}")]
    Peer(StatusCode),
}

pub struct Coordinator {
    engine: Arc<LsmEngine>,
    topology: Topology,
    self_url: String,
    client: reqwest::Client,
}

impl Coordinator {
    /// `peer_timeout` is the client-facing request timeout; each replica
    /// attempt gets half of it, capped at one minute.
    pub fn new(
        engine: Arc<LsmEngine>,
        cluster: &ClusterConfig,
        peer_timeout: Duration,
    ) -> reqwest::Result<Self> {
        let deadline = (peer_timeout / 2).min(MAX_DEADLINE);
        let client = reqwest::Client::builder().timeout(deadline).build()?;
        Ok(Self {
            engine,
            topology: Topology::new(cluster.nodes.clone()),
            self_url: cluster.self_url.clone(),
            client,
        })
    }

    pub fn cluster_size(&self) -> usize {
        self.topology.len()
    }

    pub fn engine(&self) -> &Arc<LsmEngine> {
        &self.engine
    }

    pub async fn get(&self, key: &str, quorum: Quorum) -> ReadOutcome {
        let replicas = self.topology.replicas_for(key.as_bytes(), quorum.from);
        let mut pending: FuturesUnordered<_> = replicas
            .iter()
            .map(|node| self.read_replica(node, key))
            .collect();

        let mut responses: Vec<ReplicaRead> = Vec::with_capacity(quorum.ack);
        let mut failures = 0usize;
        while let Some(result) = pending.next().await {
            match result {
                Ok(read) => {
                    responses.push(read);
                    if responses.len() >= quorum.ack {
                        break;
                    }
                }
                Err(e) => {
                    warn!("replica read failed: {e}");
                    failures += 1;
                    if failures > quorum.from - quorum.ack {
                        break;
                    }
                }
            }
        }
        drop(pending);

        if responses.len() < quorum.ack {
            return ReadOutcome::QuorumUnmet;
        }
        resolve(responses)
    }

    pub async fn put(&self, key: &str, body: Bytes, quorum: Quorum) -> WriteOutcome {
        self.write(key, Some(body), wall_clock_millis(), quorum)
            .await
    }

    pub async fn delete(&self, key: &str, quorum: Quorum) -> WriteOutcome {
        self.write(key, None, wall_clock_millis(), quorum).await
    }

    /// Fans one write out to the replica set with a single timestamp.
    async fn write(
        &self,
        key: &str,
        value: Option<Bytes>,
        timestamp: u64,
        quorum: Quorum,
    ) -> WriteOutcome {
        let replicas = self.topology.replicas_for(key.as_bytes(), quorum.from);
        let mut pending: FuturesUnordered<_> = replicas
            .iter()
            .map(|node| self.write_replica(node, key, value.clone(), timestamp))
            .collect();

        let mut acks = 0usize;
        let mut failures = 0usize;
        while let Some(result) = pending.next().await {
            match result {
                Ok(()) => {
                    acks += 1;
                    if acks >= quorum.ack {
                        return WriteOutcome::Acked;
                    }
                }
                Err(e) => {
                    warn!("replica write failed: {e}");
                    failures += 1;
                    if failures > quorum.from - quorum.ack {
                        return WriteOutcome::QuorumUnmet;
                    }
                }
            }
        }
        WriteOutcome::QuorumUnmet
    }

    async fn read_replica(&self, node: &str, key: &str) -> Result<ReplicaRead, ReplicaError> {
        if node == self.self_url {
            return Ok(local_read(&self.engine, key)?);
        }

        let response = self
            .client
            .get(format!("{node}/v0/entity"))
            .query(&[("id", key)])
            .header(INTERNAL_HEADER, "true")
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let timestamp = header_timestamp(&response);
                let body = response.bytes().await?;
                Ok(ReplicaRead::Value { timestamp, body })
            }
            StatusCode::NOT_FOUND => {
                if response.headers().contains_key(TOMBSTONE_HEADER) {
                    Ok(ReplicaRead::Tombstone {
                        timestamp: header_timestamp(&response),
                    })
                } else {
                    Ok(ReplicaRead::Absent)
                }
            }
            status => Err(ReplicaError::Peer(status)),
        }
    }

    async fn write_replica(
        &self,
        node: &str,
        key: &str,
        value: Option<Bytes>,
        timestamp: u64,
    ) -> Result<(), ReplicaError> {
        if node == self.self_url {
            let key = Bytes::copy_from_slice(key.as_bytes());
            let record = match value {
                Some(body) => Record::present(key, body, timestamp),
                None => Record::tombstone(key, timestamp),
            };
            self.engine.upsert(record)?;
            return Ok(());
        }

        let url = format!("{node}/v0/entity");
        let request = match value {
            Some(body) => self.client.put(url).body(body),
            None => self.client.delete(url),
        };
        let response = request
            .query(&[("id", key)])
            .header(INTERNAL_HEADER, "true")
            .header(TIMESTAMP_HEADER, timestamp.to_string())
            .send()
            .await?;

        if response.status().is_success() {
            debug!("replica {node} acked write for key {key:?}");
            Ok(())
        } else {
            Err(ReplicaError::Peer(response.status()))
        }
    }
}

/// Reads the local engine the way an internal hop would.
fn local_read(engine: &LsmEngine, key: &str) -> crate::infra::error::Result<ReplicaRead> {
    Ok(match engine.get_record(key.as_bytes())? {
        None => ReplicaRead::Absent,
        Some(record) => {
            let timestamp = record.timestamp;
            match record.value {
                Some(body) => ReplicaRead::Value { timestamp, body },
                None => ReplicaRead::Tombstone { timestamp },
            }
        }
    })
}

fn resolve(responses: Vec<ReplicaRead>) -> ReadOutcome {
    let mut best = ReplicaRead::Absent;
    for response in responses {
        if response.supersedes(&best) {
            best = response;
        }
    }
    match best {
        ReplicaRead::Value { timestamp, body } => ReadOutcome::Found { timestamp, body },
        _ => ReadOutcome::NotFound,
    }
}

fn header_timestamp(response: &reqwest::Response) -> u64 {
    response
        .headers()
        .get(TIMESTAMP_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or_default()
}
