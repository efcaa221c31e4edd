//! Key-to-replica mapping over a fixed node set.
//!
//! Rendezvous (highest-random-weight) hashing: each node is scored by
//! `crc32(key ‖ node_url)` and nodes are ranked by descending score. The
//! ranking is a deterministic total order, identical on every node that
//! shares the topology, so any node can compute any key's replica set
//! without coordination. Taking the first `from` entries yields the
//! replica set for a request.

use std::fmt;

pub struct Topology {
    nodes: Vec<String>,
}

impl Topology {
    /// Builds a topology from the full cluster node list. Ordering of the
    /// input does not matter; scores depend only on key and URL.
    pub fn new(mut nodes: Vec<String>) -> Self {
        nodes.sort();
        Self { nodes }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, node: &str) -> bool {
        self.nodes.iter().any(|n| n == node)
    }

    /// The first `from` nodes in this key's preference order.
    pub fn replicas_for(&self, key: &[u8], from: usize) -> Vec<&str> {
        let mut scored: Vec<(u32, &str)> = self
            .nodes
            .iter()
            .map(|node| (Self::score(key, node), node.as_str()))
            .collect();
        // Ties broken by URL so the order stays total and stable.
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
        scored.into_iter().take(from).map(|(_, node)| node).collect()
    }

    fn score(key: &[u8], node: &str) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(key);
        hasher.update(node.as_bytes());
        hasher.finalize()
    }
}

impl fmt::Debug for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topology").field("nodes", &self.nodes).finish()
    }
}
