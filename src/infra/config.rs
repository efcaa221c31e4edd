use crate::infra::error::{LsmError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Storage-engine configuration for one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LsmConfig {
    pub dir_path: PathBuf,
    pub memtable_max_size: usize,
    pub bloom_false_positive_rate: f64,
}

impl Default for LsmConfig {
    fn default() -> Self {
        Self {
            dir_path: PathBuf::from("./.kvdata"),
            memtable_max_size: 4 * 1024 * 1024,
            bloom_false_positive_rate: 0.01,
        }
    }
}

impl LsmConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> LsmConfigBuilder {
        LsmConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.memtable_max_size == 0 {
            return Err(LsmError::InvalidConfig(
                "memtable size cannot be 0".to_string(),
            ));
        }

        if self.memtable_max_size < 1024 {
            return Err(LsmError::InvalidConfig(
                "memtable size too small (minimum 1KB)".to_string(),
            ));
        }

        if !(0.0..1.0).contains(&self.bloom_false_positive_rate)
            || self.bloom_false_positive_rate == 0.0
        {
            return Err(LsmError::InvalidConfig(
                "bloom false positive rate must be in (0, 1)".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct LsmConfigBuilder {
    config: LsmConfig,
}

impl LsmConfigBuilder {
    pub fn dir_path(mut self, dir_path: PathBuf) -> Self {
        self.config.dir_path = dir_path;
        self
    }

    pub fn memtable_max_size(mut self, bytes: usize) -> Self {
        self.config.memtable_max_size = bytes;
        self
    }

    pub fn bloom_false_positive_rate(mut self, rate: f64) -> Self {
        self.config.bloom_false_positive_rate = rate;
        self
    }

    pub fn build(self) -> LsmConfig {
        self.config
    }
}

/// Fixed cluster topology known at start: the full node URL list plus the
/// URL this node answers on. Membership never changes at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub nodes: Vec<String>,
    pub self_url: String,
}

impl ClusterConfig {
    /// Single-node cluster of just this node.
    pub fn standalone(self_url: impl Into<String>) -> Self {
        let self_url = self_url.into();
        Self {
            nodes: vec![self_url.clone()],
            self_url,
        }
    }

    pub fn new(nodes: Vec<String>, self_url: impl Into<String>) -> Self {
        Self {
            nodes,
            self_url: self_url.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(LsmError::InvalidConfig(
                "cluster node list cannot be empty".to_string(),
            ));
        }

        if !self.nodes.contains(&self.self_url) {
            return Err(LsmError::InvalidConfig(format!(
                "self URL {} is not in the cluster node list",
                self.self_url
            )));
        }

        let mut seen = self.nodes.clone();
        seen.sort();
        seen.dedup();
        if seen.len() != self.nodes.len() {
            return Err(LsmError::InvalidConfig(
                "cluster node list contains duplicates".to_string(),
            ));
        }

        Ok(())
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }
}
