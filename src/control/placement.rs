//! Shard placement.
//!
//! Data nodes register here with their labels. A shard of a group is owned by
//! the node it was explicitly assigned to; unassigned shards are spread over
//! the registered nodes by hashing `(group, shard)`, so every liaison with the
//! same node set picks the same owner.

use crate::bus::NodeId;
use crate::core::error::{LiaisonError, LiaisonResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::hash::Hasher;
use twox_hash::XxHash64;

/// A registered data node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl NodeInfo {
    pub fn new(id: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            labels: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Resolves the node owning a shard.
pub trait NodeRegistry: Send + Sync {
    fn locate(&self, group: &str, name: &str, shard_id: u32) -> LiaisonResult<NodeId>;
}

/// Placement table for the cluster.
#[derive(Debug, Default)]
pub struct NodeTable {
    /// Registered nodes, kept sorted by id.
    nodes: RwLock<Vec<NodeInfo>>,
    /// Explicit `(group, shard)` owners.
    assignments: RwLock<HashMap<(String, u32), NodeId>>,
}

impl NodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a node.
    pub fn register(&self, node: NodeInfo) {
        let mut nodes = self.nodes.write();
        match nodes.binary_search_by(|n| n.id.cmp(&node.id)) {
            Ok(idx) => nodes[idx] = node,
            Err(idx) => nodes.insert(idx, node),
        }
    }

    pub fn deregister(&self, id: &str) {
        self.nodes.write().retain(|n| n.id != id);
    }

    /// Pin a shard to a node.
    pub fn assign(&self, group: impl Into<String>, shard_id: u32, node: impl Into<NodeId>) {
        self.assignments
            .write()
            .insert((group.into(), shard_id), node.into());
    }

    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.nodes.read().clone()
    }

    fn placement_hash(group: &str, shard_id: u32) -> u64 {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(group.as_bytes());
        hasher.write(&shard_id.to_le_bytes());
        hasher.finish()
    }
}

impl NodeRegistry for NodeTable {
    fn locate(&self, group: &str, name: &str, shard_id: u32) -> LiaisonResult<NodeId> {
        let nodes = self.nodes.read();

        if let Some(node) = self.assignments.read().get(&(group.to_string(), shard_id)) {
            if nodes.iter().any(|n| &n.id == node) {
                return Ok(node.clone());
            }
            return Err(LiaisonError::NodeUnavailable {
                group: group.to_string(),
                name: name.to_string(),
                shard_id,
                message: format!("assigned node {} is not registered", node),
            });
        }

        if nodes.is_empty() {
            return Err(LiaisonError::NodeUnavailable {
                group: group.to_string(),
                name: name.to_string(),
                shard_id,
                message: "no data node registered".to_string(),
            });
        }
        let idx = Self::placement_hash(group, shard_id) % nodes.len() as u64;
        Ok(nodes[idx as usize].id.clone())
    }
}
