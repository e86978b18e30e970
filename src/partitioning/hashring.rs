//! Consistent hashing of buckets onto nodes with virtual nodes.
//!
//! Each physical node is represented by multiple virtual nodes (vnodes) so
//! that buckets spread evenly and only a small share of them moves when a
//! node joins or leaves.

use crate::types::{BucketNumber, NodeAddress};
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use twox_hash::XxHash64;

/// Number of virtual nodes per physical node.
pub const DEFAULT_VNODES_PER_NODE: usize = 64;

/// A consistent hash ring placing buckets on node addresses.
#[derive(Debug, Clone)]
pub struct HashRing {
    /// Ring position to owning node.
    vnodes: BTreeMap<u64, NodeAddress>,

    /// Number of virtual nodes per physical node.
    vnodes_per_node: usize,

    /// Physical nodes in the ring, sorted.
    nodes: Vec<NodeAddress>,
}

impl HashRing {
    /// Create a new empty hash ring.
    pub fn new() -> Self {
        Self::with_vnodes(DEFAULT_VNODES_PER_NODE)
    }

    /// Create a new hash ring with custom vnode count.
    pub fn with_vnodes(vnodes_per_node: usize) -> Self {
        Self {
            vnodes: BTreeMap::new(),
            vnodes_per_node: vnodes_per_node.max(1),
            nodes: Vec::new(),
        }
    }

    /// Get the number of physical nodes in the ring.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Get all physical nodes in the ring.
    pub fn nodes(&self) -> &[NodeAddress] {
        &self.nodes
    }

    /// Check if a node is in the ring.
    pub fn contains_node(&self, node: &NodeAddress) -> bool {
        self.nodes.contains(node)
    }

    /// Add a node to the ring.
    pub fn add_node(&mut self, node: NodeAddress) {
        if self.nodes.contains(&node) {
            return;
        }

        self.nodes.push(node);
        self.nodes.sort();

        for i in 0..self.vnodes_per_node {
            self.vnodes.insert(Self::vnode_position(&node, i), node);
        }
    }

    /// Remove a node from the ring.
    pub fn remove_node(&mut self, node: &NodeAddress) {
        if !self.nodes.contains(node) {
            return;
        }

        self.nodes.retain(|n| n != node);
        for i in 0..self.vnodes_per_node {
            self.vnodes.remove(&Self::vnode_position(node, i));
        }
    }

    /// Get up to `count` distinct owners for a bucket, primary first.
    pub fn owners(&self, bucket: BucketNumber, count: usize) -> Vec<NodeAddress> {
        if self.vnodes.is_empty() || count == 0 {
            return Vec::new();
        }

        let position = Self::hash(&bucket.to_be_bytes());
        let mut owners = Vec::with_capacity(count.min(self.nodes.len()));

        let iter = self.vnodes.range(position..).chain(self.vnodes.iter());
        for (_, node) in iter {
            if !owners.contains(node) {
                owners.push(*node);
                if owners.len() >= count || owners.len() >= self.nodes.len() {
                    break;
                }
            }
        }

        owners
    }

    fn vnode_position(node: &NodeAddress, index: usize) -> u64 {
        Self::hash(format!("{}:{}", node, index).as_bytes())
    }

    fn hash(data: &[u8]) -> u64 {
        let mut hasher = XxHash64::with_seed(0);
        data.hash(&mut hasher);
        hasher.finish()
    }
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new()
    }
}
