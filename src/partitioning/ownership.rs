//! Bucket ownership: which node owns which bucket at which storage slot.
//!
//! The assignment is part of the replicated state every node sees; the
//! protocols in this crate only read it. [`RingBucketAssignment`] is a
//! concrete assignment driven by a consistent hash ring with explicit
//! overrides, used by single-process clusters and tests to script
//! rebalancing.

use crate::partitioning::hashring::HashRing;
use crate::types::{BucketNumber, NodeAddress, StorageNumber};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use twox_hash::XxHash64;

/// Compute the bucket a key falls into.
pub fn bucket_for_key(key: &[u8], bucket_count: u32) -> BucketNumber {
    let mut hasher = XxHash64::with_seed(0);
    key.hash(&mut hasher);
    (hasher.finish() % u64::from(bucket_count.max(1))) as BucketNumber
}

/// The owner of one or more buckets at a storage slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketOwner {
    address: NodeAddress,
    /// Buckets being moved away from this owner, with their destination.
    outbound_transfers: HashMap<BucketNumber, NodeAddress>,
}

impl BucketOwner {
    /// Create an owner with no transfers in flight.
    pub fn new(address: NodeAddress) -> Self {
        Self {
            address,
            outbound_transfers: HashMap::new(),
        }
    }

    /// Add an outbound transfer for a bucket.
    pub fn with_outbound_transfer(mut self, bucket: BucketNumber, to: NodeAddress) -> Self {
        self.outbound_transfers.insert(bucket, to);
        self
    }

    /// Address of the owner.
    pub fn address(&self) -> NodeAddress {
        self.address
    }

    /// Destination of the bucket's outbound transfer, if one is in flight.
    pub fn outbound_transfer(&self, bucket: BucketNumber) -> Option<&NodeAddress> {
        self.outbound_transfers.get(&bucket)
    }

    /// Whether the bucket is being moved away from this owner.
    pub fn is_reconfiguring(&self, bucket: BucketNumber) -> bool {
        self.outbound_transfers.contains_key(&bucket)
    }
}

/// Maps buckets to owning nodes.
pub trait BucketOwnershipAssignment: Send + Sync + fmt::Debug + 'static {
    /// Number of buckets in the key space.
    fn bucket_count(&self) -> u32;

    /// Owner of a bucket at a storage slot, or None if unassigned.
    fn bucket_owner(&self, storage: StorageNumber, bucket: BucketNumber) -> Option<BucketOwner>;

    /// Address of the owner of a bucket at a storage slot.
    fn bucket_owner_address(
        &self,
        storage: StorageNumber,
        bucket: BucketNumber,
    ) -> Option<NodeAddress> {
        self.bucket_owner(storage, bucket).map(|owner| owner.address())
    }

    /// Bucket a key falls into.
    fn bucket_of(&self, key: &[u8]) -> BucketNumber {
        bucket_for_key(key, self.bucket_count())
    }
}

#[derive(Debug)]
struct AssignmentState {
    ring: HashRing,
    /// Explicit placements; `None` marks a bucket as unassigned.
    overrides: HashMap<(StorageNumber, BucketNumber), Option<NodeAddress>>,
    /// Transfers in flight, keyed by slot, valued by destination.
    transfers: HashMap<(StorageNumber, BucketNumber), NodeAddress>,
}

impl AssignmentState {
    fn owner_address(
        &self,
        replica_count: u32,
        storage: StorageNumber,
        bucket: BucketNumber,
    ) -> Option<NodeAddress> {
        if storage > replica_count {
            return None;
        }
        if let Some(placement) = self.overrides.get(&(storage, bucket)) {
            return *placement;
        }
        self.ring
            .owners(bucket, replica_count as usize + 1)
            .get(storage as usize)
            .copied()
    }
}

/// Ring-based bucket assignment with overrides and transfer tracking.
#[derive(Debug)]
pub struct RingBucketAssignment {
    bucket_count: u32,
    replica_count: u32,
    state: RwLock<AssignmentState>,
}

impl RingBucketAssignment {
    /// Create an empty assignment.
    pub fn new(bucket_count: u32, replica_count: u32) -> Self {
        Self {
            bucket_count: bucket_count.max(1),
            replica_count,
            state: RwLock::new(AssignmentState {
                ring: HashRing::new(),
                overrides: HashMap::new(),
                transfers: HashMap::new(),
            }),
        }
    }

    /// Create an assignment over the given nodes.
    pub fn with_nodes<I>(bucket_count: u32, replica_count: u32, nodes: I) -> Self
    where
        I: IntoIterator<Item = NodeAddress>,
    {
        let assignment = Self::new(bucket_count, replica_count);
        for node in nodes {
            assignment.add_node(node);
        }
        assignment
    }

    /// Number of replicas kept per bucket, not counting the primary.
    pub fn replica_count(&self) -> u32 {
        self.replica_count
    }

    /// Nodes currently in the ring.
    pub fn nodes(&self) -> Vec<NodeAddress> {
        self.state.read().ring.nodes().to_vec()
    }

    /// Add a node to the ring.
    pub fn add_node(&self, node: NodeAddress) {
        self.state.write().ring.add_node(node);
    }

    /// Remove a node from the ring and drop every placement naming it.
    pub fn remove_node(&self, node: &NodeAddress) {
        let mut state = self.state.write();
        state.ring.remove_node(node);
        state.overrides.retain(|_, placement| placement.as_ref() != Some(node));
        state.transfers.retain(|_, to| to != node);
    }

    /// Place a bucket on a node explicitly.
    pub fn assign(&self, storage: StorageNumber, bucket: BucketNumber, owner: NodeAddress) {
        self.state
            .write()
            .overrides
            .insert((storage, bucket), Some(owner));
    }

    /// Mark a bucket as having no owner at the storage slot.
    pub fn unassign(&self, storage: StorageNumber, bucket: BucketNumber) {
        let mut state = self.state.write();
        state.overrides.insert((storage, bucket), None);
        state.transfers.remove(&(storage, bucket));
    }

    /// Start moving a bucket to another node. The current owner reports
    /// the bucket as reconfiguring until the transfer completes.
    pub fn begin_transfer(&self, storage: StorageNumber, bucket: BucketNumber, to: NodeAddress) {
        self.state.write().transfers.insert((storage, bucket), to);
    }

    /// Abandon an in-flight transfer, leaving ownership unchanged.
    pub fn cancel_transfer(&self, storage: StorageNumber, bucket: BucketNumber) {
        self.state.write().transfers.remove(&(storage, bucket));
    }

    /// Finish a transfer: the destination becomes the owner.
    pub fn complete_transfer(&self, storage: StorageNumber, bucket: BucketNumber) -> bool {
        let mut state = self.state.write();
        match state.transfers.remove(&(storage, bucket)) {
            Some(to) => {
                state.overrides.insert((storage, bucket), Some(to));
                true
            }
            None => false,
        }
    }
}

impl BucketOwnershipAssignment for RingBucketAssignment {
    fn bucket_count(&self) -> u32 {
        self.bucket_count
    }

    fn bucket_owner(&self, storage: StorageNumber, bucket: BucketNumber) -> Option<BucketOwner> {
        let state = self.state.read();
        let address = state.owner_address(self.replica_count, storage, bucket)?;

        let mut owner = BucketOwner::new(address);
        for ((slot_storage, slot_bucket), to) in &state.transfers {
            if *slot_storage != storage {
                continue;
            }
            if state.owner_address(self.replica_count, storage, *slot_bucket) == Some(address) {
                owner = owner.with_outbound_transfer(*slot_bucket, *to);
            }
        }
        Some(owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PRIMARY_STORAGE;

    fn three_nodes() -> RingBucketAssignment {
        RingBucketAssignment::with_nodes(
            16,
            1,
            (1..=3).map(NodeAddress::local),
        )
    }

    #[test]
    fn test_bucket_for_key_in_range() {
        for i in 0..100u32 {
            let key = format!("key-{}", i);
            assert!(bucket_for_key(key.as_bytes(), 7) < 7);
        }
        assert_eq!(bucket_for_key(b"same", 7), bucket_for_key(b"same", 7));
    }

    #[test]
    fn test_primary_and_replica_differ() {
        let assignment = three_nodes();
        for bucket in 0..16 {
            let primary = assignment.bucket_owner_address(PRIMARY_STORAGE, bucket).unwrap();
            let replica = assignment.bucket_owner_address(1, bucket).unwrap();
            assert_ne!(primary, replica);
        }
        assert!(assignment.bucket_owner(2, 0).is_none());
    }

    #[test]
    fn test_overrides() {
        let assignment = three_nodes();
        let node = NodeAddress::local(3);

        assignment.assign(PRIMARY_STORAGE, 4, node);
        assert_eq!(assignment.bucket_owner_address(PRIMARY_STORAGE, 4), Some(node));

        assignment.unassign(PRIMARY_STORAGE, 4);
        assert!(assignment.bucket_owner(PRIMARY_STORAGE, 4).is_none());
    }

    #[test]
    fn test_transfer_lifecycle() {
        let assignment = three_nodes();
        let from = NodeAddress::local(1);
        let to = NodeAddress::local(2);
        assignment.assign(PRIMARY_STORAGE, 0, from);

        assignment.begin_transfer(PRIMARY_STORAGE, 0, to);
        let owner = assignment.bucket_owner(PRIMARY_STORAGE, 0).unwrap();
        assert_eq!(owner.address(), from);
        assert!(owner.is_reconfiguring(0));
        assert_eq!(owner.outbound_transfer(0), Some(&to));

        assert!(assignment.complete_transfer(PRIMARY_STORAGE, 0));
        let owner = assignment.bucket_owner(PRIMARY_STORAGE, 0).unwrap();
        assert_eq!(owner.address(), to);
        assert!(!owner.is_reconfiguring(0));
        assert!(!assignment.complete_transfer(PRIMARY_STORAGE, 0));
    }

    #[test]
    fn test_remove_node_clears_placements() {
        let assignment = three_nodes();
        let gone = NodeAddress::local(2);
        assignment.assign(PRIMARY_STORAGE, 1, gone);
        assignment.remove_node(&gone);

        assert!(!assignment.nodes().contains(&gone));
        for bucket in 0..16 {
            assert_ne!(assignment.bucket_owner_address(PRIMARY_STORAGE, bucket), Some(gone));
        }
    }
}
