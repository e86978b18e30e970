//! State every node keeps identical by executing multicasts in order.

use crate::lock::LockRegistry;
use crate::partitioning::BucketOwnershipAssignment;
use crate::subscription::{Group, InMemoryGroup};
use crate::types::NodeAddress;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Creates the subscription group of a cache on first use.
pub type GroupFactory = Box<dyn Fn(&str) -> Box<dyn Group> + Send>;

/// Replicated state of a processor: lock queues, subscription groups and
/// the bucket assignment they are validated against.
pub struct ReplicatedState {
    assignment: Arc<dyn BucketOwnershipAssignment>,
    locks: LockRegistry,
    groups: BTreeMap<String, Box<dyn Group>>,
    group_factory: GroupFactory,
}

impl ReplicatedState {
    pub fn new(assignment: Arc<dyn BucketOwnershipAssignment>, deadlock_search_depth: usize) -> Self {
        Self {
            assignment,
            locks: LockRegistry::new(deadlock_search_depth),
            groups: BTreeMap::new(),
            group_factory: Box::new(|name| Box::new(InMemoryGroup::new(name))),
        }
    }

    /// Use another [`Group`] implementation for new caches.
    pub fn with_group_factory(mut self, factory: GroupFactory) -> Self {
        self.group_factory = factory;
        self
    }

    pub fn assignment(&self) -> &dyn BucketOwnershipAssignment {
        self.assignment.as_ref()
    }

    pub fn locks(&self) -> &LockRegistry {
        &self.locks
    }

    pub fn locks_mut(&mut self) -> &mut LockRegistry {
        &mut self.locks
    }

    pub fn group(&self, cache_name: &str) -> Option<&dyn Group> {
        self.groups.get(cache_name).map(|g| g.as_ref() as &dyn Group)
    }

    /// Group of a cache, created if missing.
    pub fn group_mut(&mut self, cache_name: &str) -> &mut dyn Group {
        let factory = &self.group_factory;
        self.groups
            .entry(cache_name.to_string())
            .or_insert_with(|| factory(cache_name))
            .as_mut()
    }

    /// Drop subscriptions of subscribers on a departed node from every
    /// group. Returns the number of registrations removed.
    pub fn remove_subscriber_node(&mut self, address: &NodeAddress) -> usize {
        self.groups
            .values_mut()
            .map(|group| group.remove_subscriber_node(address))
            .sum()
    }
}

impl fmt::Debug for ReplicatedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatedState")
            .field("lock_queues", &self.locks.len())
            .field("groups", &self.groups.keys().collect::<Vec<_>>())
            .finish()
    }
}
