//! Deterministic in-process cluster of synchronous processors.

use crate::config::NodeConfig;
use crate::partitioning::{BucketOwnershipAssignment, RingBucketAssignment};
use crate::processor::{ClusterProcessor, LocalRequest};
use crate::subscription::EntryModifiedEvent;
use crate::types::{BucketNumber, ManualClock, NodeAddress};
use crate::wire::{Envelope, Response};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

/// Steps before [`SimulatedCluster::run`] gives up on a cluster that keeps
/// talking.
const MAX_STEPS: usize = 100_000;

/// What the interceptor wants done with a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interception {
    Deliver,
    Drop,
}

type Interceptor = Box<dyn FnMut(&NodeAddress, &Envelope) -> Interception>;

/// N processors sharing one clock, one bucket assignment and one delivery
/// queue.
///
/// Every envelope a processor sends becomes one delivery per receiver,
/// appended to a single FIFO queue. A multicast is appended for all
/// members at once, so every node executes multicasts in the same order.
/// Nothing moves until the test calls [`step`](Self::step) or
/// [`run`](Self::run).
pub struct SimulatedCluster {
    assignment: Arc<RingBucketAssignment>,
    clock: Arc<ManualClock>,
    nodes: BTreeMap<NodeAddress, ClusterProcessor>,
    queue: VecDeque<(NodeAddress, Envelope)>,
    interceptor: Option<Interceptor>,
    delivered: usize,
    dropped: usize,
}

impl SimulatedCluster {
    /// Nodes 1..=n over `bucket_count` buckets placed by the ring.
    pub fn new(node_count: u64, bucket_count: u32) -> Self {
        Self::with_config(node_count, bucket_count, |config| config)
    }

    /// Like [`new`](Self::new), adjusting each node's configuration.
    pub fn with_config<F>(node_count: u64, bucket_count: u32, configure: F) -> Self
    where
        F: Fn(NodeConfig) -> NodeConfig,
    {
        let addresses: Vec<NodeAddress> = (1..=node_count).map(NodeAddress::local).collect();
        let assignment = Arc::new(RingBucketAssignment::with_nodes(
            bucket_count,
            0,
            addresses.clone(),
        ));
        let clock = Arc::new(ManualClock::new(1_000_000));

        let nodes = addresses
            .iter()
            .map(|address| {
                let config = configure(NodeConfig::new(*address).with_bucket_count(bucket_count));
                let processor = ClusterProcessor::new(config, assignment.clone(), clock.clone())
                    .with_members(addresses.iter().copied());
                (*address, processor)
            })
            .collect();

        Self {
            assignment,
            clock,
            nodes,
            queue: VecDeque::new(),
            interceptor: None,
            delivered: 0,
            dropped: 0,
        }
    }

    pub fn addresses(&self) -> Vec<NodeAddress> {
        self.nodes.keys().copied().collect()
    }

    /// Address of node `id`.
    pub fn address(&self, id: u64) -> NodeAddress {
        NodeAddress::local(id)
    }

    pub fn assignment(&self) -> &Arc<RingBucketAssignment> {
        &self.assignment
    }

    pub fn clock(&self) -> &Arc<ManualClock> {
        &self.clock
    }

    /// Processor of a live node.
    ///
    /// # Panics
    ///
    /// Panics if the node is not part of the cluster.
    pub fn node(&self, address: &NodeAddress) -> &ClusterProcessor {
        match self.nodes.get(address) {
            Some(node) => node,
            None => panic!("no node {}", address),
        }
    }

    pub fn node_mut(&mut self, address: &NodeAddress) -> &mut ClusterProcessor {
        match self.nodes.get_mut(address) {
            Some(node) => node,
            None => panic!("no node {}", address),
        }
    }

    /// Place every bucket on an explicit owner, `owners[bucket % len]`.
    pub fn assign_round_robin(&self, owners: &[NodeAddress]) {
        for bucket in 0..self.assignment.bucket_count() {
            let owner = owners[bucket as usize % owners.len()];
            self.assignment.assign(0, bucket, owner);
        }
    }

    /// A key that falls into `bucket`.
    pub fn key_in_bucket(&self, bucket: BucketNumber) -> bytes::Bytes {
        super::key_in_bucket(self.assignment.as_ref(), bucket)
    }

    /// Inspect, and possibly drop, every delivery from now on.
    pub fn intercept<F>(&mut self, interceptor: F)
    where
        F: FnMut(&NodeAddress, &Envelope) -> Interception + 'static,
    {
        self.interceptor = Some(Box::new(interceptor));
    }

    pub fn clear_interceptor(&mut self) {
        self.interceptor = None;
    }

    /// Submit a local request at `address` and collect what it sends.
    pub fn submit(&mut self, address: &NodeAddress, request: LocalRequest) -> oneshot::Receiver<Response> {
        let (tx, rx) = oneshot::channel();
        self.node_mut(address).submit(request, tx);
        self.collect(address);
        rx
    }

    /// Report an entry modification at `address`.
    pub fn notify_entry_modified(
        &mut self,
        address: &NodeAddress,
        cache_name: &str,
        event: EntryModifiedEvent,
    ) -> usize {
        let posted = self.node_mut(address).notify_entry_modified(cache_name, event);
        self.collect(address);
        posted
    }

    /// Deliveries waiting in the queue.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn delivered(&self) -> usize {
        self.delivered
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Make one delivery. Returns false when the queue is empty.
    pub fn step(&mut self) -> bool {
        let Some((to, envelope)) = self.queue.pop_front() else {
            return false;
        };

        if let Some(interceptor) = self.interceptor.as_mut() {
            if interceptor(&to, &envelope) == Interception::Drop {
                debug!(to = %to, request_id = %envelope.id(), "Delivery dropped");
                self.dropped += 1;
                return true;
            }
        }

        let Some(node) = self.nodes.get_mut(&to) else {
            self.dropped += 1;
            return true;
        };
        node.receive(envelope);
        self.delivered += 1;
        self.collect(&to);
        true
    }

    /// Deliver until the cluster is quiet. Returns the steps taken.
    ///
    /// # Panics
    ///
    /// Panics if the cluster never goes quiet.
    pub fn run(&mut self) -> usize {
        let mut steps = 0;
        while self.step() {
            steps += 1;
            if steps > MAX_STEPS {
                panic!("cluster did not go quiet after {} steps", MAX_STEPS);
            }
        }
        steps
    }

    /// Move the clock and tick every node.
    pub fn advance(&mut self, by: Duration) {
        self.clock.advance(by);
        self.tick_all();
    }

    pub fn tick_all(&mut self) {
        for address in self.addresses() {
            self.node_mut(&address).tick();
            self.collect(&address);
        }
    }

    /// Remove a node: its processor stops, the ring forgets it, queued
    /// deliveries to it are lost, and the others see it leave.
    pub fn node_left(&mut self, address: &NodeAddress) -> Option<ClusterProcessor> {
        let removed = self.nodes.remove(address)?;
        self.assignment.remove_node(address);
        let before = self.queue.len();
        self.queue.retain(|(to, _)| to != address);
        self.dropped += before - self.queue.len();

        for other in self.addresses() {
            self.node_mut(&other).notify_node_left(*address);
            self.collect(&other);
        }
        Some(removed)
    }

    fn collect(&mut self, from: &NodeAddress) {
        let Some(node) = self.nodes.get_mut(from) else {
            return;
        };
        for envelope in node.drain_outbound() {
            match envelope.header.receiver {
                Some(receiver) => self.queue.push_back((receiver, envelope)),
                None => {
                    for member in self.nodes.keys() {
                        self.queue.push_back((*member, envelope.clone()));
                    }
                }
            }
        }
    }
}

impl fmt::Debug for SimulatedCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedCluster")
            .field("nodes", &self.addresses())
            .field("pending", &self.queue.len())
            .field("delivered", &self.delivered)
            .field("dropped", &self.dropped)
            .finish()
    }
}
