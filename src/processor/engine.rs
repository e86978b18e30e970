//! The cluster processor: a single-threaded state machine per node.
//!
//! ```text
//!   transport ──receive──▶ ┌──────────────────────────────┐ ──drain_outbound──▶ transport
//!                          │ local queue ─▶ dispatch      │
//!   local caller ─submit─▶ │   requests  ─▶ execute(ctx)  │
//!                          │   responses ─▶ waiter table  │
//!   runtime ──tick───────▶ │ timeouts, forced unlocks     │
//!                          └──────────────────────────────┘
//! ```
//!
//! Messages addressed to this node are executed from the local queue.
//! Multicasts, including the ones this node posts, go out through the
//! transport and come back in the cluster-wide total order, so every node
//! applies them to its [`ReplicatedState`] in the same sequence.

use crate::config::NodeConfig;
use crate::lock::requests::respond_granted;
use crate::lock::{LockOwnerId, LockQueueKey, LockRequest, ReleaseLockRequest};
use crate::metrics::ProcessorMetrics;
use crate::partitioning::BucketOwnershipAssignment;
use crate::processor::local::LocalRequest;
use crate::processor::replicated::{GroupFactory, ReplicatedState};
use crate::processor::waiter::{complete, Completion, Waiter, WaiterStatus};
use crate::subscription::{EntryModifiedEvent, LocalSubscriptions};
use crate::types::{Clock, NodeAddress, Time, PRIMARY_STORAGE};
use crate::wire::{Envelope, MessageHeader, Payload, Response};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Whether the processor serves requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Operational,
    /// Local requests and unicast requests that need a response are
    /// answered with a retry. Multicasts are still executed.
    Blocked,
}

impl fmt::Display for ProcessorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessorState::Operational => f.write_str("operational"),
            ProcessorState::Blocked => f.write_str("blocked"),
        }
    }
}

/// What message and waiter code may touch while it runs.
pub struct ProcessorContext<'a> {
    address: NodeAddress,
    now: Time,
    config: &'a NodeConfig,
    members: &'a BTreeSet<NodeAddress>,
    replicated: &'a mut ReplicatedState,
    subscriptions: &'a mut LocalSubscriptions,
    metrics: &'a ProcessorMetrics,
    posted: &'a mut Vec<Envelope>,
    new_waiters: &'a mut Vec<Box<dyn Waiter>>,
}

impl<'a> ProcessorContext<'a> {
    /// Address of this node.
    pub fn address(&self) -> NodeAddress {
        self.address
    }

    /// Local clock reading taken when the current event started.
    pub fn now(&self) -> Time {
        self.now
    }

    pub fn config(&self) -> &NodeConfig {
        self.config
    }

    /// Current cluster members, including this node.
    pub fn members(&self) -> &BTreeSet<NodeAddress> {
        self.members
    }

    /// Whether `address` is this node.
    pub fn is_local(&self, address: &NodeAddress) -> bool {
        *address == self.address
    }

    pub fn replicated(&self) -> &ReplicatedState {
        self.replicated
    }

    pub fn replicated_mut(&mut self) -> &mut ReplicatedState {
        self.replicated
    }

    pub fn subscriptions(&self) -> &LocalSubscriptions {
        self.subscriptions
    }

    pub fn subscriptions_mut(&mut self) -> &mut LocalSubscriptions {
        self.subscriptions
    }

    pub fn metrics(&self) -> &'a ProcessorMetrics {
        self.metrics
    }

    /// Queue a message. It is routed once the current event is done.
    pub fn post(&mut self, envelope: Envelope) {
        self.posted.push(envelope);
    }

    /// Register a waiter. It receives responses from the next message on.
    pub fn register_waiter(&mut self, waiter: Box<dyn Waiter>) {
        self.new_waiters.push(waiter);
    }

    /// Answer the sender of a request.
    pub fn respond(&mut self, request: &MessageHeader, response: Response) {
        self.respond_to(request.sender, response);
    }

    /// Send a response to a node.
    pub fn respond_to(&mut self, receiver: NodeAddress, response: Response) {
        let envelope = Envelope::response(self.address, receiver, response);
        self.post(envelope);
    }
}

/// Processor state lent to a [`ProcessorContext`].
struct Node {
    address: NodeAddress,
    config: NodeConfig,
    members: BTreeSet<NodeAddress>,
    replicated: ReplicatedState,
    subscriptions: LocalSubscriptions,
    metrics: Arc<ProcessorMetrics>,
    posted: Vec<Envelope>,
    new_waiters: Vec<Box<dyn Waiter>>,
}

impl Node {
    fn context(&mut self, now: Time) -> ProcessorContext<'_> {
        ProcessorContext {
            address: self.address,
            now,
            config: &self.config,
            members: &self.members,
            replicated: &mut self.replicated,
            subscriptions: &mut self.subscriptions,
            metrics: &self.metrics,
            posted: &mut self.posted,
            new_waiters: &mut self.new_waiters,
        }
    }
}

/// Forced unlock already posted for an owner and deadline.
type ForcedUnlock = (LockQueueKey, LockOwnerId, Time);

/// Message processor of one node.
pub struct ClusterProcessor {
    node: Node,
    clock: Arc<dyn Clock>,
    state: ProcessorState,
    waiters: HashMap<Uuid, Box<dyn Waiter>>,
    local_queue: VecDeque<Envelope>,
    outbound: Vec<Envelope>,
    forced_unlocks: HashSet<ForcedUnlock>,
}

impl ClusterProcessor {
    /// Create a processor for `config.address`, alone in its cluster until
    /// members are added.
    pub fn new(
        config: NodeConfig,
        assignment: Arc<dyn BucketOwnershipAssignment>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let address = config.address;
        let replicated = ReplicatedState::new(assignment, config.lock.deadlock_search_depth);
        Self {
            node: Node {
                address,
                config,
                members: BTreeSet::from([address]),
                replicated,
                subscriptions: LocalSubscriptions::new(),
                metrics: Arc::new(ProcessorMetrics::new()),
                posted: Vec::new(),
                new_waiters: Vec::new(),
            },
            clock,
            state: ProcessorState::Operational,
            waiters: HashMap::new(),
            local_queue: VecDeque::new(),
            outbound: Vec::new(),
            forced_unlocks: HashSet::new(),
        }
    }

    /// Add known cluster members.
    pub fn with_members<I>(mut self, members: I) -> Self
    where
        I: IntoIterator<Item = NodeAddress>,
    {
        self.node.members.extend(members);
        self
    }

    /// Use another subscription group implementation.
    pub fn with_group_factory(mut self, factory: GroupFactory) -> Self {
        self.node.replicated = self.node.replicated.with_group_factory(factory);
        self
    }

    pub fn address(&self) -> NodeAddress {
        self.node.address
    }

    pub fn config(&self) -> &NodeConfig {
        &self.node.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn state(&self) -> ProcessorState {
        self.state
    }

    pub fn members(&self) -> &BTreeSet<NodeAddress> {
        &self.node.members
    }

    pub fn replicated_state(&self) -> &ReplicatedState {
        &self.node.replicated
    }

    pub fn local_subscriptions(&self) -> &LocalSubscriptions {
        &self.node.subscriptions
    }

    pub fn metrics(&self) -> &Arc<ProcessorMetrics> {
        &self.node.metrics
    }

    /// Number of registered waiters.
    pub fn pending_waiters(&self) -> usize {
        self.waiters.len() + self.node.new_waiters.len()
    }

    /// Whether this node is the lowest-addressed member.
    pub fn is_representative(&self) -> bool {
        self.node.members.iter().next() == Some(&self.node.address)
    }

    pub fn set_state(&mut self, state: ProcessorState) {
        if self.state != state {
            info!(node = %self.node.address, from = %self.state, to = %state, "Processor state changed");
            self.state = state;
        }
    }

    /// Post a message from this node.
    pub fn post(&mut self, envelope: Envelope) {
        self.node.posted.push(envelope);
        self.flush();
    }

    /// Accept a message delivered by the transport.
    pub fn receive(&mut self, envelope: Envelope) {
        let header = &envelope.header;
        if self.state == ProcessorState::Blocked
            && header.receiver.is_some()
            && header.response_required
        {
            debug!(
                node = %self.node.address,
                request_id = %header.id,
                from = %header.sender,
                "Blocked, answering retry"
            );
            self.node.metrics.retries.inc();
            let response = Envelope::response(
                self.node.address,
                header.sender,
                Response::retry(header.id, "processor is blocked"),
            );
            self.node.posted.push(response);
        } else {
            self.local_queue.push_back(envelope);
        }
        self.flush();
    }

    /// Start a local request. Its final response goes to `completion`.
    pub fn submit(&mut self, request: LocalRequest, completion: Completion) -> Uuid {
        let id = Uuid::new_v4();
        if self.state == ProcessorState::Blocked {
            debug!(node = %self.node.address, request_id = %id, kind = request.kind(), "Blocked, answering retry");
            self.node.metrics.retries.inc();
            complete(completion, Response::retry(id, "processor is blocked"));
            return id;
        }

        let now = self.clock.now();
        request.start(id, completion, &mut self.node.context(now));
        self.flush();
        id
    }

    /// A node joined the cluster.
    pub fn notify_node_joined(&mut self, address: NodeAddress) {
        if self.node.members.insert(address) {
            info!(node = %self.node.address, joined = %address, "Node joined");
        }
    }

    /// A node left the cluster: release its locks, drop its subscriptions,
    /// and let every waiter react.
    pub fn notify_node_left(&mut self, address: NodeAddress) {
        if !self.node.members.remove(&address) {
            debug!(node = %self.node.address, left = %address, "Unknown node left");
        }
        info!(node = %self.node.address, left = %address, "Node left");

        let now = self.clock.now();
        {
            let mut ctx = self.node.context(now);
            let granted = ctx.replicated_mut().locks_mut().remove_node(&address);
            respond_granted(&mut ctx, granted);
            let purged = ctx.replicated_mut().remove_subscriber_node(&address);
            if purged > 0 {
                debug!(left = %address, purged, "Dropped subscriptions of departed node");
            }
        }

        self.absorb_waiters();
        let ids: Vec<Uuid> = self.waiters.keys().copied().collect();
        for id in ids {
            let Some(waiter) = self.waiters.get_mut(&id) else {
                continue;
            };
            if waiter.on_node_left(&address, &mut self.node.context(now)) == WaiterStatus::Finished {
                self.settle(id, now);
            }
        }
        self.flush();
    }

    /// Fire expired waiter deadlines and, on the representative, post
    /// forced unlocks for owners past their unlock deadline.
    pub fn tick(&mut self) {
        let now = self.clock.now();
        self.absorb_waiters();

        let mut expired: Vec<(Time, Uuid)> = self
            .waiters
            .iter()
            .filter_map(|(id, waiter)| waiter.deadline().filter(|d| *d <= now).map(|d| (d, *id)))
            .collect();
        expired.sort();
        for (_, id) in expired {
            let Some(waiter) = self.waiters.get_mut(&id) else {
                continue;
            };
            self.node.metrics.waiter_timeouts.inc();
            debug!(node = %self.node.address, request_id = %id, "Waiter timed out");
            if waiter.on_timeout(&mut self.node.context(now)) == WaiterStatus::Finished {
                self.settle(id, now);
            }
        }

        if self.state == ProcessorState::Operational && self.is_representative() {
            self.post_forced_unlocks(now);
        }
        self.flush();
    }

    /// Report a modification of an entry this node stores. At the primary
    /// owner of the entry's bucket, posts a notification to the home node
    /// of every matching subscriber. Returns the number posted.
    pub fn notify_entry_modified(&mut self, cache_name: &str, event: EntryModifiedEvent) -> usize {
        let assignment = self.node.replicated.assignment();
        let bucket = assignment.bucket_of(&event.key);
        if assignment.bucket_owner_address(PRIMARY_STORAGE, bucket) != Some(self.node.address) {
            debug!(cache = %cache_name, bucket, "Not the primary owner, skipping notification");
            return 0;
        }
        let subscribers = match self.node.replicated.group(cache_name) {
            Some(group) => group.subscribers_for(bucket, &event.key),
            None => return 0,
        };

        let mut forwarded = 0;
        for subscriber in subscribers {
            let home = subscriber.subscription.subscriber_address;
            if !self.node.members.contains(&home) {
                debug!(cache = %cache_name, subscriber = %home, "Subscriber node is gone");
                continue;
            }
            if let Some(message) = subscriber.notification_for(cache_name, &event) {
                self.node.posted.push(Envelope::notification(
                    self.node.address,
                    home,
                    Payload::EntryModifiedNotification(message),
                ));
                forwarded += 1;
            }
        }
        self.node.metrics.notifications_forwarded.inc_by(forwarded as u64);
        self.flush();
        forwarded
    }

    /// Take the messages to hand to the transport.
    pub fn drain_outbound(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.outbound)
    }

    fn post_forced_unlocks(&mut self, now: Time) {
        let expired = self.node.replicated.locks().expired_owners(now);
        let current: HashSet<ForcedUnlock> = expired
            .iter()
            .filter_map(|(key, owner)| owner.unlock_deadline.map(|d| (key.clone(), owner.id(), d)))
            .collect();
        self.forced_unlocks.retain(|posted| current.contains(posted));

        for (key, owner) in expired {
            let Some(deadline) = owner.unlock_deadline else {
                continue;
            };
            if !self.forced_unlocks.insert((key.clone(), owner.id(), deadline)) {
                continue;
            }
            info!(
                lock = %key,
                owner = %owner.address,
                thread_id = owner.thread_id,
                deadline,
                "Unlock timeout passed, forcing release"
            );
            let lock = LockRequest::new(
                key.region,
                key.key,
                owner.address,
                owner.thread_id,
                owner.thread_name,
                owner.read_lock,
            );
            self.node.posted.push(Envelope::multicast(
                self.node.address,
                Payload::ReleaseLock(ReleaseLockRequest::forced(lock, deadline, now)),
                false,
            ));
        }
    }

    fn absorb_waiters(&mut self) {
        for waiter in self.node.new_waiters.drain(..) {
            self.waiters.insert(waiter.request_id(), waiter);
        }
    }

    fn absorb_posted(&mut self) {
        for envelope in self.node.posted.drain(..) {
            if envelope.header.receiver == Some(self.node.address) {
                self.local_queue.push_back(envelope);
            } else {
                self.node.metrics.messages_sent.inc();
                self.outbound.push(envelope);
            }
        }
    }

    /// Route everything posted and execute the local queue until both are
    /// empty.
    fn flush(&mut self) {
        loop {
            self.absorb_waiters();
            self.absorb_posted();
            let Some(envelope) = self.local_queue.pop_front() else {
                break;
            };
            self.dispatch(envelope);
        }
        self.node
            .metrics
            .pending_waiters
            .set(self.waiters.len());
        self.node
            .metrics
            .lock_queues
            .set(self.node.replicated.locks().len());
    }

    fn dispatch(&mut self, envelope: Envelope) {
        let kind = envelope.wireable_type();
        self.node.metrics.messages_received.inc(&kind.to_string());
        let now = self.clock.now();
        let Envelope { header, payload } = envelope;
        debug!(node = %self.node.address, request_id = %header.id, from = %header.sender, %kind, "Dispatching");

        match payload {
            Payload::Response(response) => self.route_response(response, now),
            Payload::AcquireLock(request) => request.execute(&header, &mut self.node.context(now)),
            Payload::ReleaseLock(request) => request.execute(&header, &mut self.node.context(now)),
            Payload::EntryCount(request) => request.execute(&header, &mut self.node.context(now)),
            Payload::WaitForLockExpired(announcement) => {
                announcement.execute(&header, &mut self.node.context(now))
            }
            Payload::Subscription(announcement) => {
                announcement.execute(&header, &mut self.node.context(now))
            }
            Payload::EntryModifiedNotification(message) => {
                message.execute(&header, &mut self.node.context(now))
            }
        }
    }

    fn route_response(&mut self, response: Response, now: Time) {
        let id = response.response_to;
        let Some(waiter) = self.waiters.get_mut(&id) else {
            self.node.metrics.late_responses.inc();
            debug!(node = %self.node.address, request_id = %id, code = ?response.code, "Response without waiter");
            return;
        };
        self.node.metrics.responses_routed.inc();
        if waiter.on_response(response, &mut self.node.context(now)) == WaiterStatus::Finished {
            self.settle(id, now);
        }
    }

    /// Remove a finished waiter, finish it, and hand its response to its
    /// parent, repeating while parents finish too.
    fn settle(&mut self, id: Uuid, now: Time) {
        self.absorb_waiters();
        let mut next = Some(id);
        while let Some(id) = next.take() {
            let Some(waiter) = self.waiters.remove(&id) else {
                break;
            };
            let parent = waiter.parent();
            let response = waiter.finish(&mut self.node.context(now));

            let Some(parent_id) = parent else {
                break;
            };
            self.absorb_waiters();
            let Some(parent) = self.waiters.get_mut(&parent_id) else {
                debug!(request_id = %id, parent = %parent_id, "Parent waiter already gone");
                break;
            };
            if parent.on_child_finished(id, response, &mut self.node.context(now))
                == WaiterStatus::Finished
            {
                next = Some(parent_id);
            }
        }
    }
}

impl fmt::Debug for ClusterProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterProcessor")
            .field("address", &self.node.address)
            .field("state", &self.state)
            .field("members", &self.node.members)
            .field("waiters", &self.waiters.len())
            .field("replicated", &self.node.replicated)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessorConfig;
    use crate::partitioning::RingBucketAssignment;
    use crate::types::{Binary, ManualClock};
    use crate::lock::EntryCountRequest;
    use crate::wire::{LockResult, ResponsePayload, ResultCode, UnlockResult};
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn single_node() -> (ClusterProcessor, Arc<ManualClock>) {
        let address = NodeAddress::local(1);
        let config = NodeConfig::new(address).with_bucket_count(16).with_processor_config(
            ProcessorConfig::default().with_request_timeout(Duration::from_millis(500)),
        );
        let assignment = Arc::new(RingBucketAssignment::with_nodes(16, 0, [address]));
        let clock = Arc::new(ManualClock::new(1_000));
        (ClusterProcessor::new(config, assignment, clock.clone()), clock)
    }

    fn lock(thread: u64) -> LockRequest {
        LockRequest::new(
            "region",
            Binary::from_static(b"k"),
            NodeAddress::local(1),
            thread,
            "main",
            false,
        )
    }

    /// Deliver everything a lone node sends back to itself.
    fn pump(processor: &mut ClusterProcessor) {
        loop {
            let outbound = processor.drain_outbound();
            if outbound.is_empty() {
                break;
            }
            for envelope in outbound {
                processor.receive(envelope);
            }
        }
    }

    fn run(processor: &mut ClusterProcessor, request: LocalRequest) -> oneshot::Receiver<Response> {
        let (tx, rx) = oneshot::channel();
        processor.submit(request, tx);
        pump(processor);
        rx
    }

    #[test]
    fn test_acquire_count_release() {
        let (mut processor, _) = single_node();

        let mut rx = run(
            &mut processor,
            LocalRequest::AcquireLock {
                lock: lock(1),
                timeout: None,
                unlock_timeout: None,
            },
        );
        let response = rx.try_recv().unwrap();
        assert_eq!(response.payload, ResponsePayload::Lock(LockResult::Granted));

        let mut rx = run(&mut processor, LocalRequest::EntryCount { lock: lock(1) });
        assert_eq!(rx.try_recv().unwrap().payload, ResponsePayload::EntryCount(1));

        let mut rx = run(&mut processor, LocalRequest::ReleaseLock { lock: lock(1) });
        assert_eq!(
            rx.try_recv().unwrap().payload,
            ResponsePayload::Unlock(UnlockResult::Released)
        );
        assert!(processor.replicated_state().locks().is_empty());
        assert_eq!(processor.pending_waiters(), 0);
    }

    #[test]
    fn test_late_response_is_dropped() {
        let (mut processor, _) = single_node();
        let address = processor.address();
        processor.receive(Envelope::response(
            address,
            address,
            Response::success(Uuid::new_v4(), ResponsePayload::Empty),
        ));
        assert_eq!(processor.metrics().late_responses.get(), 1);
    }

    #[test]
    fn test_blocked_answers_retry() {
        let (mut processor, _) = single_node();
        processor.set_state(ProcessorState::Blocked);

        let mut rx = run(&mut processor, LocalRequest::EntryCount { lock: lock(1) });
        assert_eq!(rx.try_recv().unwrap().code, ResultCode::Retry);

        let remote = NodeAddress::local(2);
        let request = Envelope::request(
            remote,
            processor.address(),
            Payload::EntryCount(EntryCountRequest::new(lock(1))),
        );
        processor.receive(request.clone());
        let outbound = processor.drain_outbound();
        assert_eq!(outbound.len(), 1);
        assert_eq!(outbound[0].header.receiver, Some(remote));
        match &outbound[0].payload {
            Payload::Response(response) => {
                assert_eq!(response.response_to, request.id());
                assert_eq!(response.code, ResultCode::Retry);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_waiter_deadline_answers_retry() {
        let (mut processor, clock) = single_node();
        let (tx, mut rx) = oneshot::channel();
        processor.submit(LocalRequest::ReleaseLock { lock: lock(1) }, tx);
        // The multicast never comes back.
        processor.drain_outbound();

        processor.tick();
        assert!(rx.try_recv().is_err());

        clock.advance(Duration::from_millis(500));
        processor.tick();
        assert_eq!(rx.try_recv().unwrap().code, ResultCode::Retry);
        assert_eq!(processor.metrics().waiter_timeouts.get(), 1);
    }

    #[test]
    fn test_representative_is_lowest_member() {
        let (processor, _) = single_node();
        assert!(processor.is_representative());
        let processor = processor.with_members([NodeAddress::local(0)]);
        assert!(!processor.is_representative());
    }
}
