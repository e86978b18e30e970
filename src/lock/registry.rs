//! Replicated registry of lock queues.
//!
//! Every node holds an identical registry. Lock requests are multicast in
//! total order and executed against it on every node, so grant decisions
//! and their timestamps agree everywhere.

use crate::lock::queue::{Admission, LockOwner, LockOwnerId, LockQueue, LockQueueKey, PendingLock};
use crate::lock::requests::{AcquireLockRequest, LockRequest, ReleaseLockRequest};
use crate::types::{NodeAddress, Time};
use std::collections::{HashMap, HashSet};
use tracing::debug;
use uuid::Uuid;

/// Outcome of an acquire request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Granted,
    Enqueued,
    Deadlock,
}

/// Outcome of a release request.
#[derive(Debug, Clone, PartialEq)]
pub enum ReleaseOutcome {
    /// The hold was released; `granted` lists pending requests granted as
    /// a result, in grant order.
    Released { granted: Vec<PendingLock> },
    /// The requester held no matching lock.
    Broken,
}

/// Grants pending requests at the head of a queue while they are
/// compatible with the current owners.
pub struct NextLockRequestGranter<'a> {
    queue: &'a mut LockQueue,
    granted_at: Option<Time>,
}

impl<'a> NextLockRequestGranter<'a> {
    pub fn new(queue: &'a mut LockQueue, granted_at: Time) -> Self {
        Self {
            queue,
            granted_at: Some(granted_at),
        }
    }

    /// Stamp each grant with the send time of the granted request. Used
    /// where no message time is available, such as node departures.
    pub fn at_request_time(queue: &'a mut LockQueue) -> Self {
        Self {
            queue,
            granted_at: None,
        }
    }

    /// Grant in strict FIFO order, stopping at the first request that
    /// has to keep waiting.
    pub fn grant(self) -> Vec<PendingLock> {
        let mut granted = Vec::new();
        loop {
            let admitted = match self.queue.front_pending() {
                Some(head) => self.queue.admit(&head.request.lock, true) == Admission::Grant,
                None => false,
            };
            if !admitted {
                break;
            }
            let Some(next) = self.queue.pop_pending() else {
                break;
            };
            let granted_at = self.granted_at.unwrap_or(next.request.sent_at);
            self.queue.grant(&next.request, granted_at);
            granted.push(next);
        }
        granted
    }
}

/// All lock queues of a node.
#[derive(Debug)]
pub struct LockRegistry {
    queues: HashMap<LockQueueKey, LockQueue>,
    deadlock_search_depth: usize,
}

impl LockRegistry {
    /// Create a registry. A search depth of 1 checks whether any current
    /// owner directly waits for a lock the requester holds.
    pub fn new(deadlock_search_depth: usize) -> Self {
        Self {
            queues: HashMap::new(),
            deadlock_search_depth: deadlock_search_depth.max(1),
        }
    }

    /// Number of queues with owners or waiters.
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Queue of a lock, if anyone holds or waits for it.
    pub fn queue(&self, key: &LockQueueKey) -> Option<&LockQueue> {
        self.queues.get(key)
    }

    /// Execute an acquire request sent as message `request_id`.
    pub fn acquire(&mut self, request_id: Uuid, request: &AcquireLockRequest) -> AcquireOutcome {
        let key = request.lock.queue_key();
        let admission = self
            .queues
            .get(&key)
            .map(|queue| queue.admit(&request.lock, false))
            .unwrap_or(Admission::Grant);

        if admission == Admission::Grant {
            self.queues
                .entry(key)
                .or_default()
                .grant(request, request.sent_at);
            return AcquireOutcome::Granted;
        }

        if self.detects_deadlock(&key, request.lock.owner_id()) {
            return AcquireOutcome::Deadlock;
        }

        self.queues.entry(key).or_default().enqueue(PendingLock {
            request_id,
            request: request.clone(),
        });
        AcquireOutcome::Enqueued
    }

    /// Execute a release request.
    pub fn release(&mut self, request: &ReleaseLockRequest) -> ReleaseOutcome {
        let key = request.lock.queue_key();
        let Some(queue) = self.queues.get_mut(&key) else {
            return ReleaseOutcome::Broken;
        };

        let released = match request.forced_deadline {
            Some(deadline) => queue.force_release(&request.lock, deadline),
            None => queue.release(&request.lock, false),
        };
        if !released {
            return ReleaseOutcome::Broken;
        }

        let granted = NextLockRequestGranter::new(queue, request.sent_at).grant();
        self.prune(&key);
        ReleaseOutcome::Released { granted }
    }

    /// Withdraw a pending request whose wait expired. Returns the withdrawn
    /// request and whatever became grantable behind it, or None if the
    /// request is no longer pending.
    pub fn withdraw(
        &mut self,
        lock: &LockRequest,
        request_id: Uuid,
        now: Time,
    ) -> Option<(PendingLock, Vec<PendingLock>)> {
        let key = lock.queue_key();
        let queue = self.queues.get_mut(&key)?;
        let withdrawn = queue.withdraw(request_id)?;
        let granted = NextLockRequestGranter::new(queue, now).grant();
        self.prune(&key);
        Some((withdrawn, granted))
    }

    /// Hold count of the owner described by `lock`.
    pub fn entry_count(&self, lock: &LockRequest) -> u32 {
        self.queues
            .get(&lock.queue_key())
            .map(|queue| queue.entry_count(lock))
            .unwrap_or(0)
    }

    /// Release every hold and drop every pending request of a departed
    /// node, then grant what became grantable.
    pub fn remove_node(&mut self, address: &NodeAddress) -> Vec<PendingLock> {
        let mut granted = Vec::new();
        for queue in self.queues.values_mut() {
            if queue.remove_node(address) {
                granted.extend(NextLockRequestGranter::at_request_time(queue).grant());
            }
        }
        self.queues.retain(|_, queue| !queue.is_empty());
        granted
    }

    /// Owners whose unlock deadline has passed.
    pub fn expired_owners(&self, now: Time) -> Vec<(LockQueueKey, LockOwner)> {
        let mut expired: Vec<_> = self
            .queues
            .iter()
            .flat_map(|(key, queue)| {
                queue
                    .owners()
                    .filter(|owner| owner.unlock_deadline.map(|d| d <= now).unwrap_or(false))
                    .map(move |owner| (key.clone(), owner.clone()))
            })
            .collect();
        expired.sort_by(|a, b| a.0.cmp(&b.0));
        expired
    }

    fn prune(&mut self, key: &LockQueueKey) {
        if self.queues.get(key).map(LockQueue::is_empty).unwrap_or(false) {
            self.queues.remove(key);
        }
    }

    /// Breadth-first search of the wait-for relation, starting from the
    /// owners of `target`, for a path back to `requester`.
    fn detects_deadlock(&self, target: &LockQueueKey, requester: LockOwnerId) -> bool {
        let Some(queue) = self.queues.get(target) else {
            return false;
        };

        let mut frontier: Vec<LockOwnerId> = queue
            .owners()
            .map(LockOwner::id)
            .filter(|owner| *owner != requester)
            .collect();
        let mut visited = HashSet::new();

        for depth in 0..self.deadlock_search_depth {
            let mut next = Vec::new();
            for owner in frontier {
                if !visited.insert(owner) {
                    continue;
                }
                for (key, waited) in &self.queues {
                    if !waited.has_pending_from(&owner) {
                        continue;
                    }
                    for holder in waited.owners().map(LockOwner::id) {
                        if holder == requester {
                            debug!(lock = %key, depth, "Deadlock cycle found");
                            return true;
                        }
                        if holder != owner {
                            next.push(holder);
                        }
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }
        false
    }
}
