//! Per-key lock queue: current owners plus FIFO pending requests.

use crate::lock::requests::{AcquireLockRequest, LockRequest};
use crate::types::{Binary, NodeAddress, Time};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use uuid::Uuid;

/// Identifies a lock queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockQueueKey {
    pub region: String,
    pub key: Binary,
}

impl LockQueueKey {
    pub fn new(region: impl Into<String>, key: Binary) -> Self {
        Self {
            region: region.into(),
            key,
        }
    }
}

impl fmt::Display for LockQueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:?}", self.region, self.key)
    }
}

/// Logical lock owner: a thread of control on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockOwnerId {
    pub address: NodeAddress,
    pub thread_id: u64,
}

/// A granted hold on a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOwner {
    pub thread_id: u64,
    pub address: NodeAddress,
    pub thread_name: String,
    /// Re-entrant hold count.
    pub entry_count: u32,
    pub read_lock: bool,
    /// When the hold may be broken by a forced unlock.
    pub unlock_deadline: Option<Time>,
}

impl LockOwner {
    fn from_request(request: &AcquireLockRequest, granted_at: Time) -> Self {
        Self {
            thread_id: request.lock.thread_id,
            address: request.lock.owner_address,
            thread_name: request.lock.thread_name.clone(),
            entry_count: 1,
            read_lock: request.lock.read_lock,
            unlock_deadline: request
                .unlock_timeout_millis
                .map(|millis| granted_at.saturating_add(millis)),
        }
    }

    /// Identity of the owner.
    pub fn id(&self) -> LockOwnerId {
        LockOwnerId {
            address: self.address,
            thread_id: self.thread_id,
        }
    }
}

/// A request waiting for the lock.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingLock {
    /// Message ID of the acquire request; the grant response answers it.
    pub request_id: Uuid,
    pub request: AcquireLockRequest,
}

impl PendingLock {
    /// Identity of the requester.
    pub fn owner_id(&self) -> LockOwnerId {
        self.request.lock.owner_id()
    }
}

/// Decision for an acquire request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Grant,
    Enqueue,
}

/// Owners and waiters of one lock.
#[derive(Debug, Clone, Default)]
pub struct LockQueue {
    write_owner: Option<LockOwner>,
    read_owners: Vec<LockOwner>,
    pending: VecDeque<PendingLock>,
}

impl LockQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current write owner.
    pub fn write_owner(&self) -> Option<&LockOwner> {
        self.write_owner.as_ref()
    }

    /// Current read owners.
    pub fn read_owners(&self) -> &[LockOwner] {
        &self.read_owners
    }

    /// Requests waiting, oldest first.
    pub fn pending(&self) -> impl Iterator<Item = &PendingLock> {
        self.pending.iter()
    }

    /// No owners.
    pub fn is_unlocked(&self) -> bool {
        self.write_owner.is_none() && self.read_owners.is_empty()
    }

    /// No owners and nobody waiting.
    pub fn is_empty(&self) -> bool {
        self.is_unlocked() && self.pending.is_empty()
    }

    /// Every owner, writer first.
    pub fn owners(&self) -> impl Iterator<Item = &LockOwner> {
        self.write_owner.iter().chain(self.read_owners.iter())
    }

    /// Whether `owner` has a request waiting in this queue.
    pub fn has_pending_from(&self, owner: &LockOwnerId) -> bool {
        self.pending.iter().any(|p| p.owner_id() == *owner)
    }

    /// Hold count of an owner in the given mode.
    pub fn entry_count(&self, lock: &LockRequest) -> u32 {
        let owner = lock.owner_id();
        let found = if lock.read_lock {
            self.read_owners.iter().find(|o| o.id() == owner)
        } else {
            self.write_owner.as_ref().filter(|o| o.id() == owner)
        };
        found.map(|o| o.entry_count).unwrap_or(0)
    }

    /// Decide whether a request can be granted now.
    ///
    /// `at_head` is set when the request is the oldest pending one, so
    /// queued requests do not count against it.
    pub(crate) fn admit(&self, request: &LockRequest, at_head: bool) -> Admission {
        let requester = request.owner_id();
        let nobody_ahead = at_head || self.pending.is_empty();

        if let Some(writer) = &self.write_owner {
            return if writer.id() == requester {
                Admission::Grant
            } else {
                Admission::Enqueue
            };
        }

        if self.read_owners.is_empty() {
            return if nobody_ahead {
                Admission::Grant
            } else {
                Admission::Enqueue
            };
        }

        let holds_read = self.read_owners.iter().any(|o| o.id() == requester);
        let grant = if request.read_lock {
            holds_read || nobody_ahead
        } else {
            self.read_owners.iter().all(|o| o.id() == requester)
        };
        if grant {
            Admission::Grant
        } else {
            Admission::Enqueue
        }
    }

    /// Record a grant.
    pub(crate) fn grant(&mut self, request: &AcquireLockRequest, granted_at: Time) {
        let requester = request.lock.owner_id();
        if request.lock.read_lock {
            match self.read_owners.iter_mut().find(|o| o.id() == requester) {
                Some(owner) => owner.entry_count += 1,
                None => self
                    .read_owners
                    .push(LockOwner::from_request(request, granted_at)),
            }
            return;
        }

        match &mut self.write_owner {
            Some(owner) if owner.id() == requester => owner.entry_count += 1,
            _ => self.write_owner = Some(LockOwner::from_request(request, granted_at)),
        }
    }

    /// Append a request to the wait queue.
    pub(crate) fn enqueue(&mut self, pending: PendingLock) {
        self.pending.push_back(pending);
    }

    /// Release one hold, or every hold of the owner when `all_holds` is
    /// set. Returns false if the owner does not hold the lock in that mode.
    pub(crate) fn release(&mut self, lock: &LockRequest, all_holds: bool) -> bool {
        let owner = lock.owner_id();
        if lock.read_lock {
            let Some(index) = self.read_owners.iter().position(|o| o.id() == owner) else {
                return false;
            };
            let entry = &mut self.read_owners[index];
            if all_holds || entry.entry_count <= 1 {
                self.read_owners.remove(index);
            } else {
                entry.entry_count -= 1;
            }
            return true;
        }

        match &mut self.write_owner {
            Some(entry) if entry.id() == owner => {
                if all_holds || entry.entry_count <= 1 {
                    self.write_owner = None;
                } else {
                    entry.entry_count -= 1;
                }
                true
            }
            _ => false,
        }
    }

    /// Release an owner whose unlock deadline is exactly `deadline`.
    pub(crate) fn force_release(&mut self, lock: &LockRequest, deadline: Time) -> bool {
        let owner = lock.owner_id();
        let matches = |o: &LockOwner| o.id() == owner && o.unlock_deadline == Some(deadline);
        if lock.read_lock {
            let before = self.read_owners.len();
            self.read_owners.retain(|o| !matches(o));
            return self.read_owners.len() != before;
        }
        if self.write_owner.as_ref().map(matches).unwrap_or(false) {
            self.write_owner = None;
            return true;
        }
        false
    }

    /// Remove the pending request that `request_id` identifies.
    pub(crate) fn withdraw(&mut self, request_id: Uuid) -> Option<PendingLock> {
        let index = self.pending.iter().position(|p| p.request_id == request_id)?;
        self.pending.remove(index)
    }

    /// Drop every hold and pending request of a node.
    pub(crate) fn remove_node(&mut self, address: &NodeAddress) -> bool {
        let before = (self.read_owners.len(), self.pending.len(), self.write_owner.is_some());
        if self
            .write_owner
            .as_ref()
            .map(|o| o.address == *address)
            .unwrap_or(false)
        {
            self.write_owner = None;
        }
        self.read_owners.retain(|o| o.address != *address);
        self.pending.retain(|p| p.request.lock.owner_address != *address);
        before != (self.read_owners.len(), self.pending.len(), self.write_owner.is_some())
    }

    pub(crate) fn front_pending(&self) -> Option<&PendingLock> {
        self.pending.front()
    }

    pub(crate) fn pop_pending(&mut self) -> Option<PendingLock> {
        self.pending.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock(thread: u64, read: bool) -> LockRequest {
        LockRequest::new(
            "r",
            Binary::from_static(b"k"),
            NodeAddress::local(1),
            thread,
            format!("t{}", thread),
            read,
        )
    }

    fn acquire(thread: u64, read: bool) -> AcquireLockRequest {
        AcquireLockRequest::new(lock(thread, read), None, None, 0)
    }

    fn pending(thread: u64, read: bool) -> PendingLock {
        PendingLock {
            request_id: Uuid::new_v4(),
            request: acquire(thread, read),
        }
    }

    #[test]
    fn test_write_excludes_others_but_reenters() {
        let mut queue = LockQueue::new();
        assert_eq!(queue.admit(&lock(1, false), false), Admission::Grant);
        queue.grant(&acquire(1, false), 0);

        assert_eq!(queue.admit(&lock(1, false), false), Admission::Grant);
        assert_eq!(queue.admit(&lock(1, true), false), Admission::Grant);
        assert_eq!(queue.admit(&lock(2, true), false), Admission::Enqueue);
        assert_eq!(queue.admit(&lock(2, false), false), Admission::Enqueue);

        queue.grant(&acquire(1, false), 0);
        assert_eq!(queue.entry_count(&lock(1, false)), 2);
    }

    #[test]
    fn test_readers_share_unless_someone_waits() {
        let mut queue = LockQueue::new();
        queue.grant(&acquire(1, true), 0);

        assert_eq!(queue.admit(&lock(2, true), false), Admission::Grant);
        queue.enqueue(pending(3, false));
        assert_eq!(queue.admit(&lock(2, true), false), Admission::Enqueue);
        assert_eq!(queue.admit(&lock(1, true), false), Admission::Grant);
    }

    #[test]
    fn test_sole_reader_escalates() {
        let mut queue = LockQueue::new();
        queue.grant(&acquire(1, true), 0);
        assert_eq!(queue.admit(&lock(1, false), false), Admission::Grant);

        queue.grant(&acquire(2, true), 0);
        assert_eq!(queue.admit(&lock(1, false), false), Admission::Enqueue);
    }

    #[test]
    fn test_release_counts_down() {
        let mut queue = LockQueue::new();
        queue.grant(&acquire(1, false), 0);
        queue.grant(&acquire(1, false), 0);

        assert!(queue.release(&lock(1, false), false));
        assert!(!queue.is_unlocked());
        assert!(queue.release(&lock(1, false), false));
        assert!(queue.is_unlocked());
        assert!(!queue.release(&lock(1, false), false));
        assert!(!queue.release(&lock(1, true), false));
    }

    #[test]
    fn test_force_release_matches_deadline() {
        let mut queue = LockQueue::new();
        let request = AcquireLockRequest::new(lock(1, false), None, Some(100), 0);
        queue.grant(&request, 50);
        assert_eq!(queue.write_owner().unwrap().unlock_deadline, Some(150));

        assert!(!queue.force_release(&lock(1, false), 149));
        assert!(queue.force_release(&lock(1, false), 150));
        assert!(queue.is_unlocked());
    }

    #[test]
    fn test_remove_node() {
        let mut queue = LockQueue::new();
        queue.grant(&acquire(1, true), 0);
        queue.enqueue(pending(2, false));
        assert!(queue.remove_node(&NodeAddress::local(1)));
        assert!(queue.is_empty());
        assert!(!queue.remove_node(&NodeAddress::local(1)));
    }
}
