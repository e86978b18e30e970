//! Distributed read-write locks.
//!
//! Lock state lives in a [`LockRegistry`] replicated on every node. Acquire
//! and release requests are multicast and executed everywhere in the same
//! order; only the node the owner lives on answers.
//!
//! ```text
//!  DistributedLock::lock ──▶ AcquireLockRequest (multicast)
//!                                │ every node: LockRegistry::acquire
//!                                ▼
//!        owner's node ◀── LOCK_GRANTED / LOCK_WAIT_EXPIRED / DEADLOCK
//! ```

mod client;
mod queue;
mod registry;
pub(crate) mod requests;
mod waiter;

pub use client::{DistributedLock, LockOwnerIdentity, ReadWriteLock};
pub use queue::{LockOwner, LockOwnerId, LockQueue, LockQueueKey, PendingLock};
pub use registry::{AcquireOutcome, LockRegistry, NextLockRequestGranter, ReleaseOutcome};
pub use requests::{
    AcquireLockRequest, EntryCountRequest, LockRequest, ReleaseLockRequest,
    WaitForLockExpiredAnnouncement,
};
pub use waiter::AcquireLockWaiter;
