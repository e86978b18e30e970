//! Lock messages and their execution on every replica.

use crate::lock::queue::{LockOwnerId, LockQueueKey, PendingLock};
use crate::lock::registry::{AcquireOutcome, ReleaseOutcome};
use crate::processor::ProcessorContext;
use crate::types::{Binary, NodeAddress, Time};
use crate::wire::{LockResult, MessageHeader, Response, ResponsePayload, UnlockResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

/// Lock and logical owner a lock message refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockRequest {
    pub region: String,
    pub key: Binary,
    pub owner_address: NodeAddress,
    pub thread_id: u64,
    pub thread_name: String,
    pub read_lock: bool,
}

impl LockRequest {
    pub fn new(
        region: impl Into<String>,
        key: Binary,
        owner_address: NodeAddress,
        thread_id: u64,
        thread_name: impl Into<String>,
        read_lock: bool,
    ) -> Self {
        Self {
            region: region.into(),
            key,
            owner_address,
            thread_id,
            thread_name: thread_name.into(),
            read_lock,
        }
    }

    /// Queue this request refers to.
    pub fn queue_key(&self) -> LockQueueKey {
        LockQueueKey::new(self.region.clone(), self.key.clone())
    }

    /// Logical owner.
    pub fn owner_id(&self) -> LockOwnerId {
        LockOwnerId {
            address: self.owner_address,
            thread_id: self.thread_id,
        }
    }
}

/// Request to acquire a lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquireLockRequest {
    pub lock: LockRequest,
    /// How long to wait. None waits until granted; Some(0) never waits.
    pub timeout_millis: Option<u64>,
    /// How long the lock may be held before a forced unlock.
    pub unlock_timeout_millis: Option<u64>,
    /// Sender's clock when the request was posted.
    pub sent_at: Time,
}

impl AcquireLockRequest {
    pub fn new(
        lock: LockRequest,
        timeout_millis: Option<u64>,
        unlock_timeout_millis: Option<u64>,
        sent_at: Time,
    ) -> Self {
        Self {
            lock,
            timeout_millis,
            unlock_timeout_millis,
            sent_at,
        }
    }

    pub(crate) fn execute(&self, header: &MessageHeader, ctx: &mut ProcessorContext<'_>) {
        let outcome = ctx.replicated_mut().locks_mut().acquire(header.id, self);
        debug!(
            request_id = %header.id,
            lock = %self.lock.queue_key(),
            thread_id = self.lock.thread_id,
            read = self.lock.read_lock,
            ?outcome,
            "Executed acquire"
        );

        let result = match outcome {
            AcquireOutcome::Granted => {
                ctx.metrics().locks_granted.inc();
                Some(LockResult::Granted)
            }
            AcquireOutcome::Deadlock => {
                ctx.metrics().deadlocks_detected.inc();
                Some(LockResult::DetectedDeadlock)
            }
            AcquireOutcome::Enqueued => {
                ctx.metrics().locks_enqueued.inc();
                (self.timeout_millis == Some(0)).then_some(LockResult::WaitExpired)
            }
        };

        if let Some(result) = result {
            if ctx.is_local(&header.sender) {
                ctx.respond(header, Response::success(header.id, ResponsePayload::Lock(result)));
            }
        }
    }
}

/// Request to release a lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseLockRequest {
    pub lock: LockRequest,
    /// Set for a forced unlock: only an owner whose unlock deadline equals
    /// this value is released, along with all its holds.
    pub forced_deadline: Option<Time>,
    /// Sender's clock when the request was posted.
    pub sent_at: Time,
}

impl ReleaseLockRequest {
    pub fn new(lock: LockRequest, sent_at: Time) -> Self {
        Self {
            lock,
            forced_deadline: None,
            sent_at,
        }
    }

    /// A forced release of an owner past its unlock deadline.
    pub fn forced(lock: LockRequest, deadline: Time, sent_at: Time) -> Self {
        Self {
            lock,
            forced_deadline: Some(deadline),
            sent_at,
        }
    }

    pub(crate) fn execute(&self, header: &MessageHeader, ctx: &mut ProcessorContext<'_>) {
        let outcome = ctx.replicated_mut().locks_mut().release(self);
        let result = match outcome {
            ReleaseOutcome::Broken => {
                if self.forced_deadline.is_none() {
                    ctx.metrics().broken_locks.inc();
                }
                UnlockResult::Broken
            }
            ReleaseOutcome::Released { granted } => {
                if self.forced_deadline.is_some() {
                    ctx.metrics().forced_unlocks.inc();
                    info!(
                        lock = %self.lock.queue_key(),
                        owner = %self.lock.owner_address,
                        thread_id = self.lock.thread_id,
                        "Forced unlock after unlock timeout"
                    );
                }
                respond_granted(ctx, granted);
                UnlockResult::Released
            }
        };

        if header.response_required && ctx.is_local(&header.sender) {
            ctx.respond(header, Response::success(header.id, ResponsePayload::Unlock(result)));
        }
    }
}

/// Request for the re-entrant hold count of an owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryCountRequest {
    pub lock: LockRequest,
}

impl EntryCountRequest {
    pub fn new(lock: LockRequest) -> Self {
        Self { lock }
    }

    pub(crate) fn execute(&self, header: &MessageHeader, ctx: &mut ProcessorContext<'_>) {
        let count = ctx.replicated().locks().entry_count(&self.lock);
        ctx.respond(header, Response::success(header.id, ResponsePayload::EntryCount(count)));
    }
}

/// Withdraws a pending acquire request whose wait expired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitForLockExpiredAnnouncement {
    pub lock: LockRequest,
    /// Message ID of the acquire request to withdraw.
    pub lock_request_id: Uuid,
    /// Sender's clock when the announcement was posted.
    pub sent_at: Time,
}

impl WaitForLockExpiredAnnouncement {
    pub fn new(lock: LockRequest, lock_request_id: Uuid, sent_at: Time) -> Self {
        Self {
            lock,
            lock_request_id,
            sent_at,
        }
    }

    pub(crate) fn execute(&self, _header: &MessageHeader, ctx: &mut ProcessorContext<'_>) {
        let withdrawn = ctx.replicated_mut().locks_mut().withdraw(
            &self.lock,
            self.lock_request_id,
            self.sent_at,
        );

        let Some((pending, granted)) = withdrawn else {
            debug!(
                request_id = %self.lock_request_id,
                "Wait expired for a request no longer pending"
            );
            return;
        };

        if ctx.is_local(&pending.request.lock.owner_address) {
            ctx.respond_to(
                pending.request.lock.owner_address,
                Response::success(
                    pending.request_id,
                    ResponsePayload::Lock(LockResult::WaitExpired),
                ),
            );
        }
        respond_granted(ctx, granted);
    }
}

/// Answer grants of pending requests whose owner lives on this node.
pub(crate) fn respond_granted(ctx: &mut ProcessorContext<'_>, granted: Vec<PendingLock>) {
    for pending in granted {
        ctx.metrics().locks_granted.inc();
        let owner = pending.request.lock.owner_address;
        debug!(
            request_id = %pending.request_id,
            lock = %pending.request.lock.queue_key(),
            thread_id = pending.request.lock.thread_id,
            "Granted pending lock"
        );
        if ctx.is_local(&owner) {
            ctx.respond_to(
                owner,
                Response::success(pending.request_id, ResponsePayload::Lock(LockResult::Granted)),
            );
        }
    }
}
