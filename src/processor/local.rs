//! Requests submitted to a processor by code running on its node.

use crate::lock::{AcquireLockRequest, AcquireLockWaiter, EntryCountRequest, LockRequest, ReleaseLockRequest};
use crate::processor::engine::ProcessorContext;
use crate::processor::waiter::{Completion, ResponseWaiter};
use crate::subscription::{AddEntryModifiedSubscriberRequest, RemoveEntryModifiedSubscriberRequest};
use crate::types::Time;
use crate::wire::{Envelope, Payload};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// A request from a local caller. Its final response is delivered to the
/// completion passed to [`ClusterProcessor::submit`].
///
/// [`ClusterProcessor::submit`]: crate::processor::ClusterProcessor::submit
#[derive(Debug, Clone)]
pub enum LocalRequest {
    /// Acquire a lock. A `timeout` of None waits until granted; zero does
    /// not wait at all.
    AcquireLock {
        lock: LockRequest,
        timeout: Option<Duration>,
        unlock_timeout: Option<Duration>,
    },
    /// Release one hold of a lock.
    ReleaseLock { lock: LockRequest },
    /// Read the hold count of an owner.
    EntryCount { lock: LockRequest },
    AddSubscriber(AddEntryModifiedSubscriberRequest),
    RemoveSubscriber(RemoveEntryModifiedSubscriberRequest),
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}

fn deadline_after(now: Time, timeout: Duration) -> Time {
    now.saturating_add(millis(timeout))
}

impl LocalRequest {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            LocalRequest::AcquireLock { .. } => "acquire_lock",
            LocalRequest::ReleaseLock { .. } => "release_lock",
            LocalRequest::EntryCount { .. } => "entry_count",
            LocalRequest::AddSubscriber(_) => "add_subscriber",
            LocalRequest::RemoveSubscriber(_) => "remove_subscriber",
        }
    }

    /// Whether issuing the request a second time leaves the same state as
    /// issuing it once. Lock requests change hold counts and are not.
    pub fn is_repeatable(&self) -> bool {
        !matches!(
            self,
            LocalRequest::AcquireLock { .. } | LocalRequest::ReleaseLock { .. }
        )
    }

    /// Post the messages that carry out this request and register the
    /// waiters that complete it. `id` becomes the ID of the top-level
    /// message, so responses to it reach the top-level waiter.
    pub(crate) fn start(self, id: Uuid, completion: Completion, ctx: &mut ProcessorContext<'_>) {
        debug!(request_id = %id, kind = self.kind(), "Starting local request");
        let now = ctx.now();
        let address = ctx.address();
        let request_timeout = ctx.config().processor.default_request_timeout;

        match self {
            LocalRequest::AcquireLock {
                lock,
                timeout,
                unlock_timeout,
            } => {
                let unlock_timeout = unlock_timeout.or(ctx.config().lock.default_unlock_timeout);
                let request = AcquireLockRequest::new(
                    lock,
                    timeout.map(millis),
                    unlock_timeout.map(millis),
                    now,
                );
                let deadline = timeout
                    .filter(|t| !t.is_zero())
                    .map(|t| deadline_after(now, t));
                let envelope =
                    Envelope::multicast(address, Payload::AcquireLock(request.clone()), true)
                        .with_id(id);
                ctx.register_waiter(Box::new(AcquireLockWaiter::new(
                    id, request, deadline, completion,
                )));
                ctx.post(envelope);
            }
            LocalRequest::ReleaseLock { lock } => {
                let request = ReleaseLockRequest::new(lock, now);
                let envelope =
                    Envelope::multicast(address, Payload::ReleaseLock(request), true).with_id(id);
                ctx.register_waiter(Box::new(
                    ResponseWaiter::new(id, completion)
                        .with_deadline(deadline_after(now, request_timeout))
                        .ordered(),
                ));
                ctx.post(envelope);
            }
            LocalRequest::EntryCount { lock } => {
                let envelope = Envelope::request(
                    address,
                    address,
                    Payload::EntryCount(EntryCountRequest::new(lock)),
                )
                .with_id(id);
                ctx.register_waiter(Box::new(
                    ResponseWaiter::new(id, completion)
                        .with_deadline(deadline_after(now, request_timeout)),
                ));
                ctx.post(envelope);
            }
            LocalRequest::AddSubscriber(request) => request.start(id, completion, ctx),
            LocalRequest::RemoveSubscriber(request) => request.start(id, completion, ctx),
        }
    }
}
