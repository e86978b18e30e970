//! Waiter of an acquire request on the requester's node.

use crate::lock::requests::{AcquireLockRequest, WaitForLockExpiredAnnouncement};
use crate::processor::{complete, Completion, ProcessorContext, Waiter, WaiterStatus};
use crate::types::Time;
use crate::wire::{Envelope, LockResult, Payload, Response, ResponsePayload, ResultCode};
use tracing::{debug, warn};
use uuid::Uuid;

/// Waits for the outcome of an acquire request.
///
/// A grant or a deadlock finishes the waiter. When the wait expires, either
/// because the request asked not to wait or because the deadline passed,
/// the waiter multicasts a [`WaitForLockExpiredAnnouncement`] to withdraw
/// the pending request everywhere, and finishes on the expiry answer to
/// that withdrawal, or on a grant that won the race.
pub struct AcquireLockWaiter {
    request_id: Uuid,
    request: AcquireLockRequest,
    deadline: Option<Time>,
    withdrawing: bool,
    completion: Option<Completion>,
    response: Option<Response>,
}

impl AcquireLockWaiter {
    pub fn new(
        request_id: Uuid,
        request: AcquireLockRequest,
        deadline: Option<Time>,
        completion: Completion,
    ) -> Self {
        Self {
            request_id,
            request,
            deadline,
            withdrawing: false,
            completion: Some(completion),
            response: None,
        }
    }

    fn withdraw(&mut self, ctx: &mut ProcessorContext<'_>) {
        if self.withdrawing {
            return;
        }
        self.withdrawing = true;
        self.deadline = None;

        let announcement = WaitForLockExpiredAnnouncement::new(
            self.request.lock.clone(),
            self.request_id,
            ctx.now(),
        );
        debug!(request_id = %self.request_id, "Withdrawing expired lock request");
        ctx.post(Envelope::multicast(
            ctx.address(),
            Payload::WaitForLockExpired(announcement),
            false,
        ));
    }
}

impl Waiter for AcquireLockWaiter {
    fn request_id(&self) -> Uuid {
        self.request_id
    }

    fn deadline(&self) -> Option<Time> {
        self.deadline
    }

    fn on_response(&mut self, response: Response, ctx: &mut ProcessorContext<'_>) -> WaiterStatus {
        if response.code != ResultCode::Success {
            self.response = Some(response);
            return WaiterStatus::Finished;
        }

        match response.payload {
            ResponsePayload::Lock(LockResult::WaitExpired) if !self.withdrawing => {
                self.withdraw(ctx);
                WaiterStatus::Pending
            }
            ResponsePayload::Lock(_) => {
                self.response = Some(response);
                WaiterStatus::Finished
            }
            other => {
                warn!(request_id = %self.request_id, payload = ?other, "Unexpected response to acquire");
                ctx.metrics().synthesized_errors.inc();
                self.response = Some(Response::error(
                    self.request_id,
                    format!("unexpected response to acquire: {:?}", other),
                ));
                WaiterStatus::Finished
            }
        }
    }

    fn on_timeout(&mut self, ctx: &mut ProcessorContext<'_>) -> WaiterStatus {
        self.withdraw(ctx);
        WaiterStatus::Pending
    }

    fn finish(mut self: Box<Self>, _ctx: &mut ProcessorContext<'_>) -> Response {
        let response = self
            .response
            .take()
            .unwrap_or_else(|| Response::error(self.request_id, "acquire finished without outcome"));
        if let Some(completion) = self.completion.take() {
            complete(completion, response.clone());
        }
        response
    }
}
