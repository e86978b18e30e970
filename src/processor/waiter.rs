//! Waiters: per-request response collectors.
//!
//! A waiter is registered under the ID of the message it waits on. The
//! processor feeds it responses, node departures, timeouts and the outcomes
//! of its child waiters. Once a callback reports [`WaiterStatus::Finished`]
//! the processor removes the waiter, calls [`Waiter::finish`] and hands the
//! resulting response to the parent waiter, if there is one.
//!
//! ```text
//!  local request waiter ◀── root announcement waiter ◀── child waiter (owner A)
//!                                                    ◀── child waiter (owner B)
//! ```

use crate::processor::engine::ProcessorContext;
use crate::types::{NodeAddress, Time};
use crate::wire::Response;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

/// Delivers the final response of a top-level local request.
pub type Completion = oneshot::Sender<Response>;

/// Complete a local request. A dropped receiver means the caller gave up.
pub fn complete(completion: Completion, response: Response) {
    if completion.send(response).is_err() {
        debug!("Caller dropped before completion");
    }
}

/// Whether a waiter keeps waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaiterStatus {
    Pending,
    Finished,
}

/// Collects responses for one request.
pub trait Waiter: Send + 'static {
    /// ID of the message this waiter waits on.
    fn request_id(&self) -> Uuid;

    /// Waiter to notify when this one finishes.
    fn parent(&self) -> Option<Uuid> {
        None
    }

    /// Time after which [`Waiter::on_timeout`] fires.
    fn deadline(&self) -> Option<Time> {
        None
    }

    /// A response addressed to this waiter arrived.
    fn on_response(&mut self, response: Response, ctx: &mut ProcessorContext<'_>)
        -> WaiterStatus;

    /// A node left the cluster.
    fn on_node_left(
        &mut self,
        _address: &NodeAddress,
        _ctx: &mut ProcessorContext<'_>,
    ) -> WaiterStatus {
        WaiterStatus::Pending
    }

    /// The deadline passed.
    fn on_timeout(&mut self, _ctx: &mut ProcessorContext<'_>) -> WaiterStatus {
        WaiterStatus::Finished
    }

    /// A child waiter finished with the given response.
    fn on_child_finished(
        &mut self,
        _child: Uuid,
        outcome: Response,
        ctx: &mut ProcessorContext<'_>,
    ) -> WaiterStatus {
        self.on_response(outcome, ctx)
    }

    /// Produce the final response. For top-level waiters this also
    /// completes the caller.
    fn finish(self: Box<Self>, ctx: &mut ProcessorContext<'_>) -> Response;
}

/// Waits for a single response and relays it to its completion.
///
/// Used for requests answered by one node. A departure of that node, or
/// the deadline passing, finishes the waiter with a retry. Requests posted
/// to the ordered stream still execute after their waiter gives up, so
/// those time out with [`Response::timed_out`] instead.
pub struct ResponseWaiter {
    request_id: Uuid,
    receiver: Option<NodeAddress>,
    deadline: Option<Time>,
    ordered: bool,
    completion: Option<Completion>,
    response: Option<Response>,
}

impl ResponseWaiter {
    /// Create a waiter for a request.
    pub fn new(request_id: Uuid, completion: Completion) -> Self {
        Self {
            request_id,
            receiver: None,
            deadline: None,
            ordered: false,
            completion: Some(completion),
            response: None,
        }
    }

    /// Finish with a retry if this node leaves.
    pub fn with_receiver(mut self, receiver: NodeAddress) -> Self {
        self.receiver = Some(receiver);
        self
    }

    /// Finish with a retry at this time.
    pub fn with_deadline(mut self, deadline: Time) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// The request was multicast in total order and cannot be resent.
    pub fn ordered(mut self) -> Self {
        self.ordered = true;
        self
    }
}

impl Waiter for ResponseWaiter {
    fn request_id(&self) -> Uuid {
        self.request_id
    }

    fn deadline(&self) -> Option<Time> {
        self.deadline
    }

    fn on_response(&mut self, response: Response, _ctx: &mut ProcessorContext<'_>) -> WaiterStatus {
        self.response = Some(response);
        WaiterStatus::Finished
    }

    fn on_node_left(&mut self, address: &NodeAddress, _ctx: &mut ProcessorContext<'_>) -> WaiterStatus {
        if self.receiver.as_ref() != Some(address) {
            return WaiterStatus::Pending;
        }
        self.response = Some(Response::retry(
            self.request_id,
            format!("receiver {} left", address),
        ));
        WaiterStatus::Finished
    }

    fn on_timeout(&mut self, _ctx: &mut ProcessorContext<'_>) -> WaiterStatus {
        self.response = Some(if self.ordered {
            Response::timed_out(self.request_id)
        } else {
            Response::retry(self.request_id, "response timed out")
        });
        WaiterStatus::Finished
    }

    fn finish(mut self: Box<Self>, _ctx: &mut ProcessorContext<'_>) -> Response {
        let response = self
            .response
            .take()
            .unwrap_or_else(|| Response::error(self.request_id, "finished without response"));
        if let Some(completion) = self.completion.take() {
            complete(completion, response.clone());
        }
        response
    }
}
