//! Local subscribe and unsubscribe requests.

use crate::processor::{complete, Completion, ProcessorContext, Waiter, WaiterStatus};
use crate::subscription::announcement::{SubscriptionAction, SubscriptionRootWaiter};
use crate::subscription::group::EntryModifiedSubscription;
use crate::subscription::subscriber::{build_subscriber_chain, SubscriberHandle, SubscriberId};
use crate::types::Binary;
use crate::wire::{Response, ResponsePayload, ResultCode};
use tracing::debug;
use uuid::Uuid;

/// Subscribe a local subscriber to keys of a cache.
#[derive(Debug, Clone)]
pub struct AddEntryModifiedSubscriberRequest {
    pub cache_name: String,
    pub keys: Vec<Binary>,
    pub subscriber: SubscriberHandle,
}

impl AddEntryModifiedSubscriberRequest {
    pub fn new(cache_name: impl Into<String>, keys: Vec<Binary>, subscriber: SubscriberHandle) -> Self {
        Self {
            cache_name: cache_name.into(),
            keys,
            subscriber,
        }
    }

    pub(crate) fn start(self, id: Uuid, completion: Completion, ctx: &mut ProcessorContext<'_>) {
        let local = SubscriberRequestWaiter::new(id, completion);
        if self.keys.is_empty() {
            local.complete_now(Response::success(id, ResponsePayload::Empty), ctx);
            return;
        }

        let capacity = ctx.config().subscription.async_queue_capacity;
        let handle = &self.subscriber;
        ctx.subscriptions_mut().add(
            &self.cache_name,
            handle.id(),
            self.keys.iter().cloned(),
            || build_subscriber_chain(handle, capacity),
        );

        let subscription = EntryModifiedSubscription::for_handle(handle, ctx.address());
        debug!(
            request_id = %id,
            cache = %self.cache_name,
            subscriber = handle.id(),
            keys = self.keys.len(),
            "Adding subscriber"
        );
        let root = SubscriptionRootWaiter::new(
            id,
            SubscriptionAction::Add,
            self.cache_name,
            subscription,
            self.keys,
        );
        launch(local, root, ctx);
    }
}

/// Unsubscribe a local subscriber from keys of a cache.
#[derive(Debug, Clone)]
pub struct RemoveEntryModifiedSubscriberRequest {
    pub cache_name: String,
    pub keys: Vec<Binary>,
    pub subscriber: SubscriberHandle,
}

impl RemoveEntryModifiedSubscriberRequest {
    pub fn new(cache_name: impl Into<String>, keys: Vec<Binary>, subscriber: SubscriberHandle) -> Self {
        Self {
            cache_name: cache_name.into(),
            keys,
            subscriber,
        }
    }

    pub(crate) fn start(self, id: Uuid, completion: Completion, ctx: &mut ProcessorContext<'_>) {
        let subscriber_id = self.subscriber.id();
        let removed = ctx
            .subscriptions_mut()
            .remove(&self.cache_name, subscriber_id, self.keys);

        let mut local = SubscriberRequestWaiter::new(id, completion);
        if !removed.not_subscribed.is_empty() {
            debug!(
                request_id = %id,
                cache = %self.cache_name,
                subscriber = subscriber_id,
                keys = removed.not_subscribed.len(),
                "Keys were not subscribed"
            );
            local = local.with_not_subscribed(subscriber_id, removed.not_subscribed);
        }
        if removed.removed.is_empty() {
            local.complete_now(Response::success(id, ResponsePayload::Empty), ctx);
            return;
        }

        let subscription = EntryModifiedSubscription::for_handle(&self.subscriber, ctx.address());
        let local = local.restoring(&self.cache_name, self.subscriber, removed.removed.clone());
        let root = SubscriptionRootWaiter::new(
            id,
            SubscriptionAction::Remove,
            self.cache_name,
            subscription,
            removed.removed,
        );
        launch(local, root, ctx);
    }
}

fn launch(
    local: SubscriberRequestWaiter,
    mut root: SubscriptionRootWaiter,
    ctx: &mut ProcessorContext<'_>,
) {
    match root.dispatch(ctx) {
        WaiterStatus::Pending => {
            ctx.register_waiter(Box::new(local));
            ctx.register_waiter(Box::new(root));
        }
        WaiterStatus::Finished => {
            let response = Box::new(root).finish(ctx);
            local.complete_now(response, ctx);
        }
    }
}

/// Completes a local subscribe or unsubscribe call with the outcome of its
/// root announcement.
pub struct SubscriberRequestWaiter {
    request_id: Uuid,
    completion: Option<Completion>,
    not_subscribed: Option<(SubscriberId, Vec<Binary>)>,
    restore: Option<(String, SubscriberHandle, Vec<Binary>)>,
    response: Option<Response>,
}

impl SubscriberRequestWaiter {
    pub fn new(request_id: Uuid, completion: Completion) -> Self {
        Self {
            request_id,
            completion: Some(completion),
            not_subscribed: None,
            restore: None,
            response: None,
        }
    }

    /// Report keys that were never subscribed when the call succeeds.
    pub fn with_not_subscribed(mut self, subscriber: SubscriberId, keys: Vec<Binary>) -> Self {
        self.not_subscribed = Some((subscriber, keys));
        self
    }

    /// Put `keys` back into the local bookkeeping if the call fails, so a
    /// retried unsubscribe finds them again.
    pub fn restoring(mut self, cache_name: &str, subscriber: SubscriberHandle, keys: Vec<Binary>) -> Self {
        self.restore = Some((cache_name.to_string(), subscriber, keys));
        self
    }

    fn outcome(&mut self, response: Response, ctx: &mut ProcessorContext<'_>) -> Response {
        let response = response.relay_to(self.request_id);
        if let Some((cache_name, handle, keys)) = self.restore.take() {
            if response.code != ResultCode::Success {
                debug!(
                    request_id = %self.request_id,
                    cache = %cache_name,
                    subscriber = handle.id(),
                    "Restoring local subscription after failed removal"
                );
                let capacity = ctx.config().subscription.async_queue_capacity;
                ctx.subscriptions_mut().add(&cache_name, handle.id(), keys, || {
                    build_subscriber_chain(&handle, capacity)
                });
            }
        }
        match (response.code, self.not_subscribed.take()) {
            (ResultCode::Success, Some((subscriber, keys))) => Response::success(
                self.request_id,
                ResponsePayload::NotSubscribed { subscriber, keys },
            ),
            _ => response,
        }
    }

    /// Complete the caller without registering.
    fn complete_now(mut self, response: Response, ctx: &mut ProcessorContext<'_>) {
        let response = self.outcome(response, ctx);
        if let Some(completion) = self.completion.take() {
            complete(completion, response);
        }
    }
}

impl Waiter for SubscriberRequestWaiter {
    fn request_id(&self) -> Uuid {
        self.request_id
    }

    fn on_response(&mut self, response: Response, _ctx: &mut ProcessorContext<'_>) -> WaiterStatus {
        self.response = Some(response);
        WaiterStatus::Finished
    }

    fn finish(mut self: Box<Self>, ctx: &mut ProcessorContext<'_>) -> Response {
        let response = self
            .response
            .take()
            .unwrap_or_else(|| Response::error(self.request_id, "subscription finished without outcome"));
        let response = self.outcome(response, ctx);
        if let Some(completion) = self.completion.take() {
            complete(completion, response.clone());
        }
        response
    }
}
