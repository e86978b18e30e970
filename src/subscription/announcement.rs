//! Subscription announcements and the waiters that drive them.
//!
//! A local subscribe or unsubscribe call creates a root waiter over the
//! caller's keys. The root splits the keys by bucket owner and multicasts
//! one announcement per owner, each tracked by a child waiter. Every node
//! validates an announcement against its view of bucket ownership and
//! applies the accepted buckets to its replicated [`Group`].
//!
//! A child finishes once two acknowledgements are in: the sender's own
//! replica reports which buckets it processed, and the bucket owner
//! confirms it applied the announcement. The owner leaving the cluster
//! counts as its acknowledgement. When every child has finished the root
//! resubmits whatever buckets were rejected, against the ownership at
//! that time.
//!
//! A child that is not acknowledged within the request timeout times out,
//! and its root then answers with a retry instead of resubmitting.
//!
//! [`Group`]: crate::subscription::Group

use crate::error::Error;
use crate::processor::keyset::{self, BucketKeys, KeySet};
use crate::processor::{ProcessorContext, Waiter, WaiterStatus};
use crate::subscription::group::EntryModifiedSubscription;
use crate::types::{Binary, BucketNumber, NodeAddress, StorageNumber, Time, PRIMARY_STORAGE};
use crate::wire::{Envelope, MessageHeader, Payload, Response, ResponsePayload, ResultCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, warn};
use uuid::Uuid;

/// What an announcement does to the subscription state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionAction {
    Add,
    Remove,
}

/// Adds or removes a subscription at keys owned by one bucket owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionAnnouncement {
    pub action: SubscriptionAction,
    pub cache_name: String,
    pub storage: StorageNumber,
    /// Node the sender believed owns every bucket in `keys`.
    pub bucket_owner: NodeAddress,
    pub keys: BucketKeys,
    pub subscription: EntryModifiedSubscription,
}

impl SubscriptionAnnouncement {
    /// Same announcement for other keys and another owner.
    pub fn with_keys(&self, bucket_owner: NodeAddress, keys: BucketKeys) -> Self {
        Self {
            action: self.action,
            cache_name: self.cache_name.clone(),
            storage: self.storage,
            bucket_owner,
            keys,
            subscription: self.subscription.clone(),
        }
    }

    pub(crate) fn execute(&self, header: &MessageHeader, ctx: &mut ProcessorContext<'_>) {
        if self.keys.values().all(BTreeSet::is_empty) {
            warn!(request_id = %header.id, "Announcement without keys");
            if ctx.is_local(&header.sender) {
                ctx.respond(header, Response::error(header.id, "announcement without keys"));
            }
            return;
        }

        let validation = keyset::validate(
            self.storage,
            &self.keys,
            ctx.replicated().assignment(),
            &self.bucket_owner,
        );
        if !validation.rejected.is_empty() {
            ctx.metrics()
                .rejected_buckets
                .inc_by(validation.rejected.len() as u64);
            debug!(
                request_id = %header.id,
                owner = %self.bucket_owner,
                rejected = ?validation.rejected,
                "Rejected buckets not owned by expected owner"
            );
        }

        if !validation.to_process.is_empty() {
            let group = ctx.replicated_mut().group_mut(&self.cache_name);
            match self.action {
                SubscriptionAction::Add => {
                    group.add_entry_event_subscription(&validation.to_process, &self.subscription)
                }
                SubscriptionAction::Remove => group
                    .remove_entry_event_subscription(&validation.to_process, &self.subscription),
            }
        }

        if ctx.is_local(&header.sender) {
            let processed = validation.to_process.keys().copied().collect();
            ctx.respond(
                header,
                Response::success(header.id, ResponsePayload::ProcessedBuckets(processed)),
            );
        }
        if ctx.is_local(&self.bucket_owner) {
            ctx.respond(header, Response::success(header.id, ResponsePayload::OwnerAck));
        }
    }
}

/// Acknowledgement a child announcement waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AckRole {
    /// The sender's own replica executed the announcement.
    Sender,
    /// The bucket owner executed it, or left.
    BucketOwner,
}

/// Waits for both acknowledgements of one announcement.
pub struct SubscriptionAckWaiter {
    request_id: Uuid,
    parent: Uuid,
    bucket_owner: NodeAddress,
    deadline: Time,
    acks: BTreeSet<AckRole>,
    processed: BTreeSet<BucketNumber>,
    failure: Option<Response>,
}

impl SubscriptionAckWaiter {
    pub fn new(request_id: Uuid, parent: Uuid, bucket_owner: NodeAddress, deadline: Time) -> Self {
        Self {
            request_id,
            parent,
            bucket_owner,
            deadline,
            acks: BTreeSet::new(),
            processed: BTreeSet::new(),
            failure: None,
        }
    }

    fn status(&self) -> WaiterStatus {
        if self.acks.contains(&AckRole::Sender) && self.acks.contains(&AckRole::BucketOwner) {
            WaiterStatus::Finished
        } else {
            WaiterStatus::Pending
        }
    }
}

impl Waiter for SubscriptionAckWaiter {
    fn request_id(&self) -> Uuid {
        self.request_id
    }

    fn parent(&self) -> Option<Uuid> {
        Some(self.parent)
    }

    fn deadline(&self) -> Option<Time> {
        Some(self.deadline)
    }

    fn on_response(&mut self, response: Response, ctx: &mut ProcessorContext<'_>) -> WaiterStatus {
        if response.code != ResultCode::Success {
            self.failure = Some(response);
            return WaiterStatus::Finished;
        }

        match response.payload {
            ResponsePayload::ProcessedBuckets(buckets) => {
                if self.acks.insert(AckRole::Sender) {
                    self.processed = buckets;
                }
            }
            ResponsePayload::OwnerAck => {
                self.acks.insert(AckRole::BucketOwner);
            }
            other => {
                warn!(request_id = %self.request_id, payload = ?other, "Unexpected announcement response");
                ctx.metrics().synthesized_errors.inc();
                self.failure = Some(Response::error(
                    self.request_id,
                    format!("unexpected announcement response: {:?}", other),
                ));
                return WaiterStatus::Finished;
            }
        }
        self.status()
    }

    fn on_node_left(&mut self, address: &NodeAddress, _ctx: &mut ProcessorContext<'_>) -> WaiterStatus {
        if *address == self.bucket_owner && self.acks.insert(AckRole::BucketOwner) {
            debug!(request_id = %self.request_id, owner = %address, "Bucket owner left before acknowledging");
        }
        self.status()
    }

    fn on_timeout(&mut self, _ctx: &mut ProcessorContext<'_>) -> WaiterStatus {
        debug!(
            request_id = %self.request_id,
            owner = %self.bucket_owner,
            acks = ?self.acks,
            "Announcement not acknowledged in time"
        );
        self.failure = Some(Response::timed_out(self.request_id));
        WaiterStatus::Finished
    }

    fn finish(self: Box<Self>, _ctx: &mut ProcessorContext<'_>) -> Response {
        match self.failure {
            Some(failure) => failure.relay_to(self.request_id),
            None => Response::success(
                self.request_id,
                ResponsePayload::ProcessedBuckets(self.processed),
            ),
        }
    }
}

/// Root of a subscription announcement on the caller's node.
pub struct SubscriptionRootWaiter {
    request_id: Uuid,
    parent: Uuid,
    template: SubscriptionAnnouncement,
    pending: KeySet,
    outstanding: BTreeSet<Uuid>,
    partials: Vec<Response>,
    rounds: u32,
    timed_out: bool,
    response: Option<Response>,
}

impl SubscriptionRootWaiter {
    /// Create a root over the caller's keys, reporting to `parent`.
    pub fn new<I>(
        parent: Uuid,
        action: SubscriptionAction,
        cache_name: impl Into<String>,
        subscription: EntryModifiedSubscription,
        keys: I,
    ) -> Self
    where
        I: IntoIterator<Item = Binary>,
    {
        let owner = subscription.subscriber_address;
        Self {
            request_id: Uuid::new_v4(),
            parent,
            template: SubscriptionAnnouncement {
                action,
                cache_name: cache_name.into(),
                storage: PRIMARY_STORAGE,
                bucket_owner: owner,
                keys: BucketKeys::new(),
                subscription,
            },
            pending: KeySet::root(keys),
            outstanding: BTreeSet::new(),
            partials: Vec::new(),
            rounds: 0,
            timed_out: false,
            response: None,
        }
    }

    /// Announce at a replica storage instead of the primary.
    pub fn with_storage(mut self, storage: StorageNumber) -> Self {
        self.template.storage = storage;
        self
    }

    /// Post one announcement per owner of the pending keys.
    pub fn dispatch(&mut self, ctx: &mut ProcessorContext<'_>) -> WaiterStatus {
        let parts = self.pending.split(
            self.template.storage,
            ctx.replicated().assignment(),
            ctx.address(),
        );
        if parts.is_empty() {
            self.response = Some(Response::success(self.request_id, ResponsePayload::Empty));
            return WaiterStatus::Finished;
        }

        let deadline = ctx
            .now()
            .saturating_add(ctx.config().processor.default_request_timeout.as_millis() as Time);
        for (owner, keys) in parts {
            let announcement = self.template.with_keys(owner, keys);
            let envelope =
                Envelope::multicast(ctx.address(), Payload::Subscription(announcement), true);
            debug!(
                root = %self.request_id,
                request_id = %envelope.id(),
                owner = %owner,
                round = self.rounds,
                "Posting subscription announcement"
            );
            self.outstanding.insert(envelope.id());
            ctx.register_waiter(Box::new(SubscriptionAckWaiter::new(
                envelope.id(),
                self.request_id,
                owner,
                deadline,
            )));
            ctx.post(envelope);
            ctx.metrics().announcements_posted.inc();
        }
        WaiterStatus::Pending
    }

    fn complete_round(&mut self, ctx: &mut ProcessorContext<'_>) -> WaiterStatus {
        let partials = std::mem::take(&mut self.partials);
        if self.timed_out {
            self.response = Some(Response::retry(
                self.request_id,
                "announcement not acknowledged in time",
            ));
            return WaiterStatus::Finished;
        }
        let outcome = keyset::aggregate(&partials, (), |(), _| ());

        if let Err(Error::Remote(message)) = &outcome {
            self.response = Some(Response::error(self.request_id, message.clone()));
            return WaiterStatus::Finished;
        }
        if outcome.is_ok() && self.pending.is_empty() {
            self.response = Some(Response::success(self.request_id, ResponsePayload::Empty));
            return WaiterStatus::Finished;
        }

        if self.rounds >= ctx.config().processor.max_resubmits {
            warn!(
                root = %self.request_id,
                rounds = self.rounds,
                keys = self.pending.key_count(),
                "Giving up resubmitting announcement"
            );
            self.response = Some(Response::retry(
                self.request_id,
                "buckets kept moving while announcing",
            ));
            return WaiterStatus::Finished;
        }

        self.rounds += 1;
        ctx.metrics().announcements_resubmitted.inc();
        debug!(
            root = %self.request_id,
            round = self.rounds,
            keys = self.pending.key_count(),
            "Resubmitting rejected buckets"
        );
        self.dispatch(ctx)
    }
}

impl Waiter for SubscriptionRootWaiter {
    fn request_id(&self) -> Uuid {
        self.request_id
    }

    fn parent(&self) -> Option<Uuid> {
        Some(self.parent)
    }

    fn on_response(&mut self, response: Response, ctx: &mut ProcessorContext<'_>) -> WaiterStatus {
        warn!(root = %self.request_id, code = ?response.code, "Root announcement got a direct response");
        ctx.metrics().synthesized_errors.inc();
        self.response = Some(Response::error(
            self.request_id,
            "root announcement cannot be answered directly",
        ));
        WaiterStatus::Finished
    }

    fn on_child_finished(
        &mut self,
        child: Uuid,
        outcome: Response,
        ctx: &mut ProcessorContext<'_>,
    ) -> WaiterStatus {
        if !self.outstanding.remove(&child) {
            debug!(root = %self.request_id, child = %child, "Outcome of unknown child");
            return WaiterStatus::Pending;
        }
        match (outcome.code, &outcome.payload) {
            (ResultCode::Success, ResponsePayload::ProcessedBuckets(buckets)) => {
                self.pending.remove_processed(buckets);
            }
            (_, ResponsePayload::TimedOut) => self.timed_out = true,
            _ => {}
        }
        self.partials.push(outcome);

        if self.outstanding.is_empty() {
            self.complete_round(ctx)
        } else {
            WaiterStatus::Pending
        }
    }

    fn finish(mut self: Box<Self>, _ctx: &mut ProcessorContext<'_>) -> Response {
        self.response
            .take()
            .unwrap_or_else(|| Response::error(self.request_id, "announcement finished without outcome"))
    }
}
