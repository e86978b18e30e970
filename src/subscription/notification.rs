//! Delivery of entry-modified events to the subscriber's node.

use crate::processor::ProcessorContext;
use crate::subscription::subscriber::{EntryModifiedEvent, SubscriberId};
use crate::wire::MessageHeader;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Events for one subscriber, sent by a bucket owner to the node the
/// subscriber lives on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryModifiedNotificationMessage {
    pub cache_name: String,
    pub subscriber_id: SubscriberId,
    pub events: Vec<EntryModifiedEvent>,
}

impl EntryModifiedNotificationMessage {
    pub(crate) fn execute(&self, header: &MessageHeader, ctx: &mut ProcessorContext<'_>) {
        let delivered = ctx.subscriptions().deliver(
            &self.cache_name,
            self.subscriber_id,
            self.events.clone(),
        );
        if !delivered {
            debug!(
                cache = %self.cache_name,
                subscriber = self.subscriber_id,
                from = %header.sender,
                "Dropping notification for unknown subscriber"
            );
        }
    }
}
