//! Replicated subscription state of a cache.

use crate::processor::keyset::BucketKeys;
use crate::subscription::notification::EntryModifiedNotificationMessage;
use crate::subscription::subscriber::{
    EntryModifiedEvent, EntryModifiedEventType, EventContent, NotificationMode, SubscriberHandle,
    SubscriberId,
};
use crate::types::{Binary, BucketNumber, NodeAddress};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Description of a subscription as it travels to bucket owners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryModifiedSubscription {
    pub subscriber_id: SubscriberId,
    /// Node the subscriber lives on.
    pub subscriber_address: NodeAddress,
    pub notification_mode: NotificationMode,
    pub content: EventContent,
    pub modification_types: BTreeSet<EntryModifiedEventType>,
}

impl EntryModifiedSubscription {
    /// Describe a subscriber registered on `address`.
    pub fn for_handle(handle: &SubscriberHandle, address: NodeAddress) -> Self {
        let subscriber = handle.subscriber();
        Self {
            subscriber_id: handle.id(),
            subscriber_address: address,
            notification_mode: subscriber.notification_mode(),
            content: subscriber.event_content(),
            modification_types: subscriber.modification_types(),
        }
    }

    fn same_subscriber(&self, other: &EntryModifiedSubscription) -> bool {
        self.subscriber_id == other.subscriber_id
            && self.subscriber_address == other.subscriber_address
    }
}

/// A subscriber living on some node, as registered at a bucket key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntryModifiedSubscriber {
    pub subscription: EntryModifiedSubscription,
}

impl RemoteEntryModifiedSubscriber {
    pub fn new(subscription: EntryModifiedSubscription) -> Self {
        Self { subscription }
    }

    /// Notification carrying `event` to the subscriber's node, unless the
    /// subscriber does not want events of that type.
    pub fn notification_for(
        &self,
        cache_name: &str,
        event: &EntryModifiedEvent,
    ) -> Option<EntryModifiedNotificationMessage> {
        if !self
            .subscription
            .modification_types
            .contains(&event.event_type)
        {
            return None;
        }
        Some(EntryModifiedNotificationMessage {
            cache_name: cache_name.to_string(),
            subscriber_id: self.subscription.subscriber_id,
            events: vec![event.with_content(self.subscription.content)],
        })
    }
}

/// Subscription state of one cache, kept identical on every node.
pub trait Group: Send + fmt::Debug {
    /// Name of the cache.
    fn cache_name(&self) -> &str;

    /// Register `subscription` at every key.
    fn add_entry_event_subscription(
        &mut self,
        keys: &BucketKeys,
        subscription: &EntryModifiedSubscription,
    );

    /// Unregister `subscription` from every key.
    fn remove_entry_event_subscription(
        &mut self,
        keys: &BucketKeys,
        subscription: &EntryModifiedSubscription,
    );

    /// Subscribers registered at a key.
    fn subscribers_for(&self, bucket: BucketNumber, key: &[u8]) -> Vec<RemoteEntryModifiedSubscriber>;

    /// Drop every subscription of subscribers living on `address`.
    /// Returns the number of key registrations removed.
    fn remove_subscriber_node(&mut self, address: &NodeAddress) -> usize;

    /// Number of key registrations.
    fn subscription_count(&self) -> usize;
}

/// [`Group`] held in memory, indexed by bucket and key.
#[derive(Debug, Default)]
pub struct InMemoryGroup {
    cache_name: String,
    buckets: HashMap<BucketNumber, HashMap<Binary, Vec<RemoteEntryModifiedSubscriber>>>,
}

impl InMemoryGroup {
    pub fn new(cache_name: impl Into<String>) -> Self {
        Self {
            cache_name: cache_name.into(),
            buckets: HashMap::new(),
        }
    }
}

impl Group for InMemoryGroup {
    fn cache_name(&self) -> &str {
        &self.cache_name
    }

    fn add_entry_event_subscription(
        &mut self,
        keys: &BucketKeys,
        subscription: &EntryModifiedSubscription,
    ) {
        for (bucket, bucket_keys) in keys {
            let by_key = self.buckets.entry(*bucket).or_default();
            for key in bucket_keys {
                let subscribers = by_key.entry(key.clone()).or_default();
                match subscribers
                    .iter_mut()
                    .find(|s| s.subscription.same_subscriber(subscription))
                {
                    Some(existing) => existing.subscription = subscription.clone(),
                    None => subscribers.push(RemoteEntryModifiedSubscriber::new(subscription.clone())),
                }
            }
        }
    }

    fn remove_entry_event_subscription(
        &mut self,
        keys: &BucketKeys,
        subscription: &EntryModifiedSubscription,
    ) {
        for (bucket, bucket_keys) in keys {
            let Some(by_key) = self.buckets.get_mut(bucket) else {
                continue;
            };
            for key in bucket_keys {
                if let Some(subscribers) = by_key.get_mut(key) {
                    subscribers.retain(|s| !s.subscription.same_subscriber(subscription));
                    if subscribers.is_empty() {
                        by_key.remove(key);
                    }
                }
            }
            if by_key.is_empty() {
                self.buckets.remove(bucket);
            }
        }
    }

    fn subscribers_for(&self, bucket: BucketNumber, key: &[u8]) -> Vec<RemoteEntryModifiedSubscriber> {
        self.buckets
            .get(&bucket)
            .and_then(|by_key| by_key.get(key))
            .cloned()
            .unwrap_or_default()
    }

    fn remove_subscriber_node(&mut self, address: &NodeAddress) -> usize {
        let mut removed = 0;
        for by_key in self.buckets.values_mut() {
            for subscribers in by_key.values_mut() {
                let before = subscribers.len();
                subscribers.retain(|s| s.subscription.subscriber_address != *address);
                removed += before - subscribers.len();
            }
            by_key.retain(|_, subscribers| !subscribers.is_empty());
        }
        self.buckets.retain(|_, by_key| !by_key.is_empty());
        removed
    }

    fn subscription_count(&self) -> usize {
        self.buckets
            .values()
            .flat_map(HashMap::values)
            .map(Vec::len)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscription(id: SubscriberId, node: u64) -> EntryModifiedSubscription {
        EntryModifiedSubscription {
            subscriber_id: id,
            subscriber_address: NodeAddress::local(node),
            notification_mode: NotificationMode::Sync,
            content: EventContent::KeyAndValues,
            modification_types: BTreeSet::from([EntryModifiedEventType::Update]),
        }
    }

    fn keys(bucket: BucketNumber, names: &[&'static str]) -> BucketKeys {
        BucketKeys::from([(
            bucket,
            names.iter().map(|n| Binary::from_static(n.as_bytes())).collect(),
        )])
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut group = InMemoryGroup::new("users");
        group.add_entry_event_subscription(&keys(1, &["a", "b"]), &subscription(7, 1));
        group.add_entry_event_subscription(&keys(1, &["a"]), &subscription(7, 1));
        group.add_entry_event_subscription(&keys(1, &["a"]), &subscription(8, 1));

        assert_eq!(group.subscription_count(), 3);
        assert_eq!(group.subscribers_for(1, b"a").len(), 2);
        assert!(group.subscribers_for(2, b"a").is_empty());
    }

    #[test]
    fn test_remove() {
        let mut group = InMemoryGroup::new("users");
        group.add_entry_event_subscription(&keys(1, &["a", "b"]), &subscription(7, 1));
        group.remove_entry_event_subscription(&keys(1, &["a"]), &subscription(7, 1));

        assert!(group.subscribers_for(1, b"a").is_empty());
        assert_eq!(group.subscribers_for(1, b"b").len(), 1);
        group.remove_entry_event_subscription(&keys(1, &["b"]), &subscription(7, 1));
        assert_eq!(group.subscription_count(), 0);
    }

    #[test]
    fn test_remove_subscriber_node() {
        let mut group = InMemoryGroup::new("users");
        group.add_entry_event_subscription(&keys(1, &["a", "b"]), &subscription(7, 1));
        group.add_entry_event_subscription(&keys(1, &["a"]), &subscription(9, 2));

        assert_eq!(group.remove_subscriber_node(&NodeAddress::local(1)), 2);
        assert_eq!(group.subscription_count(), 1);
    }

    #[test]
    fn test_notification_respects_types() {
        let remote = RemoteEntryModifiedSubscriber::new(subscription(7, 1));
        let update = EntryModifiedEvent::new(EntryModifiedEventType::Update, Binary::from_static(b"a"));
        let remove = EntryModifiedEvent::new(EntryModifiedEventType::Remove, Binary::from_static(b"a"));

        let message = remote.notification_for("users", &update).unwrap();
        assert_eq!(message.subscriber_id, 7);
        assert_eq!(message.events, vec![update]);
        assert!(remote.notification_for("users", &remove).is_none());
    }
}
