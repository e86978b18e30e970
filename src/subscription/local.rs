//! Subscriptions of subscribers living on this node.

use crate::subscription::subscriber::{EntryModifiedEvent, EntryModifiedSubscriber, SubscriberId};
use crate::types::Binary;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Keys a local subscriber is subscribed to, and its delivery chain.
pub struct LocalSubscription {
    keys: BTreeSet<Binary>,
    chain: Arc<dyn EntryModifiedSubscriber>,
}

impl LocalSubscription {
    pub fn keys(&self) -> &BTreeSet<Binary> {
        &self.keys
    }
}

/// Result of removing keys from a local subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemovedKeys {
    /// Keys that were subscribed and are now removed.
    pub removed: Vec<Binary>,
    /// Keys that were never subscribed.
    pub not_subscribed: Vec<Binary>,
}

/// Local subscriptions by cache and subscriber.
#[derive(Default)]
pub struct LocalSubscriptions {
    subscriptions: HashMap<(String, SubscriberId), LocalSubscription>,
}

impl LocalSubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn get(&self, cache_name: &str, subscriber: SubscriberId) -> Option<&LocalSubscription> {
        self.subscriptions.get(&(cache_name.to_string(), subscriber))
    }

    /// Add keys to a subscription, creating it with `chain` if needed.
    pub fn add<I, F>(&mut self, cache_name: &str, subscriber: SubscriberId, keys: I, chain: F)
    where
        I: IntoIterator<Item = Binary>,
        F: FnOnce() -> Arc<dyn EntryModifiedSubscriber>,
    {
        self.subscriptions
            .entry((cache_name.to_string(), subscriber))
            .or_insert_with(|| LocalSubscription {
                keys: BTreeSet::new(),
                chain: chain(),
            })
            .keys
            .extend(keys);
    }

    /// Remove keys from a subscription. An emptied subscription is dropped.
    pub fn remove<I>(&mut self, cache_name: &str, subscriber: SubscriberId, keys: I) -> RemovedKeys
    where
        I: IntoIterator<Item = Binary>,
    {
        let id = (cache_name.to_string(), subscriber);
        let mut result = RemovedKeys::default();
        let Some(subscription) = self.subscriptions.get_mut(&id) else {
            result.not_subscribed = keys.into_iter().collect();
            return result;
        };

        for key in keys {
            if subscription.keys.remove(&key) {
                result.removed.push(key);
            } else {
                result.not_subscribed.push(key);
            }
        }
        if subscription.keys.is_empty() {
            self.subscriptions.remove(&id);
        }
        result
    }

    /// Deliver events to a local subscriber. Returns false if it is not
    /// subscribed here any more.
    pub fn deliver(
        &self,
        cache_name: &str,
        subscriber: SubscriberId,
        events: Vec<EntryModifiedEvent>,
    ) -> bool {
        match self.get(cache_name, subscriber) {
            Some(subscription) => {
                subscription.chain.on_entry_modified(events);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::subscriber::EntryModifiedEventType;
    use crate::testing::RecordingSubscriber;

    fn key(name: &'static str) -> Binary {
        Binary::from_static(name.as_bytes())
    }

    #[test]
    fn test_add_merges_keys() {
        let recorder: Arc<dyn EntryModifiedSubscriber> = Arc::new(RecordingSubscriber::new());
        let mut local = LocalSubscriptions::new();
        local.add("c", 1, [key("a")], || recorder.clone());
        local.add("c", 1, [key("b"), key("a")], || recorder.clone());

        assert_eq!(local.len(), 1);
        assert_eq!(local.get("c", 1).unwrap().keys().len(), 2);
        assert!(local.get("other", 1).is_none());
    }

    #[test]
    fn test_remove_reports_missing_keys() {
        let recorder: Arc<dyn EntryModifiedSubscriber> = Arc::new(RecordingSubscriber::new());
        let mut local = LocalSubscriptions::new();
        local.add("c", 1, [key("a"), key("b")], || recorder.clone());

        let result = local.remove("c", 1, [key("a"), key("z")]);
        assert_eq!(result.removed, vec![key("a")]);
        assert_eq!(result.not_subscribed, vec![key("z")]);
        assert_eq!(local.len(), 1);

        local.remove("c", 1, [key("b")]);
        assert!(local.is_empty());

        let result = local.remove("c", 1, [key("b")]);
        assert_eq!(result.not_subscribed, vec![key("b")]);
    }

    #[test]
    fn test_deliver() {
        let recorder = Arc::new(RecordingSubscriber::new());
        let chain: Arc<dyn EntryModifiedSubscriber> = recorder.clone();
        let mut local = LocalSubscriptions::new();
        local.add("c", 1, [key("a")], || chain);

        let event = EntryModifiedEvent::new(EntryModifiedEventType::Add, key("a"));
        assert!(local.deliver("c", 1, vec![event.clone()]));
        assert!(!local.deliver("c", 2, vec![event]));
        assert_eq!(recorder.events().len(), 1);
    }
}
