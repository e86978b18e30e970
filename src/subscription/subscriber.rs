//! Public subscriber API and the adapters a subscriber is wrapped in.
//!
//! Events reach a user subscriber through a chain built at registration:
//!
//! ```text
//! notification ─▶ BinaryKeyAdapter ─▶ AsyncSubscriber ─▶ SafeSubscriber ─▶ user
//!                 (type filter,        (optional task      (panic
//!                  content stripping)   queue)              containment)
//! ```

use crate::types::Binary;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Identifier of a registered subscriber, unique within a process.
pub type SubscriberId = u64;

/// Kind of modification an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntryModifiedEventType {
    Add,
    Update,
    Remove,
    Evict,
    Expire,
}

impl EntryModifiedEventType {
    /// Every event type.
    pub fn all() -> BTreeSet<Self> {
        BTreeSet::from([
            EntryModifiedEventType::Add,
            EntryModifiedEventType::Update,
            EntryModifiedEventType::Remove,
            EntryModifiedEventType::Evict,
            EntryModifiedEventType::Expire,
        ])
    }
}

/// How a subscriber wants to be called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationMode {
    /// On the processor's thread, in event order.
    Sync,
    /// From a queue drained by a separate task.
    Async,
}

/// What an event carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventContent {
    /// The key only; values are stripped.
    Key,
    /// The key and the new and previous values.
    KeyAndValues,
}

/// A modification of a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryModifiedEvent {
    pub event_type: EntryModifiedEventType,
    pub key: Binary,
    pub new_value: Option<Binary>,
    pub previous_value: Option<Binary>,
}

impl EntryModifiedEvent {
    pub fn new(event_type: EntryModifiedEventType, key: Binary) -> Self {
        Self {
            event_type,
            key,
            new_value: None,
            previous_value: None,
        }
    }

    pub fn with_new_value(mut self, value: Binary) -> Self {
        self.new_value = Some(value);
        self
    }

    pub fn with_previous_value(mut self, value: Binary) -> Self {
        self.previous_value = Some(value);
        self
    }

    /// Copy of this event restricted to the given content.
    pub fn with_content(&self, content: EventContent) -> Self {
        match content {
            EventContent::KeyAndValues => self.clone(),
            EventContent::Key => Self::new(self.event_type, self.key.clone()),
        }
    }
}

/// Receives entry-modified events.
pub trait EntryModifiedSubscriber: Send + Sync + 'static {
    /// Called with a batch of events, in modification order.
    fn on_entry_modified(&self, events: Vec<EntryModifiedEvent>);

    /// How to be called.
    fn notification_mode(&self) -> NotificationMode {
        NotificationMode::Sync
    }

    /// What the events should carry.
    fn event_content(&self) -> EventContent {
        EventContent::KeyAndValues
    }

    /// Event types to receive.
    fn modification_types(&self) -> BTreeSet<EntryModifiedEventType> {
        EntryModifiedEventType::all()
    }
}

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

/// A subscriber registered under a stable ID.
///
/// Adding and removing subscriptions must use the same handle; two
/// handles over the same subscriber are different registrations.
#[derive(Clone)]
pub struct SubscriberHandle {
    id: SubscriberId,
    subscriber: Arc<dyn EntryModifiedSubscriber>,
}

impl SubscriberHandle {
    pub fn new(subscriber: Arc<dyn EntryModifiedSubscriber>) -> Self {
        Self {
            id: NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed),
            subscriber,
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn subscriber(&self) -> &Arc<dyn EntryModifiedSubscriber> {
        &self.subscriber
    }
}

impl fmt::Debug for SubscriberHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberHandle")
            .field("id", &self.id)
            .field("mode", &self.subscriber.notification_mode())
            .finish()
    }
}

/// Contains panics raised by the wrapped subscriber.
pub struct SafeSubscriber {
    id: SubscriberId,
    inner: Arc<dyn EntryModifiedSubscriber>,
}

impl SafeSubscriber {
    pub fn new(id: SubscriberId, inner: Arc<dyn EntryModifiedSubscriber>) -> Self {
        Self { id, inner }
    }
}

impl EntryModifiedSubscriber for SafeSubscriber {
    fn on_entry_modified(&self, events: Vec<EntryModifiedEvent>) {
        let inner = &self.inner;
        if catch_unwind(AssertUnwindSafe(|| inner.on_entry_modified(events))).is_err() {
            warn!(subscriber = self.id, "Subscriber panicked handling events");
        }
    }
}

/// Hands events to a task that calls the wrapped subscriber.
pub struct AsyncSubscriber {
    id: SubscriberId,
    tx: mpsc::Sender<Vec<EntryModifiedEvent>>,
}

impl AsyncSubscriber {
    /// Spawn the delivery task. Without a tokio runtime there is nowhere to
    /// run it, and the subscriber is returned to be called inline.
    pub fn spawn(
        id: SubscriberId,
        inner: Arc<dyn EntryModifiedSubscriber>,
        capacity: usize,
    ) -> Arc<dyn EntryModifiedSubscriber> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(subscriber = id, "No runtime for async delivery, delivering inline");
            return inner;
        };

        let (tx, mut rx) = mpsc::channel::<Vec<EntryModifiedEvent>>(capacity.max(1));
        runtime.spawn(async move {
            while let Some(events) = rx.recv().await {
                inner.on_entry_modified(events);
            }
        });
        Arc::new(Self { id, tx })
    }
}

impl EntryModifiedSubscriber for AsyncSubscriber {
    fn on_entry_modified(&self, events: Vec<EntryModifiedEvent>) {
        if let Err(e) = self.tx.try_send(events) {
            warn!(subscriber = self.id, error = %e, "Dropping events for async subscriber");
        }
    }
}

/// Filters events by type and strips them to the requested content.
pub struct BinaryKeyAdapter {
    inner: Arc<dyn EntryModifiedSubscriber>,
    types: BTreeSet<EntryModifiedEventType>,
    content: EventContent,
}

impl BinaryKeyAdapter {
    pub fn new(
        inner: Arc<dyn EntryModifiedSubscriber>,
        types: BTreeSet<EntryModifiedEventType>,
        content: EventContent,
    ) -> Self {
        Self {
            inner,
            types,
            content,
        }
    }
}

impl EntryModifiedSubscriber for BinaryKeyAdapter {
    fn on_entry_modified(&self, events: Vec<EntryModifiedEvent>) {
        let events: Vec<_> = events
            .iter()
            .filter(|event| self.types.contains(&event.event_type))
            .map(|event| event.with_content(self.content))
            .collect();
        if !events.is_empty() {
            self.inner.on_entry_modified(events);
        }
    }
}

/// Wrap a registered subscriber in its delivery chain.
pub fn build_subscriber_chain(
    handle: &SubscriberHandle,
    async_queue_capacity: usize,
) -> Arc<dyn EntryModifiedSubscriber> {
    let user = handle.subscriber();
    let safe: Arc<dyn EntryModifiedSubscriber> =
        Arc::new(SafeSubscriber::new(handle.id(), user.clone()));

    let dispatched = match user.notification_mode() {
        NotificationMode::Sync => safe,
        NotificationMode::Async => AsyncSubscriber::spawn(handle.id(), safe, async_queue_capacity),
    };

    Arc::new(BinaryKeyAdapter::new(
        dispatched,
        user.modification_types(),
        user.event_content(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSubscriber;
    use std::time::Duration;

    struct Panicking;

    impl EntryModifiedSubscriber for Panicking {
        fn on_entry_modified(&self, _events: Vec<EntryModifiedEvent>) {
            panic!("subscriber failure");
        }
    }

    fn event(event_type: EntryModifiedEventType) -> EntryModifiedEvent {
        EntryModifiedEvent::new(event_type, Binary::from_static(b"k"))
            .with_new_value(Binary::from_static(b"v2"))
            .with_previous_value(Binary::from_static(b"v1"))
    }

    #[test]
    fn test_handles_are_distinct() {
        let recorder = Arc::new(RecordingSubscriber::new());
        let a = SubscriberHandle::new(recorder.clone());
        let b = SubscriberHandle::new(recorder);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
    }

    #[test]
    fn test_safe_subscriber_contains_panic() {
        let safe = SafeSubscriber::new(1, Arc::new(Panicking));
        safe.on_entry_modified(vec![event(EntryModifiedEventType::Add)]);
    }

    #[test]
    fn test_chain_filters_and_strips() {
        let recorder = Arc::new(
            RecordingSubscriber::new()
                .with_content(EventContent::Key)
                .with_types([EntryModifiedEventType::Update]),
        );
        let handle = SubscriberHandle::new(recorder.clone());
        let chain = build_subscriber_chain(&handle, 8);

        chain.on_entry_modified(vec![
            event(EntryModifiedEventType::Add),
            event(EntryModifiedEventType::Update),
        ]);

        let events = recorder.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EntryModifiedEventType::Update);
        assert_eq!(events[0].new_value, None);
        assert_eq!(events[0].previous_value, None);
    }

    #[test]
    fn test_async_without_runtime_delivers_inline() {
        let recorder = Arc::new(RecordingSubscriber::new().with_mode(NotificationMode::Async));
        let chain = build_subscriber_chain(&SubscriberHandle::new(recorder.clone()), 8);
        chain.on_entry_modified(vec![event(EntryModifiedEventType::Remove)]);
        assert_eq!(recorder.events().len(), 1);
    }

    #[tokio::test]
    async fn test_async_delivery() {
        let recorder = Arc::new(RecordingSubscriber::new().with_mode(NotificationMode::Async));
        let chain = build_subscriber_chain(&SubscriberHandle::new(recorder.clone()), 8);
        chain.on_entry_modified(vec![event(EntryModifiedEventType::Expire)]);

        let received = recorder.wait_for(1, Duration::from_secs(1)).await;
        assert!(received);
        assert_eq!(recorder.events()[0].event_type, EntryModifiedEventType::Expire);
    }
}
