//! Subscriber that records what it receives.

use crate::subscription::{
    EntryModifiedEvent, EntryModifiedEventType, EntryModifiedSubscriber, EventContent,
    NotificationMode,
};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Records every event delivered to it.
#[derive(Debug)]
pub struct RecordingSubscriber {
    events: Mutex<Vec<EntryModifiedEvent>>,
    mode: NotificationMode,
    content: EventContent,
    types: BTreeSet<EntryModifiedEventType>,
}

impl Default for RecordingSubscriber {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingSubscriber {
    /// Synchronous subscriber for every event type, with values.
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            mode: NotificationMode::Sync,
            content: EventContent::KeyAndValues,
            types: EntryModifiedEventType::all(),
        }
    }

    pub fn with_mode(mut self, mode: NotificationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_content(mut self, content: EventContent) -> Self {
        self.content = content;
        self
    }

    pub fn with_types<I>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = EntryModifiedEventType>,
    {
        self.types = types.into_iter().collect();
        self
    }

    /// Events received so far.
    pub fn events(&self) -> Vec<EntryModifiedEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until at least `count` events arrived.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.len() >= count {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(Duration::from_millis(10)).await;
        }
    }
}

impl EntryModifiedSubscriber for RecordingSubscriber {
    fn on_entry_modified(&self, events: Vec<EntryModifiedEvent>) {
        self.events.lock().extend(events);
    }

    fn notification_mode(&self) -> NotificationMode {
        self.mode
    }

    fn event_content(&self) -> EventContent {
        self.content
    }

    fn modification_types(&self) -> BTreeSet<EntryModifiedEventType> {
        self.types.clone()
    }
}
