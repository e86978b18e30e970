//! Entry-modified subscriptions.
//!
//! Subscribers register against keys of a cache. The registration is
//! replicated to every node through ordered announcements, so any node that
//! becomes the primary owner of a bucket already knows who to notify when
//! an entry in it changes. Events travel from the owner to the node the
//! subscriber lives on, where a local adapter chain delivers them.

pub mod announcement;
pub mod group;
pub mod local;
pub mod notification;
pub mod requests;
pub mod subscriber;

pub use announcement::{
    AckRole, SubscriptionAckWaiter, SubscriptionAction, SubscriptionAnnouncement,
    SubscriptionRootWaiter,
};
pub use group::{EntryModifiedSubscription, Group, InMemoryGroup, RemoteEntryModifiedSubscriber};
pub use local::{LocalSubscription, LocalSubscriptions, RemovedKeys};
pub use notification::EntryModifiedNotificationMessage;
pub use requests::{
    AddEntryModifiedSubscriberRequest, RemoveEntryModifiedSubscriberRequest,
    SubscriberRequestWaiter,
};
pub use subscriber::{
    build_subscriber_chain, AsyncSubscriber, BinaryKeyAdapter, EntryModifiedEvent,
    EntryModifiedEventType, EntryModifiedSubscriber, EventContent, NotificationMode,
    SafeSubscriber, SubscriberHandle, SubscriberId,
};
