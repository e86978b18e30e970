//! Addressable messages exchanged between processors.

use crate::lock::{
    AcquireLockRequest, EntryCountRequest, ReleaseLockRequest, WaitForLockExpiredAnnouncement,
};
use crate::subscription::{EntryModifiedNotificationMessage, SubscriptionAnnouncement};
use crate::types::NodeAddress;
use crate::wire::response::Response;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Addressing part of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Unique message ID; responses refer to it.
    pub id: Uuid,
    /// Node that posted the message.
    pub sender: NodeAddress,
    /// Receiving node. None means reliable multicast to every node.
    pub receiver: Option<NodeAddress>,
    /// Whether the sender waits for a response.
    pub response_required: bool,
}

/// A message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Addressing.
    pub header: MessageHeader,
    /// Content.
    pub payload: Payload,
}

/// Message content. The variant is the wireable type tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    AcquireLock(AcquireLockRequest),
    ReleaseLock(ReleaseLockRequest),
    EntryCount(EntryCountRequest),
    WaitForLockExpired(WaitForLockExpiredAnnouncement),
    Subscription(SubscriptionAnnouncement),
    EntryModifiedNotification(EntryModifiedNotificationMessage),
    Response(Response),
}

/// Stable numeric type code of a payload, for logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum WireableType {
    AcquireLock = 1,
    ReleaseLock = 2,
    EntryCount = 3,
    WaitForLockExpired = 4,
    AddSubscription = 5,
    RemoveSubscription = 6,
    EntryModifiedNotification = 7,
    Response = 8,
}

impl fmt::Display for WireableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WireableType::AcquireLock => "acquire_lock",
            WireableType::ReleaseLock => "release_lock",
            WireableType::EntryCount => "entry_count",
            WireableType::WaitForLockExpired => "wait_for_lock_expired",
            WireableType::AddSubscription => "add_subscription",
            WireableType::RemoveSubscription => "remove_subscription",
            WireableType::EntryModifiedNotification => "entry_modified_notification",
            WireableType::Response => "response",
        };
        f.write_str(name)
    }
}

impl Payload {
    /// Type code of this payload.
    pub fn wireable_type(&self) -> WireableType {
        use crate::subscription::SubscriptionAction;

        match self {
            Payload::AcquireLock(_) => WireableType::AcquireLock,
            Payload::ReleaseLock(_) => WireableType::ReleaseLock,
            Payload::EntryCount(_) => WireableType::EntryCount,
            Payload::WaitForLockExpired(_) => WireableType::WaitForLockExpired,
            Payload::Subscription(a) => match a.action {
                SubscriptionAction::Add => WireableType::AddSubscription,
                SubscriptionAction::Remove => WireableType::RemoveSubscription,
            },
            Payload::EntryModifiedNotification(_) => WireableType::EntryModifiedNotification,
            Payload::Response(_) => WireableType::Response,
        }
    }
}

impl Envelope {
    /// A request to a single node that expects a response.
    pub fn request(sender: NodeAddress, receiver: NodeAddress, payload: Payload) -> Self {
        Self {
            header: MessageHeader {
                id: Uuid::new_v4(),
                sender,
                receiver: Some(receiver),
                response_required: true,
            },
            payload,
        }
    }

    /// A request multicast to every node.
    pub fn multicast(sender: NodeAddress, payload: Payload, response_required: bool) -> Self {
        Self {
            header: MessageHeader {
                id: Uuid::new_v4(),
                sender,
                receiver: None,
                response_required,
            },
            payload,
        }
    }

    /// A one-way message to a single node.
    pub fn notification(sender: NodeAddress, receiver: NodeAddress, payload: Payload) -> Self {
        Self {
            header: MessageHeader {
                id: Uuid::new_v4(),
                sender,
                receiver: Some(receiver),
                response_required: false,
            },
            payload,
        }
    }

    /// A response sent back to the request's sender.
    pub fn response(sender: NodeAddress, receiver: NodeAddress, response: Response) -> Self {
        Self::notification(sender, receiver, Payload::Response(response))
    }

    /// Use a specific message ID.
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.header.id = id;
        self
    }

    /// Message ID.
    pub fn id(&self) -> Uuid {
        self.header.id
    }

    /// Whether the message goes to every node.
    pub fn is_multicast(&self) -> bool {
        self.header.receiver.is_none()
    }

    /// Type code of the payload.
    pub fn wireable_type(&self) -> WireableType {
        self.payload.wireable_type()
    }
}
