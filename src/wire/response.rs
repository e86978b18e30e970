//! Responses and result codes.

use crate::types::{Binary, BucketNumber};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Outcome class of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultCode {
    /// The request was executed.
    Success,
    /// The request failed for good.
    Error,
    /// The cluster is reconfiguring; issue the request again.
    Retry,
    /// The receiver cannot serve the request right now.
    Inaccessible,
}

/// Result of a lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum LockResult {
    Granted = 0,
    WaitExpired = 1,
    DetectedDeadlock = 2,
}

/// Result of a lock release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum UnlockResult {
    Released = 0,
    Broken = 1,
}

/// Result carried by a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponsePayload {
    /// No result.
    Empty,
    /// Outcome of an acquire request.
    Lock(LockResult),
    /// Outcome of a release request.
    Unlock(UnlockResult),
    /// Re-entrant hold count.
    EntryCount(u32),
    /// Buckets the sender of a key-set announcement saw processed.
    ProcessedBuckets(BTreeSet<BucketNumber>),
    /// The bucket owner applied a key-set announcement.
    OwnerAck,
    /// Keys a subscriber asked to remove but never subscribed to.
    NotSubscribed { subscriber: u64, keys: Vec<Binary> },
    /// Error description.
    Error(String),
    /// Reason the request should be retried.
    Retry(String),
    /// The requester stopped waiting for a request that may still execute.
    TimedOut,
}

/// Response to a request, correlated by the request's message ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// ID of the request this responds to.
    pub response_to: Uuid,
    /// Outcome class.
    pub code: ResultCode,
    /// Result value.
    pub payload: ResponsePayload,
}

impl Response {
    /// Create a success response.
    pub fn success(response_to: Uuid, payload: ResponsePayload) -> Self {
        Self {
            response_to,
            code: ResultCode::Success,
            payload,
        }
    }

    /// Create an error response.
    pub fn error(response_to: Uuid, message: impl Into<String>) -> Self {
        Self {
            response_to,
            code: ResultCode::Error,
            payload: ResponsePayload::Error(message.into()),
        }
    }

    /// Create a retry response.
    pub fn retry(response_to: Uuid, reason: impl Into<String>) -> Self {
        Self {
            response_to,
            code: ResultCode::Retry,
            payload: ResponsePayload::Retry(reason.into()),
        }
    }

    /// Create the response of a request whose outcome is unknown because
    /// the requester stopped waiting. Not retryable.
    pub fn timed_out(response_to: Uuid) -> Self {
        Self {
            response_to,
            code: ResultCode::Error,
            payload: ResponsePayload::TimedOut,
        }
    }

    /// Create an inaccessible response.
    pub fn inaccessible(response_to: Uuid, reason: impl Into<String>) -> Self {
        Self {
            response_to,
            code: ResultCode::Inaccessible,
            payload: ResponsePayload::Retry(reason.into()),
        }
    }

    /// Re-address this response to another request.
    pub fn relay_to(mut self, response_to: Uuid) -> Self {
        self.response_to = response_to;
        self
    }

    /// Check whether the response reports success.
    pub fn is_success(&self) -> bool {
        self.code == ResultCode::Success
    }
}
