//! Error types for the grid.

use crate::types::{Binary, NodeAddress};
use std::io;
use thiserror::Error;

/// Result type alias for grid operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the grid.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The cluster is reconfiguring; the operation should be issued again.
    #[error("retry: {reason}")]
    Retry { reason: String },

    /// Granting the lock would have created a deadlock.
    #[error("deadlock detected acquiring lock {key:?} in region {region}")]
    Deadlock { region: String, key: Binary },

    /// The lock was not held by the caller when it tried to release it.
    #[error("broken lock {key:?} in region {region}")]
    BrokenLock { region: String, key: Binary },

    /// Some keys were not subscribed by the subscriber.
    #[error("subscriber {subscriber} is not subscribed to {} key(s)", keys.len())]
    NotSubscribed { subscriber: u64, keys: Vec<Binary> },

    /// A remote node answered with an error.
    #[error("remote error: {0}")]
    Remote(String),

    /// Network communication errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// The processor is shutting down.
    #[error("processor shut down")]
    Shutdown,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a retry error.
    pub fn retry(reason: impl Into<String>) -> Self {
        Error::Retry {
            reason: reason.into(),
        }
    }

    /// Whether the operation may succeed if issued again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Retry { .. })
    }
}

/// Network communication errors.
#[derive(Error, Debug, Clone)]
pub enum NetworkError {
    /// Connection failed.
    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: NodeAddress, reason: String },

    /// Connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// No route to the receiver.
    #[error("unknown receiver: {0}")]
    UnknownReceiver(NodeAddress),

    /// Failed to send message.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Failed to receive message.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(String),
}

impl From<io::Error> for NetworkError {
    fn from(e: io::Error) -> Self {
        NetworkError::Io(e.to_string())
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Network(e.into())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Network(NetworkError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(Error::retry("rebalancing").is_retryable());
        assert!(!Error::Timeout.is_retryable());
    }

    #[test]
    fn test_not_subscribed_display() {
        let err = Error::NotSubscribed {
            subscriber: 7,
            keys: vec![Binary::from_static(b"a"), Binary::from_static(b"b")],
        };
        assert_eq!(err.to_string(), "subscriber 7 is not subscribed to 2 key(s)");
    }
}
