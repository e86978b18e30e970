//! Core types used throughout the grid.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Node identifier in the cluster.
pub type NodeId = u64;

/// Opaque binary key or value as it travels on the wire.
pub type Binary = Bytes;

/// Number of a bucket in the partitioned key space.
pub type BucketNumber = u32;

/// Storage slot of a bucket: 0 is the primary, 1..N are replica ordinals.
pub type StorageNumber = u32;

/// Primary storage slot.
pub const PRIMARY_STORAGE: StorageNumber = 0;

/// Point in time, in milliseconds since the Unix epoch.
pub type Time = u64;

/// Address of a cluster node.
///
/// Ordered by node ID first, so the lowest address is stable across
/// replicas and can serve as the cluster representative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddress {
    /// Unique node identifier.
    pub id: NodeId,
    /// Socket address the node's processor listens on.
    pub addr: SocketAddr,
}

impl NodeAddress {
    /// Create a new node address.
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }

    /// Loopback address for tests and single-process clusters.
    pub fn local(id: NodeId) -> Self {
        let port = 7000 + (id % 50_000) as u16;
        Self {
            id,
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}

/// Source of time for a processor.
pub trait Clock: Send + Sync + fmt::Debug + 'static {
    /// Current time in milliseconds.
    fn now(&self) -> Time;
}

/// Wall clock backed by [`SystemTime`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Time {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as Time)
            .unwrap_or(0)
    }
}

/// Manually advanced clock for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create a clock starting at the given time.
    pub fn new(start: Time) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    /// Set the clock to an absolute time.
    pub fn set(&self, now: Time) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Time {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_address_ordering() {
        let a = NodeAddress::local(1);
        let b = NodeAddress::local(2);
        assert!(a < b);
        assert_eq!(a.to_string(), "1@127.0.0.1:7001");
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1_000);
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now(), 1_250);
        clock.set(10);
        assert_eq!(clock.now(), 10);
    }
}
