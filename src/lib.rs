//! Cluster coordination for a partitioned in-memory data grid.
//!
//! This crate provides the coordination layer of a data grid whose keys are
//! spread over a fixed number of buckets:
//! - **Distributed locks** with re-entrant read/write semantics, FIFO
//!   fairness, deadlock detection and forced unlock after a timeout
//! - **Entry-modified subscriptions** replicated on every node and
//!   notified by the owner of each key's bucket
//! - **A single-threaded message processor** per node that executes a
//!   totally ordered multicast stream and routes responses to waiters
//!
//! # Example
//!
//! ```rust,no_run
//! use keygrid::cache::CacheNode;
//! use keygrid::config::NodeConfig;
//! use keygrid::lock::LockOwnerIdentity;
//! use keygrid::network::LocalNetwork;
//! use keygrid::partitioning::RingBucketAssignment;
//! use keygrid::types::NodeAddress;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let addresses = [NodeAddress::local(1), NodeAddress::local(2)];
//!     let assignment = Arc::new(RingBucketAssignment::with_nodes(256, 0, addresses));
//!     let network = LocalNetwork::new();
//!
//!     let config = |address| NodeConfig::new(address).with_bucket_count(256);
//!
//!     let a = CacheNode::join_local(config(addresses[0]), assignment.clone(), &network)?;
//!     let b = CacheNode::join_local(config(addresses[1]), assignment, &network)?;
//!
//!     // Locks are cluster-wide: a writer on one node excludes writers on all others.
//!     let lock = a.read_write_lock("orders").write_lock(&LockOwnerIdentity::new("main"));
//!     lock.lock().await?;
//!     let other = b.read_write_lock("orders").write_lock(&LockOwnerIdentity::new("other"));
//!     assert!(!other.try_lock().await?);
//!     lock.unlock().await?;
//!
//!     a.shutdown().await;
//!     b.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │            Application Layer                │
//! └─────────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │      CacheNode / PartitionedCache           │
//! │  • read_write_lock(key)                     │
//! │  • add/remove_event_subscriber(keys)        │
//! │  • notify_entry_modified(event)             │
//! └─────────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │     ProcessorRuntime ─▶ ClusterProcessor    │
//! │  waiters · replicated state · local subs    │
//! └─────────────────────────────────────────────┘
//!                     │
//!     ┌───────────────┼───────────────┐
//!     ▼               ▼               ▼
//! ┌─────────┐   ┌──────────┐   ┌────────────┐
//! │  Lock   │   │Subscript-│   │ Transport  │
//! │Registry │   │ion Group │   │ TCP/Local  │
//! └─────────┘   └──────────┘   └────────────┘
//! ```
//!
//! # Consistency Model
//!
//! - Every node executes multicasts in the same order, so lock queues and
//!   subscription groups are identical replicas.
//! - A request is answered by the requester's own replica, except for
//!   entry counts, which are read locally.
//! - Bucket ownership is validated on execution; announcements for buckets
//!   that moved are resubmitted to the new owner.

pub mod cache;
pub mod cluster;
pub mod config;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod network;
pub mod partitioning;
pub mod processor;
pub mod subscription;
pub mod testing;
pub mod types;
pub mod wire;

// Re-export main types for convenience
pub use cache::{CacheNode, PartitionedCache};
pub use config::{LockConfig, NodeConfig, ProcessorConfig, RetryConfig, SubscriptionConfig};
pub use error::{Error, NetworkError, Result};
pub use types::{Binary, BucketNumber, Clock, ManualClock, NodeAddress, NodeId, SystemClock, Time};

// Re-export cluster types
pub use cluster::{MemberEvent, MemberEventListener};

// Re-export lock types
pub use lock::{DistributedLock, LockOwnerIdentity, ReadWriteLock};

// Re-export subscription types
pub use subscription::{
    EntryModifiedEvent, EntryModifiedEventType, EntryModifiedSubscriber, EventContent,
    NotificationMode, SubscriberHandle,
};

// Re-export partitioning types
pub use partitioning::{BucketOwnershipAssignment, HashRing, RingBucketAssignment};

// Re-export metrics types
pub use metrics::{Counter, Gauge, LabeledCounter, ProcessorMetrics, ProcessorMetricsSnapshot};

// Re-export network types
pub use network::{LocalNetwork, NetworkServer, TcpTransport, Transport};

// Re-export testing types
pub use testing::{RecordingSubscriber, SimulatedCluster};
