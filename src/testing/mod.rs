//! Testing utilities for the grid.
//!
//! This module provides tools for testing the cluster protocol:
//! - A deterministic simulated cluster with delivery interception
//! - A subscriber that records the events it receives
//! - Helpers for picking keys and polling for results
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      SimulatedCluster                        │
//! │                                                              │
//! │  ┌────────────┐   ┌────────────┐   ┌────────────┐            │
//! │  │ Processor 1│   │ Processor 2│   │ Processor 3│            │
//! │  └─────┬──────┘   └─────┬──────┘   └─────┬──────┘            │
//! │        │ outbound       │                │                   │
//! │        ▼                ▼                ▼                   │
//! │  ┌───────────────────────────────────────────────────────┐   │
//! │  │   FIFO delivery queue  ──►  interceptor  ──►  receive │   │
//! │  └───────────────────────────────────────────────────────┘   │
//! │                                                              │
//! │  shared ManualClock · shared RingBucketAssignment            │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use keygrid::lock::LockRequest;
//! use keygrid::processor::LocalRequest;
//! use keygrid::testing::SimulatedCluster;
//! use keygrid::wire::{LockResult, ResponsePayload};
//!
//! let mut cluster = SimulatedCluster::new(3, 16);
//! let node = cluster.address(2);
//! let lock = LockRequest::new("orders", "o-1".into(), node, 1, "worker", false);
//!
//! let mut rx = cluster.submit(
//!     &node,
//!     LocalRequest::AcquireLock { lock, timeout: None, unlock_timeout: None },
//! );
//! cluster.run();
//!
//! let response = rx.try_recv().unwrap();
//! assert_eq!(response.payload, ResponsePayload::Lock(LockResult::Granted));
//! ```

mod cluster;
mod subscriber;
mod utils;

#[cfg(test)]
mod node_scenario_tests;

pub use cluster::{Interception, SimulatedCluster};
pub use subscriber::RecordingSubscriber;
pub use utils::{key_in_bucket, wait_for_result};

#[cfg(test)]
pub(crate) use utils::init_tracing;
