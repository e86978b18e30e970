//! Per-node message processor and the waiter protocol.
//!
//! Each node runs one [`ClusterProcessor`]. Requests either run locally or
//! travel to other nodes; announcements are multicast and executed by
//! every node in the same order. Responses are matched to [`Waiter`]s by
//! the ID of the message they answer.

pub mod engine;
pub mod keyset;
mod local;
mod replicated;
mod retry;
mod runtime;
mod waiter;
pub mod waiter_utils;

pub use engine::{ClusterProcessor, ProcessorContext, ProcessorState};
pub use keyset::{BucketKeys, KeySet, Validation, ROOT_BUCKET};
pub use local::LocalRequest;
pub use replicated::{GroupFactory, ReplicatedState};
pub use retry::{BackoffPolicy, Retrier};
pub use runtime::{ProcessorCommand, ProcessorHandle, ProcessorRuntime};
pub use waiter::{complete, Completion, ResponseWaiter, Waiter, WaiterStatus};
pub use waiter_utils::into_result;
