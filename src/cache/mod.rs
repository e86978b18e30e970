//! Node and cache façade.
//!
//! [`CacheNode`] owns the processor task of one node and its transport.
//! [`PartitionedCache`] is the per-cache client surface: key locks and
//! entry-modified subscriptions, retried while the cluster reconfigures.

mod node;
mod partitioned;

pub use node::CacheNode;
pub use partitioned::PartitionedCache;
