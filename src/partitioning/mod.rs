//! Partitioning of the key space into buckets and buckets onto nodes.
//!
//! Keys hash into a fixed number of buckets. Each bucket has an owner per
//! storage slot: slot 0 is the primary, slots 1..N are replicas.
//!
//! ```text
//! key "user:123" ──xxhash──▶ bucket 17 ──assignment──▶ storage 0: node 2
//!                                                   └─▶ storage 1: node 3
//! ```
//!
//! While a bucket is being moved its current owner reports an outbound
//! transfer; protocols treat such buckets as reconfiguring and retry them.

mod hashring;
mod ownership;

pub use hashring::{HashRing, DEFAULT_VNODES_PER_NODE};
pub use ownership::{bucket_for_key, BucketOwner, BucketOwnershipAssignment, RingBucketAssignment};
