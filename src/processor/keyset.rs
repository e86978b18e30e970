//! Key sets for announcements that carry keys spread over many buckets.
//!
//! A root key set holds every key the caller passed, unbucketed. The first
//! split buckets the keys and groups them by the current owner of each
//! bucket; one child announcement goes to each owner. An owner validates
//! the buckets it receives and processes only the ones it really owns;
//! the rest are rejected and the root resubmits them against the new
//! ownership.

use crate::error::{Error, Result};
use crate::partitioning::BucketOwnershipAssignment;
use crate::types::{Binary, BucketNumber, NodeAddress, StorageNumber, PRIMARY_STORAGE};
use crate::wire::{Response, ResultCode};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Bucket under which a root key set keeps its keys before the first split.
pub const ROOT_BUCKET: BucketNumber = 0;

/// Keys grouped by bucket.
pub type BucketKeys = BTreeMap<BucketNumber, BTreeSet<Binary>>;

/// Keys an announcement still has to get processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySet {
    root: bool,
    bucketed: bool,
    buckets: BucketKeys,
}

impl KeySet {
    /// A root key set over caller-provided keys.
    pub fn root<I>(keys: I) -> Self
    where
        I: IntoIterator<Item = Binary>,
    {
        let keys: BTreeSet<Binary> = keys.into_iter().collect();
        let mut buckets = BucketKeys::new();
        if !keys.is_empty() {
            buckets.insert(ROOT_BUCKET, keys);
        }
        Self {
            root: true,
            bucketed: false,
            buckets,
        }
    }

    /// A non-root key set over already bucketed keys.
    pub fn from_buckets(buckets: BucketKeys) -> Self {
        Self {
            root: false,
            bucketed: true,
            buckets,
        }
    }

    /// Whether this is the caller-side root set.
    pub fn is_root(&self) -> bool {
        self.root
    }

    /// Whether no keys are left.
    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(BTreeSet::is_empty)
    }

    /// Number of keys left.
    pub fn key_count(&self) -> usize {
        self.buckets.values().map(BTreeSet::len).sum()
    }

    /// Keys by bucket. Before the first split a root set has everything
    /// under [`ROOT_BUCKET`].
    pub fn buckets(&self) -> &BucketKeys {
        &self.buckets
    }

    /// Group the remaining keys by the current owner of their bucket.
    ///
    /// At the primary storage an unassigned bucket goes to `local`, whose
    /// validation rejects it so the root retries instead of losing the
    /// keys. At replica storages unassigned buckets are dropped.
    pub fn split(
        &mut self,
        storage: StorageNumber,
        assignment: &dyn BucketOwnershipAssignment,
        local: NodeAddress,
    ) -> BTreeMap<NodeAddress, BucketKeys> {
        if !self.bucketed {
            self.bucketize(assignment);
        }

        let mut by_owner: BTreeMap<NodeAddress, BucketKeys> = BTreeMap::new();
        let mut dropped = Vec::new();
        for (bucket, keys) in &self.buckets {
            if keys.is_empty() {
                continue;
            }
            let owner = match assignment.bucket_owner_address(storage, *bucket) {
                Some(owner) => owner,
                None if storage == PRIMARY_STORAGE => local,
                None => {
                    dropped.push(*bucket);
                    continue;
                }
            };
            by_owner
                .entry(owner)
                .or_default()
                .insert(*bucket, keys.clone());
        }

        for bucket in dropped {
            debug!(bucket, storage, "Dropping unassigned replica bucket");
            self.buckets.remove(&bucket);
        }
        by_owner
    }

    /// Remove buckets that were processed.
    pub fn remove_processed(&mut self, buckets: &BTreeSet<BucketNumber>) {
        self.buckets.retain(|bucket, _| !buckets.contains(bucket));
    }

    fn bucketize(&mut self, assignment: &dyn BucketOwnershipAssignment) {
        let keys = std::mem::take(&mut self.buckets);
        for key in keys.into_values().flatten() {
            self.buckets
                .entry(assignment.bucket_of(&key))
                .or_default()
                .insert(key);
        }
        self.bucketed = true;
    }
}

/// Result of validating an announcement's buckets at a replica.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validation {
    /// Buckets the expected owner does not own, or is moving away.
    pub rejected: BTreeSet<BucketNumber>,
    /// Buckets and keys to process.
    pub to_process: BucketKeys,
}

/// Split buckets into those `expected_owner` currently owns at `storage`
/// and is not transferring, and the rejected rest.
pub fn validate(
    storage: StorageNumber,
    buckets: &BucketKeys,
    assignment: &dyn BucketOwnershipAssignment,
    expected_owner: &NodeAddress,
) -> Validation {
    let mut validation = Validation::default();
    for (bucket, keys) in buckets {
        let accepted = match assignment.bucket_owner(storage, *bucket) {
            Some(owner) => owner.address() == *expected_owner && !owner.is_reconfiguring(*bucket),
            None => false,
        };
        if accepted {
            validation.to_process.insert(*bucket, keys.clone());
        } else {
            validation.rejected.insert(*bucket);
        }
    }
    validation
}

/// Fold partial responses into one result.
///
/// The first error response fails the whole aggregation. Any retry or
/// inaccessible response turns it into [`Error::Retry`]. Success responses
/// are folded in order.
pub fn aggregate<'a, I, A, F>(responses: I, init: A, mut fold: F) -> Result<A>
where
    I: IntoIterator<Item = &'a Response>,
    F: FnMut(A, &Response) -> A,
{
    let mut acc = init;
    let mut retry = None;
    for response in responses {
        match response.code {
            ResultCode::Success => acc = fold(acc, response),
            ResultCode::Error => {
                return Err(Error::Remote(describe(response)));
            }
            ResultCode::Retry | ResultCode::Inaccessible => {
                retry.get_or_insert_with(|| describe(response));
            }
        }
    }
    match retry {
        Some(reason) => Err(Error::retry(reason)),
        None => Ok(acc),
    }
}

fn describe(response: &Response) -> String {
    use crate::wire::ResponsePayload;

    match &response.payload {
        ResponsePayload::Error(message) | ResponsePayload::Retry(message) => message.clone(),
        other => format!("{:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partitioning::RingBucketAssignment;
    use crate::wire::ResponsePayload;
    use uuid::Uuid;

    fn keys(names: &[&str]) -> Vec<Binary> {
        names
            .iter()
            .map(|n| Binary::copy_from_slice(n.as_bytes()))
            .collect()
    }

    fn two_node_assignment() -> RingBucketAssignment {
        let assignment = RingBucketAssignment::new(4, 1);
        for bucket in 0..4 {
            let owner = NodeAddress::local(if bucket % 2 == 0 { 1 } else { 2 });
            assignment.assign(PRIMARY_STORAGE, bucket, owner);
        }
        assignment
    }

    #[test]
    fn test_root_keeps_keys_under_root_bucket() {
        let set = KeySet::root(keys(&["a", "b", "a"]));
        assert!(set.is_root());
        assert_eq!(set.key_count(), 2);
        assert_eq!(set.buckets().keys().copied().collect::<Vec<_>>(), vec![ROOT_BUCKET]);
    }

    #[test]
    fn test_split_groups_by_owner() {
        let assignment = two_node_assignment();
        let all = keys(&["a", "b", "c", "d", "e", "f", "g", "h"]);
        let mut set = KeySet::root(all.clone());

        let parts = set.split(PRIMARY_STORAGE, &assignment, NodeAddress::local(1));
        let mut seen = 0;
        for (owner, buckets) in &parts {
            for (bucket, bucket_keys) in buckets {
                assert_eq!(assignment.bucket_owner_address(PRIMARY_STORAGE, *bucket), Some(*owner));
                for key in bucket_keys {
                    assert_eq!(assignment.bucket_of(key), *bucket);
                    seen += 1;
                }
            }
        }
        assert_eq!(seen, all.len());
        assert_eq!(set.key_count(), all.len());
    }

    #[test]
    fn test_split_unassigned_bucket() {
        let assignment = two_node_assignment();
        let local = NodeAddress::local(9);
        let key = Binary::from_static(b"orphan");
        let bucket = assignment.bucket_of(&key);
        assignment.unassign(PRIMARY_STORAGE, bucket);
        assignment.unassign(1, bucket);

        let mut primary = KeySet::root(vec![key.clone()]);
        let parts = primary.split(PRIMARY_STORAGE, &assignment, local);
        assert!(parts[&local].contains_key(&bucket));

        let mut replica = KeySet::root(vec![key]);
        let parts = replica.split(1, &assignment, local);
        assert!(parts.is_empty());
        assert!(replica.is_empty());
    }

    #[test]
    fn test_validate_rejects_foreign_and_moving_buckets() {
        let assignment = two_node_assignment();
        let owner = NodeAddress::local(1);
        let mut buckets = BucketKeys::new();
        for bucket in 0..4 {
            buckets.insert(bucket, keys(&["k"]).into_iter().collect());
        }
        assignment.begin_transfer(PRIMARY_STORAGE, 2, NodeAddress::local(2));

        let validation = validate(PRIMARY_STORAGE, &buckets, &assignment, &owner);
        assert_eq!(validation.to_process.keys().copied().collect::<Vec<_>>(), vec![0]);
        assert_eq!(
            validation.rejected.into_iter().collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn test_remove_processed() {
        let mut set = KeySet::from_buckets(BucketKeys::from([
            (1, keys(&["a"]).into_iter().collect()),
            (2, keys(&["b"]).into_iter().collect()),
        ]));
        set.remove_processed(&BTreeSet::from([1]));
        assert_eq!(set.buckets().keys().copied().collect::<Vec<_>>(), vec![2]);
        set.remove_processed(&BTreeSet::from([2]));
        assert!(set.is_empty());
    }

    #[test]
    fn test_aggregate() {
        let id = Uuid::new_v4();
        let ok = Response::success(id, ResponsePayload::ProcessedBuckets(BTreeSet::from([1, 2])));
        let retry = Response::retry(id, "moving");
        let error = Response::error(id, "bad");

        let count = aggregate([&ok, &ok], 0, |n, _| n + 1).unwrap();
        assert_eq!(count, 2);

        let err = aggregate([&ok, &retry], 0, |n, _| n + 1).unwrap_err();
        assert!(err.is_retryable());

        let err = aggregate([&retry, &error], 0, |n, _| n + 1).unwrap_err();
        assert!(matches!(err, Error::Remote(msg) if msg == "bad"));
    }
}
