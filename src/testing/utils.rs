use crate::partitioning::BucketOwnershipAssignment;
use crate::types::{Binary, BucketNumber};
use std::future::Future;
use std::time::{Duration, Instant};

/// Find a key that falls into `bucket`.
///
/// # Panics
///
/// Panics if none of the first million candidate keys does.
pub fn key_in_bucket(assignment: &dyn BucketOwnershipAssignment, bucket: BucketNumber) -> Binary {
    for i in 0..1_000_000u32 {
        let key = format!("key-{}", i);
        if assignment.bucket_of(key.as_bytes()) == bucket {
            return Binary::from(key);
        }
    }
    panic!("no key found for bucket {}", bucket);
}

/// Poll `action` until `predicate` holds or `timeout` passes.
pub async fn wait_for_result<F, Fut, T, P>(
    mut action: F,
    predicate: P,
    timeout: Duration,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = T>,
    P: Fn(&T) -> bool,
{
    let start = Instant::now();
    let interval = Duration::from_millis(20);

    while start.elapsed() < timeout {
        let result = action().await;
        if predicate(&result) {
            return Some(result);
        }
        tokio::time::sleep(interval).await;
    }
    None
}

/// Install a test log subscriber filtered by `RUST_LOG`.
#[cfg(test)]
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
