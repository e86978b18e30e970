//! Client API of the distributed lock manager.

use crate::config::RetryConfig;
use crate::error::{Error, Result};
use crate::lock::requests::LockRequest;
use crate::processor::{into_result, LocalRequest, ProcessorHandle, Retrier};
use crate::types::Binary;
use crate::wire::{LockResult, ResponsePayload, UnlockResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

/// Logical thread of control that owns locks. Holds are re-entrant per
/// identity, and every identity is distinct within a process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockOwnerIdentity {
    thread_id: u64,
    thread_name: String,
}

impl LockOwnerIdentity {
    pub fn new(thread_name: impl Into<String>) -> Self {
        Self {
            thread_id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
            thread_name: thread_name.into(),
        }
    }

    pub fn thread_id(&self) -> u64 {
        self.thread_id
    }

    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }
}

/// A named read-write lock.
#[derive(Debug, Clone)]
pub struct ReadWriteLock {
    handle: ProcessorHandle,
    retrier: Retrier,
    region: String,
    key: Binary,
    unlock_timeout: Option<Duration>,
}

impl ReadWriteLock {
    pub fn new(
        handle: ProcessorHandle,
        retry: RetryConfig,
        region: impl Into<String>,
        key: Binary,
    ) -> Self {
        Self {
            handle,
            retrier: Retrier::new(retry),
            region: region.into(),
            key,
            unlock_timeout: None,
        }
    }

    /// Force-release holds after `timeout` instead of the node default.
    pub fn with_unlock_timeout(mut self, timeout: Duration) -> Self {
        self.unlock_timeout = Some(timeout);
        self
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn key(&self) -> &Binary {
        &self.key
    }

    /// Shared side of the lock for `owner`.
    pub fn read_lock(&self, owner: &LockOwnerIdentity) -> DistributedLock {
        self.lock_for(owner, true)
    }

    /// Exclusive side of the lock for `owner`.
    pub fn write_lock(&self, owner: &LockOwnerIdentity) -> DistributedLock {
        self.lock_for(owner, false)
    }

    fn lock_for(&self, owner: &LockOwnerIdentity, read_lock: bool) -> DistributedLock {
        DistributedLock {
            handle: self.handle.clone(),
            retrier: self.retrier.clone(),
            request: LockRequest::new(
                self.region.clone(),
                self.key.clone(),
                self.handle.address(),
                owner.thread_id(),
                owner.thread_name(),
                read_lock,
            ),
            unlock_timeout: self.unlock_timeout,
        }
    }
}

/// One side of a [`ReadWriteLock`] as seen by one owner.
#[derive(Debug, Clone)]
pub struct DistributedLock {
    handle: ProcessorHandle,
    retrier: Retrier,
    request: LockRequest,
    unlock_timeout: Option<Duration>,
}

impl DistributedLock {
    pub fn request(&self) -> &LockRequest {
        &self.request
    }

    /// Wait until the lock is granted.
    pub async fn lock(&self) -> Result<()> {
        if self.acquire(None).await? {
            Ok(())
        } else {
            Err(Error::Internal(
                "wait expired for a request without timeout".to_string(),
            ))
        }
    }

    /// Take the lock only if it can be granted at once.
    pub async fn try_lock(&self) -> Result<bool> {
        self.acquire(Some(Duration::ZERO)).await
    }

    /// Take the lock if it is granted within `timeout`.
    ///
    /// Fails with [`Error::Timeout`] if the processor gives no outcome in
    /// time. The request is not resent, since the first one may still be
    /// granted.
    pub async fn try_lock_for(&self, timeout: Duration) -> Result<bool> {
        self.acquire(Some(timeout)).await
    }

    /// Release one hold. A release whose outcome does not arrive in time
    /// fails with [`Error::Timeout`] and is not resent.
    pub async fn unlock(&self) -> Result<()> {
        let this = self;
        self.retrier
            .run(move || async move {
                let response = this
                    .handle
                    .execute(LocalRequest::ReleaseLock {
                        lock: this.request.clone(),
                    })
                    .await?;
                match into_result(response)? {
                    ResponsePayload::Unlock(UnlockResult::Released) => Ok(()),
                    ResponsePayload::Unlock(UnlockResult::Broken) => Err(Error::BrokenLock {
                        region: this.request.region.clone(),
                        key: this.request.key.clone(),
                    }),
                    other => Err(Error::Remote(format!("unexpected release result: {:?}", other))),
                }
            })
            .await
    }

    /// Number of holds this owner has on this side of the lock.
    pub async fn hold_count(&self) -> Result<u32> {
        let this = self;
        self.retrier
            .run(move || async move {
                let response = this
                    .handle
                    .execute(LocalRequest::EntryCount {
                        lock: this.request.clone(),
                    })
                    .await?;
                match into_result(response)? {
                    ResponsePayload::EntryCount(count) => Ok(count),
                    other => Err(Error::Remote(format!("unexpected entry count: {:?}", other))),
                }
            })
            .await
    }

    /// Whether this owner holds this side of the lock.
    pub async fn is_held(&self) -> Result<bool> {
        Ok(self.hold_count().await? > 0)
    }

    async fn acquire(&self, timeout: Option<Duration>) -> Result<bool> {
        // A request that waits is answered by the lock manager itself;
        // only bounded waits get a local deadline on top.
        let wait = timeout.map(|t| t + self.handle.request_timeout());
        let this = self;
        self.retrier
            .run(move || async move {
                let response = this
                    .handle
                    .execute_within(
                        LocalRequest::AcquireLock {
                            lock: this.request.clone(),
                            timeout,
                            unlock_timeout: this.unlock_timeout,
                        },
                        wait,
                    )
                    .await?;
                match into_result(response)? {
                    ResponsePayload::Lock(LockResult::Granted) => Ok(true),
                    ResponsePayload::Lock(LockResult::WaitExpired) => {
                        debug!(lock = %this.request.queue_key(), "Lock wait expired");
                        Ok(false)
                    }
                    ResponsePayload::Lock(LockResult::DetectedDeadlock) => Err(Error::Deadlock {
                        region: this.request.region.clone(),
                        key: this.request.key.clone(),
                    }),
                    other => Err(Error::Remote(format!("unexpected acquire result: {:?}", other))),
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::network::LocalNetwork;
    use crate::partitioning::RingBucketAssignment;
    use crate::processor::{ClusterProcessor, ProcessorRuntime};
    use crate::types::{NodeAddress, SystemClock};
    use std::sync::Arc;

    fn single_node() -> ProcessorHandle {
        let address = NodeAddress::local(1);
        let config = NodeConfig::new(address).with_bucket_count(16);
        let assignment = Arc::new(RingBucketAssignment::with_nodes(16, 0, [address]));
        let processor = ClusterProcessor::new(config, assignment, Arc::new(SystemClock));
        let network = LocalNetwork::new();
        let (handle, _task) = ProcessorRuntime::spawn(processor, network.clone());
        network.register(handle.clone());
        handle
    }

    fn rw_lock(handle: &ProcessorHandle, key: &'static str) -> ReadWriteLock {
        let retry = RetryConfig::default().with_timeout(Duration::from_secs(2));
        ReadWriteLock::new(handle.clone(), retry, "test", Binary::from_static(key.as_bytes()))
    }

    #[test]
    fn test_identities_are_distinct() {
        let a = LockOwnerIdentity::new("worker");
        let b = LockOwnerIdentity::new("worker");
        assert_ne!(a, b);
        assert_eq!(a.thread_name(), "worker");
    }

    #[tokio::test]
    async fn test_reentrant_write_lock() {
        let handle = single_node();
        let owner = LockOwnerIdentity::new("main");
        let lock = rw_lock(&handle, "k").write_lock(&owner);

        lock.lock().await.unwrap();
        lock.lock().await.unwrap();
        assert_eq!(lock.hold_count().await.unwrap(), 2);

        lock.unlock().await.unwrap();
        assert!(lock.is_held().await.unwrap());
        lock.unlock().await.unwrap();
        assert!(!lock.is_held().await.unwrap());

        assert!(matches!(lock.unlock().await, Err(Error::BrokenLock { .. })));
    }

    #[tokio::test]
    async fn test_try_lock_fails_while_held() {
        let handle = single_node();
        let rw = rw_lock(&handle, "k");
        let first = rw.write_lock(&LockOwnerIdentity::new("first"));
        let second = rw.write_lock(&LockOwnerIdentity::new("second"));

        first.lock().await.unwrap();
        assert!(!second.try_lock().await.unwrap());
        assert!(!second
            .try_lock_for(Duration::from_millis(100))
            .await
            .unwrap());

        first.unlock().await.unwrap();
        assert!(second.try_lock().await.unwrap());
        assert_eq!(second.hold_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_waiter_is_granted_on_release() {
        let handle = single_node();
        let rw = rw_lock(&handle, "k");
        let first = rw.write_lock(&LockOwnerIdentity::new("first"));
        let second = rw.write_lock(&LockOwnerIdentity::new("second"));

        first.lock().await.unwrap();
        let waiting = tokio::spawn({
            let second = second.clone();
            async move { second.try_lock_for(Duration::from_secs(2)).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        first.unlock().await.unwrap();

        assert!(waiting.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_readers_share() {
        let handle = single_node();
        let rw = rw_lock(&handle, "k");
        let a = rw.read_lock(&LockOwnerIdentity::new("a"));
        let b = rw.read_lock(&LockOwnerIdentity::new("b"));
        let writer = rw.write_lock(&LockOwnerIdentity::new("w"));

        a.lock().await.unwrap();
        b.lock().await.unwrap();
        assert!(!writer.try_lock().await.unwrap());
    }

    #[tokio::test]
    async fn test_deadlock_is_reported() {
        let handle = single_node();
        let t1 = LockOwnerIdentity::new("t1");
        let t2 = LockOwnerIdentity::new("t2");
        let a = rw_lock(&handle, "a");
        let b = rw_lock(&handle, "b");

        a.write_lock(&t1).lock().await.unwrap();
        b.write_lock(&t2).lock().await.unwrap();

        let blocked = tokio::spawn({
            let lock = b.write_lock(&t1);
            async move { lock.lock().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let result = a.write_lock(&t2).lock().await;
        assert!(matches!(result, Err(Error::Deadlock { .. })));

        b.write_lock(&t2).unlock().await.unwrap();
        blocked.await.unwrap().unwrap();
    }
}
