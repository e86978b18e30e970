//! Client view of one partitioned cache.

use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::lock::ReadWriteLock;
use crate::processor::{into_result, LocalRequest, ProcessorHandle, Retrier};
use crate::subscription::{
    AddEntryModifiedSubscriberRequest, EntryModifiedEvent, RemoveEntryModifiedSubscriberRequest,
    SubscriberHandle,
};
use crate::types::Binary;
use tracing::debug;

/// A named cache whose keys are partitioned over the cluster's buckets.
///
/// Entry storage is out of scope here; the cache carries key locks and
/// entry-modified subscriptions. Whatever stores entries reports changes
/// with [`notify_entry_modified`](Self::notify_entry_modified).
#[derive(Debug, Clone)]
pub struct PartitionedCache {
    name: String,
    handle: ProcessorHandle,
    config: NodeConfig,
    retrier: Retrier,
}

impl PartitionedCache {
    pub(crate) fn new(name: impl Into<String>, handle: ProcessorHandle, config: NodeConfig) -> Self {
        let retrier = Retrier::new(config.retry.clone());
        Self {
            name: name.into(),
            handle,
            config,
            retrier,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscribe to changes of `keys`. Keys the subscriber already has are
    /// left alone.
    pub async fn add_event_subscriber<I, K>(&self, keys: I, subscriber: &SubscriberHandle) -> Result<()>
    where
        I: IntoIterator<Item = K>,
        K: Into<Binary>,
    {
        let keys: Vec<Binary> = keys.into_iter().map(Into::into).collect();
        let this = self;
        let keys = &keys;
        self.retrier
            .run(move || async move {
                let request = AddEntryModifiedSubscriberRequest::new(
                    this.name.clone(),
                    keys.clone(),
                    subscriber.clone(),
                );
                let response = this
                    .handle
                    .execute(LocalRequest::AddSubscriber(request))
                    .await?;
                into_result(response).map(|_| ())
            })
            .await?;
        debug!(cache = %self.name, subscriber = subscriber.id(), "Subscriber added");
        Ok(())
    }

    /// Unsubscribe from `keys`. Keys the subscriber never had are reported
    /// as [`Error::NotSubscribed`]; the others are removed regardless.
    pub async fn remove_event_subscriber<I, K>(
        &self,
        keys: I,
        subscriber: &SubscriberHandle,
    ) -> Result<()>
    where
        I: IntoIterator<Item = K>,
        K: Into<Binary>,
    {
        let keys: Vec<Binary> = keys.into_iter().map(Into::into).collect();
        let this = self;
        let keys = &keys;
        let result = self
            .retrier
            .run(move || async move {
                let request = RemoveEntryModifiedSubscriberRequest::new(
                    this.name.clone(),
                    keys.clone(),
                    subscriber.clone(),
                );
                let response = this
                    .handle
                    .execute(LocalRequest::RemoveSubscriber(request))
                    .await?;
                into_result(response).map(|_| ())
            })
            .await;

        if let Err(Error::NotSubscribed { keys, .. }) = &result {
            debug!(
                cache = %self.name,
                subscriber = subscriber.id(),
                missing = keys.len(),
                "Unsubscribed with missing keys"
            );
        }
        result
    }

    /// A lock on `key` in this cache's region.
    pub fn read_write_lock(&self, key: impl Into<Binary>) -> ReadWriteLock {
        let lock = ReadWriteLock::new(
            self.handle.clone(),
            self.config.retry.clone(),
            self.name.clone(),
            key.into(),
        );
        match self.config.lock.default_unlock_timeout {
            Some(timeout) => lock.with_unlock_timeout(timeout),
            None => lock,
        }
    }

    /// Report a change of an entry stored on this node.
    pub fn notify_entry_modified(&self, event: EntryModifiedEvent) -> Result<()> {
        self.handle.notify_entry_modified(self.name.clone(), event)
    }
}
