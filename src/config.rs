//! Configuration types for a grid node.

use crate::error::{Error, Result};
use crate::types::NodeAddress;
use std::time::Duration;

/// Default number of buckets in the partitioned key space.
pub const DEFAULT_BUCKET_COUNT: u32 = 271;

/// Region used for cluster-wide locks.
pub const DEFAULT_LOCK_REGION: &str = "cluster";

/// Main configuration for a grid node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address of this node.
    pub address: NodeAddress,

    /// Number of buckets the key space is split into.
    pub bucket_count: u32,

    /// Message processor configuration.
    pub processor: ProcessorConfig,

    /// Distributed lock configuration.
    pub lock: LockConfig,

    /// Retry policy for client calls.
    pub retry: RetryConfig,

    /// Entry-modified subscription configuration.
    pub subscription: SubscriptionConfig,
}

impl NodeConfig {
    /// Create a new configuration for the given address.
    pub fn new(address: NodeAddress) -> Self {
        Self {
            address,
            bucket_count: DEFAULT_BUCKET_COUNT,
            processor: ProcessorConfig::default(),
            lock: LockConfig::default(),
            retry: RetryConfig::default(),
            subscription: SubscriptionConfig::default(),
        }
    }

    /// Set the number of buckets.
    pub fn with_bucket_count(mut self, bucket_count: u32) -> Self {
        self.bucket_count = bucket_count;
        self
    }

    /// Set processor configuration.
    pub fn with_processor_config(mut self, processor: ProcessorConfig) -> Self {
        self.processor = processor;
        self
    }

    /// Set lock configuration.
    pub fn with_lock_config(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    /// Set retry configuration.
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set subscription configuration.
    pub fn with_subscription_config(mut self, subscription: SubscriptionConfig) -> Self {
        self.subscription = subscription;
        self
    }

    /// Check the configuration for values the protocol cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.bucket_count == 0 {
            return Err(Error::Config("bucket_count must be positive".to_string()));
        }
        if self.lock.deadlock_search_depth == 0 {
            return Err(Error::Config(
                "deadlock_search_depth must be at least 1".to_string(),
            ));
        }
        if self.retry.initial_backoff > self.retry.max_backoff {
            return Err(Error::Config(
                "initial_backoff exceeds max_backoff".to_string(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(Error::Config("backoff multiplier below 1.0".to_string()));
        }
        if self.processor.tick_interval.is_zero() {
            return Err(Error::Config("tick_interval must be positive".to_string()));
        }
        Ok(())
    }
}

/// Message processor configuration.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Interval between timeout and forced-unlock sweeps.
    pub tick_interval: Duration,

    /// How long a client waits for one attempt of a local request.
    pub default_request_timeout: Duration,

    /// How many times a key-set announcement resubmits rejected buckets
    /// before answering RESULT_RETRY to its caller.
    pub max_resubmits: u32,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            default_request_timeout: Duration::from_secs(10),
            max_resubmits: 8,
        }
    }
}

impl ProcessorConfig {
    /// Set the tick interval.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Set the per-attempt request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.default_request_timeout = timeout;
        self
    }

    /// Set the resubmission limit.
    pub fn with_max_resubmits(mut self, max: u32) -> Self {
        self.max_resubmits = max;
        self
    }
}

/// Distributed lock configuration.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Region used when a lock is created without an explicit one.
    pub region: String,

    /// Time after which a held lock is forcibly released.
    /// None means locks are never forcibly released.
    pub default_unlock_timeout: Option<Duration>,

    /// How many hops of the wait-for relation deadlock detection follows.
    /// 1 checks whether an owner of the requested lock waits for a lock
    /// the requester holds.
    pub deadlock_search_depth: usize,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            region: DEFAULT_LOCK_REGION.to_string(),
            default_unlock_timeout: None,
            deadlock_search_depth: 1,
        }
    }
}

impl LockConfig {
    /// Set the default lock region.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Set the unlock timeout.
    pub fn with_unlock_timeout(mut self, timeout: Duration) -> Self {
        self.default_unlock_timeout = Some(timeout);
        self
    }

    /// Set the deadlock search depth.
    pub fn with_deadlock_search_depth(mut self, depth: usize) -> Self {
        self.deadlock_search_depth = depth;
        self
    }
}

/// Retry policy for client calls.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// First backoff delay.
    pub initial_backoff: Duration,

    /// Upper bound for a single backoff delay.
    pub max_backoff: Duration,

    /// Factor applied to the delay after every attempt.
    pub multiplier: f64,

    /// Fraction of the delay randomly added or removed.
    pub jitter: f64,

    /// Total time a call may spend retrying.
    pub timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.2,
            timeout: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Set the total retry timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the backoff bounds.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Disable jitter.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }
}

/// Entry-modified subscription configuration.
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Capacity of the queue feeding an asynchronous subscriber.
    pub async_queue_capacity: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            async_queue_capacity: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::new(NodeAddress::local(1));
        assert_eq!(config.bucket_count, DEFAULT_BUCKET_COUNT);
        assert_eq!(config.lock.region, DEFAULT_LOCK_REGION);
        assert_eq!(config.lock.deadlock_search_depth, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = NodeConfig::new(NodeAddress::local(2))
            .with_bucket_count(3)
            .with_lock_config(LockConfig::default().with_deadlock_search_depth(4))
            .with_retry_config(RetryConfig::default().with_timeout(Duration::from_secs(1)));

        assert_eq!(config.bucket_count, 3);
        assert_eq!(config.lock.deadlock_search_depth, 4);
        assert_eq!(config.retry.timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = NodeConfig::new(NodeAddress::local(1)).with_bucket_count(0);
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = NodeConfig::new(NodeAddress::local(1))
            .with_lock_config(LockConfig::default().with_deadlock_search_depth(0));
        assert!(config.validate().is_err());

        let config = NodeConfig::new(NodeAddress::local(1)).with_retry_config(
            RetryConfig::default()
                .with_backoff(Duration::from_secs(5), Duration::from_secs(1)),
        );
        assert!(config.validate().is_err());
    }
}
