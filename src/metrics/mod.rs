//! Metrics for a node's message processor.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    ProcessorMetrics                       │
//! │  ┌───────────────────┐  ┌────────────────┐               │
//! │  │  Counters         │  │  Gauges        │               │
//! │  │ - messages by type│  │ - waiters      │               │
//! │  │ - lock outcomes   │  │ - lock queues  │               │
//! │  │ - retries, errors │  │                │               │
//! │  └───────────────────┘  └────────────────┘               │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The processor records into its metrics from its own task; readers take
//! a [`ProcessorMetricsSnapshot`] or a Prometheus text dump at any time.

mod counters;

pub use counters::{Counter, LabeledCounter};

use std::sync::atomic::{AtomicU64, Ordering};

/// Number of things currently held, with the highest number seen.
#[derive(Debug)]
pub struct Gauge {
    name: &'static str,
    help: &'static str,
    level: AtomicU64,
    peak: AtomicU64,
}

impl Gauge {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            level: AtomicU64::new(0),
            peak: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn help(&self) -> &'static str {
        self.help
    }

    /// Record the current level.
    pub fn set(&self, level: usize) {
        let level = level as u64;
        self.level.store(level, Ordering::Relaxed);
        self.peak.fetch_max(level, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.level.load(Ordering::Relaxed)
    }

    /// Highest level ever recorded.
    pub fn peak(&self) -> u64 {
        self.peak.load(Ordering::Relaxed)
    }
}

/// Metrics of one processor.
#[derive(Debug)]
pub struct ProcessorMetrics {
    /// Messages executed, by wireable type.
    pub messages_received: LabeledCounter,
    /// Messages handed to the transport.
    pub messages_sent: Counter,
    /// Responses matched to a waiter.
    pub responses_routed: Counter,
    /// Responses for which no waiter existed.
    pub late_responses: Counter,
    /// Errors synthesized for unexpected responses.
    pub synthesized_errors: Counter,
    /// Waiters that reached their deadline.
    pub waiter_timeouts: Counter,
    /// Local requests answered with a retry.
    pub retries: Counter,

    /// Locks granted.
    pub locks_granted: Counter,
    /// Lock requests that had to wait.
    pub locks_enqueued: Counter,
    /// Lock requests refused to avoid a deadlock.
    pub deadlocks_detected: Counter,
    /// Releases that found no matching owner.
    pub broken_locks: Counter,
    /// Owners released after their unlock timeout.
    pub forced_unlocks: Counter,

    /// Key-set announcements posted.
    pub announcements_posted: Counter,
    /// Key-set announcements resubmitted for rejected buckets.
    pub announcements_resubmitted: Counter,
    /// Buckets rejected by bucket validation.
    pub rejected_buckets: Counter,
    /// Entry-modified notifications sent to subscriber nodes.
    pub notifications_forwarded: Counter,

    /// Waiters currently registered.
    pub pending_waiters: Gauge,
    /// Lock queues currently held in the registry.
    pub lock_queues: Gauge,
}

impl ProcessorMetrics {
    /// Create a new metrics instance.
    pub fn new() -> Self {
        Self {
            messages_received: LabeledCounter::new(
                "grid_messages_received_total",
                "Messages executed by type",
                "type",
            ),
            messages_sent: Counter::new("grid_messages_sent_total", "Messages sent"),
            responses_routed: Counter::new(
                "grid_responses_routed_total",
                "Responses delivered to waiters",
            ),
            late_responses: Counter::new(
                "grid_late_responses_total",
                "Responses without a waiter",
            ),
            synthesized_errors: Counter::new(
                "grid_synthesized_errors_total",
                "Errors synthesized for unexpected responses",
            ),
            waiter_timeouts: Counter::new("grid_waiter_timeouts_total", "Waiter timeouts"),
            retries: Counter::new("grid_retries_total", "Local requests answered with retry"),
            locks_granted: Counter::new("grid_locks_granted_total", "Locks granted"),
            locks_enqueued: Counter::new("grid_locks_enqueued_total", "Lock requests enqueued"),
            deadlocks_detected: Counter::new(
                "grid_deadlocks_detected_total",
                "Lock requests refused due to deadlock",
            ),
            broken_locks: Counter::new("grid_broken_locks_total", "Releases of unheld locks"),
            forced_unlocks: Counter::new(
                "grid_forced_unlocks_total",
                "Owners released after unlock timeout",
            ),
            announcements_posted: Counter::new(
                "grid_announcements_posted_total",
                "Key-set announcements posted",
            ),
            announcements_resubmitted: Counter::new(
                "grid_announcements_resubmitted_total",
                "Key-set announcement rounds resubmitted",
            ),
            rejected_buckets: Counter::new(
                "grid_rejected_buckets_total",
                "Buckets rejected by validation",
            ),
            notifications_forwarded: Counter::new(
                "grid_notifications_forwarded_total",
                "Entry-modified notifications forwarded",
            ),
            pending_waiters: Gauge::new("grid_pending_waiters", "Registered waiters"),
            lock_queues: Gauge::new("grid_lock_queues", "Lock queues in the registry"),
        }
    }

    /// Get a snapshot of the current metrics.
    pub fn snapshot(&self) -> ProcessorMetricsSnapshot {
        ProcessorMetricsSnapshot {
            messages_received: self.messages_received.get_all().iter().map(|(_, v)| v).sum(),
            messages_sent: self.messages_sent.get(),
            responses_routed: self.responses_routed.get(),
            late_responses: self.late_responses.get(),
            synthesized_errors: self.synthesized_errors.get(),
            waiter_timeouts: self.waiter_timeouts.get(),
            retries: self.retries.get(),
            locks_granted: self.locks_granted.get(),
            locks_enqueued: self.locks_enqueued.get(),
            deadlocks_detected: self.deadlocks_detected.get(),
            broken_locks: self.broken_locks.get(),
            forced_unlocks: self.forced_unlocks.get(),
            announcements_posted: self.announcements_posted.get(),
            announcements_resubmitted: self.announcements_resubmitted.get(),
            rejected_buckets: self.rejected_buckets.get(),
            notifications_forwarded: self.notifications_forwarded.get(),
            pending_waiters: self.pending_waiters.get(),
            peak_pending_waiters: self.pending_waiters.peak(),
            lock_queues: self.lock_queues.get(),
        }
    }

    /// Format metrics in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        macro_rules! add_metric {
            ($kind:literal, $metric:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $metric.name(),
                    $metric.help(),
                    $metric.name(),
                    $kind,
                    $metric.name(),
                    $metric.get()
                ));
            };
        }

        output.push_str(&format!(
            "# HELP {} {}\n# TYPE {} counter\n",
            self.messages_received.name(),
            self.messages_received.help(),
            self.messages_received.name()
        ));
        for (label, value) in self.messages_received.get_all() {
            output.push_str(&format!(
                "{}{{{}=\"{}\"}} {}\n",
                self.messages_received.name(),
                self.messages_received.label_name(),
                label,
                value
            ));
        }

        add_metric!("counter", self.messages_sent);
        add_metric!("counter", self.responses_routed);
        add_metric!("counter", self.late_responses);
        add_metric!("counter", self.synthesized_errors);
        add_metric!("counter", self.waiter_timeouts);
        add_metric!("counter", self.retries);
        add_metric!("counter", self.locks_granted);
        add_metric!("counter", self.locks_enqueued);
        add_metric!("counter", self.deadlocks_detected);
        add_metric!("counter", self.broken_locks);
        add_metric!("counter", self.forced_unlocks);
        add_metric!("counter", self.announcements_posted);
        add_metric!("counter", self.announcements_resubmitted);
        add_metric!("counter", self.rejected_buckets);
        add_metric!("counter", self.notifications_forwarded);
        add_metric!("gauge", self.pending_waiters);
        add_metric!("gauge", self.lock_queues);

        output
    }
}

impl Default for ProcessorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of processor metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessorMetricsSnapshot {
    pub messages_received: u64,
    pub messages_sent: u64,
    pub responses_routed: u64,
    pub late_responses: u64,
    pub synthesized_errors: u64,
    pub waiter_timeouts: u64,
    pub retries: u64,
    pub locks_granted: u64,
    pub locks_enqueued: u64,
    pub deadlocks_detected: u64,
    pub broken_locks: u64,
    pub forced_unlocks: u64,
    pub announcements_posted: u64,
    pub announcements_resubmitted: u64,
    pub rejected_buckets: u64,
    pub notifications_forwarded: u64,
    pub pending_waiters: u64,
    pub peak_pending_waiters: u64,
    pub lock_queues: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let metrics = ProcessorMetrics::new();
        metrics.messages_received.inc("acquire_lock");
        metrics.messages_received.inc("response");
        metrics.locks_granted.inc();
        metrics.pending_waiters.set(5);
        metrics.pending_waiters.set(2);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_received, 2);
        assert_eq!(snapshot.locks_granted, 1);
        assert_eq!(snapshot.pending_waiters, 2);
        assert_eq!(snapshot.peak_pending_waiters, 5);
        assert_eq!(snapshot.broken_locks, 0);
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = ProcessorMetrics::new();
        metrics.messages_received.inc("release_lock");
        metrics.deadlocks_detected.inc();

        let output = metrics.to_prometheus();
        assert!(output.contains("grid_messages_received_total{type=\"release_lock\"} 1"));
        assert!(output.contains("# TYPE grid_deadlocks_detected_total counter"));
        assert!(output.contains("grid_deadlocks_detected_total 1"));
        assert!(output.contains("# TYPE grid_pending_waiters gauge"));
    }
}
