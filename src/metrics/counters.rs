//! Counter metrics for monotonically increasing values.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    help: &'static str,
    value: AtomicU64,
}

impl Counter {
    /// Create a new counter.
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicU64::new(0),
        }
    }

    /// Get the counter name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Get the counter help text.
    pub fn help(&self) -> &'static str {
        self.help
    }

    /// Increment the counter by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the counter by a specific amount.
    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Get the current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A counter split by one label, such as the wireable type of a message.
#[derive(Debug)]
pub struct LabeledCounter {
    name: &'static str,
    help: &'static str,
    label_name: &'static str,
    counters: RwLock<HashMap<String, AtomicU64>>,
}

impl LabeledCounter {
    /// Create a new labeled counter.
    pub fn new(name: &'static str, help: &'static str, label_name: &'static str) -> Self {
        Self {
            name,
            help,
            label_name,
            counters: RwLock::new(HashMap::new()),
        }
    }

    /// Get the counter name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Get the counter help text.
    pub fn help(&self) -> &'static str {
        self.help
    }

    /// Get the label name.
    pub fn label_name(&self) -> &'static str {
        self.label_name
    }

    /// Increment the counter for a label value.
    pub fn inc(&self, label: &str) {
        {
            let counters = self.counters.read();
            if let Some(counter) = counters.get(label) {
                counter.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        self.counters
            .write()
            .entry(label.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Get the value for a label value.
    pub fn get(&self, label: &str) -> u64 {
        self.counters
            .read()
            .get(label)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Get all values with their labels, sorted by label.
    pub fn get_all(&self) -> Vec<(String, u64)> {
        let mut all: Vec<_> = self
            .counters
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();
        all.sort();
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new("test_counter", "A test counter");
        assert_eq!(counter.get(), 0);

        counter.inc();
        counter.inc_by(5);
        assert_eq!(counter.get(), 6);
    }

    #[test]
    fn test_labeled_counter() {
        let counter = LabeledCounter::new("messages", "Messages by type", "type");

        counter.inc("acquire_lock");
        counter.inc("acquire_lock");
        counter.inc("response");

        assert_eq!(counter.get("acquire_lock"), 2);
        assert_eq!(counter.get("missing"), 0);
        assert_eq!(
            counter.get_all(),
            vec![("acquire_lock".to_string(), 2), ("response".to_string(), 1)]
        );
    }
}
