//! Monotonic counters, plain and labeled.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    value: AtomicU64,
}

impl Counter {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            value: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A counter partitioned by a fixed set of label values.
#[derive(Debug)]
pub struct LabeledCounter<const N: usize> {
    name: &'static str,
    label_names: [&'static str; N],
    counters: RwLock<HashMap<[String; N], AtomicU64>>,
}

impl<const N: usize> LabeledCounter<N> {
    pub fn new(name: &'static str, label_names: [&'static str; N]) -> Self {
        Self {
            name,
            label_names,
            counters: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn label_names(&self) -> &[&'static str; N] {
        &self.label_names
    }

    pub fn inc(&self, labels: [&str; N]) {
        self.inc_by(labels, 1);
    }

    pub fn inc_by(&self, labels: [&str; N], n: u64) {
        let key: [String; N] = labels.map(|s| s.to_string());

        if let Some(counter) = self.counters.read().get(&key) {
            counter.fetch_add(n, Ordering::Relaxed);
            return;
        }

        self.counters
            .write()
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, labels: [&str; N]) -> u64 {
        let key: [String; N] = labels.map(|s| s.to_string());
        self.counters
            .read()
            .get(&key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Sum over every label combination.
    pub fn total(&self) -> u64 {
        self.counters
            .read()
            .values()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }
}
