//! Runtime metrics
//!
//! Components report through the `MetricsSink` trait instead of package-level
//! counters. `AtomicMetrics` keeps everything in lock-free counters so the
//! sampling loop and workers never contend on a lock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// One sample taken by the memory monitor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemorySample {
    /// Bytes allocated since monitoring started
    pub allocated: u64,

    /// Current resident size of the process
    pub current: u64,

    /// Budget the invocation is allowed to use
    pub budget: u64,
}

/// Destination for runtime metrics
pub trait MetricsSink: Send + Sync {
    /// Record one memory sample
    fn record_memory(&self, sample: MemorySample);

    /// Increment a named counter
    fn incr(&self, counter: &str);
}

/// Discards everything
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_memory(&self, _sample: MemorySample) {}

    fn incr(&self, _counter: &str) {}
}

/// Lock-free counters and gauges
#[derive(Debug, Default)]
pub struct AtomicMetrics {
    counters: DashMap<String, AtomicU64>,
    allocated: AtomicU64,
    current: AtomicU64,
    peak: AtomicU64,
    samples: AtomicU64,
}

/// Point-in-time copy of `AtomicMetrics`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub allocated: u64,
    pub current: u64,
    pub peak: u64,
    pub samples: u64,
}

impl AtomicMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of a single counter
    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self
                .counters
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
                .collect(),
            allocated: self.allocated.load(Ordering::Relaxed),
            current: self.current.load(Ordering::Relaxed),
            peak: self.peak.load(Ordering::Relaxed),
            samples: self.samples.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSink for AtomicMetrics {
    fn record_memory(&self, sample: MemorySample) {
        self.allocated.store(sample.allocated, Ordering::Relaxed);
        self.current.store(sample.current, Ordering::Relaxed);
        self.peak.fetch_max(sample.current, Ordering::Relaxed);
        self.samples.fetch_add(1, Ordering::Relaxed);
    }

    fn incr(&self, counter: &str) {
        if let Some(c) = self.counters.get(counter) {
            c.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.counters
            .entry(counter.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_gauges() {
        let metrics = AtomicMetrics::new();
        metrics.incr("FINISHED");
        metrics.incr("FINISHED");
        metrics.incr("TIMED_OUT");
        metrics.record_memory(MemorySample { allocated: 10, current: 500, budget: 100 });
        metrics.record_memory(MemorySample { allocated: 20, current: 300, budget: 100 });

        assert_eq!(metrics.counter("FINISHED"), 2);
        assert_eq!(metrics.counter("REPL_FAILED"), 0);

        let snap = metrics.snapshot();
        assert_eq!(snap.counters.get("TIMED_OUT"), Some(&1));
        assert_eq!(snap.allocated, 20);
        assert_eq!(snap.current, 300);
        assert_eq!(snap.peak, 500);
        assert_eq!(snap.samples, 2);
    }
}
