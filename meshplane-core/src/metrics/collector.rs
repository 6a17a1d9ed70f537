//! In-process metrics collector

use super::StoreMetrics;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Point-in-time view of the collector counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub persistence_count: u64,
    pub persistence_total_micros: u64,
    pub global_lock_count: u64,
    pub global_lock_total_micros: u64,
    pub account_lock_count: u64,
    pub account_lock_total_micros: u64,
}

/// Aggregates store timings into atomic counters
#[derive(Debug, Default)]
pub struct MetricsCollector {
    persistence_count: AtomicU64,
    persistence_total_micros: AtomicU64,
    global_lock_count: AtomicU64,
    global_lock_total_micros: AtomicU64,
    account_lock_count: AtomicU64,
    account_lock_total_micros: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            persistence_count: self.persistence_count.load(Ordering::Relaxed),
            persistence_total_micros: self.persistence_total_micros.load(Ordering::Relaxed),
            global_lock_count: self.global_lock_count.load(Ordering::Relaxed),
            global_lock_total_micros: self.global_lock_total_micros.load(Ordering::Relaxed),
            account_lock_count: self.account_lock_count.load(Ordering::Relaxed),
            account_lock_total_micros: self.account_lock_total_micros.load(Ordering::Relaxed),
        }
    }
}

fn add(count: &AtomicU64, total: &AtomicU64, duration: Duration) {
    count.fetch_add(1, Ordering::Relaxed);
    total.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
}

impl StoreMetrics for MetricsCollector {
    fn count_persistence_duration(&self, duration: Duration) {
        add(&self.persistence_count, &self.persistence_total_micros, duration);
    }

    fn count_global_lock_acquisition_duration(&self, duration: Duration) {
        add(&self.global_lock_count, &self.global_lock_total_micros, duration);
    }

    fn count_account_lock_acquisition_duration(&self, duration: Duration) {
        add(&self.account_lock_count, &self.account_lock_total_micros, duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_counts() {
        let collector = MetricsCollector::new();
        collector.count_persistence_duration(Duration::from_micros(10));
        collector.count_persistence_duration(Duration::from_micros(5));
        collector.count_account_lock_acquisition_duration(Duration::from_micros(1));

        let snap = collector.snapshot();
        assert_eq!(snap.persistence_count, 2);
        assert_eq!(snap.persistence_total_micros, 15);
        assert_eq!(snap.account_lock_count, 1);
        assert_eq!(snap.global_lock_count, 0);
    }
}
