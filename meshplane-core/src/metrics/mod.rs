//! Metrics hook for the account store
//!
//! Engines report persistence time and advisory lock acquisition time
//! through the [`StoreMetrics`] trait. Stores accept an optional
//! `Arc<dyn StoreMetrics>`; passing `None` disables reporting.

use metrics::{describe_histogram, histogram};
use std::time::{Duration, Instant};

mod collector;

pub use collector::{MetricsCollector, MetricsSnapshot};

/// Histogram name for whole-store persistence time
pub const PERSISTENCE_DURATION: &str = "store.persistence.duration_ms";

/// Histogram name for global advisory lock acquisition time
pub const GLOBAL_LOCK_ACQUIRE: &str = "store.lock.global.acquire_ms";

/// Histogram name for per-account advisory lock acquisition time
pub const ACCOUNT_LOCK_ACQUIRE: &str = "store.lock.account.acquire_ms";

/// Receiver for timings measured inside the store
pub trait StoreMetrics: Send + Sync {
    /// Time spent writing the store to durable storage
    fn count_persistence_duration(&self, duration: Duration);

    /// Time spent waiting for the global advisory lock
    fn count_global_lock_acquisition_duration(&self, duration: Duration);

    /// Time spent waiting for a per-account advisory lock
    fn count_account_lock_acquisition_duration(&self, duration: Duration);
}

/// Register descriptions for the store histograms
pub fn init_metrics() {
    describe_histogram!(PERSISTENCE_DURATION, "Store persistence duration in milliseconds");
    describe_histogram!(GLOBAL_LOCK_ACQUIRE, "Global lock acquisition duration in milliseconds");
    describe_histogram!(ACCOUNT_LOCK_ACQUIRE, "Account lock acquisition duration in milliseconds");
}

/// Forwards store timings to whatever `metrics` recorder is installed
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsRecorder;

impl MetricsRecorder {
    pub fn new() -> Self {
        init_metrics();
        MetricsRecorder
    }
}

impl StoreMetrics for MetricsRecorder {
    fn count_persistence_duration(&self, duration: Duration) {
        histogram!(PERSISTENCE_DURATION).record(as_millis_f64(duration));
    }

    fn count_global_lock_acquisition_duration(&self, duration: Duration) {
        histogram!(GLOBAL_LOCK_ACQUIRE).record(as_millis_f64(duration));
    }

    fn count_account_lock_acquisition_duration(&self, duration: Duration) {
        histogram!(ACCOUNT_LOCK_ACQUIRE).record(as_millis_f64(duration));
    }
}

fn as_millis_f64(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Wall-clock timer for one operation
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
