//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that resets anything (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering intentionally. These are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
pub const METRICS_NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; METRICS_NUM_BUCKETS]) -> [u64; METRICS_NUM_BUCKETS] {
    let mut result = [0u64; METRICS_NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; METRICS_NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; METRICS_NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[METRICS_NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
pub struct Metrics {
    /// Observations accepted by the normalizer (monotonic)
    observations_total: AtomicU64,
    /// Observations since last report (reset on report)
    observations_since_report: AtomicU64,
    /// Malformed observations dropped at ingestion (monotonic)
    observations_dropped: AtomicU64,
    /// Observations in the anonymous bucket that were not tracked (monotonic)
    anonymous_suppressed: AtomicU64,
    /// Sum of processing latencies in microseconds (reset on report)
    latency_sum_us: AtomicU64,
    /// Max processing latency in microseconds (reset on report)
    latency_max_us: AtomicU64,
    /// Processing latency histogram buckets (reset on report)
    latency_buckets: [AtomicU64; METRICS_NUM_BUCKETS],
    enters_total: AtomicU64,
    leaves_total: AtomicU64,
    /// Timestamps that moved backwards and were clamped
    clock_anomalies: AtomicU64,
    history_append_failures: AtomicU64,
    notifications_queued: AtomicU64,
    /// Notifications dropped because the queue was full
    notifications_dropped: AtomicU64,
    notifications_skipped: AtomicU64,
    notifications_sent: AtomicU64,
    notifications_failed: AtomicU64,
    notifications_timed_out: AtomicU64,
    /// Last report time (only accessed from reporter)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            observations_total: AtomicU64::new(0),
            observations_since_report: AtomicU64::new(0),
            observations_dropped: AtomicU64::new(0),
            anonymous_suppressed: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            latency_max_us: AtomicU64::new(0),
            latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            enters_total: AtomicU64::new(0),
            leaves_total: AtomicU64::new(0),
            clock_anomalies: AtomicU64::new(0),
            history_append_failures: AtomicU64::new(0),
            notifications_queued: AtomicU64::new(0),
            notifications_dropped: AtomicU64::new(0),
            notifications_skipped: AtomicU64::new(0),
            notifications_sent: AtomicU64::new(0),
            notifications_failed: AtomicU64::new(0),
            notifications_timed_out: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record a processed observation with its pipeline latency
    #[inline]
    pub fn record_observation_processed(&self, latency_us: u64) {
        self.observations_total.fetch_add(1, Ordering::Relaxed);
        self.observations_since_report.fetch_add(1, Ordering::Relaxed);
        self.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        update_atomic_max(&self.latency_max_us, latency_us);
        self.latency_buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_observation_dropped(&self) {
        self.observations_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_anonymous_suppressed(&self) {
        self.anonymous_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_enter(&self) {
        self.enters_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_leave(&self) {
        self.leaves_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_clock_anomaly(&self) {
        self.clock_anomalies.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_history_append_failure(&self) {
        self.history_append_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_notification_queued(&self) {
        self.notifications_queued.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_notification_dropped(&self) {
        self.notifications_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// ENTER that did not qualify for a notification
    #[inline]
    pub fn record_notification_skipped(&self) {
        self.notifications_skipped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_notification_sent(&self) {
        self.notifications_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_notification_failed(&self) {
        self.notifications_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_notification_timed_out(&self) {
        self.notifications_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observations_total(&self) -> u64 {
        self.observations_total.load(Ordering::Relaxed)
    }

    pub fn observations_dropped(&self) -> u64 {
        self.observations_dropped.load(Ordering::Relaxed)
    }

    pub fn anonymous_suppressed(&self) -> u64 {
        self.anonymous_suppressed.load(Ordering::Relaxed)
    }

    pub fn enters_total(&self) -> u64 {
        self.enters_total.load(Ordering::Relaxed)
    }

    pub fn leaves_total(&self) -> u64 {
        self.leaves_total.load(Ordering::Relaxed)
    }

    pub fn clock_anomalies(&self) -> u64 {
        self.clock_anomalies.load(Ordering::Relaxed)
    }

    pub fn history_append_failures(&self) -> u64 {
        self.history_append_failures.load(Ordering::Relaxed)
    }

    pub fn notifications_queued(&self) -> u64 {
        self.notifications_queued.load(Ordering::Relaxed)
    }

    pub fn notifications_dropped(&self) -> u64 {
        self.notifications_dropped.load(Ordering::Relaxed)
    }

    pub fn notifications_skipped(&self) -> u64 {
        self.notifications_skipped.load(Ordering::Relaxed)
    }

    pub fn notifications_sent(&self) -> u64 {
        self.notifications_sent.load(Ordering::Relaxed)
    }

    pub fn notifications_failed(&self) -> u64 {
        self.notifications_failed.load(Ordering::Relaxed)
    }

    pub fn notifications_timed_out(&self) -> u64 {
        self.notifications_timed_out.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    pub fn report(&self, devices_known: usize, devices_present: usize) -> MetricsSummary {
        let observations_count = self.observations_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.latency_sum_us.swap(0, Ordering::Relaxed);
        let max_latency = self.latency_max_us.swap(0, Ordering::Relaxed);
        let lat_buckets = swap_buckets(&self.latency_buckets);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let observations_per_sec = if elapsed.as_secs_f64() > 0.0 {
            observations_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let avg_latency = if observations_count > 0 { latency_sum / observations_count } else { 0 };

        MetricsSummary {
            observations_total: self.observations_total(),
            observations_per_sec,
            observations_dropped: self.observations_dropped(),
            anonymous_suppressed: self.anonymous_suppressed(),
            avg_process_latency_us: avg_latency,
            max_process_latency_us: max_latency,
            lat_p50_us: percentile_from_buckets(&lat_buckets, 0.50),
            lat_p99_us: percentile_from_buckets(&lat_buckets, 0.99),
            devices_known,
            devices_present,
            enters_total: self.enters_total(),
            leaves_total: self.leaves_total(),
            clock_anomalies: self.clock_anomalies(),
            history_append_failures: self.history_append_failures(),
            notifications_sent: self.notifications_sent(),
            notifications_failed: self.notifications_failed(),
            notifications_timed_out: self.notifications_timed_out(),
            notifications_dropped: self.notifications_dropped(),
        }
    }
}

/// Metrics summary for periodic logging
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub observations_total: u64,
    pub observations_per_sec: f64,
    pub observations_dropped: u64,
    pub anonymous_suppressed: u64,
    pub avg_process_latency_us: u64,
    pub max_process_latency_us: u64,
    pub lat_p50_us: u64,
    pub lat_p99_us: u64,
    pub devices_known: usize,
    pub devices_present: usize,
    pub enters_total: u64,
    pub leaves_total: u64,
    pub clock_anomalies: u64,
    pub history_append_failures: u64,
    pub notifications_sent: u64,
    pub notifications_failed: u64,
    pub notifications_timed_out: u64,
    pub notifications_dropped: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            observations_total = %self.observations_total,
            observations_per_sec = format!("{:.1}", self.observations_per_sec),
            dropped = %self.observations_dropped,
            anonymous = %self.anonymous_suppressed,
            avg_latency_us = %self.avg_process_latency_us,
            max_latency_us = %self.max_process_latency_us,
            p50_us = %self.lat_p50_us,
            p99_us = %self.lat_p99_us,
            devices_known = %self.devices_known,
            devices_present = %self.devices_present,
            enters = %self.enters_total,
            leaves = %self.leaves_total,
            clock_anomalies = %self.clock_anomalies,
            history_failures = %self.history_append_failures,
            notify_sent = %self.notifications_sent,
            notify_failed = %self.notifications_failed,
            notify_timeout = %self.notifications_timed_out,
            notify_dropped = %self.notifications_dropped,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.observations_total(), 0);
        assert_eq!(metrics.enters_total(), 0);
    }

    #[test]
    fn test_record_observation() {
        let metrics = Metrics::new();

        metrics.record_observation_processed(100);
        assert_eq!(metrics.observations_total(), 1);
        assert_eq!(metrics.latency_sum_us.load(Ordering::Relaxed), 100);

        metrics.record_observation_processed(200);
        assert_eq!(metrics.observations_total(), 2);
        assert_eq!(metrics.latency_sum_us.load(Ordering::Relaxed), 300);
        assert_eq!(metrics.latency_max_us.load(Ordering::Relaxed), 200);
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(50), 0);
        assert_eq!(bucket_index(100), 0);
        assert_eq!(bucket_index(101), 1);
        assert_eq!(bucket_index(60000), 10);
    }

    #[test]
    fn test_report_resets_periodic_counters() {
        let metrics = Metrics::new();
        metrics.record_observation_processed(150);
        metrics.record_observation_processed(250);
        metrics.record_enter();

        let summary = metrics.report(3, 1);
        assert_eq!(summary.observations_total, 2);
        assert_eq!(summary.avg_process_latency_us, 200);
        assert_eq!(summary.max_process_latency_us, 250);
        assert_eq!(summary.enters_total, 1);
        assert_eq!(summary.devices_known, 3);

        let summary = metrics.report(3, 1);
        assert_eq!(summary.observations_total, 2);
        assert_eq!(summary.avg_process_latency_us, 0);
        assert_eq!(summary.max_process_latency_us, 0);
    }

    #[test]
    fn test_percentile_empty() {
        assert_eq!(percentile_from_buckets(&[0; METRICS_NUM_BUCKETS], 0.99), 0);
    }
}
