use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Number of latency samples each stage keeps
const LATENCY_WINDOW: usize = 1000;

/// A simple percentile tracker that maintains a sliding window of measurements
#[derive(Debug, Clone)]
pub struct PercentileTracker {
    measurements: Arc<Mutex<VecDeque<u64>>>,
    window_size: usize,
}

impl PercentileTracker {
    /// Create a new percentile tracker with a specified window size
    pub fn new(window_size: usize) -> Self {
        Self {
            measurements: Arc::new(Mutex::new(VecDeque::with_capacity(window_size))),
            window_size,
        }
    }

    /// Record a measurement (in nanoseconds)
    pub fn record(&self, nanos: u64) {
        let mut measurements = self.measurements.lock();
        if measurements.len() >= self.window_size {
            measurements.pop_front();
        }
        measurements.push_back(nanos);
    }

    /// Median latency in microseconds
    pub fn p50_us(&self) -> f64 {
        self.percentile(0.50)
    }

    /// 95th percentile latency in microseconds
    pub fn p95_us(&self) -> f64 {
        self.percentile(0.95)
    }

    /// 99th percentile latency in microseconds
    pub fn p99_us(&self) -> f64 {
        self.percentile(0.99)
    }

    fn percentile(&self, p: f64) -> f64 {
        let mut sorted: Vec<_> = self.measurements.lock().iter().copied().collect();
        if sorted.is_empty() {
            return 0.0;
        }
        sorted.sort_unstable();

        let idx = ((sorted.len() as f64 * p).ceil() as usize).saturating_sub(1);
        sorted[idx] as f64 / 1000.0
    }

    /// Get the count of recorded measurements
    pub fn count(&self) -> usize {
        self.measurements.lock().len()
    }
}

/// Per-stage counters, shared between the worker thread and the manager
#[derive(Debug, Clone)]
pub struct StageMetrics {
    processed: Arc<AtomicU64>,
    failures: Arc<AtomicU64>,
    latency: PercentileTracker,
    start_time: Instant,
}

impl StageMetrics {
    pub fn new() -> Self {
        Self {
            processed: Arc::new(AtomicU64::new(0)),
            failures: Arc::new(AtomicU64::new(0)),
            latency: PercentileTracker::new(LATENCY_WINDOW),
            start_time: Instant::now(),
        }
    }

    /// Record one item handled, with the time the stage spent on it
    pub fn record(&self, elapsed: Duration) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.latency.record(elapsed.as_nanos() as u64);
    }

    /// Record a stage error
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn total_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Items per second since the stage was created
    pub fn throughput(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            0.0
        } else {
            self.total_processed() as f64 / elapsed
        }
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_processed: self.total_processed(),
            total_failures: self.total_failures(),
            throughput: self.throughput(),
            latency_p50_us: self.latency.p50_us(),
            latency_p95_us: self.latency.p95_us(),
            latency_p99_us: self.latency.p99_us(),
            elapsed: self.start_time.elapsed(),
        }
    }
}

impl Default for StageMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub total_processed: u64,
    pub total_failures: u64,
    pub throughput: f64,
    pub latency_p50_us: f64,
    pub latency_p95_us: f64,
    pub latency_p99_us: f64,
    pub elapsed: Duration,
}

impl MetricsSnapshot {
    /// Format metrics as a human-readable string
    pub fn format(&self) -> String {
        format!(
            "Processed: {}, Failures: {}, Throughput: {:.2} items/s, \
             Latency P50: {:.2}µs, P95: {:.2}µs, P99: {:.2}µs, Elapsed: {:.2}s",
            self.total_processed,
            self.total_failures,
            self.throughput,
            self.latency_p50_us,
            self.latency_p95_us,
            self.latency_p99_us,
            self.elapsed.as_secs_f64()
        )
    }
}
