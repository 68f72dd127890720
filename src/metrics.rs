use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const LATENCY_WINDOW: usize = 1000;

/// Sliding window of per-input processing times
#[derive(Debug, Clone)]
pub struct LatencyWindow {
    samples: Arc<Mutex<VecDeque<Duration>>>,
    window_size: usize,
}

impl LatencyWindow {
    /// Create a window keeping the latest `window_size` samples
    pub fn new(window_size: usize) -> Self {
        Self {
            samples: Arc::new(Mutex::new(VecDeque::with_capacity(window_size))),
            window_size: window_size.max(1),
        }
    }

    /// Add a latency sample, evicting the oldest once the window is full
    pub fn record(&self, sample: Duration) {
        let mut samples = self.samples.lock();
        if samples.len() >= self.window_size {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    /// Nearest-rank percentile, `p` in `0.0..=1.0`
    pub fn percentile(&self, p: f64) -> Duration {
        let samples = self.samples.lock();
        if samples.is_empty() {
            return Duration::ZERO;
        }
        let mut sorted: Vec<Duration> = samples.iter().copied().collect();
        sorted.sort_unstable();
        let rank = ((sorted.len() as f64 * p).ceil() as usize).saturating_sub(1);
        sorted[rank.min(sorted.len() - 1)]
    }

    /// Get the number of samples in the window
    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    /// Check if the window holds no samples
    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }
}

/// Per-stage counters, shared between the stage task and the driver
#[derive(Debug, Clone)]
pub struct StageMetrics {
    received: Arc<AtomicU64>,
    emitted: Arc<AtomicU64>,
    latency: LatencyWindow,
    start_time: Instant,
}

impl StageMetrics {
    /// Create new stage metrics
    pub fn new() -> Self {
        Self {
            received: Arc::new(AtomicU64::new(0)),
            emitted: Arc::new(AtomicU64::new(0)),
            latency: LatencyWindow::new(LATENCY_WINDOW),
            start_time: Instant::now(),
        }
    }

    /// Record an input taken from the stage's mailbox
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an output handed to the downstream link
    pub fn record_emitted(&self) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record how long one input took, including time suspended downstream
    pub fn record_latency(&self, elapsed: Duration) {
        self.latency.record(elapsed);
    }

    /// Get total items received
    pub fn total_received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Get total items emitted
    pub fn total_emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Inputs processed per second since the stage was created
    pub fn throughput(&self) -> f64 {
        let secs = self.start_time.elapsed().as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.total_received() as f64 / secs
        }
    }

    /// Take a point-in-time snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            received: self.total_received(),
            emitted: self.total_emitted(),
            throughput: self.throughput(),
            latency_p50: self.latency.percentile(0.50),
            latency_p95: self.latency.percentile(0.95),
            latency_p99: self.latency.percentile(0.99),
            elapsed: self.start_time.elapsed(),
        }
    }
}

impl Default for StageMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of a stage's metrics
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub received: u64,
    pub emitted: u64,
    pub throughput: f64,
    pub latency_p50: Duration,
    pub latency_p95: Duration,
    pub latency_p99: Duration,
    pub elapsed: Duration,
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "received: {}, emitted: {}, throughput: {:.2} items/s, \
             latency p50: {:?}, p95: {:?}, p99: {:?}, elapsed: {:.2}s",
            self.received,
            self.emitted,
            self.throughput,
            self.latency_p50,
            self.latency_p95,
            self.latency_p99,
            self.elapsed.as_secs_f64()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_percentiles() {
        let window = LatencyWindow::new(10);
        for i in 1..=10 {
            window.record(Duration::from_micros(i));
        }
        assert_eq!(window.percentile(0.5), Duration::from_micros(5));
        assert_eq!(window.percentile(0.99), Duration::from_micros(10));
    }

    #[test]
    fn test_latency_window_slides() {
        let window = LatencyWindow::new(3);
        for i in 1..=5 {
            window.record(Duration::from_millis(i));
        }
        assert_eq!(window.len(), 3);
        assert_eq!(window.percentile(0.0), Duration::from_millis(3));
    }

    #[test]
    fn test_stage_metrics_counts() {
        let metrics = StageMetrics::new();
        for _ in 0..4 {
            metrics.record_received();
            for _ in 0..5 {
                metrics.record_emitted();
            }
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.received, 4);
        assert_eq!(snapshot.emitted, 20);
        assert_eq!(snapshot.latency_p50, Duration::ZERO);
    }
}
