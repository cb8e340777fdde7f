//! Request and inference statistics for the segmentation service.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::info;

/// Largest latency window kept in memory; older half dropped when exceeded
const LATENCY_WINDOW: usize = 10_000;

/// Metrics collector for the request pipeline
pub struct ServiceMetrics {
    /// Requests answered with an envelope
    pub requests_succeeded: AtomicU64,
    /// Requests answered with an error
    pub requests_failed: AtomicU64,
    /// Failures by error kind
    failures_by_kind: RwLock<HashMap<String, u64>>,
    /// End-to-end request times (in microseconds)
    request_times: RwLock<Vec<u64>>,
    /// Model run times (in microseconds)
    inference_times: RwLock<Vec<u64>>,
    /// Foreground fraction of returned segmentations
    foreground_buckets: RwLock<[u64; 10]>,
    /// Start time for rate calculation
    start_time: Instant,
}

fn push_window(window: &RwLock<Vec<u64>>, value: Duration) {
    if let Ok(mut times) = window.write() {
        times.push(value.as_micros() as u64);
        if times.len() > LATENCY_WINDOW {
            times.drain(0..LATENCY_WINDOW / 2);
        }
    }
}

fn latency_stats(window: &RwLock<Vec<u64>>) -> LatencyStats {
    let mut sorted = match window.read() {
        Ok(times) if !times.is_empty() => times.clone(),
        _ => return LatencyStats::default(),
    };
    sorted.sort_unstable();

    let count = sorted.len();
    let sum: u64 = sorted.iter().sum();
    let at = |q: f64| sorted[((count as f64 * q) as usize).min(count - 1)];

    LatencyStats {
        count: count as u64,
        mean_us: sum / count as u64,
        p50_us: at(0.5),
        p95_us: at(0.95),
        p99_us: at(0.99),
        max_us: sorted[count - 1],
    }
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            requests_succeeded: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            failures_by_kind: RwLock::new(HashMap::new()),
            request_times: RwLock::new(Vec::with_capacity(1000)),
            inference_times: RwLock::new(Vec::with_capacity(1000)),
            foreground_buckets: RwLock::new([0; 10]),
            start_time: Instant::now(),
        }
    }

    /// Record a request that produced an envelope
    pub fn record_success(&self, request_time: Duration, foreground_fraction: f64) {
        self.requests_succeeded.fetch_add(1, Ordering::Relaxed);
        push_window(&self.request_times, request_time);

        let bucket = (foreground_fraction.clamp(0.0, 1.0) * 10.0).min(9.0) as usize;
        if let Ok(mut buckets) = self.foreground_buckets.write() {
            buckets[bucket] += 1;
        }
    }

    /// Record a failed request by its error kind
    pub fn record_failure(&self, kind: &str) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut by_kind) = self.failures_by_kind.write() {
            *by_kind.entry(kind.to_string()).or_insert(0) += 1;
        }
    }

    pub fn record_inference(&self, duration: Duration) {
        push_window(&self.inference_times, duration);
    }

    pub fn request_stats(&self) -> LatencyStats {
        latency_stats(&self.request_times)
    }

    pub fn inference_stats(&self) -> LatencyStats {
        latency_stats(&self.inference_times)
    }

    pub fn failures_by_kind(&self) -> HashMap<String, u64> {
        self.failures_by_kind
            .read()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    pub fn foreground_distribution(&self) -> [u64; 10] {
        self.foreground_buckets.read().map(|b| *b).unwrap_or([0; 10])
    }

    /// Answered requests per second since start
    pub fn throughput(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let handled = self.requests_succeeded.load(Ordering::Relaxed)
            + self.requests_failed.load(Ordering::Relaxed);
        if elapsed > 0.0 {
            handled as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Log summary statistics
    pub fn print_summary(&self) {
        let succeeded = self.requests_succeeded.load(Ordering::Relaxed);
        let failed = self.requests_failed.load(Ordering::Relaxed);
        let requests = self.request_stats();
        let inference = self.inference_stats();

        info!(
            succeeded,
            failed,
            throughput = format!("{:.3} req/s", self.throughput()),
            "Segmentation service summary"
        );
        info!(
            mean_us = requests.mean_us,
            p50_us = requests.p50_us,
            p95_us = requests.p95_us,
            p99_us = requests.p99_us,
            max_us = requests.max_us,
            "Request latency"
        );
        info!(
            calls = inference.count,
            mean_us = inference.mean_us,
            p50_us = inference.p50_us,
            p99_us = inference.p99_us,
            "Inference latency"
        );
        for (kind, count) in &self.failures_by_kind() {
            info!(kind = %kind, count, "Failures");
        }

        let distribution = self.foreground_distribution();
        let total: u64 = distribution.iter().sum();
        if total > 0 {
            for (i, &count) in distribution.iter().enumerate() {
                let pct = count as f64 / total as f64 * 100.0;
                info!(
                    "  foreground {:.1}-{:.1}: {:>6} ({:>5.1}%) {}",
                    i as f64 / 10.0,
                    (i + 1) as f64 / 10.0,
                    count,
                    pct,
                    "█".repeat(((pct / 5.0) as usize).min(20))
                );
            }
        }
    }
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Latency statistics over the retained window
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LatencyStats {
    pub count: u64,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

/// Periodically logs a metrics summary
pub struct MetricsReporter {
    metrics: Arc<ServiceMetrics>,
    interval_secs: u64,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<ServiceMetrics>, interval_secs: u64) -> Self {
        Self {
            metrics,
            interval_secs,
        }
    }

    /// Start the periodic reporting task
    pub async fn start(self) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.interval_secs.max(1)));
        // The first tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            self.metrics.print_summary();
        }
    }
}
