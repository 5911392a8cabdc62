//! Metrics collection for BatchLoop
//!
//! This module provides Prometheus metrics for observability.
//! All metrics are carefully designed to minimize overhead in the hot path.

use lazy_static::lazy_static;
use prometheus::{Histogram, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for BatchLoop
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub scheduler: SchedulerMetrics,
    pub worker: WorkerMetrics,
}

/// Request-level scheduler metrics
#[derive(Debug, Clone)]
pub struct SchedulerMetrics {
    /// Total number of requests created
    pub requests_total: IntCounter,

    /// Total number of failed requests
    pub requests_failed: IntCounter,

    /// Requests completed through the shared batched executor
    pub batch_executed_total: IntCounter,

    /// Requests completed through the non-batched fallback executor
    pub fallback_executed_total: IntCounter,

    /// Current in-flight requests
    pub active_requests: IntGauge,

    /// Submit-to-completion duration
    pub request_duration: Histogram,
}

/// Batch-worker metrics
#[derive(Debug, Clone)]
pub struct WorkerMetrics {
    /// Rounds executed
    pub rounds_total: IntCounter,

    /// Rounds that faulted
    pub round_faults_total: IntCounter,

    /// Occupied slots per round
    pub batch_occupancy: Histogram,

    /// Current depth of the task queue
    pub queue_depth: IntGauge,

    /// Time requests spend queued before their round is popped
    pub queue_time: Histogram,

    /// Batched executor invocation duration
    pub infer_duration: Histogram,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        // Scheduler metrics
        let requests_total = IntCounter::new(
            "scheduler_requests_total",
            "Total number of requests created"
        ).unwrap();

        let requests_failed = IntCounter::new(
            "scheduler_requests_failed_total",
            "Total number of failed requests"
        ).unwrap();

        let batch_executed_total = IntCounter::new(
            "scheduler_batch_executed_total",
            "Requests completed by the shared batched executor"
        ).unwrap();

        let fallback_executed_total = IntCounter::new(
            "scheduler_fallback_executed_total",
            "Requests completed by the non-batched fallback executor"
        ).unwrap();

        let active_requests = IntGauge::new(
            "scheduler_active_requests",
            "Current number of in-flight requests"
        ).unwrap();

        let request_duration = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "scheduler_request_duration_seconds",
                "Submit-to-completion duration in seconds"
            ).buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0])
        ).unwrap();

        // Worker metrics
        let rounds_total = IntCounter::new(
            "worker_rounds_total",
            "Total number of batched rounds executed"
        ).unwrap();

        let round_faults_total = IntCounter::new(
            "worker_round_faults_total",
            "Total number of rounds that faulted"
        ).unwrap();

        let batch_occupancy = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "worker_batch_occupancy",
                "Occupied slots per round"
            ).buckets(vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0])
        ).unwrap();

        let queue_depth = IntGauge::new(
            "worker_queue_depth",
            "Current depth of the worker task queue"
        ).unwrap();

        let queue_time = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "worker_queue_time_seconds",
                "Time requests spend in queue before their round is popped"
            ).buckets(vec![0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1])
        ).unwrap();

        let infer_duration = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "worker_infer_duration_seconds",
                "Batched executor invocation duration in seconds"
            ).buckets(vec![0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.5])
        ).unwrap();

        // Register all metrics
        registry.register(Box::new(requests_total.clone())).unwrap();
        registry.register(Box::new(requests_failed.clone())).unwrap();
        registry.register(Box::new(batch_executed_total.clone())).unwrap();
        registry.register(Box::new(fallback_executed_total.clone())).unwrap();
        registry.register(Box::new(active_requests.clone())).unwrap();
        registry.register(Box::new(request_duration.clone())).unwrap();

        registry.register(Box::new(rounds_total.clone())).unwrap();
        registry.register(Box::new(round_faults_total.clone())).unwrap();
        registry.register(Box::new(batch_occupancy.clone())).unwrap();
        registry.register(Box::new(queue_depth.clone())).unwrap();
        registry.register(Box::new(queue_time.clone())).unwrap();
        registry.register(Box::new(infer_duration.clone())).unwrap();

        let scheduler = SchedulerMetrics {
            requests_total,
            requests_failed,
            batch_executed_total,
            fallback_executed_total,
            active_requests,
            request_duration,
        };

        let worker = WorkerMetrics {
            rounds_total,
            round_faults_total,
            batch_occupancy,
            queue_depth,
            queue_time,
            infer_duration,
        };

        MetricsRegistry {
            registry,
            scheduler,
            worker,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper trait for measuring latency
pub trait LatencyTimer {
    /// Run a closure and observe its duration
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R;
}

impl LatencyTimer for Histogram {
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = std::time::Instant::now();
        let result = f();
        let duration = start.elapsed().as_secs_f64();
        self.observe(duration);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry() {
        let metrics = MetricsRegistry::new();

        metrics.scheduler.requests_total.inc();
        metrics.scheduler.active_requests.inc();
        metrics.worker.queue_depth.set(3);
        metrics.worker.batch_occupancy.observe(3.0);

        let output = metrics.gather();
        assert!(output.contains("scheduler_requests_total"));
        assert!(output.contains("worker_queue_depth"));
        assert!(output.contains("worker_batch_occupancy"));
    }

    #[test]
    fn test_latency_timer() {
        let metrics = MetricsRegistry::new();

        let value = metrics.worker.infer_duration.time(|| 41 + 1);
        assert_eq!(value, 42);
        assert_eq!(metrics.worker.infer_duration.get_sample_count(), 1);
    }
}
