//! Coordinator owning the worker set and the request factory
//!
//! The coordinator is the entry point of the scheduler: it validates the
//! configuration, owns every batch worker explicitly (no global registry),
//! grows the worker set when all slots are busy, and builds the
//! request/submission pairs callers drive. Teardown closes every queue,
//! fails whatever is still pending with `ShuttingDown` and joins the
//! consumer threads.

use crate::buffer::NetworkSpec;
use crate::executor::{CallbackExecutor, ExecutorFactory, ThreadPoolExecutor};
use crate::request::{AsyncInferRequest, InferRequest};
use crate::worker::BatchWorker;
use batchloop_common::config::BatchLoopConfig;
use batchloop_common::error::{BatchLoopError, Result};
use batchloop_common::metrics::METRICS;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Scheduler-level counters, aggregated with per-worker stats into the
/// performance counter map
#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub(crate) requests_created: AtomicU64,
    pub(crate) batch_executed: AtomicU64,
    pub(crate) fallback_executed: AtomicU64,
    pub(crate) failures: AtomicU64,
}

impl SchedulerStats {
    /// Requests created so far
    pub fn requests_created(&self) -> u64 {
        self.requests_created.load(Ordering::Relaxed)
    }

    /// Requests completed successfully through the batched path
    pub fn batch_executed(&self) -> u64 {
        self.batch_executed.load(Ordering::Relaxed)
    }

    /// Requests completed successfully through the fallback path
    pub fn fallback_executed(&self) -> u64 {
        self.fallback_executed.load(Ordering::Relaxed)
    }

    /// Requests that completed with a fault
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// Owns the batch workers for one configured backend target
pub struct BatchCoordinator {
    config: BatchLoopConfig,
    spec: NetworkSpec,
    factory: Box<dyn ExecutorFactory>,
    callbacks: Arc<dyn CallbackExecutor>,
    workers: Mutex<Vec<BatchWorker>>,
    stats: Arc<SchedulerStats>,
    terminated: AtomicBool,
}

impl BatchCoordinator {
    /// Create a coordinator and spawn its first worker.
    pub fn new(
        config: BatchLoopConfig,
        spec: NetworkSpec,
        factory: Box<dyn ExecutorFactory>,
    ) -> Result<Self> {
        config.validate()?;
        let callbacks: Arc<dyn CallbackExecutor> =
            Arc::new(ThreadPoolExecutor::new(config.callback.threads)?);

        info!(
            "Creating batch coordinator for device {} (batch size {}, window {:?})",
            config.device_id,
            config.batching.batch_size,
            config.batching_window()
        );

        let coordinator = Self {
            config,
            spec,
            factory,
            callbacks,
            workers: Mutex::new(Vec::new()),
            stats: Arc::new(SchedulerStats::default()),
            terminated: AtomicBool::new(false),
        };

        let first = coordinator.spawn_worker(0)?;
        coordinator.workers.lock().push(first);

        Ok(coordinator)
    }

    fn spawn_worker(&self, index: usize) -> Result<BatchWorker> {
        let batch_size = self.config.batching.batch_size;
        let executor = self.factory.create_batched(batch_size)?;
        BatchWorker::spawn(
            index,
            &self.spec,
            batch_size,
            self.config.batching_window(),
            executor,
        )
    }

    /// Build a request bound to a free slot, growing the worker set when
    /// every existing slot is busy, paired with the submission object that
    /// drives it.
    pub fn create_request(&self) -> Result<(Arc<InferRequest>, AsyncInferRequest)> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(BatchLoopError::ShuttingDown);
        }

        let (worker, slot) = {
            let mut workers = self.workers.lock();

            let mut bound = None;
            for worker in workers.iter() {
                match worker.inner().bind_slot() {
                    Ok(slot) => {
                        bound = Some((worker.inner().clone(), slot));
                        break;
                    }
                    Err(BatchLoopError::NoCapacity(_)) => continue,
                    Err(err) => return Err(err),
                }
            }

            match bound {
                Some(pair) => pair,
                None => {
                    // Re-checked under the lock so a concurrent teardown
                    // cannot interleave with worker growth.
                    if self.terminated.load(Ordering::SeqCst) {
                        return Err(BatchLoopError::ShuttingDown);
                    }
                    let worker = self.spawn_worker(workers.len())?;
                    let slot = worker.inner().bind_slot()?;
                    let inner = worker.inner().clone();
                    debug!("All slots busy, grew worker set to {}", workers.len() + 1);
                    workers.push(worker);
                    (inner, slot)
                }
            }
        };

        let request = Arc::new(InferRequest::new(worker, slot, &self.spec));
        let fallback = self.factory.create_single()?;
        let async_request = AsyncInferRequest::new(
            request.clone(),
            fallback,
            self.callbacks.clone(),
            self.stats.clone(),
            self.config.fallback_timeout(),
        );

        self.stats.requests_created.fetch_add(1, Ordering::Relaxed);
        METRICS.scheduler.requests_total.inc();

        Ok((request, async_request))
    }

    /// Read-only view of the active configuration
    pub fn config(&self) -> &BatchLoopConfig {
        &self.config
    }

    /// Number of workers spawned so far
    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Scheduler-level counters
    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    /// Totals across the scheduler and all of its workers
    pub fn aggregate_performance_counters(&self) -> HashMap<String, f64> {
        let workers = self.workers.lock();
        let rounds: u64 = workers.iter().map(|w| w.stats().rounds()).sum();
        let round_faults: u64 = workers.iter().map(|w| w.stats().round_faults()).sum();
        let batched_items: u64 = workers.iter().map(|w| w.stats().batched_items()).sum();
        let occupancy = if rounds > 0 {
            batched_items as f64 / rounds as f64
        } else {
            0.0
        };

        let mut counters = HashMap::new();
        counters.insert(
            "requests_created".to_string(),
            self.stats.requests_created() as f64,
        );
        counters.insert(
            "batch_executed".to_string(),
            self.stats.batch_executed() as f64,
        );
        counters.insert(
            "fallback_executed".to_string(),
            self.stats.fallback_executed() as f64,
        );
        counters.insert("failures".to_string(), self.stats.failures() as f64);
        counters.insert("rounds".to_string(), rounds as f64);
        counters.insert("round_faults".to_string(), round_faults as f64);
        counters.insert("batched_items".to_string(), batched_items as f64);
        counters.insert("avg_batch_occupancy".to_string(), occupancy);
        counters.insert("workers".to_string(), workers.len() as f64);
        counters
    }

    /// Tear the scheduler down: every queue is closed, queued and future
    /// requests fail with `ShuttingDown`, consumer threads are joined.
    /// Idempotent; also run on drop.
    pub fn shutdown(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Shutting down scheduler for device {}", self.config.device_id);
        let mut workers = self.workers.lock();
        for worker in workers.iter_mut() {
            worker.shutdown();
        }
    }
}

impl Drop for BatchCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
