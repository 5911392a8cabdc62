//! Batch worker: one shared engine, one queue, one consumer thread
//!
//! A worker owns a batched executor exclusively; the executor is moved into
//! the consumer thread and never runs concurrently with itself. The thread
//! collects queued tasks into rounds (full, or flushed by the collection
//! window), runs the engine once per round over the shared buffers, and
//! fans the round's single outcome out to every member. An engine fault is
//! fatal to its round but not to the worker.

use crate::buffer::{BufferSet, NetworkSpec};
use crate::executor::Executor;
use crate::queue::{QueuedTask, RoundOutcome, SlotResult, TaskQueue};
use crate::slot::{BatchSlot, SlotAllocator};
use batchloop_common::error::{BatchLoopError, Result};
use batchloop_common::metrics::METRICS;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Counters kept per worker, aggregated by the coordinator
#[derive(Debug, Default)]
pub struct WorkerStats {
    rounds: AtomicU64,
    round_faults: AtomicU64,
    batched_items: AtomicU64,
}

impl WorkerStats {
    /// Rounds executed so far
    pub fn rounds(&self) -> u64 {
        self.rounds.load(Ordering::Relaxed)
    }

    /// Rounds that faulted
    pub fn round_faults(&self) -> u64 {
        self.round_faults.load(Ordering::Relaxed)
    }

    /// Total occupied slots across all rounds
    pub fn batched_items(&self) -> u64 {
        self.batched_items.load(Ordering::Relaxed)
    }
}

/// State shared between the worker thread, the submitting requests and the
/// coordinator
pub(crate) struct WorkerInner {
    pub(crate) index: usize,
    pub(crate) batch_size: usize,
    pub(crate) window: Duration,
    pub(crate) queue: TaskQueue,
    pub(crate) slots: SlotAllocator,
    pub(crate) inputs: Mutex<BufferSet>,
    pub(crate) outputs: Mutex<BufferSet>,
    pub(crate) last_error: Mutex<Option<BatchLoopError>>,
    pub(crate) stats: WorkerStats,
}

impl WorkerInner {
    /// Claim a slot in this worker's batch context
    pub(crate) fn bind_slot(&self) -> Result<BatchSlot> {
        if self.queue.is_closed() {
            return Err(BatchLoopError::no_capacity(format!(
                "worker {} is terminating",
                self.index
            )));
        }

        let batch_id = self.slots.acquire().ok_or_else(|| {
            BatchLoopError::no_capacity(format!("worker {} has no free slot", self.index))
        })?;

        Ok(BatchSlot {
            batch_id,
            batch_size: self.batch_size,
        })
    }

    /// Hand a task to the consumer thread
    pub(crate) fn enqueue(&self, task: QueuedTask) -> Result<()> {
        self.queue.push(task)
    }
}

/// A batch worker and its consumer thread
pub struct BatchWorker {
    inner: Arc<WorkerInner>,
    thread: Option<JoinHandle<()>>,
}

impl BatchWorker {
    /// Spawn a worker for the given batch context. The executor moves into
    /// the consumer thread.
    pub fn spawn(
        index: usize,
        spec: &NetworkSpec,
        batch_size: usize,
        window: Duration,
        executor: Box<dyn Executor>,
    ) -> Result<Self> {
        let inner = Arc::new(WorkerInner {
            index,
            batch_size,
            window,
            queue: TaskQueue::new(),
            slots: SlotAllocator::new(batch_size),
            inputs: Mutex::new(BufferSet::new(&spec.inputs, batch_size)),
            outputs: Mutex::new(BufferSet::new(&spec.outputs, batch_size)),
            last_error: Mutex::new(None),
            stats: WorkerStats::default(),
        });

        let thread_inner = inner.clone();
        let thread = std::thread::Builder::new()
            .name(format!("batchloop-worker-{}", index))
            .spawn(move || run_worker_loop(thread_inner, executor))
            .map_err(|e| BatchLoopError::internal(format!("Failed to spawn worker thread: {}", e)))?;

        info!("Spawned batch worker {} (batch size {})", index, batch_size);

        Ok(Self {
            inner,
            thread: Some(thread),
        })
    }

    pub(crate) fn inner(&self) -> &Arc<WorkerInner> {
        &self.inner
    }

    /// Worker index within its coordinator
    pub fn index(&self) -> usize {
        self.inner.index
    }

    /// Current task queue depth
    pub fn queue_depth(&self) -> usize {
        self.inner.queue.len()
    }

    /// Most recent round fault, if any
    pub fn last_error(&self) -> Option<BatchLoopError> {
        self.inner.last_error.lock().clone()
    }

    /// Per-worker counters
    pub fn stats(&self) -> &WorkerStats {
        &self.inner.stats
    }

    /// Close the queue, fail whatever is left with `ShuttingDown` and join
    /// the consumer thread. Idempotent.
    pub fn shutdown(&mut self) {
        self.inner.queue.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
            info!("Batch worker {} stopped", self.inner.index);
        }
    }
}

impl Drop for BatchWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Consumer loop, runs for the worker's lifetime
fn run_worker_loop(inner: Arc<WorkerInner>, mut executor: Box<dyn Executor>) {
    loop {
        match inner.queue.wait_round(inner.batch_size, inner.window) {
            RoundOutcome::Round(tasks) => {
                if tasks.is_empty() {
                    continue;
                }
                run_round(&inner, executor.as_mut(), tasks);
            }
            RoundOutcome::Shutdown(tasks) => {
                debug!(
                    "Worker {} draining {} queued tasks on shutdown",
                    inner.index,
                    tasks.len()
                );
                for task in tasks {
                    (task.complete)(SlotResult {
                        result: Err(BatchLoopError::ShuttingDown),
                        queue_time: task.enqueued_at.elapsed(),
                        infer_time: Duration::ZERO,
                    });
                }
                break;
            }
        }
    }
}

/// Execute one round and fan its outcome out to every member
fn run_round(inner: &WorkerInner, executor: &mut dyn Executor, tasks: Vec<QueuedTask>) {
    let occupancy = tasks.len();
    let popped_at = Instant::now();

    debug!(
        "Worker {} running round: {}/{} slots, oldest task waited {:?}",
        inner.index,
        occupancy,
        inner.batch_size,
        popped_at.saturating_duration_since(tasks[0].enqueued_at)
    );

    // The engine sees the full fixed-shape buffers; unoccupied slots are
    // padding whose outputs are never copied back.
    let started = Instant::now();
    let result = {
        let inputs = inner.inputs.lock();
        let mut outputs = inner.outputs.lock();
        executor.infer(&inputs, &mut outputs)
    };
    let infer_time = started.elapsed();

    METRICS.worker.rounds_total.inc();
    METRICS.worker.batch_occupancy.observe(occupancy as f64);
    METRICS.worker.infer_duration.observe(infer_time.as_secs_f64());
    inner.stats.rounds.fetch_add(1, Ordering::Relaxed);
    inner
        .stats
        .batched_items
        .fetch_add(occupancy as u64, Ordering::Relaxed);

    // A fault is recorded once and replayed to every member; the round is
    // never retried.
    let fault = result.err();
    if let Some(err) = &fault {
        warn!(
            "Worker {} round of {} faulted: {}",
            inner.index, occupancy, err
        );
        METRICS.worker.round_faults_total.inc();
        inner.stats.round_faults.fetch_add(1, Ordering::Relaxed);
        *inner.last_error.lock() = Some(err.clone());
    }

    for task in tasks {
        let result = match &fault {
            None => Ok(()),
            Some(err) => Err(err.clone()),
        };
        let queue_time = popped_at.saturating_duration_since(task.enqueued_at);
        METRICS.worker.queue_time.observe(queue_time.as_secs_f64());
        (task.complete)(SlotResult {
            result,
            queue_time,
            infer_time,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PortSpec;
    use crate::executor::ScaleExecutor;
    use crate::queue::QueuedTask;
    use crossbeam::channel::{unbounded, Receiver};
    use std::sync::atomic::AtomicUsize;

    fn spec() -> NetworkSpec {
        NetworkSpec::new(
            vec![PortSpec::new("data", vec![2])],
            vec![PortSpec::new("data", vec![2])],
        )
    }

    /// Counts engine invocations, delegating to a scaling engine
    struct CountingExecutor {
        calls: Arc<AtomicUsize>,
        inner: ScaleExecutor,
    }

    impl Executor for CountingExecutor {
        fn infer(&mut self, inputs: &BufferSet, outputs: &mut BufferSet) -> crate::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.infer(inputs, outputs)
        }
    }

    /// Faults on the first invocation, then recovers
    struct FlakyExecutor {
        failed: bool,
        inner: ScaleExecutor,
    }

    impl Executor for FlakyExecutor {
        fn infer(&mut self, inputs: &BufferSet, outputs: &mut BufferSet) -> crate::Result<()> {
            if !self.failed {
                self.failed = true;
                return Err(BatchLoopError::executor("injected fault"));
            }
            self.inner.infer(inputs, outputs)
        }
    }

    fn enqueue_n(worker: &BatchWorker, n: usize) -> Receiver<crate::Result<()>> {
        let (tx, rx) = unbounded();
        for _ in 0..n {
            let slot = worker.inner().bind_slot().unwrap();
            let tx = tx.clone();
            worker
                .inner()
                .enqueue(QueuedTask::new(
                    slot.batch_id,
                    Box::new(move |slot_result: SlotResult| {
                        tx.send(slot_result.result).unwrap();
                    }),
                ))
                .unwrap();
        }
        rx
    }

    #[test]
    fn test_full_round_runs_engine_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let executor = Box::new(CountingExecutor {
            calls: calls.clone(),
            inner: ScaleExecutor::new(1.0),
        });
        let worker =
            BatchWorker::spawn(0, &spec(), 2, Duration::from_secs(5), executor).unwrap();

        let rx = enqueue_n(&worker, 2);
        for _ in 0..2 {
            rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(worker.stats().rounds(), 1);
        assert_eq!(worker.stats().batched_items(), 2);
    }

    #[test]
    fn test_partial_round_flushes_on_window() {
        let calls = Arc::new(AtomicUsize::new(0));
        let executor = Box::new(CountingExecutor {
            calls: calls.clone(),
            inner: ScaleExecutor::new(1.0),
        });
        let worker =
            BatchWorker::spawn(0, &spec(), 4, Duration::from_millis(50), executor).unwrap();

        let started = Instant::now();
        let rx = enqueue_n(&worker, 1);
        rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap();

        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(worker.stats().batched_items(), 1);
    }

    #[test]
    fn test_round_fault_is_shared_and_worker_recovers() {
        let executor = Box::new(FlakyExecutor {
            failed: false,
            inner: ScaleExecutor::new(1.0),
        });
        let worker =
            BatchWorker::spawn(0, &spec(), 2, Duration::from_millis(20), executor).unwrap();

        let rx = enqueue_n(&worker, 2);
        for _ in 0..2 {
            let result = rx.recv_timeout(Duration::from_secs(2)).unwrap();
            assert!(matches!(result, Err(BatchLoopError::Executor(_))));
        }
        assert!(matches!(
            worker.last_error(),
            Some(BatchLoopError::Executor(_))
        ));

        // Members of the next round are unaffected; slots recycle first.
        worker.inner().slots.release(0);
        worker.inner().slots.release(1);
        let rx = enqueue_n(&worker, 2);
        for _ in 0..2 {
            rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap();
        }
        assert_eq!(worker.stats().rounds(), 2);
        assert_eq!(worker.stats().round_faults(), 1);
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let executor = Box::new(ScaleExecutor::new(1.0));
        let mut worker =
            BatchWorker::spawn(0, &spec(), 4, Duration::from_secs(60), executor).unwrap();

        let rx = enqueue_n(&worker, 2);
        worker.shutdown();

        for _ in 0..2 {
            let result = rx.recv_timeout(Duration::from_secs(2)).unwrap();
            assert!(result.unwrap_err().is_shutting_down());
        }

        assert!(worker.inner().bind_slot().unwrap_err().to_string().contains("terminating"));
        let err = worker
            .inner()
            .enqueue(QueuedTask::new(0, Box::new(|_| {})))
            .unwrap_err();
        assert!(err.is_shutting_down());
    }
}
