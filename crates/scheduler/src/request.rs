//! Per-caller requests and their submission lifecycle
//!
//! `InferRequest` is one caller's view of a single inference: private input
//! and output buffers pinned to a slot of its worker's shared batch buffer,
//! plus the record of which execution path produced the result.
//! `AsyncInferRequest` drives one submission through that request: copy
//! inputs in, enqueue for batching, and race a wall-clock fallback timer
//! against the batch. Whichever path claims the flavor cell first owns the
//! user-visible outcome; the loser runs to completion with no effect.

use crate::buffer::{BufferSet, NetworkSpec};
use crate::coordinator::SchedulerStats;
use crate::executor::{CallbackExecutor, Executor};
use crate::queue::{QueuedTask, SlotResult};
use crate::slot::BatchSlot;
use crate::worker::WorkerInner;
use batchloop_common::error::{BatchLoopError, Result};
use batchloop_common::metrics::METRICS;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{trace, warn};
use uuid::Uuid;

/// Which path produced a request's result. Set exactly once per lifecycle;
/// the compare-and-swap on this cell is what arbitrates the batch/fallback
/// race.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExecutionFlavor {
    /// No path has claimed the request yet
    NotExecuted = 0,

    /// The shared batched executor produced the result; outputs must be
    /// copied back out of the shared buffer
    BatchExecuted = 1,

    /// The non-batched fallback produced the result directly in the
    /// caller's buffers
    TimeoutExecuted = 2,
}

impl ExecutionFlavor {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ExecutionFlavor::BatchExecuted,
            2 => ExecutionFlavor::TimeoutExecuted,
            _ => ExecutionFlavor::NotExecuted,
        }
    }
}

/// Timings recorded for one request
#[derive(Debug, Clone, Copy, Default)]
pub struct PerfCounters {
    /// Time spent queued before the round was popped (zero for the
    /// fallback path)
    pub queue_time: Duration,

    /// Engine invocation time for the path that ran
    pub infer_time: Duration,

    /// Submit-to-completion time
    pub total_time: Duration,
}

impl PerfCounters {
    /// Counters as a name -> milliseconds map
    pub fn as_map(&self) -> HashMap<String, f64> {
        let mut map = HashMap::new();
        map.insert("queue_ms".to_string(), self.queue_time.as_secs_f64() * 1e3);
        map.insert("infer_ms".to_string(), self.infer_time.as_secs_f64() * 1e3);
        map.insert("total_ms".to_string(), self.total_time.as_secs_f64() * 1e3);
        map
    }
}

/// One caller's slot-bound inference request
impl std::fmt::Debug for InferRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferRequest")
            .field("id", &self.id)
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

pub struct InferRequest {
    id: Uuid,
    slot: BatchSlot,
    worker: Arc<WorkerInner>,
    pub(crate) inputs: Mutex<BufferSet>,
    pub(crate) outputs: Mutex<BufferSet>,
    flavor: AtomicU8,
    perf: Mutex<PerfCounters>,
}

impl InferRequest {
    pub(crate) fn new(worker: Arc<WorkerInner>, slot: BatchSlot, spec: &NetworkSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            slot,
            worker,
            inputs: Mutex::new(BufferSet::new(&spec.inputs, 1)),
            outputs: Mutex::new(BufferSet::new(&spec.outputs, 1)),
            flavor: AtomicU8::new(ExecutionFlavor::NotExecuted as u8),
            perf: Mutex::new(PerfCounters::default()),
        }
    }

    /// Unique request id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The slot this request occupies in its worker's batch context
    pub fn slot(&self) -> BatchSlot {
        self.slot
    }

    /// Which path produced the result so far
    pub fn flavor(&self) -> ExecutionFlavor {
        ExecutionFlavor::from_u8(self.flavor.load(Ordering::SeqCst))
    }

    /// Try to claim the request for one execution path. Returns false if
    /// the other path won.
    pub(crate) fn claim_flavor(&self, flavor: ExecutionFlavor) -> bool {
        self.flavor
            .compare_exchange(
                ExecutionFlavor::NotExecuted as u8,
                flavor as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    pub(crate) fn worker(&self) -> &Arc<WorkerInner> {
        &self.worker
    }

    /// Set one input port's item
    pub fn set_input(&self, name: &str, data: &[f32]) -> Result<()> {
        self.inputs.lock().write(name, data, 0)
    }

    /// Read one output port's item
    pub fn output(&self, name: &str) -> Result<Vec<f32>> {
        let outputs = self.outputs.lock();
        let port = outputs
            .port(name)
            .ok_or_else(|| BatchLoopError::shape_mismatch(format!("unknown port '{}'", name)))?;
        Ok(port.slot(0).to_vec())
    }

    /// Copy the caller's inputs into the shared batch buffer at this
    /// request's slot. Must happen before the request is enqueued; the
    /// queue hand-off is what orders the write against the round that
    /// reads it.
    pub fn copy_inputs_in(&self) -> Result<()> {
        if self.worker.queue.is_closed() {
            return Err(BatchLoopError::ShuttingDown);
        }

        let mine = self.inputs.lock();
        let mut shared = self.worker.inputs.lock();
        shared.copy_slot_from(&mine, self.slot.batch_id, 0)
    }

    /// Copy this request's output slice out of the shared batch buffer.
    /// Only meaningful after a batched round produced the result; for the
    /// fallback path the outputs are already caller-owned and this is a
    /// no-op. Idempotent.
    pub fn copy_outputs_out(&self) -> Result<()> {
        if self.flavor() != ExecutionFlavor::BatchExecuted {
            return Ok(());
        }
        if self.worker.queue.is_closed() {
            return Err(BatchLoopError::ShuttingDown);
        }

        let shared = self.worker.outputs.lock();
        let mut mine = self.outputs.lock();
        mine.copy_slot_from(&shared, 0, self.slot.batch_id)
    }

    /// Run the non-batched engine directly over this request's buffers
    pub(crate) fn run_fallback(&self, engine: &mut dyn Executor) -> Result<()> {
        let inputs = self.inputs.lock();
        let mut outputs = self.outputs.lock();
        engine.infer(&inputs, &mut outputs)
    }

    pub(crate) fn record_perf(&self, queue_time: Duration, infer_time: Duration) {
        let mut perf = self.perf.lock();
        perf.queue_time = queue_time;
        perf.infer_time = infer_time;
    }

    pub(crate) fn record_total(&self, total_time: Duration) {
        self.perf.lock().total_time = total_time;
    }

    /// Timings recorded for this request
    pub fn performance_counters(&self) -> HashMap<String, f64> {
        self.perf.lock().as_map()
    }
}

impl Drop for InferRequest {
    fn drop(&mut self) {
        self.worker.slots.release(self.slot.batch_id);
    }
}

/// Submission lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestState {
    /// Created, not yet started
    Idle = 0,

    /// Submitted; the batch/fallback race is on
    Running = 1,

    /// Finished successfully
    Completed = 2,

    /// Finished with a fault
    Failed = 3,
}

impl RequestState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => RequestState::Running,
            2 => RequestState::Completed,
            3 => RequestState::Failed,
            _ => RequestState::Idle,
        }
    }

    fn name(self) -> &'static str {
        match self {
            RequestState::Idle => "Idle",
            RequestState::Running => "Running",
            RequestState::Completed => "Completed",
            RequestState::Failed => "Failed",
        }
    }
}

/// User completion callback
pub type InferCallback = Box<dyn FnOnce(Result<()>) + Send>;

struct CompletionCell {
    started_at: Option<Instant>,
    result: Option<Result<()>>,
}

struct AsyncShared {
    state: AtomicU8,
    cell: Mutex<CompletionCell>,
    cond: Condvar,
    callback: Mutex<Option<InferCallback>>,
}

impl AsyncShared {
    /// Record the terminal result. The flavor cell upstream guarantees a
    /// single caller; the guard here only protects the start-failure path.
    fn complete(
        &self,
        result: Result<()>,
        request: &InferRequest,
        callbacks: &Arc<dyn CallbackExecutor>,
        stats: &SchedulerStats,
    ) {
        let total = {
            let mut cell = self.cell.lock();
            if cell.result.is_some() {
                return;
            }
            cell.result = Some(result.clone());
            let state = if result.is_ok() {
                RequestState::Completed
            } else {
                RequestState::Failed
            };
            self.state.store(state as u8, Ordering::SeqCst);
            cell.started_at.map(|started| started.elapsed())
        };
        self.cond.notify_all();

        METRICS.scheduler.active_requests.dec();
        if let Some(total) = total {
            METRICS.scheduler.request_duration.observe(total.as_secs_f64());
            request.record_total(total);
        }
        if result.is_err() {
            METRICS.scheduler.requests_failed.inc();
            stats.failures.fetch_add(1, Ordering::Relaxed);
        }

        let callback = self.callback.lock().take();
        if let Some(callback) = callback {
            callbacks.schedule(Box::new(move || callback(result)));
        }
    }
}

/// Drives one submission of an `InferRequest`
impl std::fmt::Debug for AsyncInferRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncInferRequest")
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

pub struct AsyncInferRequest {
    request: Arc<InferRequest>,
    fallback: Arc<Mutex<Box<dyn Executor>>>,
    callbacks: Arc<dyn CallbackExecutor>,
    stats: Arc<SchedulerStats>,
    fallback_timeout: Duration,
    shared: Arc<AsyncShared>,
}

impl AsyncInferRequest {
    pub(crate) fn new(
        request: Arc<InferRequest>,
        fallback: Box<dyn Executor>,
        callbacks: Arc<dyn CallbackExecutor>,
        stats: Arc<SchedulerStats>,
        fallback_timeout: Duration,
    ) -> Self {
        Self {
            request,
            fallback: Arc::new(Mutex::new(fallback)),
            callbacks,
            stats,
            fallback_timeout,
            shared: Arc::new(AsyncShared {
                state: AtomicU8::new(RequestState::Idle as u8),
                cell: Mutex::new(CompletionCell {
                    started_at: None,
                    result: None,
                }),
                cond: Condvar::new(),
                callback: Mutex::new(None),
            }),
        }
    }

    /// The underlying slot-bound request
    pub fn request(&self) -> &Arc<InferRequest> {
        &self.request
    }

    /// Current lifecycle state
    pub fn state(&self) -> RequestState {
        RequestState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    /// Install the user completion callback. It runs on the callback
    /// executor, never on the worker thread.
    pub fn set_callback(&self, callback: InferCallback) {
        *self.shared.callback.lock() = Some(callback);
    }

    /// Submit the request: copy inputs into the shared buffer, enqueue for
    /// batching and arm the fallback timer. Non-blocking.
    pub fn start(&self) -> Result<()> {
        self.shared
            .state
            .compare_exchange(
                RequestState::Idle as u8,
                RequestState::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map_err(|actual| BatchLoopError::InvalidState {
                from: RequestState::from_u8(actual).name(),
                to: RequestState::Running.name(),
            })?;
        self.shared.cell.lock().started_at = Some(Instant::now());
        METRICS.scheduler.active_requests.inc();
        trace!("Request {} starting", self.request.id());

        if let Err(err) = self.request.copy_inputs_in() {
            self.fail(err.clone());
            return Err(err);
        }

        if let Err(err) = self.request.worker().enqueue(self.batch_completion()) {
            self.fail(err.clone());
            return Err(err);
        }

        self.arm_fallback_timer();
        Ok(())
    }

    /// Block until the request reaches a terminal state
    pub fn wait(&self) -> Result<()> {
        let mut cell = self.shared.cell.lock();
        loop {
            if let Some(result) = cell.result.as_ref() {
                return result.clone();
            }
            if self.shared.state.load(Ordering::SeqCst) == RequestState::Idle as u8 {
                return Err(BatchLoopError::InvalidState {
                    from: RequestState::Idle.name(),
                    to: RequestState::Completed.name(),
                });
            }
            self.shared.cond.wait(&mut cell);
        }
    }

    fn fail(&self, err: BatchLoopError) {
        self.shared
            .complete(Err(err), &self.request, &self.callbacks, &self.stats);
    }

    /// Completion callback handed to the worker queue. Runs on the worker
    /// thread; must stay cheap.
    fn batch_completion(&self) -> QueuedTask {
        let request = self.request.clone();
        let shared = self.shared.clone();
        let callbacks = self.callbacks.clone();
        let stats = self.stats.clone();

        QueuedTask::new(
            self.request.slot().batch_id,
            Box::new(move |slot: SlotResult| {
                if !request.claim_flavor(ExecutionFlavor::BatchExecuted) {
                    // The fallback already owns this request; the round's
                    // work for this slot is discarded.
                    trace!("Request {} round completion ignored", request.id());
                    return;
                }

                request.record_perf(slot.queue_time, slot.infer_time);
                let result = slot.result.and_then(|_| request.copy_outputs_out());
                if result.is_ok() {
                    METRICS.scheduler.batch_executed_total.inc();
                    stats.batch_executed.fetch_add(1, Ordering::Relaxed);
                }
                shared.complete(result, &request, &callbacks, &stats);
            }),
        )
    }

    /// Schedule the timer that bypasses the batch when the round takes too
    /// long. The enqueued slot is never cancelled; if the timer wins, the
    /// round's eventual completion loses the flavor race and is a no-op.
    fn arm_fallback_timer(&self) {
        let request = self.request.clone();
        let shared = self.shared.clone();
        let callbacks = self.callbacks.clone();
        let stats = self.stats.clone();
        let fallback = self.fallback.clone();
        let timeout = self.fallback_timeout;
        let deadline = Instant::now() + timeout;

        self.callbacks.schedule(Box::new(move || {
            {
                let mut cell = shared.cell.lock();
                while cell.result.is_none() {
                    if shared.cond.wait_until(&mut cell, deadline).timed_out() {
                        break;
                    }
                }
                if cell.result.is_some() {
                    return;
                }
            }

            if !request.claim_flavor(ExecutionFlavor::TimeoutExecuted) {
                return;
            }
            warn!(
                "Request {} exceeded {:?}; bypassing the batch",
                request.id(),
                timeout
            );

            let started = Instant::now();
            let result = {
                let mut engine = fallback.lock();
                request.run_fallback(engine.as_mut())
            };
            request.record_perf(Duration::ZERO, started.elapsed());
            if result.is_ok() {
                METRICS.scheduler.fallback_executed_total.inc();
                stats.fallback_executed.fetch_add(1, Ordering::Relaxed);
            }
            shared.complete(result, &request, &callbacks, &stats);
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PortSpec;
    use crate::executor::{ScaleExecutor, ThreadPoolExecutor};
    use crate::worker::BatchWorker;
    use crossbeam::channel::unbounded;

    fn spec() -> NetworkSpec {
        NetworkSpec::new(
            vec![PortSpec::new("data", vec![2])],
            vec![PortSpec::new("data", vec![2])],
        )
    }

    fn build(
        batch_size: usize,
        window: Duration,
        fallback_timeout: Duration,
        batched_factor: f32,
        fallback_factor: f32,
    ) -> (BatchWorker, Arc<InferRequest>, AsyncInferRequest) {
        let worker = BatchWorker::spawn(
            0,
            &spec(),
            batch_size,
            window,
            Box::new(ScaleExecutor::new(batched_factor)),
        )
        .unwrap();
        let slot = worker.inner().bind_slot().unwrap();
        let request = Arc::new(InferRequest::new(worker.inner().clone(), slot, &spec()));
        let async_request = AsyncInferRequest::new(
            request.clone(),
            Box::new(ScaleExecutor::new(fallback_factor)),
            Arc::new(ThreadPoolExecutor::new(2).unwrap()),
            Arc::new(SchedulerStats::default()),
            fallback_timeout,
        );
        (worker, request, async_request)
    }

    #[test]
    fn test_batch_path_completes_and_copies_outputs() {
        let (_worker, request, async_request) = build(
            1,
            Duration::from_secs(5),
            Duration::from_secs(5),
            2.0,
            3.0,
        );

        request.set_input("data", &[1.0, 2.0]).unwrap();
        async_request.start().unwrap();
        async_request.wait().unwrap();

        assert_eq!(async_request.state(), RequestState::Completed);
        assert_eq!(request.flavor(), ExecutionFlavor::BatchExecuted);
        assert_eq!(request.output("data").unwrap(), vec![2.0, 4.0]);
    }

    #[test]
    fn test_fallback_path_when_batch_is_too_slow() {
        // Batch of 4 never fills; the fallback tolerance is far shorter
        // than the collection window, so the bypass must win.
        let (_worker, request, async_request) = build(
            4,
            Duration::from_secs(10),
            Duration::from_millis(30),
            2.0,
            3.0,
        );

        request.set_input("data", &[1.0, 2.0]).unwrap();
        let started = Instant::now();
        async_request.start().unwrap();
        async_request.wait().unwrap();

        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(request.flavor(), ExecutionFlavor::TimeoutExecuted);
        // The fallback engine's factor proves which path ran.
        assert_eq!(request.output("data").unwrap(), vec![3.0, 6.0]);
    }

    #[test]
    fn test_user_callback_runs_off_worker_thread() {
        let (_worker, request, async_request) = build(
            1,
            Duration::from_secs(5),
            Duration::from_secs(5),
            2.0,
            3.0,
        );
        let (tx, rx) = unbounded();
        async_request.set_callback(Box::new(move |result| {
            tx.send((result, std::thread::current().name().map(String::from)))
                .unwrap();
        }));

        request.set_input("data", &[1.0, 1.0]).unwrap();
        async_request.start().unwrap();

        let (result, thread_name) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        result.unwrap();
        assert!(thread_name.unwrap_or_default().starts_with("batchloop-callback"));
    }

    #[test]
    fn test_start_twice_is_invalid() {
        let (_worker, request, async_request) = build(
            1,
            Duration::from_secs(5),
            Duration::from_secs(5),
            1.0,
            1.0,
        );
        request.set_input("data", &[0.0, 0.0]).unwrap();
        async_request.start().unwrap();
        async_request.wait().unwrap();

        let err = async_request.start().unwrap_err();
        assert!(matches!(err, BatchLoopError::InvalidState { .. }));
    }

    #[test]
    fn test_wait_before_start_is_invalid() {
        let (_worker, _request, async_request) = build(
            1,
            Duration::from_secs(5),
            Duration::from_secs(5),
            1.0,
            1.0,
        );
        let err = async_request.wait().unwrap_err();
        assert!(matches!(err, BatchLoopError::InvalidState { .. }));
    }

    #[test]
    fn test_set_input_rejects_bad_shape() {
        let (_worker, request, _async_request) = build(
            1,
            Duration::from_secs(5),
            Duration::from_secs(5),
            1.0,
            1.0,
        );
        let err = request.set_input("data", &[1.0]).unwrap_err();
        assert!(matches!(err, BatchLoopError::ShapeMismatch(_)));
    }

    #[test]
    fn test_slot_released_on_drop() {
        let (worker, request, async_request) = build(
            2,
            Duration::from_millis(10),
            Duration::from_secs(5),
            1.0,
            1.0,
        );
        assert_eq!(request.slot().batch_id, 0);

        drop(async_request);
        drop(request);

        // The slot is free again and handed out lowest-first.
        assert_eq!(worker.inner().bind_slot().unwrap().batch_id, 0);
    }
}
