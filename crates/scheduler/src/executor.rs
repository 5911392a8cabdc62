//! Execution capabilities consumed by the scheduler
//!
//! Two seams are defined here. `Executor` is the opaque engine contract:
//! batched and non-batched engines look identical, differing only in the
//! leading batch dimension of the buffers they are handed. `CallbackExecutor`
//! is the asynchronous task executor that runs user completion callbacks and
//! the per-request fallback timers, keeping arbitrary user code off the
//! worker thread.

use crate::buffer::BufferSet;
use batchloop_common::error::{BatchLoopError, Result};

/// An execution engine. Reads every input port, writes every output port.
///
/// The engine always sees the full fixed-shape buffers; when a round is
/// partial, trailing slots hold whatever a prior round left there and their
/// outputs are never read back, so engines must not fail on arbitrary slot
/// contents.
pub trait Executor: Send {
    /// Run the network once over the whole batch dimension.
    fn infer(&mut self, inputs: &BufferSet, outputs: &mut BufferSet) -> Result<()>;
}

/// Creates the executors the scheduler needs: one batched engine per worker
/// and one non-batched fallback engine per request.
pub trait ExecutorFactory: Send + Sync {
    /// Create an engine compiled for the given batch size.
    fn create_batched(&self, batch_size: usize) -> Result<Box<dyn Executor>>;

    /// Create an engine compiled for single-item execution.
    fn create_single(&self) -> Result<Box<dyn Executor>>;
}

/// A boxed unit of deferred work
pub type Task = Box<dyn FnOnce() + Send>;

/// Runs tasks asynchronously on behalf of the scheduler.
pub trait CallbackExecutor: Send + Sync {
    /// Schedule a task. FIFO per submitter, best effort.
    fn schedule(&self, task: Task);
}

/// Rayon-backed callback executor
pub struct ThreadPoolExecutor {
    pool: rayon::ThreadPool,
}

impl ThreadPoolExecutor {
    /// Build a pool with the given thread count (0 = CPU count).
    pub fn new(threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("batchloop-callback-{}", i))
            .build()
            .map_err(|e| BatchLoopError::internal(format!("Failed to build callback pool: {}", e)))?;

        Ok(Self { pool })
    }
}

impl CallbackExecutor for ThreadPoolExecutor {
    fn schedule(&self, task: Task) {
        self.pool.spawn(task);
    }
}

/// Runs tasks inline on the scheduling thread. Test and tooling use only;
/// a blocking task blocks the submitter.
pub struct ImmediateExecutor;

impl CallbackExecutor for ImmediateExecutor {
    fn schedule(&self, task: Task) {
        task();
    }
}

/// Reference engine: multiplies every input port into the same-named output
/// port, element by element. Stands in for a real backend in the demo binary
/// and in tests.
pub struct ScaleExecutor {
    factor: f32,
}

impl ScaleExecutor {
    /// Create a scaling engine
    pub fn new(factor: f32) -> Self {
        Self { factor }
    }
}

impl Executor for ScaleExecutor {
    fn infer(&mut self, inputs: &BufferSet, outputs: &mut BufferSet) -> Result<()> {
        for out_port in outputs.ports_mut() {
            let name = out_port.spec.name.clone();
            let in_port = inputs.port(&name).ok_or_else(|| {
                BatchLoopError::executor(format!("no input port '{}' to scale", name))
            })?;
            if in_port.data.len() != out_port.data.len() {
                return Err(BatchLoopError::executor(format!(
                    "port '{}' sizes disagree: {} vs {}",
                    name,
                    in_port.data.len(),
                    out_port.data.len()
                )));
            }

            for (dst, src) in out_port.data.iter_mut().zip(in_port.data.iter()) {
                *dst = src * self.factor;
            }
        }

        Ok(())
    }
}

/// Factory producing `ScaleExecutor`s for both contracts
pub struct ScaleExecutorFactory {
    factor: f32,
}

impl ScaleExecutorFactory {
    /// Create a factory with the given scale factor
    pub fn new(factor: f32) -> Self {
        Self { factor }
    }
}

impl ExecutorFactory for ScaleExecutorFactory {
    fn create_batched(&self, _batch_size: usize) -> Result<Box<dyn Executor>> {
        Ok(Box::new(ScaleExecutor::new(self.factor)))
    }

    fn create_single(&self) -> Result<Box<dyn Executor>> {
        Ok(Box::new(ScaleExecutor::new(self.factor)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PortSpec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn specs() -> Vec<PortSpec> {
        vec![PortSpec::new("data", vec![3])]
    }

    #[test]
    fn test_scale_executor() {
        let mut inputs = BufferSet::new(&specs(), 2);
        inputs.write("data", &[1.0, 2.0, 3.0], 0).unwrap();
        inputs.write("data", &[4.0, 5.0, 6.0], 1).unwrap();
        let mut outputs = BufferSet::new(&specs(), 2);

        let mut engine = ScaleExecutor::new(2.0);
        engine.infer(&inputs, &mut outputs).unwrap();

        assert_eq!(outputs.port("data").unwrap().slot(0), &[2.0, 4.0, 6.0]);
        assert_eq!(outputs.port("data").unwrap().slot(1), &[8.0, 10.0, 12.0]);
    }

    #[test]
    fn test_scale_executor_missing_port() {
        let inputs = BufferSet::new(&specs(), 1);
        let mut outputs = BufferSet::new(&[PortSpec::new("other", vec![3])], 1);

        let mut engine = ScaleExecutor::new(1.0);
        let err = engine.infer(&inputs, &mut outputs).unwrap_err();
        assert!(matches!(err, BatchLoopError::Executor(_)));
    }

    #[test]
    fn test_thread_pool_executor_runs_tasks() {
        let pool = ThreadPoolExecutor::new(2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = crossbeam::channel::unbounded();

        for _ in 0..8 {
            let counter = counter.clone();
            let tx = tx.clone();
            pool.schedule(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                tx.send(()).unwrap();
            }));
        }

        for _ in 0..8 {
            rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_immediate_executor() {
        let ran = Arc::new(AtomicUsize::new(0));
        let inner = ran.clone();
        ImmediateExecutor.schedule(Box::new(move || {
            inner.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
