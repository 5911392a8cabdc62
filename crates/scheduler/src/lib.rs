//! BatchLoop Scheduler
//!
//! Request-batching scheduler for backends that process fixed-size batches
//! more efficiently than single items. Callers submit one request at a
//! time; a dedicated worker thread coalesces requests into rounds for a
//! shared batched executor, and a per-request timer bypasses the batch
//! through a non-batched fallback executor when the wait exceeds tolerance.

pub mod buffer;
pub mod coordinator;
pub mod executor;
pub mod queue;
pub mod request;
pub mod slot;
pub mod worker;

// Re-export commonly used types
pub use batchloop_common::error::{BatchLoopError, Result};
pub use buffer::{BufferSet, NetworkSpec, PortSpec};
pub use coordinator::{BatchCoordinator, SchedulerStats};
pub use executor::{
    CallbackExecutor, Executor, ExecutorFactory, ImmediateExecutor, ScaleExecutor,
    ScaleExecutorFactory, ThreadPoolExecutor,
};
pub use request::{AsyncInferRequest, ExecutionFlavor, InferRequest, PerfCounters, RequestState};
pub use slot::BatchSlot;
pub use worker::{BatchWorker, WorkerStats};
