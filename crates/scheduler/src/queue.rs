//! Size-tracked task queue feeding one batch worker
//!
//! The queue holds `(slot, completion)` pairs pushed by submitting threads
//! and popped, a round at a time, by the worker's single consumer thread.
//! The consumer wait combines three wake conditions: a full round is
//! available, the collection window since the round's first task has
//! elapsed, or the queue has been closed.

use batchloop_common::error::{BatchLoopError, Result};
use batchloop_common::metrics::METRICS;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::trace;

/// Outcome of one slot's dispatch, delivered to its completion callback
pub struct SlotResult {
    /// Success, the round's shared fault, or a teardown fault
    pub result: Result<()>,

    /// Time the task spent queued before its round was popped
    pub queue_time: Duration,

    /// Engine invocation time for the path that produced the result
    pub infer_time: Duration,
}

/// Completion callback invoked exactly once per queued task
pub type CompletionFn = Box<dyn FnOnce(SlotResult) + Send>;

/// One queued unit of work
pub struct QueuedTask {
    /// Slot the submitter's inputs already occupy in the shared buffer
    pub batch_id: usize,

    /// Push time
    pub enqueued_at: Instant,

    /// Callback receiving the round's outcome
    pub complete: CompletionFn,
}

impl QueuedTask {
    /// Create a task stamped with the current time
    pub fn new(batch_id: usize, complete: CompletionFn) -> Self {
        Self {
            batch_id,
            enqueued_at: Instant::now(),
            complete,
        }
    }
}

/// What the consumer got out of its wait
pub enum RoundOutcome {
    /// Tasks forming the next round, in arrival order
    Round(Vec<QueuedTask>),

    /// The queue was closed; these are the drained leftovers
    Shutdown(Vec<QueuedTask>),
}

struct QueueState {
    tasks: VecDeque<QueuedTask>,
    closed: bool,
}

/// Thread-safe FIFO with a combined fill-or-deadline consumer wait
pub struct TaskQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
    depth: AtomicUsize,
}

impl TaskQueue {
    /// Create an open, empty queue
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                closed: false,
            }),
            cond: Condvar::new(),
            depth: AtomicUsize::new(0),
        }
    }

    /// Push a task and wake the consumer. Non-blocking; fails once the
    /// queue is closed.
    pub fn push(&self, task: QueuedTask) -> Result<()> {
        let depth = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(BatchLoopError::ShuttingDown);
            }
            state.tasks.push_back(task);
            self.depth.fetch_add(1, Ordering::Relaxed) + 1
        };

        METRICS.worker.queue_depth.set(depth as i64);
        self.cond.notify_one();

        trace!("Task queued, depth: {}", depth);
        Ok(())
    }

    /// Current queue depth
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the queue has been closed
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Close the queue and wake the consumer. Later pushes fail; the
    /// consumer drains whatever is left.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
        }
        self.cond.notify_all();
    }

    /// Block until a round is ready or the queue is closed.
    ///
    /// A round is ready when `batch_size` tasks are queued, or when `window`
    /// has elapsed since the oldest queued task arrived (a partial round).
    /// Only the worker's consumer thread calls this.
    pub fn wait_round(&self, batch_size: usize, window: Duration) -> RoundOutcome {
        let mut state = self.state.lock();

        loop {
            if state.closed {
                let rest = self.drain(&mut state, usize::MAX);
                return RoundOutcome::Shutdown(rest);
            }

            if state.tasks.len() >= batch_size {
                let round = self.drain(&mut state, batch_size);
                return RoundOutcome::Round(round);
            }

            match state.tasks.front() {
                None => {
                    self.cond.wait(&mut state);
                }
                Some(first) => {
                    let deadline = first.enqueued_at + window;
                    if Instant::now() >= deadline {
                        let round = self.drain(&mut state, batch_size);
                        return RoundOutcome::Round(round);
                    }
                    let _ = self.cond.wait_until(&mut state, deadline);
                }
            }
        }
    }

    fn drain(&self, state: &mut QueueState, max: usize) -> Vec<QueuedTask> {
        let count = state.tasks.len().min(max);
        let drained: Vec<QueuedTask> = state.tasks.drain(..count).collect();

        let depth = self.depth.fetch_sub(count, Ordering::Relaxed) - count;
        METRICS.worker.queue_depth.set(depth as i64);
        drained
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_task(batch_id: usize) -> QueuedTask {
        QueuedTask::new(batch_id, Box::new(|_| {}))
    }

    #[test]
    fn test_full_round_pops_without_waiting() {
        let queue = TaskQueue::new();
        queue.push(noop_task(0)).unwrap();
        queue.push(noop_task(1)).unwrap();
        assert_eq!(queue.len(), 2);

        let start = Instant::now();
        match queue.wait_round(2, Duration::from_secs(5)) {
            RoundOutcome::Round(tasks) => {
                assert_eq!(tasks.len(), 2);
                assert_eq!(tasks[0].batch_id, 0);
                assert_eq!(tasks[1].batch_id, 1);
            }
            RoundOutcome::Shutdown(_) => panic!("queue is open"),
        }
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_partial_round_flushes_at_window() {
        let queue = TaskQueue::new();
        queue.push(noop_task(0)).unwrap();

        let window = Duration::from_millis(50);
        let start = Instant::now();
        match queue.wait_round(4, window) {
            RoundOutcome::Round(tasks) => assert_eq!(tasks.len(), 1),
            RoundOutcome::Shutdown(_) => panic!("queue is open"),
        }
        assert!(start.elapsed() >= window);
    }

    #[test]
    fn test_round_keeps_arrival_order() {
        let queue = TaskQueue::new();
        for id in [3, 1, 2] {
            queue.push(noop_task(id)).unwrap();
        }

        match queue.wait_round(3, Duration::from_secs(1)) {
            RoundOutcome::Round(tasks) => {
                let ids: Vec<usize> = tasks.iter().map(|t| t.batch_id).collect();
                assert_eq!(ids, vec![3, 1, 2]);
            }
            RoundOutcome::Shutdown(_) => panic!("queue is open"),
        }
    }

    #[test]
    fn test_close_drains_and_rejects() {
        let queue = TaskQueue::new();
        queue.push(noop_task(0)).unwrap();
        queue.close();

        match queue.wait_round(4, Duration::from_secs(5)) {
            RoundOutcome::Shutdown(tasks) => assert_eq!(tasks.len(), 1),
            RoundOutcome::Round(_) => panic!("queue is closed"),
        }

        let err = queue.push(noop_task(1)).unwrap_err();
        assert!(err.is_shutting_down());
    }

    #[test]
    fn test_push_wakes_waiting_consumer() {
        use std::sync::Arc;

        let queue = Arc::new(TaskQueue::new());
        let consumer_queue = queue.clone();
        let handle = std::thread::spawn(move || {
            match consumer_queue.wait_round(2, Duration::from_secs(10)) {
                RoundOutcome::Round(tasks) => tasks.len(),
                RoundOutcome::Shutdown(_) => 0,
            }
        });

        std::thread::sleep(Duration::from_millis(20));
        queue.push(noop_task(0)).unwrap();
        queue.push(noop_task(1)).unwrap();

        assert_eq!(handle.join().unwrap(), 2);
    }
}
