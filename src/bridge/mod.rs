//! Cross-thread execution bridge
//!
//! The host is single-threaded. Native completions arrive on any thread and
//! reach host-visible state only through this layer:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                    CROSS-THREAD BRIDGE                           │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ThreadsafeExecutor: bounded MPSC queue, enqueue-or-fail         │
//! │  ExecutorHub:        consumer side, drains with a budget         │
//! │  WorkerPool:         background jobs, one completion per task    │
//! │  TimerRegistry:      timer records and handle clearing           │
//! │  RecordPool:         synchronized reuse of queue records         │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Producers wake the consumer through a [`Wake`] implementation supplied by
//! the platform backend.

mod executor;
mod record_pool;
pub mod timer;
mod worker;

pub use executor::{ExecutorEntry, ExecutorHub, ExecutorId, TaskRecord, ThreadsafeExecutor};
pub use record_pool::RecordPool;
pub use timer::{FireOutcome, TimerEntry, TimerHandle, TimerKey, TimerRegistry};
pub use worker::{ReadyCompletion, TaskComplete, TaskEntry, WorkerPool, WorkerTask};

use crate::config::BridgeConfig;
use crate::error::SubmitError;
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Wakes the consumer thread from any thread.
pub trait Wake: Send + Sync {
    fn wake(&self);
}

/// Wake that does nothing; for consumers that poll.
pub struct NoopWake;

impl Wake for NoopWake {
    fn wake(&self) {}
}

/// Wake backed by a condition variable the consumer can block on.
#[derive(Default)]
pub struct ParkWake {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl ParkWake {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until woken or `timeout` elapses; `None` waits forever.
    ///
    /// Returns whether a wake was consumed.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut signaled = self.signaled.lock();
        if !*signaled {
            match timeout {
                Some(timeout) => {
                    self.cond.wait_for(&mut signaled, timeout);
                }
                None => self.cond.wait(&mut signaled),
            }
        }
        std::mem::replace(&mut *signaled, false)
    }
}

impl Wake for ParkWake {
    fn wake(&self) {
        *self.signaled.lock() = true;
        self.cond.notify_one();
    }
}

/// Executor hub and worker pool owned by one platform instance.
pub struct Bridge {
    executors: RefCell<ExecutorHub>,
    workers: RefCell<WorkerPool>,
}

impl Bridge {
    pub fn new(config: &BridgeConfig, wake: Arc<dyn Wake>) -> io::Result<Self> {
        let executors = ExecutorHub::new(
            config.executor.queue_capacity,
            config.executor.drain_budget,
            config.executor.record_pool_capacity,
            Arc::clone(&wake),
        );
        let workers = WorkerPool::new(config.worker.threads, wake)?;
        Ok(Self {
            executors: RefCell::new(executors),
            workers: RefCell::new(workers),
        })
    }

    pub fn acquire_executor(&self) -> Result<ThreadsafeExecutor, SubmitError> {
        self.executors.borrow_mut().acquire()
    }

    pub fn submit_worker_task(
        &self,
        entry: TaskEntry,
        complete: TaskComplete,
    ) -> Result<WorkerTask, SubmitError> {
        self.workers.borrow_mut().submit(entry, complete)
    }

    pub fn cancel_worker_task(&self, task: WorkerTask) -> bool {
        self.workers.borrow_mut().cancel(task)
    }

    /// Run queued executor entries and worker completions.
    ///
    /// Executor entries are `Send` and cannot reach consumer-side state, so
    /// they run under the hub borrow. Worker completions can, so they run
    /// after the pool borrow is released.
    pub fn drain(&self) -> usize {
        let ran = self.executors.borrow_mut().drain();
        let completions = self.workers.borrow_mut().take_completions();
        let completed = completions.len();
        for completion in completions {
            completion.run();
        }
        ran + completed
    }

    /// Finalize every executor and stop the workers.
    ///
    /// Every outstanding worker task receives its completion.
    pub fn shutdown(&self) -> usize {
        let ran = self.executors.borrow_mut().shutdown();
        let completions = self.workers.borrow_mut().shutdown();
        let completed = completions.len();
        for completion in completions {
            completion.run();
        }
        ran + completed
    }

    /// Whether a drain step would find queued entries or completions.
    pub fn has_pending_work(&self) -> bool {
        self.executors.borrow().has_pending() || self.workers.borrow().has_ready()
    }

    pub fn live_executors(&self) -> usize {
        self.executors.borrow().live()
    }

    pub fn records_in_use(&self) -> usize {
        self.executors.borrow().records().in_use()
    }

    pub fn pending_worker_tasks(&self) -> usize {
        self.workers.borrow().pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_park_wake() {
        let wake = Arc::new(ParkWake::new());
        assert!(!wake.wait(Some(Duration::from_millis(1))));

        let remote = Arc::clone(&wake);
        let handle = std::thread::spawn(move || remote.wake());
        let start = Instant::now();
        assert!(wake.wait(Some(Duration::from_secs(5))));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_bridge_drain_runs_both_sides() {
        let bridge = Bridge::new(&BridgeConfig::default(), Arc::new(NoopWake)).unwrap();
        let executor = bridge.acquire_executor().unwrap();
        executor.submit(|| {}).unwrap();
        bridge
            .submit_worker_task(Box::new(|| {}), Box::new(|_| {}))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut ran = 0;
        while ran < 2 && Instant::now() < deadline {
            ran += bridge.drain();
        }
        assert_eq!(ran, 2);
        assert_eq!(bridge.shutdown(), 0);
    }

    #[test]
    fn test_pending_work_includes_worker_completions() {
        let bridge = Bridge::new(&BridgeConfig::default(), Arc::new(NoopWake)).unwrap();
        assert!(!bridge.has_pending_work());
        bridge
            .submit_worker_task(Box::new(|| {}), Box::new(|_| {}))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !bridge.has_pending_work() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(bridge.has_pending_work());
        assert_eq!(bridge.drain(), 1);
        assert!(!bridge.has_pending_work());
    }
}
