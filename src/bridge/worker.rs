//! Background worker tasks
//!
//! Entries run on a fixed set of named worker threads. Completions come back
//! over a channel and run on the consumer thread during its drain step.
//! Every submitted task gets exactly one completion call, whether it ran,
//! was canceled before starting, or was still queued at shutdown.
//!
//! A panicking entry still completes when panics unwind. Under
//! `panic = "abort"` (the release profile) it aborts the process instead.

use super::Wake;
use crate::error::SubmitError;
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Job body; runs on a worker thread.
pub type TaskEntry = Box<dyn FnOnce() + Send + 'static>;

/// Completion; runs on the consumer thread with the `canceled` flag.
pub type TaskComplete = Box<dyn FnOnce(bool) + 'static>;

/// Handle of a submitted worker task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct WorkerTask(u64);

struct Job {
    id: u64,
    entry: TaskEntry,
    cancel: Arc<AtomicBool>,
}

struct Done {
    id: u64,
    /// The pool skipped the entry
    pool_canceled: bool,
}

struct Pending {
    complete: TaskComplete,
    cancel: Arc<AtomicBool>,
    requested: bool,
}

/// A completion ready to run; returned by [`WorkerPool::take_completions`] so
/// the caller can run it without holding a borrow on the pool.
pub struct ReadyCompletion {
    complete: TaskComplete,
    canceled: bool,
}

impl ReadyCompletion {
    pub fn canceled(&self) -> bool {
        self.canceled
    }

    pub fn run(self) {
        (self.complete)(self.canceled)
    }
}

pub struct WorkerPool {
    jobs: Option<Sender<Job>>,
    done: Receiver<Done>,
    threads: Vec<JoinHandle<()>>,
    pending: HashMap<u64, Pending>,
    closing: Arc<AtomicBool>,
    next_id: u64,
    completed: u64,
}

impl WorkerPool {
    /// Spawn `threads` worker threads.
    pub fn new(threads: usize, wake: Arc<dyn Wake>) -> io::Result<Self> {
        let (job_tx, job_rx) = unbounded::<Job>();
        let (done_tx, done_rx) = unbounded::<Done>();
        let closing = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::with_capacity(threads);
        for index in 0..threads.max(1) {
            let jobs = job_rx.clone();
            let done = done_tx.clone();
            let closing = Arc::clone(&closing);
            let wake = Arc::clone(&wake);
            let handle = std::thread::Builder::new()
                .name(format!("netbridge-worker-{}", index))
                .spawn(move || worker_loop(jobs, done, closing, wake))?;
            handles.push(handle);
        }

        Ok(Self {
            jobs: Some(job_tx),
            done: done_rx,
            threads: handles,
            pending: HashMap::new(),
            closing,
            next_id: 1,
            completed: 0,
        })
    }

    /// Schedule `entry` on a worker; `complete` runs later on this thread.
    pub fn submit(
        &mut self,
        entry: TaskEntry,
        complete: TaskComplete,
    ) -> Result<WorkerTask, SubmitError> {
        let Some(jobs) = self.jobs.as_ref() else {
            return Err(SubmitError::ShutDown);
        };
        let id = self.next_id;
        self.next_id += 1;
        let cancel = Arc::new(AtomicBool::new(false));

        jobs.send(Job {
            id,
            entry,
            cancel: Arc::clone(&cancel),
        })
        .map_err(|_| SubmitError::ShutDown)?;

        self.pending.insert(
            id,
            Pending {
                complete,
                cancel,
                requested: false,
            },
        );
        Ok(WorkerTask(id))
    }

    /// Request cancellation.
    ///
    /// Best effort: an entry that already started runs to completion.
    /// Returns `false` if the task has already completed.
    pub fn cancel(&mut self, task: WorkerTask) -> bool {
        match self.pending.get_mut(&task.0) {
            Some(pending) => {
                pending.requested = true;
                pending.cancel.store(true, Ordering::SeqCst);
                debug!(task = task.0, "worker task cancel requested");
                true
            }
            None => false,
        }
    }

    /// Collect finished tasks.
    pub fn take_completions(&mut self) -> Vec<ReadyCompletion> {
        let mut ready = Vec::new();
        while let Ok(done) = self.done.try_recv() {
            if let Some(pending) = self.pending.remove(&done.id) {
                ready.push(ReadyCompletion {
                    complete: pending.complete,
                    canceled: pending.requested || done.pool_canceled,
                });
            }
        }
        self.completed += ready.len() as u64;
        ready
    }

    /// Stop the workers.
    ///
    /// Queued entries are skipped and reported as canceled. Blocks until
    /// running entries finish. Returns every outstanding completion.
    pub fn shutdown(&mut self) -> Vec<ReadyCompletion> {
        self.closing.store(true, Ordering::SeqCst);
        self.jobs = None;
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }

        let mut ready = self.take_completions();
        for (_, pending) in self.pending.drain() {
            ready.push(ReadyCompletion {
                complete: pending.complete,
                canceled: true,
            });
        }
        ready
    }

    /// Whether finished tasks wait to be collected.
    pub fn has_ready(&self) -> bool {
        !self.done.is_empty()
    }

    /// Tasks still waiting for their completion call.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn is_shut_down(&self) -> bool {
        self.jobs.is_none()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.is_shut_down() {
            for completion in self.shutdown() {
                completion.run();
            }
        }
    }
}

fn worker_loop(jobs: Receiver<Job>, done: Sender<Done>, closing: Arc<AtomicBool>, wake: Arc<dyn Wake>) {
    for job in jobs.iter() {
        let skip = closing.load(Ordering::SeqCst) || job.cancel.load(Ordering::SeqCst);
        if !skip && catch_unwind(AssertUnwindSafe(job.entry)).is_err() {
            warn!(task = job.id, "worker task panicked");
        }
        if done
            .send(Done {
                id: job.id,
                pool_canceled: skip,
            })
            .is_err()
        {
            break;
        }
        wake.wake();
    }
}
