//! Threadsafe executor
//!
//! A bounded multi-producer, single-consumer channel that moves closures
//! from arbitrary threads onto the consumer thread.
//!
//! Producers hold a [`ThreadsafeExecutor`] (cheap to clone, `Send + Sync`)
//! and call [`submit`](ThreadsafeExecutor::submit), which never blocks: it
//! enqueues or fails with [`SubmitError`]. The consumer owns the
//! [`ExecutorHub`] and runs queued entries during its drain step.
//!
//! Release is itself a queued record. Teardown therefore happens on the
//! consumer thread, after every entry accepted before the release.

use super::{RecordPool, Wake};
use crate::error::SubmitError;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Work item run on the consumer thread.
pub type ExecutorEntry = Box<dyn FnOnce() + Send + 'static>;

/// Queue slot. Either an entry or the release marker.
#[derive(Default)]
pub struct TaskRecord {
    entry: Option<ExecutorEntry>,
    release: bool,
}

/// Identifier of an executor within its hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ExecutorId(u64);

struct ExecutorShared {
    id: ExecutorId,
    released: AtomicBool,
    /// Submissions between the released check and the enqueue
    inflight: AtomicUsize,
    submitted: AtomicU64,
    sender: Sender<Box<TaskRecord>>,
    records: Arc<RecordPool<TaskRecord>>,
    wake: Arc<dyn Wake>,
}

/// Producer side of an executor.
#[derive(Clone)]
pub struct ThreadsafeExecutor {
    shared: Arc<ExecutorShared>,
}

impl ThreadsafeExecutor {
    pub fn id(&self) -> ExecutorId {
        self.shared.id
    }

    /// Queue `entry` to run once on the consumer thread.
    pub fn submit<F>(&self, entry: F) -> Result<(), SubmitError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit_boxed(Box::new(entry))
    }

    pub fn submit_boxed(&self, entry: ExecutorEntry) -> Result<(), SubmitError> {
        let shared = &self.shared;
        shared.inflight.fetch_add(1, Ordering::SeqCst);
        let result = if shared.released.load(Ordering::SeqCst) {
            Err(SubmitError::Released)
        } else {
            let mut record = shared.records.acquire();
            record.entry = Some(entry);
            match shared.sender.try_send(record) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(record)) => {
                    shared.records.release(record);
                    Err(SubmitError::QueueFull)
                }
                Err(TrySendError::Disconnected(record)) => {
                    shared.records.release(record);
                    Err(SubmitError::Released)
                }
            }
        };
        shared.inflight.fetch_sub(1, Ordering::SeqCst);

        if result.is_ok() {
            shared.submitted.fetch_add(1, Ordering::Relaxed);
            shared.wake.wake();
        }
        result
    }

    /// Stop accepting work and schedule teardown on the consumer thread.
    ///
    /// Entries already accepted still run. Returns `false` if the executor
    /// was already released.
    pub fn release(&self) -> bool {
        let shared = &self.shared;
        if shared.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        let mut record = shared.records.acquire();
        record.release = true;
        if let Err(err) = shared.sender.try_send(record) {
            // The hub finalizes a released executor once its queue drains.
            warn!(executor = ?shared.id, "release marker not queued, queue full");
            shared.records.release(err.into_inner());
        }
        shared.wake.wake();
        true
    }

    pub fn is_released(&self) -> bool {
        self.shared.released.load(Ordering::SeqCst)
    }

    /// Entries accepted so far.
    pub fn submitted(&self) -> u64 {
        self.shared.submitted.load(Ordering::Relaxed)
    }

    /// Entries waiting in the queue.
    pub fn queued(&self) -> usize {
        self.shared.sender.len()
    }
}

impl std::fmt::Debug for ThreadsafeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadsafeExecutor")
            .field("id", &self.shared.id)
            .field("released", &self.is_released())
            .finish()
    }
}

struct HubEntry {
    shared: Arc<ExecutorShared>,
    receiver: Receiver<Box<TaskRecord>>,
}

/// Consumer side of every executor created by one platform.
pub struct ExecutorHub {
    entries: BTreeMap<ExecutorId, HubEntry>,
    records: Arc<RecordPool<TaskRecord>>,
    wake: Arc<dyn Wake>,
    capacity: usize,
    budget: usize,
    next_id: u64,
    executed: u64,
    closed: bool,
}

impl ExecutorHub {
    pub fn new(
        capacity: usize,
        budget: usize,
        record_pool_capacity: usize,
        wake: Arc<dyn Wake>,
    ) -> Self {
        Self {
            entries: BTreeMap::new(),
            records: Arc::new(RecordPool::new(record_pool_capacity)),
            wake,
            capacity: capacity.max(1),
            budget: budget.max(1),
            next_id: 1,
            executed: 0,
            closed: false,
        }
    }

    /// Create an executor bound to this hub.
    pub fn acquire(&mut self) -> Result<ThreadsafeExecutor, SubmitError> {
        if self.closed {
            return Err(SubmitError::ShutDown);
        }
        let id = ExecutorId(self.next_id);
        self.next_id += 1;

        let (sender, receiver) = bounded(self.capacity);
        let shared = Arc::new(ExecutorShared {
            id,
            released: AtomicBool::new(false),
            inflight: AtomicUsize::new(0),
            submitted: AtomicU64::new(0),
            sender,
            records: Arc::clone(&self.records),
            wake: Arc::clone(&self.wake),
        });
        self.entries.insert(
            id,
            HubEntry {
                shared: Arc::clone(&shared),
                receiver,
            },
        );
        debug!(executor = ?id, capacity = self.capacity, "executor acquired");
        Ok(ThreadsafeExecutor { shared })
    }

    /// Run queued entries, at most the drain budget per executor.
    ///
    /// Returns the number of entries run.
    pub fn drain(&mut self) -> usize {
        let mut ran = 0;
        let ids: Vec<ExecutorId> = self.entries.keys().copied().collect();
        for id in ids {
            let Some(entry) = self.entries.get(&id) else {
                continue;
            };
            let mut finished = false;
            for _ in 0..self.budget {
                let Ok(record) = entry.receiver.try_recv() else {
                    break;
                };
                if record.release {
                    self.records.release(record);
                    finished = true;
                    break;
                }
                run_record(&self.records, record);
                ran += 1;
            }
            if !finished
                && entry.shared.released.load(Ordering::SeqCst)
                && entry.receiver.is_empty()
            {
                finished = true;
            }
            if finished {
                ran += self.finalize(id);
            }
        }
        self.executed += ran as u64;
        ran
    }

    /// Tear down a released executor; returns entries run while finishing.
    fn finalize(&mut self, id: ExecutorId) -> usize {
        let Some(entry) = self.entries.remove(&id) else {
            return 0;
        };
        // A producer that passed the released check may still be enqueuing.
        while entry.shared.inflight.load(Ordering::SeqCst) != 0 {
            std::hint::spin_loop();
            std::thread::yield_now();
        }
        let mut ran = 0;
        while let Ok(record) = entry.receiver.try_recv() {
            if record.release {
                self.records.release(record);
            } else {
                run_record(&self.records, record);
                ran += 1;
            }
        }
        debug!(executor = ?id, drained = ran, "executor finalized");
        ran
    }

    /// Release and finalize every executor, running what is still queued.
    pub fn shutdown(&mut self) -> usize {
        self.closed = true;
        let ids: Vec<ExecutorId> = self.entries.keys().copied().collect();
        let mut ran = 0;
        for id in ids {
            if let Some(entry) = self.entries.get(&id) {
                entry.shared.released.store(true, Ordering::SeqCst);
            }
            ran += self.finalize(id);
        }
        self.executed += ran as u64;
        ran
    }

    /// Executors not yet finalized.
    pub fn live(&self) -> usize {
        self.entries.len()
    }

    /// Entries run since creation.
    pub fn executed(&self) -> u64 {
        self.executed
    }

    pub fn records(&self) -> &RecordPool<TaskRecord> {
        &self.records
    }

    /// Whether any executor has queued work.
    pub fn has_pending(&self) -> bool {
        self.entries
            .values()
            .any(|e| !e.receiver.is_empty() || e.shared.released.load(Ordering::SeqCst))
    }
}

fn run_record(records: &RecordPool<TaskRecord>, mut record: Box<TaskRecord>) {
    if let Some(entry) = record.entry.take() {
        entry();
    }
    records.release(record);
}
