//! Synchronized recycling of boxed records
//!
//! Task records are allocated on producer threads and freed on the consumer
//! thread, so the free list has to be safe from both sides. A bounded
//! lock-free queue holds the spare boxes; anything beyond its capacity is
//! simply dropped.

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct RecordPool<T> {
    free: ArrayQueue<Box<T>>,
    in_use: AtomicUsize,
    allocated: AtomicUsize,
}

impl<T: Default> RecordPool<T> {
    /// Create a pool retaining at most `capacity` spare records.
    pub fn new(capacity: usize) -> Self {
        Self {
            free: ArrayQueue::new(capacity.max(1)),
            in_use: AtomicUsize::new(0),
            allocated: AtomicUsize::new(0),
        }
    }

    /// Take a spare record or allocate a fresh one.
    pub fn acquire(&self) -> Box<T> {
        self.in_use.fetch_add(1, Ordering::Relaxed);
        match self.free.pop() {
            Some(record) => record,
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                Box::default()
            }
        }
    }

    /// Reset a record and keep it for reuse.
    pub fn release(&self, mut record: Box<T>) {
        *record = T::default();
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        let _ = self.free.push(record);
    }

    /// Records handed out and not yet released.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    /// Spare records ready for reuse.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Total records ever allocated.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.free.capacity()
    }
}
