//! Timer bridge bookkeeping
//!
//! Each started timer owns a record with its entry, repeat interval and the
//! backend resource that keeps it alive (a wheel token, or a strongly held
//! host timer object). A timer goes `unarmed → pending | active → cleared`;
//! clearing happens exactly once, on one-shot expiry or on stop.

use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::trace;

/// Timer callback; runs on the consumer thread.
pub type TimerEntry = Box<dyn FnMut() + 'static>;

/// Identifier of a started timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerKey(u64);

impl TimerKey {
    pub fn to_bits(self) -> u64 {
        self.0
    }

    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }
}

/// Caller-side correlator for a started timer.
///
/// Clones share the same slot. Armed while the timer is pending or active.
#[derive(Debug, Clone, Default)]
pub struct TimerHandle {
    slot: Rc<Cell<Option<TimerKey>>>,
}

impl TimerHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_armed(&self) -> bool {
        self.slot.get().is_some()
    }

    pub fn key(&self) -> Option<TimerKey> {
        self.slot.get()
    }

    fn arm(&self, key: TimerKey) {
        self.slot.set(Some(key));
    }

    /// Clear only if still pointing at `key`.
    fn clear(&self, key: TimerKey) {
        if self.slot.get() == Some(key) {
            self.slot.set(None);
        }
    }
}

/// Result of firing a timer.
#[derive(Debug)]
pub enum FireOutcome<R> {
    /// No such timer, or it is already running
    Unknown,
    /// Repeating timer stays armed
    Rearmed,
    /// One-shot timer finished; its resource is handed back
    Finished(R),
    /// The entry stopped its own timer
    StoppedDuringFire,
}

struct TimerRecord<R> {
    /// Taken out while the entry runs
    entry: Option<TimerEntry>,
    repeat_ms: u64,
    handle: Option<TimerHandle>,
    resource: R,
}

/// Started timers keyed by [`TimerKey`].
pub struct TimerRegistry<R> {
    timers: HashMap<TimerKey, TimerRecord<R>>,
    next_key: u64,
    fired: u64,
}

impl<R> TimerRegistry<R> {
    pub fn new() -> Self {
        Self {
            timers: HashMap::new(),
            next_key: 1,
            fired: 0,
        }
    }

    /// Allocate the key the next timer will use.
    pub fn next_key(&mut self) -> TimerKey {
        let key = TimerKey(self.next_key);
        self.next_key += 1;
        key
    }

    /// Record a started timer and arm its handle.
    pub fn insert(
        &mut self,
        key: TimerKey,
        entry: TimerEntry,
        repeat_ms: u64,
        handle: Option<&TimerHandle>,
        resource: R,
    ) {
        if let Some(handle) = handle {
            handle.arm(key);
        }
        self.timers.insert(
            key,
            TimerRecord {
                entry: Some(entry),
                repeat_ms,
                handle: handle.cloned(),
                resource,
            },
        );
        trace!(?key, repeat_ms, "timer armed");
    }

    /// Take the entry out so it can run without a borrow on the registry.
    pub fn begin_fire(&mut self, key: TimerKey) -> Option<TimerEntry> {
        self.timers.get_mut(&key)?.entry.take()
    }

    /// Put the entry back after it ran and apply the one-shot rule.
    pub fn end_fire(&mut self, key: TimerKey, entry: TimerEntry) -> FireOutcome<R> {
        self.fired += 1;
        let Some(record) = self.timers.get_mut(&key) else {
            return FireOutcome::StoppedDuringFire;
        };
        if record.repeat_ms > 0 {
            record.entry = Some(entry);
            return FireOutcome::Rearmed;
        }
        match self.timers.remove(&key) {
            Some(record) => {
                if let Some(handle) = &record.handle {
                    handle.clear(key);
                }
                trace!(?key, "one-shot timer cleared");
                FireOutcome::Finished(record.resource)
            }
            None => FireOutcome::Unknown,
        }
    }

    /// Stop a timer; returns its resource if it was armed.
    pub fn stop(&mut self, key: TimerKey) -> Option<R> {
        let record = self.timers.remove(&key)?;
        if let Some(handle) = &record.handle {
            handle.clear(key);
        }
        trace!(?key, "timer stopped");
        Some(record.resource)
    }

    pub fn resource(&self, key: TimerKey) -> Option<&R> {
        self.timers.get(&key).map(|r| &r.resource)
    }

    pub fn repeat_ms(&self, key: TimerKey) -> Option<u64> {
        self.timers.get(&key).map(|r| r.repeat_ms)
    }

    pub fn contains(&self, key: TimerKey) -> bool {
        self.timers.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn fired(&self) -> u64 {
        self.fired
    }

    /// Stop everything; returns the resources.
    pub fn clear(&mut self) -> Vec<R> {
        let keys: Vec<TimerKey> = self.timers.keys().copied().collect();
        keys.into_iter().filter_map(|key| self.stop(key)).collect()
    }
}

impl<R> Default for TimerRegistry<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// Fire a timer through a shared registry.
///
/// The registry is not borrowed while the entry runs, so the entry may start
/// or stop timers itself.
pub fn fire<R>(registry: &std::cell::RefCell<TimerRegistry<R>>, key: TimerKey) -> FireOutcome<R> {
    let entry = registry.borrow_mut().begin_fire(key);
    match entry {
        Some(mut entry) => {
            entry();
            registry.borrow_mut().end_fire(key, entry)
        }
        None => FireOutcome::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn counter() -> (Rc<Cell<u32>>, TimerEntry) {
        let count = Rc::new(Cell::new(0));
        let inner = Rc::clone(&count);
        (count, Box::new(move || inner.set(inner.get() + 1)))
    }

    #[test]
    fn test_one_shot_clears_handle() {
        let registry = RefCell::new(TimerRegistry::new());
        let handle = TimerHandle::new();
        let (count, entry) = counter();

        let key = registry.borrow_mut().next_key();
        registry
            .borrow_mut()
            .insert(key, entry, 0, Some(&handle), "res");
        assert!(handle.is_armed());

        assert!(matches!(fire(&registry, key), FireOutcome::Finished("res")));
        assert_eq!(count.get(), 1);
        assert!(!handle.is_armed());
        assert!(matches!(fire(&registry, key), FireOutcome::Unknown));
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_repeating_until_stopped() {
        let registry = RefCell::new(TimerRegistry::new());
        let handle = TimerHandle::new();
        let (count, entry) = counter();

        let key = registry.borrow_mut().next_key();
        registry.borrow_mut().insert(key, entry, 10, Some(&handle), ());
        for _ in 0..3 {
            assert!(matches!(fire(&registry, key), FireOutcome::Rearmed));
        }
        assert!(handle.is_armed());

        assert_eq!(registry.borrow_mut().stop(key), Some(()));
        assert!(!handle.is_armed());
        assert!(registry.borrow_mut().stop(key).is_none());
        assert!(matches!(fire(&registry, key), FireOutcome::Unknown));
        assert_eq!(count.get(), 3);
    }

    #[test]
    fn test_entry_stops_own_timer() {
        let registry = Rc::new(RefCell::new(TimerRegistry::new()));
        let key = registry.borrow_mut().next_key();
        let inner = Rc::clone(&registry);
        registry.borrow_mut().insert(
            key,
            Box::new(move || {
                inner.borrow_mut().stop(key);
            }),
            5,
            None,
            (),
        );
        assert!(matches!(
            fire(&registry, key),
            FireOutcome::StoppedDuringFire
        ));
        assert!(registry.borrow().is_empty());
    }

    #[test]
    fn test_stale_handle_not_cleared_by_old_key() {
        let mut registry = TimerRegistry::new();
        let handle = TimerHandle::new();
        let first = registry.next_key();
        registry.insert(first, Box::new(|| {}), 0, Some(&handle), ());
        let second = registry.next_key();
        registry.insert(second, Box::new(|| {}), 0, Some(&handle), ());

        registry.stop(first);
        assert_eq!(handle.key(), Some(second));
    }
}
