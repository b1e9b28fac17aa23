//! Object pool and wrapper lifecycle
//!
//! Every native entity that crosses into the host gets a wrapper: a host
//! object of the entity's class plus the state the bridge keeps for it.
//! Wrappers are expensive to build on the hot receive path, so detached
//! ones are kept in a bounded LIFO pool and reused.
//!
//! # Lifecycle
//!
//! ```text
//!   acquire ──► Detached ──attach──► Attached ──release──► PooledIdle ──acquire──► Detached
//!                                        │
//!                                        └──release (pool full)──► Reclaimable ──GC──► destroyed
//! ```
//!
//! The host twin is held strongly while a wrapper is attached or idle in
//! the pool, and weakly once it is reclaimable. The pool never grows past
//! its maximum; the check happens at release time.

mod arena;
mod wrapper;

pub use arena::WrapperId;
pub use wrapper::{PooledWrapper, WrapperState};

use crate::entity::{Entity, EntityKind, NativeHandle};
use crate::error::{BridgeError, Result};
use crate::host::{ClassId, Finalized, HandleScope, Heap, HostError, HostObjectId};
use arena::Arena;
use serde::Serialize;
use std::rc::Rc;
use tracing::{debug, trace};

/// Pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub kind: EntityKind,
    pub max: usize,
    pub idle: usize,
    pub live: usize,
    pub constructed: u64,
    pub reused: u64,
    pub reclaimed: u64,
    pub destroyed: u64,
}

/// Bounded LIFO pool of wrappers for one entity kind.
///
/// Not thread-safe. Owned by the context and touched only on the consumer
/// thread.
pub struct WrapperPool<E: Entity> {
    heap: Rc<Heap>,
    class: ClassId,
    arena: Arena<PooledWrapper<E>>,
    idle: Vec<WrapperId>,
    max: usize,
    constructed: u64,
    reused: u64,
    reclaimed: u64,
    destroyed: u64,
}

impl<E: Entity> WrapperPool<E> {
    /// Create a pool and register the host class for its wrappers.
    pub fn new(heap: Rc<Heap>, max: usize) -> Self {
        let class = heap.define_class(E::KIND.class_name());
        Self {
            heap,
            class,
            arena: Arena::new(),
            idle: Vec::new(),
            max,
            constructed: 0,
            reused: 0,
            reclaimed: 0,
            destroyed: 0,
        }
    }

    pub fn kind(&self) -> EntityKind {
        E::KIND
    }

    pub fn class(&self) -> ClassId {
        self.class
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Number of wrappers idle in the pool.
    pub fn idle_len(&self) -> usize {
        self.idle.len()
    }

    /// Number of wrappers not yet destroyed, in any state.
    pub fn live_len(&self) -> usize {
        self.arena.len()
    }

    /// Take a wrapper from the pool, or construct one when the pool is empty.
    ///
    /// The returned wrapper is detached; attach it before handing it to the
    /// host.
    pub fn acquire(&mut self) -> Result<WrapperId> {
        while let Some(id) = self.idle.pop() {
            if let Some(wrapper) = self.arena.get_mut(id) {
                wrapper.state = WrapperState::Detached;
                self.reused += 1;
                trace!(kind = ?E::KIND, ?id, "reused pooled wrapper");
                return Ok(id);
            }
        }

        let heap = Rc::clone(&self.heap);
        let class = self.class;
        let id = self.arena.try_insert_with(|id| build_twin::<E>(&heap, class, id))?;
        self.constructed += 1;
        trace!(kind = ?E::KIND, ?id, "constructed wrapper");
        Ok(id)
    }

    /// Bind a detached wrapper to a native object.
    pub fn attach(&mut self, id: WrapperId, native: &NativeHandle) -> Result<()> {
        let wrapper = self
            .arena
            .get_mut(id)
            .ok_or(BridgeError::InvalidObject(E::KIND))?;
        if !matches!(wrapper.state, WrapperState::Detached) {
            return Err(BridgeError::InvalidObject(E::KIND));
        }
        wrapper.state = WrapperState::Attached(native.clone());
        native.set_extra(Some(id));
        Ok(())
    }

    /// Acquire a wrapper and attach it in one step.
    pub fn acquire_attached(&mut self, native: &NativeHandle) -> Result<WrapperId> {
        let id = self.acquire()?;
        self.attach(id, native)?;
        Ok(id)
    }

    /// Detach a wrapper from its native object and return it to the pool.
    ///
    /// When the pool is full the twin drops to a weak reference and is left
    /// for the host collector. Returns `false` if the wrapper was not
    /// attached.
    pub fn release(&mut self, id: WrapperId) -> Result<bool> {
        let pool_has_room = self.idle.len() < self.max;
        let wrapper = self
            .arena
            .get_mut(id)
            .ok_or(BridgeError::InvalidObject(E::KIND))?;

        let native = match std::mem::replace(&mut wrapper.state, WrapperState::Detached) {
            WrapperState::Attached(native) => native,
            other => {
                wrapper.state = other;
                return Ok(false);
            }
        };
        if native.extra() == Some(id) {
            native.set_extra(None);
        }
        wrapper.data.reset();

        if pool_has_room {
            wrapper.state = WrapperState::PooledIdle;
            self.idle.push(id);
            trace!(kind = ?E::KIND, ?id, idle = self.idle.len(), "wrapper pooled");
        } else {
            wrapper.state = WrapperState::Reclaimable;
            self.heap.reference_unref(wrapper.twin)?;
            self.reclaimed += 1;
            debug!(kind = ?E::KIND, ?id, "pool full, wrapper left for collection");
        }
        Ok(true)
    }

    /// Free a wrapper for good.
    ///
    /// Called when the host collected a reclaimable twin, and for every
    /// wrapper at context teardown. Retained state is dropped before the
    /// slot is freed, which abandons any pending promises.
    pub fn destroy(&mut self, id: WrapperId) -> Option<E> {
        let mut wrapper = self.arena.remove(id)?;
        match &wrapper.state {
            WrapperState::Attached(native) if native.extra() == Some(id) => native.set_extra(None),
            WrapperState::PooledIdle => self.idle.retain(|&idle| idle != id),
            _ => {}
        }
        if self.heap.is_alive(wrapper.twin) {
            let _ = self.heap.remove_wrap(wrapper.twin);
            let _ = self.heap.delete(wrapper.twin);
        }
        wrapper.data.reset();
        self.destroyed += 1;
        trace!(kind = ?E::KIND, ?id, "wrapper destroyed");
        Some(wrapper.data)
    }

    /// Run the finalizer for a collected twin of this pool's class.
    pub fn finalize(&mut self, record: &Finalized) -> bool {
        if record.class != self.class {
            return false;
        }
        self.destroy(WrapperId::from_bits(record.native)).is_some()
    }

    /// Destroy every wrapper; returns how many were destroyed.
    pub fn drain(&mut self) -> usize {
        let ids = self.arena.ids();
        for &id in &ids {
            self.destroy(id);
        }
        self.idle.clear();
        ids.len()
    }

    /// Reverse lookup through the native object's extra-data slot.
    pub fn lookup(&self, native: &NativeHandle) -> Option<WrapperId> {
        let id = native.extra()?;
        match &self.arena.get(id)?.state {
            WrapperState::Attached(attached) if attached.ptr_eq(native) => Some(id),
            _ => None,
        }
    }

    /// Find the wrapper whose twin is `object`.
    pub fn from_twin(&self, object: HostObjectId) -> Result<WrapperId> {
        if self.heap.class_of(object)? != Some(self.class) {
            return Err(BridgeError::InvalidObject(E::KIND));
        }
        let id = WrapperId::from_bits(self.heap.unwrap(object)?);
        match self.arena.get(id) {
            Some(wrapper) if wrapper.twin == object => Ok(id),
            _ => Err(BridgeError::InvalidObject(E::KIND)),
        }
    }

    /// Resolve a host object to its wrapper and attached native object.
    pub fn resolve(&self, object: HostObjectId) -> Result<(WrapperId, NativeHandle)> {
        let id = self.from_twin(object)?;
        match self.native(id) {
            Some(native) => Ok((id, native.clone())),
            None => Err(BridgeError::Detached(E::KIND)),
        }
    }

    pub fn get(&self, id: WrapperId) -> Option<&PooledWrapper<E>> {
        self.arena.get(id)
    }

    pub fn twin(&self, id: WrapperId) -> Option<HostObjectId> {
        self.arena.get(id).map(|w| w.twin)
    }

    pub fn native(&self, id: WrapperId) -> Option<&NativeHandle> {
        self.arena.get(id).and_then(|w| w.native())
    }

    pub fn data(&self, id: WrapperId) -> Option<&E> {
        self.arena.get(id).map(|w| &w.data)
    }

    pub fn data_mut(&mut self, id: WrapperId) -> Option<&mut E> {
        self.arena.get_mut(id).map(|w| &mut w.data)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            kind: E::KIND,
            max: self.max,
            idle: self.idle.len(),
            live: self.arena.len(),
            constructed: self.constructed,
            reused: self.reused,
            reclaimed: self.reclaimed,
            destroyed: self.destroyed,
        }
    }
}

/// Build the host twin for a new wrapper slot.
///
/// Anything built before a failure is deleted again, so a failed
/// construction never leaves a half-initialized wrapper behind.
fn build_twin<E: Entity>(
    heap: &Heap,
    class: ClassId,
    id: WrapperId,
) -> std::result::Result<PooledWrapper<E>, HostError> {
    let _scope: HandleScope<'_> = heap.open_scope();
    let twin = heap.new_instance(class)?;
    let built = heap
        .wrap(twin, id.to_bits())
        .and_then(|_| heap.reference_ref(twin));
    if let Err(err) = built {
        let _ = heap.delete(twin);
        return Err(err);
    }
    Ok(PooledWrapper::new(twin, E::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{MessageData, SessionData};
    use crate::host::HeapOptions;

    fn session(id: u64) -> NativeHandle {
        NativeHandle::new(EntityKind::Session, id)
    }

    #[test]
    fn test_release_reuses_same_wrapper() {
        let heap = Rc::new(Heap::new());
        let mut pool: WrapperPool<SessionData> = WrapperPool::new(heap, 2);

        let native = session(1);
        let w1 = pool.acquire_attached(&native).unwrap();
        assert!(pool.release(w1).unwrap());
        assert_eq!(pool.idle_len(), 1);
        assert!(pool.native(w1).is_none());
        assert_eq!(native.extra(), None);

        let again = pool.acquire().unwrap();
        assert_eq!(again, w1);
        assert_eq!(pool.stats().constructed, 1);
        assert_eq!(pool.stats().reused, 1);
    }

    #[test]
    fn test_full_pool_drops_to_weak() {
        let heap = Rc::new(Heap::new());
        let mut pool: WrapperPool<SessionData> = WrapperPool::new(Rc::clone(&heap), 1);

        let w1 = pool.acquire_attached(&session(1)).unwrap();
        let w2 = pool.acquire_attached(&session(2)).unwrap();
        pool.release(w1).unwrap();
        pool.release(w2).unwrap();

        assert_eq!(pool.idle_len(), 1);
        assert!(matches!(pool.get(w1).unwrap().state(), WrapperState::PooledIdle));
        assert!(matches!(pool.get(w2).unwrap().state(), WrapperState::Reclaimable));
        assert_eq!(heap.refcount(pool.twin(w2).unwrap()).unwrap(), 0);

        let collected = heap.collect_garbage();
        assert_eq!(collected.len(), 1);
        assert!(pool.finalize(&collected[0]));
        assert!(pool.get(w2).is_none());
        assert_eq!(pool.live_len(), 1);
    }

    #[test]
    fn test_release_detached_is_noop() {
        let heap = Rc::new(Heap::new());
        let mut pool: WrapperPool<MessageData> = WrapperPool::new(heap, 4);
        let id = pool.acquire().unwrap();
        assert!(!pool.release(id).unwrap());
        assert_eq!(pool.idle_len(), 0);
    }

    #[test]
    fn test_lookup_round_trip() {
        let heap = Rc::new(Heap::new());
        let mut pool: WrapperPool<SessionData> = WrapperPool::new(heap, 4);
        let native = session(3);
        let id = pool.acquire_attached(&native).unwrap();

        assert_eq!(pool.lookup(&native), Some(id));
        let twin = pool.twin(id).unwrap();
        assert_eq!(pool.from_twin(twin).unwrap(), id);

        pool.release(id).unwrap();
        assert_eq!(pool.lookup(&native), None);
    }

    #[test]
    fn test_failed_construction_never_enters_pool() {
        let heap = Rc::new(Heap::with_options(HeapOptions {
            max_objects: Some(1),
            ..Default::default()
        }));
        let mut pool: WrapperPool<MessageData> = WrapperPool::new(heap, 4);
        pool.acquire().unwrap();
        assert!(matches!(
            pool.acquire(),
            Err(BridgeError::Host(HostError::HeapExhausted(_)))
        ));
        assert_eq!(pool.live_len(), 1);
        assert_eq!(pool.idle_len(), 0);
    }

    #[test]
    fn test_drain_frees_twins() {
        let heap = Rc::new(Heap::new());
        let mut pool: WrapperPool<SessionData> = WrapperPool::new(Rc::clone(&heap), 4);
        let native = session(1);
        let a = pool.acquire_attached(&native).unwrap();
        let b = pool.acquire_attached(&session(2)).unwrap();
        pool.release(b).unwrap();

        assert_eq!(pool.drain(), 2);
        assert_eq!(heap.stats().live_objects, 0);
        assert_eq!(native.extra(), None);
        assert!(pool.get(a).is_none());
    }
}
