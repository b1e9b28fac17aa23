//! Object heap with reference counting and handle scopes

use super::{HostBuffer, HostError};
use std::cell::RefCell;

/// Generational identifier of a host object.
///
/// Stale ids (the object was collected and the slot reused) are detected by
/// the generation check and reported as [`HostError::InvalidObject`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostObjectId {
    index: u32,
    generation: u32,
}

/// Identifier of a class registered with [`Heap::define_class`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(u32);

/// A wrapped object that was collected; its finalizer must run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Finalized {
    pub object: HostObjectId,
    pub class: ClassId,
    pub native: u64,
}

/// Environment restrictions of the host.
#[derive(Debug, Clone)]
pub struct HeapOptions {
    /// Whether buffers may point at native memory without copying
    pub allow_external_buffers: bool,
    /// Upper bound on live objects; `None` is unbounded
    pub max_objects: Option<usize>,
}

impl Default for HeapOptions {
    fn default() -> Self {
        Self {
            allow_external_buffers: true,
            max_objects: None,
        }
    }
}

/// Heap counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub live_objects: usize,
    pub strong_objects: usize,
    pub rooted_handles: usize,
    pub scope_depth: usize,
    pub collected: u64,
    pub finalized: u64,
}

struct ClassInfo {
    name: String,
}

struct HostObject {
    class: Option<ClassId>,
    refcount: u32,
    native: Option<u64>,
}

struct Slot {
    generation: u32,
    object: Option<HostObject>,
}

#[derive(Default)]
struct HeapInner {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
    classes: Vec<ClassInfo>,
    roots: Vec<HostObjectId>,
    scope_depth: usize,
    collected: u64,
    finalized: u64,
}

impl HeapInner {
    fn object(&self, id: HostObjectId) -> Result<&HostObject, HostError> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.object.as_ref())
            .ok_or(HostError::InvalidObject)
    }

    fn object_mut(&mut self, id: HostObjectId) -> Result<&mut HostObject, HostError> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.object.as_mut())
            .ok_or(HostError::InvalidObject)
    }

    fn free_slot(&mut self, index: u32) -> Option<HostObject> {
        let slot = &mut self.slots[index as usize];
        let object = slot.object.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
        self.live -= 1;
        Some(object)
    }
}

/// The host heap.
pub struct Heap {
    options: HeapOptions,
    inner: RefCell<HeapInner>,
}

impl Heap {
    pub fn new() -> Self {
        Self::with_options(HeapOptions::default())
    }

    pub fn with_options(options: HeapOptions) -> Self {
        Self {
            options,
            inner: RefCell::new(HeapInner::default()),
        }
    }

    pub fn options(&self) -> &HeapOptions {
        &self.options
    }

    /// Register a class whose wrapped instances get finalization records.
    pub fn define_class(&self, name: &str) -> ClassId {
        let mut inner = self.inner.borrow_mut();
        inner.classes.push(ClassInfo {
            name: name.to_string(),
        });
        ClassId(inner.classes.len() as u32 - 1)
    }

    pub fn class_name(&self, class: ClassId) -> Option<String> {
        self.inner
            .borrow()
            .classes
            .get(class.0 as usize)
            .map(|c| c.name.clone())
    }

    /// Construct an instance of `class`.
    ///
    /// The new object starts weak; it is rooted by the innermost open
    /// handle scope, if any.
    pub fn new_instance(&self, class: ClassId) -> Result<HostObjectId, HostError> {
        if class.0 as usize >= self.inner.borrow().classes.len() {
            return Err(HostError::UnknownClass);
        }
        self.allocate(Some(class))
    }

    /// Construct a plain object with no class.
    pub fn new_object(&self) -> Result<HostObjectId, HostError> {
        self.allocate(None)
    }

    fn allocate(&self, class: Option<ClassId>) -> Result<HostObjectId, HostError> {
        let mut inner = self.inner.borrow_mut();
        if let Some(max) = self.options.max_objects {
            if inner.live >= max {
                return Err(HostError::HeapExhausted(inner.live));
            }
        }

        let object = HostObject {
            class,
            refcount: 0,
            native: None,
        };
        let reused = inner.free.pop();
        let id = match reused {
            Some(index) => {
                let slot = &mut inner.slots[index as usize];
                slot.object = Some(object);
                HostObjectId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = inner.slots.len() as u32;
                inner.slots.push(Slot {
                    generation: 0,
                    object: Some(object),
                });
                HostObjectId {
                    index,
                    generation: 0,
                }
            }
        };
        inner.live += 1;
        if inner.scope_depth > 0 {
            inner.roots.push(id);
        }
        Ok(id)
    }

    pub fn is_alive(&self, id: HostObjectId) -> bool {
        self.inner.borrow().object(id).is_ok()
    }

    pub fn class_of(&self, id: HostObjectId) -> Result<Option<ClassId>, HostError> {
        Ok(self.inner.borrow().object(id)?.class)
    }

    /// Attach a native value to an object.
    pub fn wrap(&self, id: HostObjectId, native: u64) -> Result<(), HostError> {
        let mut inner = self.inner.borrow_mut();
        let object = inner.object_mut(id)?;
        if object.native.is_some() {
            return Err(HostError::AlreadyWrapped);
        }
        object.native = Some(native);
        Ok(())
    }

    pub fn unwrap(&self, id: HostObjectId) -> Result<u64, HostError> {
        self.inner
            .borrow()
            .object(id)?
            .native
            .ok_or(HostError::NotWrapped)
    }

    /// Detach the native value so the object is no longer finalized.
    pub fn remove_wrap(&self, id: HostObjectId) -> Result<u64, HostError> {
        self.inner
            .borrow_mut()
            .object_mut(id)?
            .native
            .take()
            .ok_or(HostError::NotWrapped)
    }

    /// Increment the reference count; returns the new count.
    pub fn reference_ref(&self, id: HostObjectId) -> Result<u32, HostError> {
        let mut inner = self.inner.borrow_mut();
        let object = inner.object_mut(id)?;
        object.refcount += 1;
        Ok(object.refcount)
    }

    /// Decrement the reference count; at zero the reference is weak.
    pub fn reference_unref(&self, id: HostObjectId) -> Result<u32, HostError> {
        let mut inner = self.inner.borrow_mut();
        let object = inner.object_mut(id)?;
        if object.refcount == 0 {
            return Err(HostError::RefUnderflow);
        }
        object.refcount -= 1;
        Ok(object.refcount)
    }

    pub fn refcount(&self, id: HostObjectId) -> Result<u32, HostError> {
        Ok(self.inner.borrow().object(id)?.refcount)
    }

    /// Free an object immediately, without finalization.
    pub fn delete(&self, id: HostObjectId) -> Result<(), HostError> {
        let mut inner = self.inner.borrow_mut();
        inner.object(id)?;
        inner.free_slot(id.index);
        Ok(())
    }

    /// Open a handle scope. Objects created while it is open stay rooted
    /// until it is dropped.
    pub fn open_scope(&self) -> HandleScope<'_> {
        let mut inner = self.inner.borrow_mut();
        inner.scope_depth += 1;
        HandleScope {
            heap: self,
            mark: inner.roots.len(),
        }
    }

    /// Create a buffer over native memory without copying.
    pub fn create_external_buffer<'a>(&self, data: &'a [u8]) -> Result<HostBuffer<'a>, HostError> {
        if !self.options.allow_external_buffers {
            return Err(HostError::NoExternalBuffersAllowed);
        }
        Ok(HostBuffer::external(data))
    }

    /// Create a host-owned copy of `data`.
    pub fn create_buffer_copy(&self, data: &[u8]) -> Result<HostBuffer<'static>, HostError> {
        if let Some(max) = self.options.max_objects {
            let live = self.inner.borrow().live;
            if live >= max {
                return Err(HostError::HeapExhausted(live));
            }
        }
        Ok(HostBuffer::owned(data.to_vec()))
    }

    /// Marshal native bytes into a host buffer, preferring zero-copy.
    ///
    /// A host that forbids external buffers gets an owned copy instead.
    pub fn wrap_buffer<'a>(&self, data: &'a [u8]) -> Result<HostBuffer<'a>, HostError> {
        match self.create_external_buffer(data) {
            Err(HostError::NoExternalBuffersAllowed) => self.create_buffer_copy(data),
            other => other,
        }
    }

    /// Free every object that is neither referenced nor rooted.
    ///
    /// Returns the wrapped instances of classes so the caller can run their
    /// finalizers. Unwrapped and classless objects are dropped silently.
    pub fn collect_garbage(&self) -> Vec<Finalized> {
        let mut inner = self.inner.borrow_mut();
        let mut rooted = vec![false; inner.slots.len()];
        for root in &inner.roots {
            if let Some(flag) = rooted.get_mut(root.index as usize) {
                *flag = true;
            }
        }

        let mut finalized = Vec::new();
        for index in 0..inner.slots.len() {
            let slot = &inner.slots[index];
            let collectable = match &slot.object {
                Some(object) => object.refcount == 0 && !rooted[index],
                None => false,
            };
            if !collectable {
                continue;
            }
            let generation = slot.generation;
            if let Some(object) = inner.free_slot(index as u32) {
                inner.collected += 1;
                if let (Some(class), Some(native)) = (object.class, object.native) {
                    inner.finalized += 1;
                    finalized.push(Finalized {
                        object: HostObjectId {
                            index: index as u32,
                            generation,
                        },
                        class,
                        native,
                    });
                }
            }
        }
        finalized
    }

    pub fn stats(&self) -> HeapStats {
        let inner = self.inner.borrow();
        HeapStats {
            live_objects: inner.live,
            strong_objects: inner
                .slots
                .iter()
                .filter_map(|s| s.object.as_ref())
                .filter(|o| o.refcount > 0)
                .count(),
            rooted_handles: inner.roots.len(),
            scope_depth: inner.scope_depth,
            collected: inner.collected,
            finalized: inner.finalized,
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII handle scope.
///
/// Dropping the scope unroots every object created inside it, on every exit
/// path including early returns through `?`.
pub struct HandleScope<'h> {
    heap: &'h Heap,
    mark: usize,
}

impl HandleScope<'_> {
    /// Handles rooted by this scope so far.
    pub fn len(&self) -> usize {
        self.heap.inner.borrow().roots.len().saturating_sub(self.mark)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for HandleScope<'_> {
    fn drop(&mut self) {
        let mut inner = self.heap.inner.borrow_mut();
        inner.roots.truncate(self.mark);
        inner.scope_depth = inner.scope_depth.saturating_sub(1);
    }
}
