use crate::entity::NativeHandle;
use crate::host::HostObjectId;

/// Where a wrapper is in its lifecycle.
#[derive(Debug, Clone)]
pub enum WrapperState {
    /// Acquired but not yet bound to a native object
    Detached,
    /// Bound to a native object; twin held strongly
    Attached(NativeHandle),
    /// Idle in the pool; twin held strongly
    PooledIdle,
    /// Released while the pool was full; twin held weakly until collected
    Reclaimable,
}

/// A native entity's host-visible twin plus the state kept for it.
pub struct PooledWrapper<E> {
    pub(super) state: WrapperState,
    pub(super) twin: HostObjectId,
    pub(super) data: E,
}

impl<E> PooledWrapper<E> {
    pub(super) fn new(twin: HostObjectId, data: E) -> Self {
        Self {
            state: WrapperState::Detached,
            twin,
            data,
        }
    }

    pub fn state(&self) -> &WrapperState {
        &self.state
    }

    pub fn twin(&self) -> HostObjectId {
        self.twin
    }

    /// The native object; `None` means detached.
    pub fn native(&self) -> Option<&NativeHandle> {
        match &self.state {
            WrapperState::Attached(native) => Some(native),
            _ => None,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.native().is_some()
    }

    pub fn data(&self) -> &E {
        &self.data
    }
}
