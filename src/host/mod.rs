//! Host object model
//!
//! A single-threaded, garbage-collected object heap that the bridge talks to
//! the same way a binding layer talks to a scripting runtime:
//!
//! - objects are created from classes and live until they become unreachable
//! - reachability comes from reference counts (`0` means weak) or from
//!   being rooted in an open [`HandleScope`]
//! - a native value can be wrapped onto an object and read back later
//! - [`Heap::collect_garbage`] frees unreachable objects and reports the
//!   wrapped ones so their finalizers can run
//!
//! Nothing in this module is `Send`. Every call happens on the consumer
//! thread.

mod buffer;
mod heap;
mod promise;

pub use buffer::HostBuffer;
pub use heap::{
    ClassId, Finalized, HandleScope, Heap, HeapOptions, HeapStats, HostObjectId,
};
pub use promise::{promise, Deferred, Promise, PromiseState};

use thiserror::Error;

/// Failures reported by the host heap.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    /// The host forbids buffers backed by native memory.
    #[error("external buffers are not allowed in this environment")]
    NoExternalBuffersAllowed,

    #[error("host heap exhausted ({0} live objects)")]
    HeapExhausted(usize),

    #[error("invalid or collected host object")]
    InvalidObject,

    #[error("host object is not wrapped")]
    NotWrapped,

    #[error("host object is already wrapped")]
    AlreadyWrapped,

    #[error("reference count underflow")]
    RefUnderflow,

    #[error("unknown class")]
    UnknownClass,

    #[error("{0}")]
    Thrown(HostException),
}

/// A value thrown by host code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HostException {
    message: String,
}

impl HostException {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<HostException> for HostError {
    fn from(exception: HostException) -> Self {
        HostError::Thrown(exception)
    }
}
