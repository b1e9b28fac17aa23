//! Native entities and their host-visible state
//!
//! The networking engine owns four kinds of native objects: sockets,
//! sessions, channels and messages. Each one surfaces to the host through a
//! pooled wrapper (see [`crate::pool`]). This module holds what is shared by
//! both sides of that boundary:
//!
//! - [`NativeHandle`]: the engine's object, with an extra-data slot that
//!   points back at the wrapper currently attached to it
//! - [`Entity`]: per-kind state retained by a wrapper
//! - [`SocketListener`]: host callbacks fired from engine events

mod listener;
mod state;

pub use listener::SocketListener;
pub use state::{ChannelData, ChannelMode, MessageData, SessionData, SocketData};

use crate::pool::WrapperId;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// The four kinds of native entity with a host-visible twin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Socket,
    Session,
    Channel,
    Message,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Socket,
        EntityKind::Session,
        EntityKind::Channel,
        EntityKind::Message,
    ];

    /// Host class name of the wrapper.
    pub fn class_name(self) -> &'static str {
        match self {
            EntityKind::Socket => "Socket",
            EntityKind::Session => "Session",
            EntityKind::Channel => "Channel",
            EntityKind::Message => "Message",
        }
    }
}

/// State a wrapper retains for its entity kind.
pub trait Entity: Default + 'static {
    const KIND: EntityKind;

    /// Drop everything retained for the previous native object.
    fn reset(&mut self);
}

struct NativeCell {
    kind: EntityKind,
    id: u64,
    extra: Mutex<Option<WrapperId>>,
}

/// Handle to a native engine object.
///
/// Clones refer to the same object. The extra-data slot gives O(1) reverse
/// lookup of the attached wrapper; it is only read or written on the
/// consumer thread, but handles themselves may travel across threads inside
/// engine events.
#[derive(Clone)]
pub struct NativeHandle(Arc<NativeCell>);

impl NativeHandle {
    pub fn new(kind: EntityKind, id: u64) -> Self {
        Self(Arc::new(NativeCell {
            kind,
            id,
            extra: Mutex::new(None),
        }))
    }

    pub fn kind(&self) -> EntityKind {
        self.0.kind
    }

    /// Engine-assigned identifier.
    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn extra(&self) -> Option<WrapperId> {
        *self.0.extra.lock()
    }

    pub fn set_extra(&self, wrapper: Option<WrapperId>) {
        *self.0.extra.lock() = wrapper;
    }

    /// Whether both handles refer to the same native object.
    pub fn ptr_eq(&self, other: &NativeHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for NativeHandle {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for NativeHandle {}

impl fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeHandle")
            .field("kind", &self.0.kind)
            .field("id", &self.0.id)
            .field("extra", &self.extra())
            .finish()
    }
}
