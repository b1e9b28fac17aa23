//! Networking engine boundary
//!
//! The engine owns the native sockets, sessions, channels and messages. It
//! is driven through the synchronous [`Engine`] entry points from the
//! consumer thread, and reports asynchronous effects as [`EngineEvent`]s
//! through an [`EventSink`]. The sink may be cloned into engine threads; its
//! events cross over through a threadsafe executor and are dispatched by
//! [`Context::poll`](crate::context::Context::poll).

mod memory;

pub use crate::entity::ChannelMode;
pub use memory::MemoryEngine;

use crate::bridge::ThreadsafeExecutor;
use crate::entity::{EntityKind, NativeHandle};
use crate::error::SubmitError;
use crossbeam_channel::Sender;
use std::net::SocketAddr;
use thiserror::Error;

/// Failures reported by the engine's synchronous entry points.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("native {0:?} object is closed")]
    Closed(EntityKind),

    #[error("native {0:?} object is not known to the engine")]
    Unknown(EntityKind),

    #[error("channel index {0} out of range")]
    InvalidChannel(usize),

    #[error("address {0} is already in use")]
    AddressInUse(SocketAddr),

    #[error("payload of {0} bytes exceeds the engine limit")]
    PayloadTooLarge(usize),
}

/// Asynchronous engine effects.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A session was established on `socket`.
    Connected {
        socket: NativeHandle,
        session: NativeHandle,
    },
    /// A session closed; its wrappers are released after the listener runs.
    Disconnected {
        socket: NativeHandle,
        session: NativeHandle,
    },
    /// A message arrived on a session channel.
    Received {
        socket: NativeHandle,
        session: NativeHandle,
        channel: usize,
        payload: Vec<u8>,
    },
    /// Outcome of a client connect: 0 or a negative status.
    ConnectResult { socket: NativeHandle, status: i32 },
    /// The socket finished stopping.
    Stopped { socket: NativeHandle },
}

/// Cross-thread event delivery into a context.
#[derive(Clone)]
pub struct EventSink {
    executor: ThreadsafeExecutor,
    inbox: Sender<EngineEvent>,
}

impl EventSink {
    pub(crate) fn new(executor: ThreadsafeExecutor, inbox: Sender<EngineEvent>) -> Self {
        Self { executor, inbox }
    }

    /// Queue an event; fails without blocking when the executor is full or
    /// released.
    pub fn emit(&self, event: EngineEvent) -> Result<(), SubmitError> {
        let inbox = self.inbox.clone();
        self.executor.submit(move || {
            // The context may already be gone; nothing to deliver to then.
            let _ = inbox.send(event);
        })
    }

    pub fn executor(&self) -> &ThreadsafeExecutor {
        &self.executor
    }
}

/// Synchronous engine entry points, called on the consumer thread.
pub trait Engine {
    /// Hand the engine the sink its events go through.
    fn attach(&mut self, sink: EventSink);

    fn create_socket(&mut self, channel_modes: &[ChannelMode]) -> Result<NativeHandle, EngineError>;

    fn listen(&mut self, socket: &NativeHandle, address: SocketAddr) -> Result<(), EngineError>;

    /// Start a client connect; completes with [`EngineEvent::ConnectResult`].
    fn connect(&mut self, socket: &NativeHandle, address: SocketAddr) -> Result<(), EngineError>;

    /// Start stopping; completes with [`EngineEvent::Stopped`].
    fn stop(&mut self, socket: &NativeHandle) -> Result<(), EngineError>;

    fn destroy_socket(&mut self, socket: &NativeHandle);

    fn session_send(&mut self, session: &NativeHandle, channel: usize, payload: &[u8]) -> Result<(), EngineError>;

    fn session_disconnect(&mut self, session: &NativeHandle) -> Result<(), EngineError>;

    fn session_channel(&mut self, session: &NativeHandle, index: usize) -> Result<NativeHandle, EngineError>;

    fn channel_send(&mut self, channel: &NativeHandle, payload: &[u8]) -> Result<(), EngineError>;

    fn channel_mode(&self, channel: &NativeHandle) -> Result<ChannelMode, EngineError>;

    fn channel_set_mode(&mut self, channel: &NativeHandle, mode: ChannelMode) -> Result<(), EngineError>;

    fn create_message(&mut self) -> NativeHandle;

    fn destroy_message(&mut self, _message: &NativeHandle) {}
}
