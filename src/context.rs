//! Runtime context
//!
//! One [`Context`] per runtime instance. It owns the engine, the platform,
//! the heap, the four wrapper pools and the error handler, and is threaded
//! explicitly through every operation; there is no global instance.
//!
//! Host code calls the entry points below with host objects. Engine events
//! arrive through the event sink, are dispatched by [`Context::poll`], and
//! surface as listener calls with wrapper twins. No pool is borrowed while a
//! listener runs, so listeners may call back into the context freely.

use crate::config::BridgeConfig;
use crate::engine::{Engine, EngineError, EngineEvent, EventSink};
use crate::entity::{
    ChannelData, ChannelMode, Entity, EntityKind, MessageData, NativeHandle, SessionData,
    SocketData, SocketListener,
};
use crate::error::{BridgeError, Result};
use crate::host::{promise, ClassId, Heap, HostException, HostObjectId, Promise};
use crate::platform::{Platform, PlatformStatistic};
use crate::pool::{PoolStats, WrapperId, WrapperPool};
use crossbeam_channel::Receiver;
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Receives exceptions thrown by listeners.
pub type ErrorHandler = Box<dyn Fn(&HostException) + 'static>;

/// Platform counters plus per-pool sizes.
#[derive(Debug, Clone, Serialize)]
pub struct ContextStatistic {
    pub platform: PlatformStatistic,
    pub pools: Vec<PoolStats>,
}

pub struct Context {
    config: BridgeConfig,
    heap: Rc<Heap>,
    platform: Rc<dyn Platform>,
    engine: RefCell<Box<dyn Engine>>,
    sockets: RefCell<WrapperPool<SocketData>>,
    sessions: RefCell<WrapperPool<SessionData>>,
    channels: RefCell<WrapperPool<ChannelData>>,
    messages: RefCell<WrapperPool<MessageData>>,
    error_handler: Option<ErrorHandler>,
    sink: EventSink,
    inbox: Receiver<EngineEvent>,
    torn_down: Cell<bool>,
}

/// Find the wrapper attached to `native`, or surface a new one.
fn surface<E: Entity>(
    pool: &RefCell<WrapperPool<E>>,
    native: &NativeHandle,
) -> Result<(WrapperId, HostObjectId)> {
    let mut pool = pool.borrow_mut();
    let id = match pool.lookup(native) {
        Some(id) => id,
        None => pool.acquire_attached(native)?,
    };
    let twin = pool.twin(id).ok_or(BridgeError::InvalidObject(E::KIND))?;
    Ok((id, twin))
}

fn twin_of<E: Entity>(pool: &RefCell<WrapperPool<E>>, id: WrapperId) -> Result<HostObjectId> {
    pool.borrow()
        .twin(id)
        .ok_or(BridgeError::InvalidObject(E::KIND))
}

impl Context {
    /// Build a context over a platform and an engine.
    ///
    /// Starts the platform if needed and hands the engine its event sink.
    pub fn create(
        config: BridgeConfig,
        heap: Rc<Heap>,
        platform: Rc<dyn Platform>,
        mut engine: Box<dyn Engine>,
        error_handler: Option<ErrorHandler>,
    ) -> Result<Self> {
        config.validate()?;
        if !platform.is_running() {
            platform.startup()?;
        }
        let executor = platform.acquire_executor()?;
        let (tx, inbox) = crossbeam_channel::unbounded();
        let sink = EventSink::new(executor, tx);
        engine.attach(sink.clone());

        let pool = &config.pool;
        let context = Self {
            sockets: RefCell::new(WrapperPool::new(Rc::clone(&heap), pool.socket_max)),
            sessions: RefCell::new(WrapperPool::new(Rc::clone(&heap), pool.session_max)),
            channels: RefCell::new(WrapperPool::new(Rc::clone(&heap), pool.channel_max)),
            messages: RefCell::new(WrapperPool::new(Rc::clone(&heap), pool.message_max)),
            config,
            heap,
            platform,
            engine: RefCell::new(engine),
            error_handler,
            sink,
            inbox,
            torn_down: Cell::new(false),
        };
        info!(backend = context.platform.name(), "context created");
        Ok(context)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn heap(&self) -> &Rc<Heap> {
        &self.heap
    }

    pub fn platform(&self) -> &Rc<dyn Platform> {
        &self.platform
    }

    /// Host class of the wrappers for `kind`.
    pub fn class(&self, kind: EntityKind) -> ClassId {
        match kind {
            EntityKind::Socket => self.sockets.borrow().class(),
            EntityKind::Session => self.sessions.borrow().class(),
            EntityKind::Channel => self.channels.borrow().class(),
            EntityKind::Message => self.messages.borrow().class(),
        }
    }

    /// A sink that engine threads may use to report events.
    pub fn event_sink(&self) -> EventSink {
        self.sink.clone()
    }

    // Sockets

    pub fn create_socket(&self, channel_modes: &[ChannelMode]) -> Result<HostObjectId> {
        let _scope = self.heap.open_scope();
        let native = self.engine.borrow_mut().create_socket(channel_modes)?;
        let surfaced = self.sockets.borrow_mut().acquire_attached(&native);
        let id = match surfaced {
            Ok(id) => id,
            Err(err) => {
                self.engine.borrow_mut().destroy_socket(&native);
                return Err(err);
            }
        };
        if let Some(data) = self.sockets.borrow_mut().data_mut(id) {
            data.channel_modes = channel_modes.to_vec();
        }
        debug!(socket = native.id(), channels = channel_modes.len(), "socket created");
        twin_of(&self.sockets, id)
    }

    pub fn set_listener(&self, socket: HostObjectId, listener: Rc<dyn SocketListener>) -> Result<()> {
        let mut sockets = self.sockets.borrow_mut();
        let (id, _) = sockets.resolve(socket)?;
        if let Some(data) = sockets.data_mut(id) {
            data.listener = Some(listener);
        }
        Ok(())
    }

    pub fn listen(&self, socket: HostObjectId, address: SocketAddr) -> Result<()> {
        let (_, native) = self.sockets.borrow().resolve(socket)?;
        self.engine.borrow_mut().listen(&native, address)?;
        Ok(())
    }

    /// Connect a client socket; the promise settles with the connect result.
    pub fn connect(&self, socket: HostObjectId, address: SocketAddr) -> Result<Promise> {
        let (id, native) = self.sockets.borrow().resolve(socket)?;
        let (deferred, promise) = promise();
        if let Some(data) = self.sockets.borrow_mut().data_mut(id) {
            data.connect_result = Some(deferred);
        }
        if let Err(err) = self.engine.borrow_mut().connect(&native, address) {
            if let Some(data) = self.sockets.borrow_mut().data_mut(id) {
                data.connect_result = None;
            }
            return Err(err.into());
        }
        Ok(promise)
    }

    /// Stop a socket; the promise resolves once the engine has stopped it.
    pub fn stop(&self, socket: HostObjectId) -> Result<Promise> {
        let (id, native) = self.sockets.borrow().resolve(socket)?;
        let (deferred, promise) = promise();
        if let Some(data) = self.sockets.borrow_mut().data_mut(id) {
            data.stopped = Some(deferred);
        }
        if let Err(err) = self.engine.borrow_mut().stop(&native) {
            if let Some(data) = self.sockets.borrow_mut().data_mut(id) {
                data.stopped = None;
            }
            return Err(err.into());
        }
        Ok(promise)
    }

    /// Destroy the native socket and release its wrapper.
    pub fn close_socket(&self, socket: HostObjectId) -> Result<()> {
        let (id, native) = self.sockets.borrow().resolve(socket)?;
        self.engine.borrow_mut().destroy_socket(&native);
        self.sockets.borrow_mut().release(id)?;
        debug!(socket = native.id(), "socket closed");
        Ok(())
    }

    /// Send one message to every session in `sessions`.
    ///
    /// Every session but the last gets a copy and the last one takes the
    /// message itself. Sessions that no longer resolve are skipped. The
    /// message wrapper goes back to its pool afterwards, whatever the
    /// outcome. Returns how many sessions accepted the message.
    pub fn socket_send(
        &self,
        socket: HostObjectId,
        channel: usize,
        message: HostObjectId,
        sessions: &[HostObjectId],
    ) -> Result<usize> {
        self.sockets.borrow().resolve(socket)?;
        let (message_id, message_native) = self.messages.borrow().resolve(message)?;
        let Some(last) = sessions.len().checked_sub(1) else {
            return Ok(0);
        };
        let payload = self
            .messages
            .borrow()
            .data(message_id)
            .map(|m| m.payload().to_vec())
            .unwrap_or_default();

        let mut sent = 0;
        let mut handed_off = false;
        for (index, &session) in sessions.iter().enumerate() {
            let native = match self.sessions.borrow().resolve(session) {
                Ok((_, native)) => native,
                Err(err) => {
                    debug!(%err, "broadcast skips session");
                    continue;
                }
            };
            match self.engine.borrow_mut().session_send(&native, channel, &payload) {
                Ok(()) => {
                    sent += 1;
                    handed_off = index == last;
                }
                Err(err) => debug!(session = native.id(), %err, "broadcast send refused"),
            }
        }

        self.finish_send(message_id, &message_native, handed_off)?;
        trace!(sent, targets = sessions.len(), "message broadcast");
        Ok(sent)
    }

    // Sessions

    /// Send a message on one session channel.
    ///
    /// On success the engine owns the message and its wrapper returns to
    /// the pool. A refused send leaves the message with the caller.
    pub fn session_send(&self, session: HostObjectId, channel: usize, message: HostObjectId) -> Result<bool> {
        let (_, native) = self.sessions.borrow().resolve(session)?;
        self.send_message(message, |payload| {
            self.engine.borrow_mut().session_send(&native, channel, payload)
        })
    }

    /// Ask the engine to close a session. Its wrappers are released when the
    /// disconnect event is dispatched.
    pub fn session_disconnect(&self, session: HostObjectId) -> Result<()> {
        let (_, native) = self.sessions.borrow().resolve(session)?;
        self.engine.borrow_mut().session_disconnect(&native)?;
        Ok(())
    }

    /// Channel wrapper for `index` on a session, created on first use.
    pub fn session_channel(&self, session: HostObjectId, index: usize) -> Result<HostObjectId> {
        let (session_id, session_native) = self.sessions.borrow().resolve(session)?;
        let known = self
            .sessions
            .borrow()
            .data(session_id)
            .and_then(|data| data.channel(index));
        if let Some(channel_id) = known {
            let channels = self.channels.borrow();
            if let Some(wrapper) = channels.get(channel_id).filter(|w| w.is_attached()) {
                return Ok(wrapper.twin());
            }
        }

        let _scope = self.heap.open_scope();
        let (native, mode) = {
            let mut engine = self.engine.borrow_mut();
            let native = engine.session_channel(&session_native, index)?;
            let mode = engine.channel_mode(&native)?;
            (native, mode)
        };
        let (channel_id, twin) = surface(&self.channels, &native)?;
        if let Some(data) = self.channels.borrow_mut().data_mut(channel_id) {
            data.index = index;
            data.mode = mode;
        }
        if let Some(data) = self.sessions.borrow_mut().data_mut(session_id) {
            data.set_channel(index, channel_id);
        }
        Ok(twin)
    }

    // Channels

    /// Send a message on a channel; same ownership rules as
    /// [`session_send`](Self::session_send).
    pub fn channel_send(&self, channel: HostObjectId, message: HostObjectId) -> Result<bool> {
        let (_, native) = self.channels.borrow().resolve(channel)?;
        self.send_message(message, |payload| {
            self.engine.borrow_mut().channel_send(&native, payload)
        })
    }

    pub fn channel_set_mode(&self, channel: HostObjectId, mode: ChannelMode) -> Result<()> {
        let (id, native) = self.channels.borrow().resolve(channel)?;
        self.engine.borrow_mut().channel_set_mode(&native, mode)?;
        if let Some(data) = self.channels.borrow_mut().data_mut(id) {
            data.mode = mode;
        }
        Ok(())
    }

    pub fn channel_mode(&self, channel: HostObjectId) -> Result<ChannelMode> {
        let channels = self.channels.borrow();
        let (id, _) = channels.resolve(channel)?;
        channels
            .data(id)
            .map(|data| data.mode)
            .ok_or(BridgeError::InvalidObject(EntityKind::Channel))
    }

    // Messages

    pub fn acquire_message(&self) -> Result<HostObjectId> {
        let _scope = self.heap.open_scope();
        let native = self.engine.borrow_mut().create_message();
        let surfaced = self.messages.borrow_mut().acquire_attached(&native);
        match surfaced {
            Ok(id) => twin_of(&self.messages, id),
            Err(err) => {
                self.engine.borrow_mut().destroy_message(&native);
                Err(err)
            }
        }
    }

    pub fn message_write(&self, message: HostObjectId, data: &[u8]) -> Result<()> {
        let mut messages = self.messages.borrow_mut();
        let (id, _) = messages.resolve(message)?;
        if let Some(state) = messages.data_mut(id) {
            state.write(data);
        }
        Ok(())
    }

    /// Read up to `len` unread bytes.
    pub fn message_read(&self, message: HostObjectId, len: usize) -> Result<Vec<u8>> {
        let mut messages = self.messages.borrow_mut();
        let (id, _) = messages.resolve(message)?;
        Ok(messages
            .data_mut(id)
            .map(|state| state.read(len))
            .unwrap_or_default())
    }

    pub fn release_message(&self, message: HostObjectId) -> Result<()> {
        let (id, native) = self.messages.borrow().resolve(message)?;
        if self.messages.borrow_mut().release(id)? {
            self.engine.borrow_mut().destroy_message(&native);
        }
        Ok(())
    }

    fn send_message(
        &self,
        message: HostObjectId,
        send: impl FnOnce(&[u8]) -> std::result::Result<(), EngineError>,
    ) -> Result<bool> {
        let (id, native) = self.messages.borrow().resolve(message)?;
        let result = {
            let messages = self.messages.borrow();
            send(messages.data(id).map(|m| m.payload()).unwrap_or_default())
        };
        match result {
            Ok(()) => {
                self.finish_send(id, &native, true)?;
                Ok(true)
            }
            Err(err) => {
                debug!(message = native.id(), %err, "send refused");
                Ok(false)
            }
        }
    }

    /// Return a sent message's wrapper to the pool. The native message is
    /// destroyed unless the engine took it over.
    fn finish_send(&self, id: WrapperId, native: &NativeHandle, handed_off: bool) -> Result<()> {
        if self.messages.borrow_mut().release(id)? && !handed_off {
            self.engine.borrow_mut().destroy_message(native);
        }
        Ok(())
    }

    // Errors and collection

    /// Route a listener exception to the error handler.
    pub fn handle_error(&self, exception: &HostException) {
        match &self.error_handler {
            Some(handler) => handler(exception),
            None => {
                error!(error = %exception, "unhandled listener exception");
                eprintln!("Unhandled error: {}", exception);
            }
        }
    }

    /// Collect unreachable host objects and run wrapper finalizers.
    ///
    /// Returns how many wrappers were destroyed.
    pub fn collect_garbage(&self) -> usize {
        let records = self.heap.collect_garbage();
        let mut destroyed = 0;
        for record in &records {
            let finalized = self.sockets.borrow_mut().finalize(record)
                || self.sessions.borrow_mut().finalize(record)
                || self.channels.borrow_mut().finalize(record)
                || self.messages.borrow_mut().finalize(record);
            if finalized {
                destroyed += 1;
            }
        }
        if destroyed > 0 {
            debug!(destroyed, "wrappers finalized");
        }
        destroyed
    }

    pub fn pool_stats(&self, kind: EntityKind) -> PoolStats {
        match kind {
            EntityKind::Socket => self.sockets.borrow().stats(),
            EntityKind::Session => self.sessions.borrow().stats(),
            EntityKind::Channel => self.channels.borrow().stats(),
            EntityKind::Message => self.messages.borrow().stats(),
        }
    }

    pub fn statistic(&self) -> ContextStatistic {
        ContextStatistic {
            platform: self.platform.statistic(),
            pools: EntityKind::ALL.iter().map(|&kind| self.pool_stats(kind)).collect(),
        }
    }

    // Run loop

    /// One run-loop step: poll the platform, then dispatch engine events.
    ///
    /// Returns how many callbacks and events ran.
    pub fn poll(&self, timeout: Option<Duration>) -> Result<usize> {
        if self.torn_down.get() {
            return Err(BridgeError::NotRunning);
        }
        let mut ran = self.platform.poll(timeout)?;
        while let Ok(event) = self.inbox.try_recv() {
            if let Err(err) = self.dispatch(event) {
                warn!(%err, "engine event dispatch failed");
            }
            ran += 1;
        }
        Ok(ran)
    }

    /// Poll until `done` holds or `limit` elapses; returns whether it held.
    pub fn run_until(&self, limit: Duration, mut done: impl FnMut(&Context) -> bool) -> Result<bool> {
        let deadline = Instant::now() + limit;
        while !done(self) {
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let step = (deadline - now).min(Duration::from_millis(10));
            self.poll(Some(step))?;
        }
        Ok(true)
    }

    /// Deliver one engine event to the host.
    pub fn dispatch(&self, event: EngineEvent) -> Result<()> {
        let _scope = self.heap.open_scope();
        match event {
            EngineEvent::Connected { socket, session } => self.on_connected(&socket, &session),
            EngineEvent::Disconnected { socket, session } => self.on_disconnected(&socket, &session),
            EngineEvent::Received {
                socket,
                session,
                channel,
                payload,
            } => self.on_received(&socket, &session, channel, &payload),
            EngineEvent::ConnectResult { socket, status } => {
                self.on_connect_result(&socket, status);
                Ok(())
            }
            EngineEvent::Stopped { socket } => {
                self.on_stopped(&socket);
                Ok(())
            }
        }
    }

    fn listener_of(&self, socket: &NativeHandle) -> Option<Rc<dyn SocketListener>> {
        let sockets = self.sockets.borrow();
        let id = sockets.lookup(socket)?;
        sockets.data(id)?.listener.clone()
    }

    fn report(&self, result: std::result::Result<(), HostException>) {
        if let Err(exception) = result {
            self.handle_error(&exception);
        }
    }

    fn on_connected(&self, socket: &NativeHandle, session: &NativeHandle) -> Result<()> {
        let (_, twin) = surface(&self.sessions, session)?;
        debug!(socket = socket.id(), session = session.id(), "session connected");
        if let Some(listener) = self.listener_of(socket) {
            self.report(listener.on_connected(self, twin));
        }
        Ok(())
    }

    fn on_disconnected(&self, socket: &NativeHandle, session: &NativeHandle) -> Result<()> {
        let Some(session_id) = self.sessions.borrow().lookup(session) else {
            debug!(session = session.id(), "disconnect for session never surfaced");
            return Ok(());
        };
        let twin = twin_of(&self.sessions, session_id)?;
        if let Some(listener) = self.listener_of(socket) {
            self.report(listener.on_disconnected(self, twin));
        }

        let nested = self
            .sessions
            .borrow_mut()
            .data_mut(session_id)
            .map(|data| data.take_channels())
            .unwrap_or_default();
        {
            let mut channels = self.channels.borrow_mut();
            for channel in nested {
                channels.release(channel)?;
            }
        }
        self.sessions.borrow_mut().release(session_id)?;
        debug!(socket = socket.id(), session = session.id(), "session released");
        Ok(())
    }

    fn on_received(
        &self,
        socket: &NativeHandle,
        session: &NativeHandle,
        channel: usize,
        payload: &[u8],
    ) -> Result<()> {
        let (_, session_twin) = surface(&self.sessions, session)?;
        let native = self.engine.borrow_mut().create_message();
        let message_id = self.messages.borrow_mut().acquire_attached(&native)?;
        if let Some(data) = self.messages.borrow_mut().data_mut(message_id) {
            data.fill(payload);
        }
        let message_twin = twin_of(&self.messages, message_id)?;

        let result = self
            .listener_of(socket)
            .map(|listener| listener.on_received(self, session_twin, channel, message_twin));

        // The message does not outlive the callback.
        if self.messages.borrow_mut().release(message_id)? {
            self.engine.borrow_mut().destroy_message(&native);
        }
        if let Some(result) = result {
            self.report(result);
        }
        Ok(())
    }

    fn on_connect_result(&self, socket: &NativeHandle, status: i32) {
        let deferred = {
            let mut sockets = self.sockets.borrow_mut();
            sockets
                .lookup(socket)
                .and_then(|id| sockets.data_mut(id))
                .and_then(|data| data.connect_result.take())
        };
        let Some(deferred) = deferred else {
            debug!(socket = socket.id(), status, "connect result without pending promise");
            return;
        };
        if status >= 0 {
            deferred.resolve(i64::from(status));
        } else {
            deferred.reject(HostException::new(format!("connect failed with status {status}")));
        }
    }

    fn on_stopped(&self, socket: &NativeHandle) {
        let deferred = {
            let mut sockets = self.sockets.borrow_mut();
            sockets
                .lookup(socket)
                .and_then(|id| sockets.data_mut(id))
                .and_then(|data| data.stopped.take())
        };
        if let Some(deferred) = deferred {
            deferred.resolve(0);
        }
    }

    /// Drain every pool, release the executor and shut the platform down.
    ///
    /// Runs once; later calls do nothing.
    pub fn teardown(&self) {
        if self.torn_down.replace(true) {
            return;
        }
        let destroyed = self.messages.borrow_mut().drain()
            + self.channels.borrow_mut().drain()
            + self.sessions.borrow_mut().drain()
            + self.sockets.borrow_mut().drain();
        self.platform.release_executor(self.sink.executor());
        self.platform.shutdown(None);
        while self.inbox.try_recv().is_ok() {}
        info!(destroyed, "context torn down");
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.get()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;
    use crate::host::PromiseState;
    use crate::platform::NativePlatform;

    fn context(config: BridgeConfig) -> Context {
        let heap = Rc::new(Heap::new());
        let platform: Rc<dyn Platform> = Rc::new(NativePlatform::new(&config).unwrap());
        Context::create(config, heap, platform, Box::new(MemoryEngine::new()), None).unwrap()
    }

    #[test]
    fn test_message_read_write() {
        let ctx = context(BridgeConfig::default());
        let message = ctx.acquire_message().unwrap();
        ctx.message_write(message, b"hello ").unwrap();
        ctx.message_write(message, b"world").unwrap();
        assert_eq!(ctx.message_read(message, 5).unwrap(), b"hello");
        assert_eq!(ctx.message_read(message, 100).unwrap(), b" world");

        ctx.release_message(message).unwrap();
        assert!(matches!(
            ctx.message_read(message, 1),
            Err(BridgeError::Detached(EntityKind::Message))
        ));
        assert_eq!(ctx.pool_stats(EntityKind::Message).idle, 1);
    }

    #[test]
    fn test_connect_refused_rejects_promise() {
        let ctx = context(BridgeConfig::default());
        let socket = ctx.create_socket(&[ChannelMode::Reliable]).unwrap();
        let promise = ctx.connect(socket, "10.9.9.9:1".parse().unwrap()).unwrap();
        assert!(promise.is_pending());

        let settled = ctx
            .run_until(Duration::from_secs(5), |_| !promise.is_pending())
            .unwrap();
        assert!(settled);
        assert!(matches!(promise.state(), PromiseState::Rejected(_)));
    }

    #[test]
    fn test_wrong_class_is_rejected() {
        let ctx = context(BridgeConfig::default());
        let message = ctx.acquire_message().unwrap();
        assert!(matches!(
            ctx.listen(message, "127.0.0.1:1".parse().unwrap()),
            Err(BridgeError::InvalidObject(EntityKind::Socket))
        ));
    }

    #[test]
    fn test_teardown_abandons_pending_promises() {
        let ctx = context(BridgeConfig::default());
        let socket = ctx.create_socket(&[]).unwrap();
        let promise = ctx.connect(socket, "10.9.9.9:1".parse().unwrap()).unwrap();
        ctx.teardown();
        assert_eq!(promise.state(), PromiseState::Abandoned);
        assert_eq!(ctx.pool_stats(EntityKind::Socket).live, 0);
        assert!(matches!(ctx.poll(None), Err(BridgeError::NotRunning)));
        ctx.teardown();
    }
}
