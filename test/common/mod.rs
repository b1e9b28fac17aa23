//! Shared fixtures for integration tests
//!
//! - [`ScriptedHost`]: a host delegate that records every primitive call
//! - [`RecordingListener`]: a socket listener that logs events and can echo
//!   or throw
//! - context builders for both platform backends

#![allow(dead_code)]

use netbridge::config::BridgeConfig;
use netbridge::context::{Context, ErrorHandler};
use netbridge::engine::MemoryEngine;
use netbridge::host::{Heap, HeapOptions, HostBuffer, HostException, HostObjectId};
use netbridge::io::SocketMode;
use netbridge::platform::{DelegatedPlatform, HostDelegate, NativePlatform, Platform, SendToken};
use netbridge::SocketListener;
use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

/// One datagram handed to the host.
#[derive(Debug, Clone)]
pub struct SentDatagram {
    pub socket: HostObjectId,
    pub target: Option<SocketAddr>,
    pub bytes: Vec<u8>,
    pub external: bool,
    pub token: SendToken,
}

/// Host delegate driven by the test.
///
/// Nothing happens on its own: the test decides when datagrams arrive,
/// sends complete and timers fire.
pub struct ScriptedHost {
    pub heap: Rc<Heap>,
    pub calls: RefCell<Vec<String>>,
    pub sends: RefCell<Vec<SentDatagram>>,
    pub sockets: RefCell<Vec<HostObjectId>>,
    pub timers: RefCell<Vec<HostObjectId>>,
    pub reject_sends: Cell<bool>,
    pub clock_ms: Cell<u64>,
}

impl ScriptedHost {
    pub fn new(heap: Rc<Heap>) -> Self {
        Self {
            heap,
            calls: RefCell::new(Vec::new()),
            sends: RefCell::new(Vec::new()),
            sockets: RefCell::new(Vec::new()),
            timers: RefCell::new(Vec::new()),
            reject_sends: Cell::new(false),
            clock_ms: Cell::new(1_700_000_000_000),
        }
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.borrow_mut().push(call.into());
    }

    pub fn called(&self, call: &str) -> usize {
        self.calls.borrow().iter().filter(|c| c.as_str() == call).count()
    }

    fn object(&self) -> Result<HostObjectId, HostException> {
        self.heap
            .new_object()
            .map_err(|err| HostException::new(err.to_string()))
    }

    pub fn last_timer(&self) -> Option<HostObjectId> {
        self.timers.borrow().last().copied()
    }

    pub fn last_socket(&self) -> Option<HostObjectId> {
        self.sockets.borrow().last().copied()
    }

    pub fn take_sends(&self) -> Vec<SentDatagram> {
        std::mem::take(&mut *self.sends.borrow_mut())
    }
}

impl HostDelegate for ScriptedHost {
    fn hrtime(&self) -> Result<u64, HostException> {
        Ok(self.clock_ms.get() * 1_000_000)
    }

    fn now(&self) -> Result<u64, HostException> {
        Ok(self.clock_ms.get())
    }

    fn udp_create(&self, mode: SocketMode) -> Result<HostObjectId, HostException> {
        self.record(format!("udp_create:{mode:?}"));
        let socket = self.object()?;
        self.sockets.borrow_mut().push(socket);
        Ok(socket)
    }

    fn udp_bind(&self, _socket: HostObjectId, _address: SocketAddr) -> Result<(), HostException> {
        self.record("udp_bind");
        Ok(())
    }

    fn udp_connect(&self, _socket: HostObjectId, _address: SocketAddr) -> Result<(), HostException> {
        self.record("udp_connect");
        Ok(())
    }

    fn udp_stop(&self, _socket: HostObjectId) -> Result<(), HostException> {
        self.record("udp_stop");
        Ok(())
    }

    fn udp_recv_start(&self, _socket: HostObjectId) -> Result<(), HostException> {
        self.record("udp_recv_start");
        Ok(())
    }

    fn udp_send(
        &self,
        socket: HostObjectId,
        target: Option<SocketAddr>,
        buffers: &[HostBuffer<'_>],
        token: SendToken,
    ) -> Result<(), HostException> {
        self.record("udp_send");
        if self.reject_sends.get() {
            return Err(HostException::new("send rejected"));
        }
        let bytes = buffers.iter().flat_map(|b| b.as_bytes().iter().copied()).collect();
        self.sends.borrow_mut().push(SentDatagram {
            socket,
            target,
            bytes,
            external: buffers.iter().all(|b| b.is_external()),
            token,
        });
        Ok(())
    }

    fn timer_create(&self, timeout_ms: u64, repeat_ms: u64) -> Result<HostObjectId, HostException> {
        self.record(format!("timer_create:{timeout_ms}:{repeat_ms}"));
        let timer = self.object()?;
        self.timers.borrow_mut().push(timer);
        Ok(timer)
    }

    fn timer_start(&self, _timer: HostObjectId) -> Result<(), HostException> {
        self.record("timer_start");
        Ok(())
    }

    fn timer_stop(&self, _timer: HostObjectId) -> Result<(), HostException> {
        self.record("timer_stop");
        Ok(())
    }
}

/// A started delegated platform over a scripted host.
pub fn delegated(options: HeapOptions) -> (Rc<ScriptedHost>, Rc<DelegatedPlatform>) {
    let heap = Rc::new(Heap::with_options(options));
    let host = Rc::new(ScriptedHost::new(Rc::clone(&heap)));
    let platform = DelegatedPlatform::new(&BridgeConfig::default(), heap, host.clone())
        .expect("delegated platform");
    platform.startup().expect("startup");
    (host, Rc::new(platform))
}

/// A started native platform with default configuration.
pub fn native() -> Rc<NativePlatform> {
    native_with(&BridgeConfig::default())
}

pub fn native_with(config: &BridgeConfig) -> Rc<NativePlatform> {
    let platform = NativePlatform::new(config).expect("native platform");
    platform.startup().expect("startup");
    Rc::new(platform)
}

/// A context over the native platform and an in-process engine.
pub fn native_context(config: BridgeConfig, error_handler: Option<ErrorHandler>) -> Context {
    let heap = Rc::new(Heap::new());
    let platform: Rc<dyn Platform> =
        Rc::new(NativePlatform::new(&config).expect("native platform"));
    Context::create(config, heap, platform, Box::new(MemoryEngine::new()), error_handler)
        .expect("context")
}

/// A context over the delegated platform and an in-process engine.
pub fn delegated_context(config: BridgeConfig) -> (Rc<ScriptedHost>, Context) {
    let heap = Rc::new(Heap::new());
    let host = Rc::new(ScriptedHost::new(Rc::clone(&heap)));
    let platform: Rc<dyn Platform> = Rc::new(
        DelegatedPlatform::new(&config, Rc::clone(&heap), host.clone()).expect("delegated platform"),
    );
    let ctx = Context::create(config, heap, platform, Box::new(MemoryEngine::new()), None)
        .expect("context");
    (host, ctx)
}

/// Poll until `done` holds; panics after five seconds.
pub fn settle(ctx: &Context, done: impl FnMut(&Context) -> bool) {
    let held = ctx.run_until(Duration::from_secs(5), done).expect("poll");
    assert!(held, "condition not reached before the deadline");
}

/// Listener that records events as strings.
#[derive(Default)]
pub struct RecordingListener {
    pub events: RefCell<Vec<String>>,
    pub sessions: RefCell<Vec<HostObjectId>>,
    /// Reply to every message on the same session and channel
    pub echo: bool,
    /// Throw from `on_received`
    pub throw_on_receive: bool,
}

impl RecordingListener {
    pub fn echoing() -> Self {
        Self {
            echo: true,
            ..Default::default()
        }
    }

    pub fn throwing() -> Self {
        Self {
            throw_on_receive: true,
            ..Default::default()
        }
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events
            .borrow()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }
}

impl SocketListener for RecordingListener {
    fn on_connected(&self, _ctx: &Context, session: HostObjectId) -> Result<(), HostException> {
        self.sessions.borrow_mut().push(session);
        self.events.borrow_mut().push("connected".into());
        Ok(())
    }

    fn on_disconnected(&self, _ctx: &Context, session: HostObjectId) -> Result<(), HostException> {
        self.sessions.borrow_mut().retain(|&s| s != session);
        self.events.borrow_mut().push("disconnected".into());
        Ok(())
    }

    fn on_received(
        &self,
        ctx: &Context,
        session: HostObjectId,
        channel: usize,
        message: HostObjectId,
    ) -> Result<(), HostException> {
        let payload = ctx
            .message_read(message, usize::MAX)
            .map_err(|err| HostException::new(err.to_string()))?;
        self.events.borrow_mut().push(format!(
            "received:{channel}:{}",
            String::from_utf8_lossy(&payload)
        ));
        if self.throw_on_receive {
            return Err(HostException::new("listener failed"));
        }
        if self.echo {
            let reply = ctx
                .acquire_message()
                .and_then(|reply| {
                    ctx.message_write(reply, &payload)?;
                    if !ctx.session_send(session, channel, reply)? {
                        ctx.release_message(reply)?;
                    }
                    Ok(())
                })
                .map_err(|err| HostException::new(err.to_string()));
            reply?;
        }
        Ok(())
    }
}
