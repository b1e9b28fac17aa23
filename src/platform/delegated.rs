//! Host-delegated platform
//!
//! Every I/O and timer primitive round-trips through the host: sockets and
//! timers are host objects created by a [`HostDelegate`], and the host
//! reports datagrams, send results and timer fires back through the `on_*`
//! entry points. Each host object is wrapped with the bridge-side key so the
//! entry points find their record in O(1), and is held strongly while the
//! bridge still needs it.
//!
//! Executors and worker tasks do not need the host; they run on the shared
//! [`Bridge`] and are drained by [`DelegatedPlatform::poll`].

use super::{wall_clock_ms, Counters, Platform, PlatformStatistic, ShutdownCallback, UdpHandle};
use crate::bridge::{
    self, Bridge, FireOutcome, ParkWake, TaskComplete, TaskEntry, ThreadsafeExecutor, TimerEntry,
    TimerHandle, TimerKey, TimerRegistry, Wake, WorkerTask,
};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result, SubmitError};
use crate::host::{Heap, HostBuffer, HostError, HostException, HostObjectId};
use crate::io::udp::deliver_datagram;
use crate::io::{AllocCallback, RecvCallback, SendCallback, SocketMode};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Correlates a delegated send with its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SendToken(u64);

impl SendToken {
    pub fn to_bits(self) -> u64 {
        self.0
    }

    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }
}

/// Host callbacks backing [`DelegatedPlatform`].
///
/// Objects returned by the `*_create` calls must live in the heap the
/// platform was built with. Every method runs on the consumer thread.
pub trait HostDelegate {
    fn hrtime(&self) -> std::result::Result<u64, HostException>;

    fn now(&self) -> std::result::Result<u64, HostException>;

    fn udp_create(&self, mode: SocketMode) -> std::result::Result<HostObjectId, HostException>;

    fn udp_bind(&self, socket: HostObjectId, address: SocketAddr) -> std::result::Result<(), HostException>;

    fn udp_connect(&self, socket: HostObjectId, address: SocketAddr) -> std::result::Result<(), HostException>;

    fn udp_stop(&self, socket: HostObjectId) -> std::result::Result<(), HostException>;

    /// Start delivering datagrams through [`DelegatedPlatform::on_udp_recv`].
    fn udp_recv_start(&self, socket: HostObjectId) -> std::result::Result<(), HostException>;

    /// Send one datagram; the result comes back through
    /// [`DelegatedPlatform::on_udp_sent`] with `token`.
    fn udp_send(
        &self,
        socket: HostObjectId,
        target: Option<SocketAddr>,
        buffers: &[HostBuffer<'_>],
        token: SendToken,
    ) -> std::result::Result<(), HostException>;

    fn udp_local_address(&self, _socket: HostObjectId) -> Option<SocketAddr> {
        None
    }

    fn timer_create(&self, timeout_ms: u64, repeat_ms: u64) -> std::result::Result<HostObjectId, HostException>;

    /// Arm a timer; fires come back through [`DelegatedPlatform::on_timer`].
    fn timer_start(&self, timer: HostObjectId) -> std::result::Result<(), HostException>;

    fn timer_stop(&self, timer: HostObjectId) -> std::result::Result<(), HostException>;
}

fn thrown(exception: HostException) -> BridgeError {
    BridgeError::Host(HostError::Thrown(exception))
}

struct DelegatedSocket {
    object: HostObjectId,
    /// Taken out while callbacks run
    callbacks: Option<(AllocCallback, RecvCallback)>,
}

pub struct DelegatedPlatform {
    heap: Rc<Heap>,
    delegate: Rc<dyn HostDelegate>,
    running: Cell<bool>,
    wake: Arc<ParkWake>,
    bridge: Bridge,
    sockets: RefCell<HashMap<UdpHandle, DelegatedSocket>>,
    next_socket: Cell<u64>,
    pending_sends: RefCell<HashMap<SendToken, Option<SendCallback>>>,
    next_send: Cell<u64>,
    send_results: RefCell<VecDeque<(SendCallback, i32)>>,
    timers: RefCell<TimerRegistry<HostObjectId>>,
    counters: Counters,
}

impl DelegatedPlatform {
    pub fn new(config: &BridgeConfig, heap: Rc<Heap>, delegate: Rc<dyn HostDelegate>) -> Result<Self> {
        let wake = Arc::new(ParkWake::new());
        let bridge = Bridge::new(config, Arc::clone(&wake) as Arc<dyn Wake>)?;
        Ok(Self {
            heap,
            delegate,
            running: Cell::new(false),
            wake,
            bridge,
            sockets: RefCell::new(HashMap::new()),
            next_socket: Cell::new(1),
            pending_sends: RefCell::new(HashMap::new()),
            next_send: Cell::new(1),
            send_results: RefCell::new(VecDeque::new()),
            timers: RefCell::new(TimerRegistry::new()),
            counters: Counters::default(),
        })
    }

    /// Host entry point: a datagram arrived on `socket`.
    pub fn on_udp_recv(&self, socket: HostObjectId, data: &[u8], from: SocketAddr) -> Result<()> {
        let _scope = self.heap.open_scope();
        let handle = UdpHandle::from_bits(self.heap.unwrap(socket)?);
        let taken = match self.sockets.borrow_mut().get_mut(&handle) {
            Some(entry) => entry.callbacks.take(),
            None => return Err(BridgeError::UnknownSocket),
        };
        let Some((mut alloc, mut recv)) = taken else {
            debug!(?handle, "datagram dropped, receive not started");
            return Ok(());
        };

        Counters::bump(&self.counters.received);
        if let Some((buffer, status)) = deliver_datagram(data, false, &mut alloc) {
            recv(from, buffer, status);
        }

        if let Some(entry) = self.sockets.borrow_mut().get_mut(&handle) {
            if entry.callbacks.is_none() {
                entry.callbacks = Some((alloc, recv));
            }
        }
        Ok(())
    }

    /// Host entry point: a send finished with `status` (0 or negative).
    ///
    /// The callback runs from the next [`poll`](Platform::poll).
    pub fn on_udp_sent(&self, token: SendToken, status: i32) {
        let pending = self.pending_sends.borrow_mut().remove(&token);
        match pending {
            Some(callback) => self.defer_send_result(callback, status),
            None => warn!(?token, status, "completion for unknown send"),
        }
        self.wake.wake();
    }

    /// Host entry point: a timer object fired.
    pub fn on_timer(&self, timer: HostObjectId) -> Result<()> {
        let _scope = self.heap.open_scope();
        let key = TimerKey::from_bits(self.heap.unwrap(timer)?);
        match bridge::timer::fire(&self.timers, key) {
            FireOutcome::Finished(object) => {
                self.heap.reference_unref(object)?;
                self.heap.remove_wrap(object)?;
            }
            FireOutcome::Unknown => debug!(?key, "fire for inactive timer"),
            FireOutcome::Rearmed | FireOutcome::StoppedDuringFire => {}
        }
        Ok(())
    }

    /// Sends waiting for a host completion.
    pub fn pending_sends(&self) -> usize {
        self.pending_sends.borrow().len()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.running.get() {
            Ok(())
        } else {
            Err(BridgeError::NotRunning)
        }
    }

    fn socket_object(&self, socket: UdpHandle) -> Option<HostObjectId> {
        self.sockets.borrow().get(&socket).map(|entry| entry.object)
    }

    fn open(&self, address: SocketAddr, mode: SocketMode) -> Result<UdpHandle> {
        self.ensure_running()?;
        let _scope = self.heap.open_scope();
        let object = self.delegate.udp_create(mode).map_err(thrown)?;
        let handle = UdpHandle::from_bits(self.next_socket.get());

        let opened = match mode {
            SocketMode::Server => self.delegate.udp_bind(object, address),
            SocketMode::Client => self.delegate.udp_connect(object, address),
        };
        opened.map_err(thrown)?;
        self.heap.wrap(object, handle.to_bits())?;
        self.heap.reference_ref(object)?;

        self.next_socket.set(handle.to_bits() + 1);
        self.sockets.borrow_mut().insert(
            handle,
            DelegatedSocket {
                object,
                callbacks: None,
            },
        );
        info!(?handle, %address, ?mode, "delegated udp socket opened");
        Ok(handle)
    }

    fn close(&self, handle: UdpHandle, object: HostObjectId) -> Result<()> {
        let stopped = self.delegate.udp_stop(object);
        self.heap.remove_wrap(object)?;
        self.heap.reference_unref(object)?;
        info!(?handle, "delegated udp socket stopped");
        stopped.map_err(thrown)
    }

    fn defer_send_result(&self, callback: Option<SendCallback>, status: i32) {
        if status < 0 {
            Counters::bump(&self.counters.send_failures);
        } else {
            Counters::bump(&self.counters.sent);
        }
        if let Some(callback) = callback {
            self.send_results.borrow_mut().push_back((callback, status));
        }
    }

    fn flush_send_results(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = self.send_results.borrow_mut().pop_front();
            let Some((callback, status)) = next else {
                break;
            };
            callback(status);
            ran += 1;
        }
        ran
    }

    fn release_timer(&self, object: HostObjectId) {
        if let Err(err) = self.delegate.timer_stop(object) {
            warn!(%err, "host timer stop failed");
        }
        if let Err(err) = self
            .heap
            .remove_wrap(object)
            .and_then(|_| self.heap.reference_unref(object))
        {
            warn!(%err, "timer object already released");
        }
    }
}

impl Platform for DelegatedPlatform {
    fn name(&self) -> &'static str {
        "delegated"
    }

    fn startup(&self) -> Result<()> {
        self.running.set(true);
        debug!("delegated platform started");
        Ok(())
    }

    fn shutdown(&self, callback: Option<ShutdownCallback>) {
        if self.running.replace(false) {
            let _scope = self.heap.open_scope();
            let timers = self.timers.borrow_mut().clear();
            for object in timers {
                self.release_timer(object);
            }

            let sockets: Vec<(UdpHandle, DelegatedSocket)> =
                self.sockets.borrow_mut().drain().collect();
            for (handle, socket) in sockets {
                if let Err(err) = self.close(handle, socket.object) {
                    warn!(?handle, %err, "udp stop failed during shutdown");
                }
            }

            let ran = self.bridge.shutdown();
            let abandoned: Vec<Option<SendCallback>> = self
                .pending_sends
                .borrow_mut()
                .drain()
                .map(|(_, callback)| callback)
                .collect();
            for callback in abandoned {
                self.defer_send_result(callback, -libc::ECANCELED);
            }
            self.flush_send_results();
            debug!(ran, "delegated platform shut down");
        }
        if let Some(callback) = callback {
            callback();
        }
    }

    fn is_running(&self) -> bool {
        self.running.get()
    }

    fn hrtime(&self) -> u64 {
        self.delegate.hrtime().unwrap_or_else(|err| {
            warn!(%err, "host hrtime failed");
            0
        })
    }

    fn now(&self) -> u64 {
        self.delegate.now().unwrap_or_else(|err| {
            warn!(%err, "host clock failed, using system time");
            wall_clock_ms()
        })
    }

    fn acquire_executor(&self) -> std::result::Result<ThreadsafeExecutor, SubmitError> {
        if !self.running.get() {
            return Err(SubmitError::ShutDown);
        }
        self.bridge.acquire_executor()
    }

    fn submit_worker_task(
        &self,
        entry: TaskEntry,
        complete: TaskComplete,
    ) -> std::result::Result<WorkerTask, SubmitError> {
        if !self.running.get() {
            return Err(SubmitError::ShutDown);
        }
        self.bridge.submit_worker_task(entry, complete)
    }

    fn cancel_worker_task(&self, task: WorkerTask) {
        self.bridge.cancel_worker_task(task);
    }

    fn udp_bind(&self, address: SocketAddr) -> Result<UdpHandle> {
        self.open(address, SocketMode::Server)
    }

    fn udp_connect(&self, address: SocketAddr) -> Result<UdpHandle> {
        self.open(address, SocketMode::Client)
    }

    fn udp_stop(&self, socket: UdpHandle) -> Result<()> {
        let entry = self
            .sockets
            .borrow_mut()
            .remove(&socket)
            .ok_or(BridgeError::UnknownSocket)?;
        let _scope = self.heap.open_scope();
        self.close(socket, entry.object)
    }

    fn udp_send(
        &self,
        socket: UdpHandle,
        target: Option<SocketAddr>,
        bufs: &[&[u8]],
        callback: Option<SendCallback>,
    ) -> Result<()> {
        let Some(object) = self.socket_object(socket) else {
            self.defer_send_result(callback, -libc::EBADF);
            return Err(BridgeError::UnknownSocket);
        };

        let _scope = self.heap.open_scope();
        let mut buffers = Vec::with_capacity(bufs.len());
        for buf in bufs {
            match self.heap.wrap_buffer(buf) {
                Ok(buffer) => buffers.push(buffer),
                Err(err) => {
                    warn!(?socket, %err, "could not marshal send buffer");
                    self.defer_send_result(callback, -libc::ENOMEM);
                    return Err(err.into());
                }
            }
        }

        let token = SendToken(self.next_send.get());
        self.next_send.set(token.0 + 1);
        self.pending_sends.borrow_mut().insert(token, callback);

        if let Err(err) = self.delegate.udp_send(object, target, &buffers, token) {
            warn!(?socket, %err, "host rejected udp send");
            let callback = self.pending_sends.borrow_mut().remove(&token).flatten();
            self.defer_send_result(callback, -libc::EIO);
            return Err(thrown(err));
        }
        Ok(())
    }

    fn udp_recv_start(&self, socket: UdpHandle, alloc: AllocCallback, recv: RecvCallback) -> Result<()> {
        let object = self.socket_object(socket).ok_or(BridgeError::UnknownSocket)?;
        let _scope = self.heap.open_scope();
        self.delegate.udp_recv_start(object).map_err(thrown)?;
        if let Some(entry) = self.sockets.borrow_mut().get_mut(&socket) {
            entry.callbacks = Some((alloc, recv));
        }
        Ok(())
    }

    fn udp_local_address(&self, socket: UdpHandle) -> Option<SocketAddr> {
        let object = self.socket_object(socket)?;
        self.delegate.udp_local_address(object)
    }

    fn timer_start(
        &self,
        entry: TimerEntry,
        timeout_ms: u64,
        repeat_ms: u64,
        handle: Option<&TimerHandle>,
    ) -> Result<TimerKey> {
        self.ensure_running()?;
        if let Some(handle) = handle {
            self.timer_stop(handle);
        }

        let _scope = self.heap.open_scope();
        let object = self
            .delegate
            .timer_create(timeout_ms, repeat_ms)
            .map_err(thrown)?;
        let key = self.timers.borrow_mut().next_key();
        self.heap.wrap(object, key.to_bits())?;
        self.heap.reference_ref(object)?;
        self.timers
            .borrow_mut()
            .insert(key, entry, repeat_ms, handle, object);

        if let Err(err) = self.delegate.timer_start(object) {
            let stopped = self.timers.borrow_mut().stop(key);
            if let Some(object) = stopped {
                self.heap.remove_wrap(object)?;
                self.heap.reference_unref(object)?;
            }
            return Err(thrown(err));
        }
        Ok(key)
    }

    fn timer_stop(&self, handle: &TimerHandle) {
        let Some(key) = handle.key() else {
            return;
        };
        let stopped = self.timers.borrow_mut().stop(key);
        if let Some(object) = stopped {
            let _scope = self.heap.open_scope();
            self.release_timer(object);
        }
    }

    fn statistic(&self) -> PlatformStatistic {
        PlatformStatistic {
            backend: self.name(),
            live_executors: self.bridge.live_executors(),
            task_records_in_use: self.bridge.records_in_use(),
            pending_worker_tasks: self.bridge.pending_worker_tasks(),
            active_timers: self.timers.borrow().len(),
            udp_sockets: self.sockets.borrow().len(),
            datagrams_sent: self.counters.sent.get(),
            datagrams_received: self.counters.received.get(),
            send_failures: self.counters.send_failures.get(),
        }
    }

    fn poll(&self, timeout: Option<Duration>) -> Result<usize> {
        self.ensure_running()?;
        let busy = !self.send_results.borrow().is_empty() || self.bridge.has_pending_work();
        if !busy {
            self.wake.wait(timeout);
        }
        let ran = self.bridge.drain() + self.flush_send_results();
        Ok(ran)
    }
}

impl Drop for DelegatedPlatform {
    fn drop(&mut self) {
        self.shutdown(None);
    }
}
