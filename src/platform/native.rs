//! OS-backed platform
//!
//! One event loop watches the UDP sockets and a pipe waker. Producer
//! threads write to the pipe after queueing work, so a blocked poll returns
//! promptly. Timers live in a deadline wheel consulted for the poll timeout.

use super::{wall_clock_ms, Counters, Platform, PlatformStatistic, ShutdownCallback, UdpHandle};
use crate::bridge::{
    self, Bridge, FireOutcome, TaskComplete, TaskEntry, ThreadsafeExecutor, TimerEntry,
    TimerHandle, TimerKey, TimerRegistry, Wake, WorkerTask,
};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result, SubmitError};
use crate::io::udp::{self, deliver_datagram, send_status};
use crate::io::{
    AllocCallback, Event, EventLoop, Interest, PipeWaker, RecvCallback, SendCallback, SocketMode,
    TimerWheel, Token,
};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const WAKER_TOKEN: Token = Token(0);

struct UdpEntry {
    socket: UdpSocket,
    mode: SocketMode,
    registered: bool,
    /// Taken out while callbacks run
    callbacks: Option<(AllocCallback, RecvCallback)>,
}

pub struct NativePlatform {
    config: BridgeConfig,
    running: Cell<bool>,
    started: Instant,
    bridge: Bridge,
    waker: Arc<PipeWaker>,
    event_loop: RefCell<EventLoop>,
    events: RefCell<Vec<Event>>,
    wheel: RefCell<TimerWheel>,
    timers: RefCell<TimerRegistry<Token>>,
    sockets: RefCell<HashMap<UdpHandle, UdpEntry>>,
    next_socket: Cell<u64>,
    send_results: RefCell<VecDeque<(SendCallback, i32)>>,
    scratch: RefCell<Vec<u8>>,
    counters: Counters,
}

impl NativePlatform {
    pub fn new(config: &BridgeConfig) -> Result<Self> {
        let waker = Arc::new(PipeWaker::new()?);
        let mut event_loop = EventLoop::new()?;
        event_loop.register(waker.read_fd(), WAKER_TOKEN, Interest::READABLE)?;
        let bridge = Bridge::new(config, Arc::clone(&waker) as Arc<dyn Wake>)?;

        Ok(Self {
            config: config.clone(),
            running: Cell::new(false),
            started: Instant::now(),
            bridge,
            waker,
            event_loop: RefCell::new(event_loop),
            events: RefCell::new(Vec::with_capacity(64)),
            wheel: RefCell::new(TimerWheel::with_resolution(Duration::from_millis(
                config.timer.resolution_ms.max(1),
            ))),
            timers: RefCell::new(TimerRegistry::new()),
            sockets: RefCell::new(HashMap::new()),
            next_socket: Cell::new(1),
            send_results: RefCell::new(VecDeque::new()),
            scratch: RefCell::new(vec![0u8; config.udp.max_datagram.max(1)]),
            counters: Counters::default(),
        })
    }

    fn ensure_running(&self) -> Result<()> {
        if self.running.get() {
            Ok(())
        } else {
            Err(BridgeError::NotRunning)
        }
    }

    fn open(&self, address: SocketAddr, mode: SocketMode) -> Result<UdpHandle> {
        self.ensure_running()?;
        let socket = udp::open_socket(address, mode, &self.config.udp)?;
        let handle = UdpHandle(self.next_socket.get());
        self.next_socket.set(handle.0 + 1);
        info!(?handle, %address, ?mode, "udp socket opened");
        self.sockets.borrow_mut().insert(
            handle,
            UdpEntry {
                socket,
                mode,
                registered: false,
                callbacks: None,
            },
        );
        Ok(handle)
    }

    fn defer_send_result(&self, callback: Option<SendCallback>, status: i32) {
        if status < 0 {
            Counters::bump(&self.counters.send_failures);
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

    fn fire_timers(&self) -> usize {
        let due = self.wheel.borrow_mut().expired(Instant::now());
        let mut ran = 0;
        for token in due {
            match bridge::timer::fire(&self.timers, TimerKey::from_bits(token.0)) {
                FireOutcome::Unknown => {}
                FireOutcome::StoppedDuringFire => {
                    self.wheel.borrow_mut().remove(token);
                    ran += 1;
                }
                FireOutcome::Rearmed | FireOutcome::Finished(_) => ran += 1,
            }
        }
        ran
    }

    /// Read up to the configured batch of datagrams from one socket.
    fn read_socket(&self, handle: UdpHandle) -> usize {
        let taken = match self.sockets.borrow_mut().get_mut(&handle) {
            Some(entry) => entry.callbacks.take(),
            None => None,
        };
        let Some((mut alloc, mut recv)) = taken else {
            return 0;
        };

        let mut delivered = 0;
        for _ in 0..self.config.udp.recv_batch.max(1) {
            let result = {
                let sockets = self.sockets.borrow();
                let Some(entry) = sockets.get(&handle) else {
                    break;
                };
                let mut scratch = self.scratch.borrow_mut();
                udp::recv_datagram(&entry.socket, &mut scratch)
                    .map(|datagram| (scratch[..datagram.len].to_vec(), datagram.from, datagram.truncated))
            };
            match result {
                Ok((data, from, truncated)) => {
                    Counters::bump(&self.counters.received);
                    if truncated {
                        debug!(?handle, len = data.len(), "datagram truncated by receive buffer");
                    }
                    if let Some((buffer, status)) = deliver_datagram(&data, truncated, &mut alloc) {
                        recv(from, buffer, status);
                        delivered += 1;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!(?handle, %err, "udp receive failed");
                    break;
                }
            }
        }

        if let Some(entry) = self.sockets.borrow_mut().get_mut(&handle) {
            if entry.callbacks.is_none() {
                entry.callbacks = Some((alloc, recv));
            }
        }
        delivered
    }

    fn close_socket(&self, handle: UdpHandle, entry: UdpEntry) {
        if entry.registered {
            if let Err(err) = self
                .event_loop
                .borrow_mut()
                .deregister(entry.socket.as_raw_fd())
            {
                warn!(?handle, %err, "deregister failed");
            }
        }
        info!(?handle, mode = ?entry.mode, "udp socket stopped");
    }
}

impl Platform for NativePlatform {
    fn name(&self) -> &'static str {
        "native"
    }

    fn startup(&self) -> Result<()> {
        self.running.set(true);
        debug!(workers = self.config.worker.threads, "native platform started");
        Ok(())
    }

    fn shutdown(&self, callback: Option<ShutdownCallback>) {
        if self.running.replace(false) {
            let stopped = self.timers.borrow_mut().clear();
            let mut wheel = self.wheel.borrow_mut();
            for token in stopped {
                wheel.remove(token);
            }
            drop(wheel);

            let sockets: Vec<(UdpHandle, UdpEntry)> = self.sockets.borrow_mut().drain().collect();
            for (handle, entry) in sockets {
                self.close_socket(handle, entry);
            }

            let ran = self.bridge.shutdown();
            self.flush_send_results();
            debug!(ran, "native platform shut down");
        }
        if let Some(callback) = callback {
            callback();
        }
    }

    fn is_running(&self) -> bool {
        self.running.get()
    }

    fn hrtime(&self) -> u64 {
        self.started.elapsed().as_nanos() as u64
    }

    fn now(&self) -> u64 {
        wall_clock_ms()
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
        self.close_socket(socket, entry);
        Ok(())
    }

    fn udp_send(
        &self,
        socket: UdpHandle,
        target: Option<SocketAddr>,
        bufs: &[&[u8]],
        callback: Option<SendCallback>,
    ) -> Result<()> {
        let result = match self.sockets.borrow().get(&socket) {
            Some(entry) => udp::send_vectored(&entry.socket, target, bufs),
            None => {
                self.defer_send_result(callback, -libc::EBADF);
                return Err(BridgeError::UnknownSocket);
            }
        };
        let status = send_status(&result);
        match &result {
            Ok(_) => Counters::bump(&self.counters.sent),
            Err(err) => warn!(?socket, %err, "udp send failed"),
        }
        self.defer_send_result(callback, status);
        Ok(())
    }

    fn udp_recv_start(&self, socket: UdpHandle, alloc: AllocCallback, recv: RecvCallback) -> Result<()> {
        let mut sockets = self.sockets.borrow_mut();
        let entry = sockets.get_mut(&socket).ok_or(BridgeError::UnknownSocket)?;
        if !entry.registered {
            self.event_loop.borrow_mut().register(
                entry.socket.as_raw_fd(),
                Token(socket.0),
                Interest::READABLE,
            )?;
            entry.registered = true;
        }
        entry.callbacks = Some((alloc, recv));
        Ok(())
    }

    fn udp_local_address(&self, socket: UdpHandle) -> Option<SocketAddr> {
        self.sockets
            .borrow()
            .get(&socket)
            .and_then(|entry| entry.socket.local_addr().ok())
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
        let mut timers = self.timers.borrow_mut();
        let key = timers.next_key();
        let token = Token(key.to_bits());
        let repeat = (repeat_ms > 0).then(|| Duration::from_millis(repeat_ms));
        self.wheel.borrow_mut().insert(
            token,
            Instant::now(),
            Duration::from_millis(timeout_ms),
            repeat,
        );
        timers.insert(key, entry, repeat_ms, handle, token);
        Ok(key)
    }

    fn timer_stop(&self, handle: &TimerHandle) {
        let Some(key) = handle.key() else {
            return;
        };
        let stopped = self.timers.borrow_mut().stop(key);
        if let Some(token) = stopped {
            self.wheel.borrow_mut().remove(token);
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
        let wait = if busy {
            Some(Duration::ZERO)
        } else {
            let next_timer = self.wheel.borrow().next_timeout(Instant::now());
            match (timeout, next_timer) {
                (Some(t), Some(n)) => Some(t.min(n)),
                (Some(t), None) => Some(t),
                (None, n) => n,
            }
        };

        let mut events = self.events.borrow_mut();
        events.clear();
        self.event_loop.borrow_mut().poll(&mut events, wait)?;
        let ready: Vec<Event> = events.drain(..).collect();
        drop(events);

        let mut ran = 0;
        let mut readable = Vec::new();
        for event in ready {
            if event.token == WAKER_TOKEN {
                self.waker.reset();
            } else if event.interest.is_readable() || event.interest.is_error() {
                readable.push(UdpHandle(event.token.0));
            }
        }

        ran += self.bridge.drain();
        ran += self.fire_timers();
        for handle in readable {
            ran += self.read_socket(handle);
        }
        ran += self.flush_send_results();
        Ok(ran)
    }
}

impl Drop for NativePlatform {
    fn drop(&mut self) {
        self.shutdown(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn platform() -> NativePlatform {
        let platform = NativePlatform::new(&BridgeConfig::default()).unwrap();
        platform.startup().unwrap();
        platform
    }

    #[test]
    fn test_hrtime_is_monotonic() {
        let platform = platform();
        let a = platform.hrtime();
        let b = platform.hrtime();
        assert!(b >= a);
        assert!(platform.now() > 0);
    }

    #[test]
    fn test_one_shot_timer_fires_once() {
        let platform = platform();
        let count = Rc::new(Cell::new(0));
        let handle = TimerHandle::new();
        let inner = Rc::clone(&count);
        platform
            .timer_start(Box::new(move || inner.set(inner.get() + 1)), 5, 0, Some(&handle))
            .unwrap();
        assert!(handle.is_armed());

        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.is_armed() && Instant::now() < deadline {
            platform.poll(Some(Duration::from_millis(10))).unwrap();
        }
        platform.poll(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(count.get(), 1);
        assert_eq!(platform.statistic().active_timers, 0);
    }

    #[test]
    fn test_stop_unknown_socket() {
        let platform = platform();
        assert!(matches!(
            platform.udp_stop(UdpHandle(99)),
            Err(BridgeError::UnknownSocket)
        ));
    }

    #[test]
    fn test_not_running_after_shutdown() {
        let platform = platform();
        let done = Rc::new(Cell::new(false));
        let flag = Rc::clone(&done);
        platform.shutdown(Some(Box::new(move || flag.set(true))));
        assert!(done.get());
        assert!(matches!(
            platform.acquire_executor(),
            Err(SubmitError::ShutDown)
        ));
        assert!(matches!(platform.poll(None), Err(BridgeError::NotRunning)));
    }
}
