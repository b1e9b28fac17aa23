//! Platform interface
//!
//! Everything the bridge needs from its environment: clocks, cross-thread
//! execution, background workers, UDP I/O and timers. Two backends
//! implement it:
//!
//! - [`NativePlatform`]: drives an OS event loop directly (epoll/kqueue,
//!   non-blocking UDP sockets, a deadline wheel)
//! - [`DelegatedPlatform`]: forwards every I/O and timer primitive to host
//!   callbacks through a [`HostDelegate`], and receives completions back
//!   through its `on_*` entry points
//!
//! The backend is chosen once when the context is created and used as
//! `Rc<dyn Platform>`. All methods run on the consumer thread; only
//! [`ThreadsafeExecutor`] handles may leave it.

mod delegated;
mod native;

pub use delegated::{DelegatedPlatform, HostDelegate, SendToken};
pub use native::NativePlatform;

use crate::bridge::{
    ExecutorEntry, TaskComplete, TaskEntry, ThreadsafeExecutor, TimerEntry, TimerHandle, TimerKey,
    WorkerTask,
};
use crate::error::{Result, SubmitError};
use crate::io::{AllocCallback, RecvCallback, SendCallback};
use serde::Serialize;
use std::cell::Cell;
use std::net::SocketAddr;
use std::time::Duration;

/// Runs once the platform has finished shutting down.
pub type ShutdownCallback = Box<dyn FnOnce() + 'static>;

/// Handle of a UDP socket opened through a platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct UdpHandle(u64);

impl UdpHandle {
    pub fn to_bits(self) -> u64 {
        self.0
    }

    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }
}

/// Point-in-time platform counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlatformStatistic {
    pub backend: &'static str,
    pub live_executors: usize,
    pub task_records_in_use: usize,
    pub pending_worker_tasks: usize,
    pub active_timers: usize,
    pub udp_sockets: usize,
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
    pub send_failures: u64,
}

/// The platform function table.
pub trait Platform {
    /// Short backend name, reported in statistics.
    fn name(&self) -> &'static str;

    fn startup(&self) -> Result<()>;

    /// Stop timers and sockets, finalize executors and stop workers.
    ///
    /// Every outstanding worker task and send still gets its completion.
    /// `callback` runs last.
    fn shutdown(&self, callback: Option<ShutdownCallback>);

    fn is_running(&self) -> bool;

    /// Monotonic time in nanoseconds.
    fn hrtime(&self) -> u64;

    /// Wall-clock time in milliseconds since the Unix epoch.
    fn now(&self) -> u64;

    fn acquire_executor(&self) -> std::result::Result<ThreadsafeExecutor, SubmitError>;

    /// Teardown runs later on the consumer thread, after queued entries.
    fn release_executor(&self, executor: &ThreadsafeExecutor) {
        executor.release();
    }

    fn executor_submit(
        &self,
        executor: &ThreadsafeExecutor,
        entry: ExecutorEntry,
    ) -> std::result::Result<(), SubmitError> {
        executor.submit_boxed(entry)
    }

    fn submit_worker_task(
        &self,
        entry: TaskEntry,
        complete: TaskComplete,
    ) -> std::result::Result<WorkerTask, SubmitError>;

    fn cancel_worker_task(&self, task: WorkerTask);

    /// Open a server socket bound to `address`.
    fn udp_bind(&self, address: SocketAddr) -> Result<UdpHandle>;

    /// Open a client socket connected to `address`.
    fn udp_connect(&self, address: SocketAddr) -> Result<UdpHandle>;

    fn udp_stop(&self, socket: UdpHandle) -> Result<()>;

    /// Send one datagram gathered from `bufs`.
    ///
    /// `callback` fires exactly once with the send status, from a later
    /// drain step, also when this call returns an error.
    fn udp_send(
        &self,
        socket: UdpHandle,
        target: Option<SocketAddr>,
        bufs: &[&[u8]],
        callback: Option<SendCallback>,
    ) -> Result<()>;

    /// Deliver incoming datagrams: `alloc` offers a buffer, `recv` gets it
    /// back filled.
    fn udp_recv_start(&self, socket: UdpHandle, alloc: AllocCallback, recv: RecvCallback) -> Result<()>;

    /// Local address of a socket, when the backend knows it.
    fn udp_local_address(&self, _socket: UdpHandle) -> Option<SocketAddr> {
        None
    }

    /// Start a timer. `repeat_ms == 0` makes it one-shot.
    ///
    /// An armed `handle` is stopped first and re-armed for the new timer.
    fn timer_start(
        &self,
        entry: TimerEntry,
        timeout_ms: u64,
        repeat_ms: u64,
        handle: Option<&TimerHandle>,
    ) -> Result<TimerKey>;

    /// Stop the timer behind `handle`; a cleared handle is a no-op.
    fn timer_stop(&self, handle: &TimerHandle);

    fn statistic(&self) -> PlatformStatistic;

    /// One step of the consumer run loop.
    ///
    /// Waits up to `timeout` for work, then runs executor entries, worker
    /// completions, due timers and I/O callbacks. Returns how many callbacks
    /// ran.
    fn poll(&self, timeout: Option<Duration>) -> Result<usize>;
}

pub(crate) fn wall_clock_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Datagram counters shared by both backends.
#[derive(Default)]
pub(crate) struct Counters {
    pub sent: Cell<u64>,
    pub received: Cell<u64>,
    pub send_failures: Cell<u64>,
}

impl Counters {
    pub fn bump(counter: &Cell<u64>) {
        counter.set(counter.get() + 1);
    }
}
