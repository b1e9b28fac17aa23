//! Native I/O primitives
//!
//! Building blocks for the OS-backed platform: a readiness poller, a pipe
//! waker that lets producer threads interrupt a blocked poll, a deadline
//! wheel for timers, and UDP socket helpers.

mod event_loop;
mod timer_wheel;
pub mod udp;
mod waker;

pub use event_loop::{Event, EventLoop, Interest, Token};
pub use timer_wheel::TimerWheel;
pub use udp::{AllocCallback, RecvCallback, RecvStatus, SendCallback, SocketMode};
pub use waker::PipeWaker;
