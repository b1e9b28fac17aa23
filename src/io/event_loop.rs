//! OS readiness polling for the native backend
//!
//! - Linux: epoll
//! - macOS/BSD: kqueue
//!
//! Registrations are level-triggered: a socket that still has datagrams
//! queued after a bounded read batch is reported again on the next poll.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Identifies a registered descriptor in poll results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub u64);

/// Readiness flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(pub u8);

impl Interest {
    pub const READABLE: Interest = Interest(0b0001);
    /// Error or hang-up on the descriptor
    pub const ERROR: Interest = Interest(0b0010);

    pub fn is_readable(&self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    pub fn is_error(&self) -> bool {
        self.0 & Self::ERROR.0 != 0
    }
}

impl std::ops::BitOr for Interest {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Interest(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// A readiness event.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub token: Token,
    pub interest: Interest,
}

/// Platform poller.
pub struct EventLoop {
    #[cfg(target_os = "linux")]
    inner: epoll::Poller,

    #[cfg(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd"
    ))]
    inner: kqueue::Poller,
}

impl EventLoop {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            #[cfg(target_os = "linux")]
            inner: epoll::Poller::new()?,

            #[cfg(any(
                target_os = "macos",
                target_os = "freebsd",
                target_os = "openbsd",
                target_os = "netbsd"
            ))]
            inner: kqueue::Poller::new()?,
        })
    }

    pub fn register(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.inner.register(fd, token, interest)
    }

    pub fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.inner.deregister(fd)
    }

    /// Wait for readiness. `None` blocks until an event arrives.
    ///
    /// Events are appended to `events`; returns how many were added.
    /// An interrupted wait reports zero events.
    pub fn poll(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<usize> {
        self.inner.poll(events, timeout)
    }
}

fn cvt(result: libc::c_int) -> io::Result<libc::c_int> {
    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(result)
    }
}

#[cfg(target_os = "linux")]
mod epoll {
    use super::*;

    pub struct Poller {
        epoll_fd: RawFd,
        buffer: Vec<libc::epoll_event>,
    }

    impl Poller {
        pub fn new() -> io::Result<Self> {
            let epoll_fd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
            Ok(Self {
                epoll_fd,
                buffer: vec![libc::epoll_event { events: 0, u64: 0 }; 256],
            })
        }

        pub fn register(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
            let mut event = libc::epoll_event {
                events: to_epoll(interest),
                u64: token.0,
            };
            cvt(unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut event) })?;
            Ok(())
        }

        pub fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
            cvt(unsafe {
                libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
            })?;
            Ok(())
        }

        pub fn poll(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<usize> {
            let timeout_ms = timeout
                .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
                .unwrap_or(-1);
            let count = unsafe {
                libc::epoll_wait(
                    self.epoll_fd,
                    self.buffer.as_mut_ptr(),
                    self.buffer.len() as i32,
                    timeout_ms,
                )
            };
            if count < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    return Ok(0);
                }
                return Err(err);
            }

            for raw in &self.buffer[..count as usize] {
                events.push(Event {
                    token: Token(raw.u64),
                    interest: from_epoll(raw.events),
                });
            }
            Ok(count as usize)
        }
    }

    impl Drop for Poller {
        fn drop(&mut self) {
            unsafe { libc::close(self.epoll_fd) };
        }
    }

    fn to_epoll(interest: Interest) -> u32 {
        let mut events = (libc::EPOLLERR | libc::EPOLLHUP) as u32;
        if interest.is_readable() {
            events |= libc::EPOLLIN as u32;
        }
        events
    }

    fn from_epoll(events: u32) -> Interest {
        let mut interest = Interest(0);
        if events & libc::EPOLLIN as u32 != 0 {
            interest |= Interest::READABLE;
        }
        if events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
            interest |= Interest::ERROR;
        }
        interest
    }
}

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd"
))]
mod kqueue {
    use super::*;

    pub struct Poller {
        kqueue_fd: RawFd,
        buffer: Vec<libc::kevent>,
    }

    fn change(fd: RawFd, filter: i16, flags: u16, token: Token) -> libc::kevent {
        libc::kevent {
            ident: fd as usize,
            filter,
            flags,
            fflags: 0,
            data: 0,
            udata: token.0 as *mut libc::c_void,
        }
    }

    impl Poller {
        pub fn new() -> io::Result<Self> {
            let kqueue_fd = cvt(unsafe { libc::kqueue() })?;
            Ok(Self {
                kqueue_fd,
                buffer: vec![unsafe { std::mem::zeroed() }; 256],
            })
        }

        fn apply(&self, changes: &[libc::kevent]) -> io::Result<()> {
            cvt(unsafe {
                libc::kevent(
                    self.kqueue_fd,
                    changes.as_ptr(),
                    changes.len() as i32,
                    std::ptr::null_mut(),
                    0,
                    std::ptr::null(),
                )
            })?;
            Ok(())
        }

        pub fn register(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
            if !interest.is_readable() {
                return Ok(());
            }
            self.apply(&[change(fd, libc::EVFILT_READ, libc::EV_ADD, token)])
        }

        pub fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
            self.apply(&[change(fd, libc::EVFILT_READ, libc::EV_DELETE, Token(0))])
        }

        pub fn poll(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<usize> {
            let spec = timeout.map(|d| libc::timespec {
                tv_sec: d.as_secs() as libc::time_t,
                tv_nsec: d.subsec_nanos() as libc::c_long,
            });
            let spec_ptr = spec
                .as_ref()
                .map_or(std::ptr::null(), |ts| ts as *const libc::timespec);

            let count = unsafe {
                libc::kevent(
                    self.kqueue_fd,
                    std::ptr::null(),
                    0,
                    self.buffer.as_mut_ptr(),
                    self.buffer.len() as i32,
                    spec_ptr,
                )
            };
            if count < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    return Ok(0);
                }
                return Err(err);
            }

            for raw in &self.buffer[..count as usize] {
                let mut interest = Interest(0);
                if raw.filter == libc::EVFILT_READ {
                    interest |= Interest::READABLE;
                }
                if raw.flags & (libc::EV_ERROR | libc::EV_EOF) != 0 {
                    interest |= Interest::ERROR;
                }
                events.push(Event {
                    token: Token(raw.udata as u64),
                    interest,
                });
            }
            Ok(count as usize)
        }
    }

    impl Drop for Poller {
        fn drop(&mut self) {
            unsafe { libc::close(self.kqueue_fd) };
        }
    }
}
