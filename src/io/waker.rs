//! Cross-thread wakeup for a blocked poller
//!
//! A non-blocking pipe registered with the event loop. Producers write one
//! byte; the consumer drains the pipe after it wakes.

use crate::bridge::Wake;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct PipeWaker {
    read_fd: RawFd,
    write_fd: RawFd,
    /// Set while a wake byte is in flight
    pending: AtomicBool,
}

impl PipeWaker {
    pub fn new() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        for &fd in &fds {
            if let Err(err) = set_nonblocking_cloexec(fd) {
                unsafe {
                    libc::close(fds[0]);
                    libc::close(fds[1]);
                }
                return Err(err);
            }
        }
        Ok(Self {
            read_fd: fds[0],
            write_fd: fds[1],
            pending: AtomicBool::new(false),
        })
    }

    /// Descriptor to register for readability.
    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Consume pending wakeups.
    ///
    /// The pipe is emptied before `pending` is cleared. A producer that
    /// races in between skips its write, but its work is already queued and
    /// the drain step that follows picks it up.
    pub fn reset(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(self.read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n <= 0 {
                break;
            }
        }
        self.pending.store(false, Ordering::SeqCst);
    }
}

impl Wake for PipeWaker {
    fn wake(&self) {
        if self.pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let byte = 1u8;
        // A full pipe already guarantees a wakeup.
        unsafe {
            libc::write(self.write_fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

impl Drop for PipeWaker {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

fn set_nonblocking_cloexec(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
