//! UDP socket setup and datagram delivery

use crate::config::UdpConfig;
use socket2::{Domain, MaybeUninitSlice, Protocol, SockAddr, SockRef, Socket, Type};
use std::io::{self, IoSlice};
use std::mem::MaybeUninit;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use tracing::warn;

/// How a UDP socket was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketMode {
    /// Bound to a local address, receives from anyone
    Server,
    /// Connected to one remote address
    Client,
}

/// Outcome of a receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvStatus {
    Complete,
    /// The datagram was larger than the receive buffer and was truncated
    Partial,
}

/// Provides a receive buffer; its length is the capacity offered.
pub type AllocCallback = Box<dyn FnMut() -> Option<Vec<u8>> + 'static>;

/// Receives a datagram copied into a buffer from the [`AllocCallback`].
pub type RecvCallback = Box<dyn FnMut(SocketAddr, Vec<u8>, RecvStatus) + 'static>;

/// Reports the outcome of one send: 0 on success, negative on failure.
pub type SendCallback = Box<dyn FnOnce(i32) + 'static>;

/// Open a non-blocking UDP socket.
///
/// Server sockets bind to `address`; client sockets bind to the unspecified
/// address of the same family and connect to `address`.
pub fn open_socket(address: SocketAddr, mode: SocketMode, config: &UdpConfig) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(address), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;

    let (recv_size, send_size) = match mode {
        SocketMode::Server => (config.server_recv_buffer, config.server_send_buffer),
        SocketMode::Client => (config.client_recv_buffer, config.client_send_buffer),
    };
    if let Err(err) = socket.set_recv_buffer_size(recv_size) {
        warn!(%address, %err, "could not set receive buffer size");
    }
    if let Err(err) = socket.set_send_buffer_size(send_size) {
        warn!(%address, %err, "could not set send buffer size");
    }

    match mode {
        SocketMode::Server => socket.bind(&address.into())?,
        SocketMode::Client => {
            let local: SocketAddr = match address {
                SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
                SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
            };
            socket.bind(&local.into())?;
            socket.connect(&address.into())?;
        }
    }
    Ok(socket.into())
}

/// Send one datagram gathered from `bufs`.
///
/// `target` is required for unconnected sockets and must be `None` for
/// connected ones.
pub fn send_vectored(socket: &UdpSocket, target: Option<SocketAddr>, bufs: &[&[u8]]) -> io::Result<usize> {
    let slices: Vec<IoSlice<'_>> = bufs.iter().map(|b| IoSlice::new(b)).collect();
    let sock = SockRef::from(socket);
    match target {
        Some(target) => sock.send_to_vectored(&slices, &SockAddr::from(target)),
        None => sock.send_vectored(&slices),
    }
}

/// A datagram read from a socket.
#[derive(Debug)]
pub struct Datagram {
    pub len: usize,
    pub from: SocketAddr,
    /// The datagram did not fit the read buffer and the OS cut it short
    pub truncated: bool,
}

/// Receive one datagram into `buf`.
///
/// Uses `recvmsg` so a datagram larger than `buf` is flagged as truncated
/// instead of silently shortened.
pub fn recv_datagram(socket: &UdpSocket, buf: &mut [u8]) -> io::Result<Datagram> {
    let sock = SockRef::from(socket);
    // SAFETY: `recvmsg` only writes initialized bytes into the buffer, and
    // `u8` and `MaybeUninit<u8>` share a layout.
    let uninit = unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
    let mut slices = [MaybeUninitSlice::new(uninit)];
    let (len, flags, from) = sock.recv_from_vectored(&mut slices)?;
    let from = from
        .as_socket()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "peer is not an IP address"))?;
    Ok(Datagram {
        len,
        from,
        truncated: flags.is_truncated(),
    })
}

/// Copy a received datagram into a buffer obtained from `alloc`.
///
/// Returns `None` when the allocator declines. A datagram larger than the
/// offered buffer, or one the OS already cut short (`truncated`), is
/// reported as [`RecvStatus::Partial`].
pub fn deliver_datagram(
    data: &[u8],
    truncated: bool,
    alloc: &mut dyn FnMut() -> Option<Vec<u8>>,
) -> Option<(Vec<u8>, RecvStatus)> {
    let mut buffer = alloc()?;
    if buffer.is_empty() {
        return None;
    }
    let (length, status) = if data.len() > buffer.len() {
        (buffer.len(), RecvStatus::Partial)
    } else if truncated {
        (data.len(), RecvStatus::Partial)
    } else {
        (data.len(), RecvStatus::Complete)
    };
    buffer[..length].copy_from_slice(&data[..length]);
    buffer.truncate(length);
    Some((buffer, status))
}

/// Map an I/O result to the status passed to a [`SendCallback`].
pub fn send_status(result: &io::Result<usize>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(err) => -err.raw_os_error().unwrap_or(libc::EIO),
    }
}
