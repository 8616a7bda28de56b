use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{IntoRawFd, RawFd};
use std::time::Duration;
use std::{io, ptr};

/// Socket utility functions for the server
///
/// This module provides the low-level socket operations the connection
/// state machine and the event loop share:
/// - Listener setup
/// - Non-blocking receive into a buffer tail
/// - Scatter-write of up to two byte ranges

/// Create the listening socket
///
/// With `linger` set, closing a client socket blocks for up to one second
/// to flush unsent data instead of resetting the connection.
pub fn make_listener(addr: SocketAddr, linger: bool) -> io::Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let sock = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    sock.set_reuse_address(true)?;
    if linger {
        sock.set_linger(Some(Duration::from_secs(1)))?;
    } else {
        sock.set_linger(None)?;
    }
    sock.bind(&addr.into())?;
    sock.listen(5)?;
    sock.set_nonblocking(true)?;
    Ok(sock.into())
}

/// Accept one pending connection. `Ok(None)` when the backlog is empty.
pub fn accept_nonblocking(listener: &TcpListener) -> io::Result<Option<(RawFd, SocketAddr)>> {
    match listener.accept() {
        Ok((stream, peer)) => Ok(Some((stream.into_raw_fd(), peer))),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(e),
    }
}

/// One `recv` into `buf`. `Ok(0)` means the peer shut down; a drained
/// socket reports `ErrorKind::WouldBlock`.
pub fn recv_nonblocking(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let n = unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Vectored write of at most two segments in a single syscall
pub fn writev(fd: RawFd, bufs: &[&[u8]]) -> io::Result<usize> {
    let mut iovecs: [libc::iovec; 2] = [libc::iovec {
        iov_base: ptr::null_mut(),
        iov_len: 0,
    }; 2];
    let count = bufs.len().min(iovecs.len());
    for (iov, buf) in iovecs.iter_mut().zip(bufs) {
        iov.iov_base = buf.as_ptr() as *mut libc::c_void;
        iov.iov_len = buf.len();
    }

    loop {
        let res = unsafe { libc::writev(fd, iovecs.as_ptr(), count as libc::c_int) };
        if res >= 0 {
            return Ok(res as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Best-effort blocking-free send of a short message, used to turn away
/// clients when the server is full.
pub fn send_quiet(fd: RawFd, msg: &[u8]) {
    let n = unsafe { libc::send(fd, msg.as_ptr().cast(), msg.len(), libc::MSG_NOSIGNAL) };
    if n < 0 {
        tracing::debug!(fd, error = %io::Error::last_os_error(), "send failed");
    }
}
