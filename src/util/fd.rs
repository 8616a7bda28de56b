use std::{io, os::fd::RawFd};

/// Close `fd`, logging instead of failing. The descriptor is dead
/// afterwards whatever `close` reported.
pub fn close_fd_quiet(fd: RawFd) {
    if fd < 0 {
        return;
    }
    if unsafe { libc::close(fd) } == 0 {
        return;
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        // Linux releases the descriptor even when close is interrupted
        Some(libc::EINTR) => tracing::debug!(fd, "close interrupted; not retrying"),
        Some(libc::EBADF) => tracing::warn!(fd, "close on invalid descriptor (double close?)"),
        _ => tracing::warn!(fd, error = %err, "close failed"),
    }
}

/// Switch `fd` to non-blocking mode, returning the previous flags.
pub fn set_nonblocking(fd: RawFd) -> io::Result<i32> {
    let old = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if old < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, old | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(old)
}
