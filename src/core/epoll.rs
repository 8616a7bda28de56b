use std::io;
use std::os::fd::RawFd;
use std::ptr;

use libc::{EPOLLET, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP, epoll_event};

use crate::util::fd::{close_fd_quiet, set_nonblocking};

/// Edge- or level-triggered readiness reporting for a descriptor.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, clap::ValueEnum)]
pub enum TrigMode {
    #[default]
    Level,
    Edge,
}

/// What a connection waits for next.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Interest {
    Read,
    Write,
}

impl Interest {
    fn bits(self) -> i32 {
        match self {
            Interest::Read => EPOLLIN,
            Interest::Write => EPOLLOUT,
        }
    }
}

/// Owned epoll instance. Shared by the event loop and every connection,
/// which re-arm their own one-shot registrations through it.
#[derive(Debug)]
pub struct Epoll {
    fd: RawFd,
}

impl Epoll {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Register `fd` for reads and switch it to non-blocking mode.
    ///
    /// Client sockets are registered one-shot so that at most one worker
    /// sees an event for them until they are re-armed.
    pub fn add(&self, fd: RawFd, one_shot: bool, trig: TrigMode) -> io::Result<()> {
        let mut events = EPOLLIN | EPOLLRDHUP;
        if trig == TrigMode::Edge {
            events |= EPOLLET;
        }
        if one_shot {
            events |= EPOLLONESHOT;
        }
        self.ctl(libc::EPOLL_CTL_ADD, fd, events)?;
        set_nonblocking(fd)?;
        Ok(())
    }

    /// Re-arm a one-shot registration for the given interest.
    pub fn rearm(&self, fd: RawFd, interest: Interest, trig: TrigMode) -> io::Result<()> {
        let mut events = interest.bits() | EPOLLONESHOT | EPOLLRDHUP;
        if trig == TrigMode::Edge {
            events |= EPOLLET;
        }
        self.ctl(libc::EPOLL_CTL_MOD, fd, events)
    }

    /// Deregister and close `fd`.
    pub fn remove(&self, fd: RawFd) {
        let ret = unsafe { libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                tracing::debug!(fd, error = %err, "epoll_ctl(DEL) failed");
            }
        }
        close_fd_quiet(fd);
    }

    /// Wait for events. An interrupted wait reports zero events.
    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> io::Result<usize> {
        let res = unsafe {
            libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as libc::c_int,
                timeout_ms,
            )
        };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(res as usize)
    }

    fn ctl(&self, op: i32, fd: RawFd, events: i32) -> io::Result<()> {
        let mut event = epoll_event {
            events: events as u32,
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.fd, op, fd, &mut event) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        close_fd_quiet(self.fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    fn empty_events() -> Vec<epoll_event> {
        vec![epoll_event { events: 0, u64: 0 }; 8]
    }

    #[test]
    fn one_shot_fires_once_until_rearmed() {
        let epoll = Epoll::new().unwrap();
        let (mut client, server) = UnixStream::pair().unwrap();
        let fd = server.as_raw_fd();
        epoll.add(fd, true, TrigMode::Level).unwrap();

        client.write_all(b"ping").unwrap();
        let mut events = empty_events();
        assert_eq!(epoll.wait(&mut events, 100).unwrap(), 1);
        let token = events[0].u64;
        assert_eq!(token, fd as u64);

        // disarmed until rearm, even though data is still pending
        assert_eq!(epoll.wait(&mut events, 20).unwrap(), 0);

        epoll.rearm(fd, Interest::Read, TrigMode::Level).unwrap();
        assert_eq!(epoll.wait(&mut events, 100).unwrap(), 1);
    }

    #[test]
    fn rearm_for_write_reports_writable() {
        let epoll = Epoll::new().unwrap();
        let (_client, server) = UnixStream::pair().unwrap();
        let fd = server.as_raw_fd();
        epoll.add(fd, true, TrigMode::Edge).unwrap();
        epoll.rearm(fd, Interest::Write, TrigMode::Edge).unwrap();

        let mut events = empty_events();
        assert_eq!(epoll.wait(&mut events, 100).unwrap(), 1);
        let ready = events[0].events;
        assert_ne!(ready & EPOLLOUT as u32, 0);
    }
}
