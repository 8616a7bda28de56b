use std::collections::HashMap;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

/// Idle deadlines per connection
///
/// The event loop extends a connection's deadline on every read or write
/// and evicts connections whose deadline passed on each tick.
pub struct IdleTimers {
    deadlines: HashMap<RawFd, Instant>,
    idle_timeout: Duration,
}

impl IdleTimers {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            deadlines: HashMap::new(),
            idle_timeout,
        }
    }

    /// Start or extend the timer for `fd`.
    pub fn touch(&mut self, fd: RawFd, now: Instant) {
        self.deadlines.insert(fd, now + self.idle_timeout);
    }

    pub fn remove(&mut self, fd: RawFd) {
        self.deadlines.remove(&fd);
    }

    /// Remove and return every descriptor whose deadline passed.
    /// Descriptors for which `keep` returns true stay armed.
    pub fn expire(&mut self, now: Instant, mut keep: impl FnMut(RawFd) -> bool) -> Vec<RawFd> {
        let mut expired = Vec::new();
        self.deadlines.retain(|&fd, deadline| {
            if *deadline > now || keep(fd) {
                return true;
            }
            expired.push(fd);
            false
        });
        expired
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}
