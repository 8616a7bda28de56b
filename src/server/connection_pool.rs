use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use crate::conn::HttpConn;
use crate::core::epoll::Epoll;
use crate::db::UserTable;
use crate::error::Result;

/// Connection slab indexed by socket descriptor
///
/// Slots are allocated on first use and reused for every later socket
/// that gets the same descriptor number, so the hot path never allocates
/// connection buffers.
pub struct ConnectionPool {
    conns: Vec<Option<Arc<HttpConn>>>,
    epoll: Arc<Epoll>,
    users: Arc<UserTable>,
    user_count: Arc<AtomicUsize>,
}

impl ConnectionPool {
    pub fn new(
        initial_capacity: usize,
        epoll: Arc<Epoll>,
        users: Arc<UserTable>,
        user_count: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            conns: Vec::with_capacity(initial_capacity),
            epoll,
            users,
            user_count,
        }
    }

    /// Slot for `fd`, creating it if this descriptor was never seen.
    pub fn ensure_slot(&mut self, fd: RawFd) -> Result<Arc<HttpConn>> {
        let id = fd as usize;
        if id >= self.conns.len() {
            self.conns.resize_with(id + 1, || None);
        }
        if let Some(conn) = &self.conns[id] {
            return Ok(Arc::clone(conn));
        }
        let conn = Arc::new(HttpConn::new(
            Arc::clone(&self.epoll),
            Arc::clone(&self.users),
            Arc::clone(&self.user_count),
        )?);
        self.conns[id] = Some(Arc::clone(&conn));
        Ok(conn)
    }

    pub fn get(&self, fd: RawFd) -> Option<&Arc<HttpConn>> {
        if fd < 0 {
            return None;
        }
        self.conns.get(fd as usize).and_then(|c| c.as_ref())
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}
