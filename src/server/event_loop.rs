use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP, epoll_event};

use crate::conn::{ConnSettings, HttpConn};
use crate::core::constants;
use crate::core::epoll::{Epoll, Interest, TrigMode};
use crate::core::socket::{accept_nonblocking, make_listener, send_quiet};
use crate::db::{ConnectionSource, UserTable};
use crate::error::{Result, ServerError};
use crate::pool::{ActorModel, Pending, ThreadPool};
use crate::util::fd::close_fd_quiet;

use super::config::ServerConfig;
use super::connection_pool::ConnectionPool;
use super::timer::IdleTimers;

const CLOSE_MASK: u32 = (EPOLLRDHUP | EPOLLHUP | EPOLLERR) as u32;

/// A connection with pool tasks not yet reported finished.
struct InFlight {
    conn: Arc<HttpConn>,
    outstanding: usize,
}

/// Main-thread epoll loop
///
/// Accepts clients, dispatches readiness to the worker pool according to
/// the actor model and evicts idle connections every `TIMESLOT` seconds.
pub struct Server<S: ConnectionSource> {
    listener: TcpListener,
    epoll: Arc<Epoll>,
    pool: ThreadPool<HttpConn, S>,
    conns: ConnectionPool,
    timers: IdleTimers,
    in_flight: HashMap<RawFd, InFlight>,
    user_count: Arc<AtomicUsize>,

    listen_trig: TrigMode,
    conn_trig: TrigMode,
    actor: ActorModel,
    settings: ConnSettings,
    tick: Duration,
    next_tick: Instant,
}

impl<S: ConnectionSource> Server<S> {
    /// Bind the listener and register it. The worker pool is already
    /// running and shares `users` with every connection.
    pub fn bind(
        config: &ServerConfig,
        pool: ThreadPool<HttpConn, S>,
        users: Arc<UserTable>,
    ) -> Result<Self> {
        if !config.doc_root.is_dir() {
            return Err(ServerError::Config(format!(
                "document root {} is not a directory",
                config.doc_root.display()
            )));
        }

        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port));
        let listener = make_listener(addr, config.linger)?;
        let epoll = Arc::new(Epoll::new()?);
        epoll.add(listener.as_raw_fd(), false, config.listen_trig)?;

        let user_count = Arc::new(AtomicUsize::new(0));
        let conns = ConnectionPool::new(
            1024,
            Arc::clone(&epoll),
            users,
            Arc::clone(&user_count),
        );

        let tick = Duration::from_secs(constants::TIMESLOT);
        tracing::info!(
            addr = %listener.local_addr()?,
            listen_trig = ?config.listen_trig,
            conn_trig = ?config.conn_trig,
            actor = ?pool.actor_model(),
            "server listening"
        );

        Ok(Self {
            listener,
            epoll,
            actor: pool.actor_model(),
            pool,
            conns,
            timers: IdleTimers::new(tick * constants::IDLE_SLOTS as u32),
            in_flight: HashMap::new(),
            user_count,
            listen_trig: config.listen_trig,
            conn_trig: config.conn_trig,
            settings: config.conn_settings(),
            tick,
            next_tick: Instant::now() + tick,
        })
    }

    /// Override the idle tick; connections expire after `IDLE_SLOTS` ticks.
    pub fn set_tick(&mut self, tick: Duration) {
        self.tick = tick;
        self.timers = IdleTimers::new(tick * constants::IDLE_SLOTS as u32);
        self.next_tick = Instant::now() + tick;
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Number of open client connections.
    pub fn user_count(&self) -> usize {
        self.user_count.load(Ordering::Acquire)
    }

    /// Serve forever.
    pub fn run(&mut self) -> Result<()> {
        let mut events = vec![epoll_event { events: 0, u64: 0 }; constants::MAX_EVENT_NUMBER];
        loop {
            self.poll_once(&mut events)?;
        }
    }

    /// Serve until `stop` is raised.
    pub fn run_until(&mut self, stop: &AtomicBool) -> Result<()> {
        let mut events = vec![epoll_event { events: 0, u64: 0 }; constants::MAX_EVENT_NUMBER];
        while !stop.load(Ordering::Acquire) {
            self.poll_once(&mut events)?;
        }
        Ok(())
    }

    fn poll_once(&mut self, events: &mut [epoll_event]) -> Result<()> {
        let timeout = if self.in_flight.is_empty() {
            constants::IDLE_POLL_MS
        } else {
            constants::IN_FLIGHT_POLL_MS
        };
        let n = self.epoll.wait(events, timeout)?;
        let listen_fd = self.listener.as_raw_fd();

        for ev in &events[..n] {
            let fd = ev.u64 as RawFd;
            let ready = ev.events;

            if fd == listen_fd {
                self.deal_with_client();
            } else if ready & CLOSE_MASK != 0 {
                self.close(fd);
            } else if ready & EPOLLIN as u32 != 0 {
                self.deal_with_read(fd);
            } else if ready & EPOLLOUT as u32 != 0 {
                self.deal_with_write(fd);
            }
        }

        self.collect_finished();

        let now = Instant::now();
        if now >= self.next_tick {
            self.expire_idle(now);
            self.next_tick = now + self.tick;
        }
        Ok(())
    }

    fn deal_with_client(&mut self) {
        loop {
            match accept_nonblocking(&self.listener) {
                Ok(Some((fd, peer))) => self.admit(fd, peer),
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                    break;
                }
            }
            if self.listen_trig == TrigMode::Level {
                break;
            }
        }
    }

    fn admit(&mut self, fd: RawFd, peer: SocketAddr) {
        if self.user_count() >= constants::MAX_FD {
            tracing::warn!(%peer, "internal server busy");
            send_quiet(fd, b"Internal server busy");
            close_fd_quiet(fd);
            return;
        }

        let conn = match self.conns.ensure_slot(fd) {
            Ok(conn) => conn,
            Err(e) => {
                tracing::error!(fd, error = %e, "connection slot allocation failed");
                close_fd_quiet(fd);
                return;
            }
        };
        if let Err(e) = self.epoll.add(fd, true, self.conn_trig) {
            tracing::error!(fd, error = %e, "epoll registration failed");
            close_fd_quiet(fd);
            return;
        }
        conn.init(fd, peer, self.settings.clone());
        self.timers.touch(fd, Instant::now());
        tracing::debug!(fd, %peer, "client connected");
    }

    fn deal_with_read(&mut self, fd: RawFd) {
        let Some(conn) = self.conns.get(fd).cloned() else {
            return;
        };

        match self.actor {
            ActorModel::Reactor => {
                self.timers.touch(fd, Instant::now());
                if self.pool.append(&conn, Pending::Read) {
                    self.dispatched(fd, conn);
                } else {
                    tracing::warn!(fd, "task queue full; retrying read later");
                    self.rearm(fd, Interest::Read);
                }
            }
            ActorModel::Proactor => {
                if !conn.read_once() {
                    self.close(fd);
                    return;
                }
                if !self.settings.close_log {
                    if let Some(peer) = conn.address() {
                        tracing::info!(%peer, "deal with the client");
                    }
                }
                self.timers.touch(fd, Instant::now());
                if self.pool.append_p(&conn) {
                    self.dispatched(fd, conn);
                } else {
                    // the request bytes are already consumed from the socket
                    tracing::warn!(fd, "task queue full; dropping client");
                    self.close(fd);
                }
            }
        }
    }

    fn deal_with_write(&mut self, fd: RawFd) {
        let Some(conn) = self.conns.get(fd).cloned() else {
            return;
        };

        match self.actor {
            ActorModel::Reactor => {
                self.timers.touch(fd, Instant::now());
                if self.pool.append(&conn, Pending::Write) {
                    self.dispatched(fd, conn);
                } else {
                    tracing::warn!(fd, "task queue full; retrying write later");
                    self.rearm(fd, Interest::Write);
                }
            }
            ActorModel::Proactor => {
                if conn.write() {
                    if !self.settings.close_log {
                        if let Some(peer) = conn.address() {
                            tracing::info!(%peer, "send data to the client");
                        }
                    }
                    self.timers.touch(fd, Instant::now());
                } else {
                    self.close(fd);
                }
            }
        }
    }

    fn dispatched(&mut self, fd: RawFd, conn: Arc<HttpConn>) {
        self.in_flight
            .entry(fd)
            .or_insert(InFlight {
                conn,
                outstanding: 0,
            })
            .outstanding += 1;
    }

    /// Account for finished tasks; close connections whose task reported
    /// a failure.
    fn collect_finished(&mut self) {
        if self.in_flight.is_empty() {
            return;
        }
        let mut failed = Vec::new();
        self.in_flight.retain(|&fd, entry| {
            let done = entry.conn.take_finished();
            if done == 0 {
                return true;
            }
            if entry.conn.take_timer_flag() {
                failed.push(fd);
                return false;
            }
            entry.outstanding = entry.outstanding.saturating_sub(done);
            entry.outstanding > 0
        });
        for fd in failed {
            self.close(fd);
        }
    }

    fn expire_idle(&mut self, now: Instant) {
        let in_flight = &self.in_flight;
        let expired = self.timers.expire(now, |fd| in_flight.contains_key(&fd));
        for fd in expired {
            tracing::debug!(fd, "idle connection expired");
            self.close(fd);
        }
    }

    fn close(&mut self, fd: RawFd) {
        self.timers.remove(fd);
        self.in_flight.remove(&fd);
        if let Some(conn) = self.conns.get(fd) {
            if conn.fd() == fd {
                conn.close_conn();
                tracing::debug!(fd, "client closed");
            }
        }
    }

    fn rearm(&self, fd: RawFd, interest: Interest) {
        if let Err(e) = self.epoll.rearm(fd, interest, self.conn_trig) {
            tracing::warn!(fd, error = %e, "epoll re-arm failed");
        }
    }
}
