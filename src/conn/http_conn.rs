use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use crate::core::constants::{READ_BUFFER_SIZE, WRITE_BUFFER_SIZE};
use crate::core::epoll::{Epoll, Interest, TrigMode};
use crate::core::socket::{recv_nonblocking, writev};
use crate::core::sync::Locker;
use crate::db::{DbCredentials, UserStore, UserTable};
use crate::error::Result;
use crate::pool::{Pending, Task};
use crate::protocol::response::{
    EMPTY_FILE_BODY, ERROR_400_FORM, ERROR_400_TITLE, ERROR_403_FORM, ERROR_403_TITLE,
    ERROR_404_FORM, ERROR_404_TITLE, ERROR_500_FORM, ERROR_500_TITLE, OK_200_TITLE,
};
use crate::protocol::{HttpCode, RequestParser, ResponseBuf};

use super::file::MappedFile;
use super::routes;

/// Per-connection configuration handed over by the event loop on accept.
#[derive(Debug, Clone, Default)]
pub struct ConnSettings {
    pub doc_root: PathBuf,
    pub trig_mode: TrigMode,
    /// Suppress this connection's request logging.
    pub close_log: bool,
    pub db: DbCredentials,
}

struct ConnState {
    fd: RawFd,
    address: Option<SocketAddr>,
    settings: ConnSettings,

    parser: RequestParser,
    last_code: Option<HttpCode>,

    write_buf: ResponseBuf,
    file: Option<MappedFile>,
    bytes_to_send: usize,
    bytes_have_send: usize,
}

impl ConnState {
    fn reset(&mut self) {
        self.parser.reset();
        self.last_code = None;
        self.write_buf.clear();
        self.file = None;
        self.bytes_to_send = 0;
        self.bytes_have_send = 0;
    }
}

/// One client socket and its HTTP request/response state machine.
///
/// Shared between the event loop and the worker pool. A worker re-arms the
/// socket before it reports completion, so the next task for a connection
/// can start while the previous one is finishing; the state lock serializes
/// that overlap.
pub struct HttpConn {
    epoll: Arc<Epoll>,
    users: Arc<UserTable>,
    user_count: Arc<AtomicUsize>,

    pending: AtomicU8,
    timer_flag: AtomicBool,
    // tasks completed since the event loop last looked
    completed: AtomicUsize,

    state: Locker<ConnState>,
}

impl HttpConn {
    /// An idle slot with no socket attached.
    pub fn new(
        epoll: Arc<Epoll>,
        users: Arc<UserTable>,
        user_count: Arc<AtomicUsize>,
    ) -> Result<Self> {
        let state = ConnState {
            fd: -1,
            address: None,
            settings: ConnSettings::default(),
            parser: RequestParser::with_capacity(READ_BUFFER_SIZE),
            last_code: None,
            write_buf: ResponseBuf::with_capacity(WRITE_BUFFER_SIZE),
            file: None,
            bytes_to_send: 0,
            bytes_have_send: 0,
        };
        Ok(Self {
            epoll,
            users,
            user_count,
            pending: AtomicU8::new(Pending::Read as u8),
            timer_flag: AtomicBool::new(false),
            completed: AtomicUsize::new(0),
            state: Locker::new(state)?,
        })
    }

    /// Attach an accepted socket and reset all request state.
    ///
    /// The socket must already be registered with the epoll instance.
    pub fn init(&self, fd: RawFd, address: SocketAddr, settings: ConnSettings) {
        let mut st = self.state.lock();
        st.fd = fd;
        st.address = Some(address);
        st.settings = settings;
        st.reset();
        self.pending.store(Pending::Read as u8, Ordering::Release);
        self.timer_flag.store(false, Ordering::Release);
        self.completed.store(0, Ordering::Release);
        self.user_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Deregister and close the socket, release the mapped file.
    pub fn close_conn(&self) {
        let mut st = self.state.lock();
        self.close_locked(&mut st);
    }

    pub fn fd(&self) -> RawFd {
        self.state.lock().fd
    }

    pub fn is_open(&self) -> bool {
        self.fd() >= 0
    }

    pub fn address(&self) -> Option<SocketAddr> {
        self.state.lock().address
    }

    /// Outcome of the most recent `process` call.
    pub fn last_outcome(&self) -> Option<HttpCode> {
        self.state.lock().last_code
    }

    /// Set when the last operation failed and the connection must go.
    pub fn timer_flag(&self) -> bool {
        self.timer_flag.load(Ordering::Acquire)
    }

    pub fn take_timer_flag(&self) -> bool {
        self.timer_flag.swap(false, Ordering::AcqRel)
    }

    /// True when a worker finished a task the event loop has not yet
    /// collected.
    pub fn is_finished(&self) -> bool {
        self.completed.load(Ordering::Acquire) > 0
    }

    /// Number of tasks finished since the last call.
    pub fn take_finished(&self) -> usize {
        self.completed.swap(0, Ordering::AcqRel)
    }

    /// Read what the socket has. False means close: error, peer shutdown,
    /// or a full buffer.
    pub fn read_once(&self) -> bool {
        let mut st = self.state.lock();
        if st.fd < 0 || st.parser.buffer().is_full() {
            return false;
        }
        let fd = st.fd;

        match st.settings.trig_mode {
            TrigMode::Level => match recv_nonblocking(fd, st.parser.buffer_mut().spare_mut()) {
                Ok(0) => false,
                Ok(n) => {
                    st.parser.buffer_mut().wrote(n);
                    true
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
                Err(e) => {
                    tracing::debug!(fd, error = %e, "recv failed");
                    false
                }
            },
            // edge-triggered: drain until the socket has nothing left
            TrigMode::Edge => loop {
                if st.parser.buffer().is_full() {
                    return true;
                }
                match recv_nonblocking(fd, st.parser.buffer_mut().spare_mut()) {
                    Ok(0) => return false,
                    Ok(n) => st.parser.buffer_mut().wrote(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                    Err(e) => {
                        tracing::debug!(fd, error = %e, "recv failed");
                        return false;
                    }
                }
            },
        }
    }

    /// Parse what is buffered and, once the request is complete, prepare
    /// the response and re-arm the socket for writing.
    pub fn process(&self, db: Option<&mut dyn UserStore>) {
        let mut st = self.state.lock();
        if st.fd < 0 {
            return;
        }

        let code = self.process_read(&mut st, db);
        st.last_code = Some(code);
        if code == HttpCode::NoRequest {
            self.rearm(&st, Interest::Read);
            return;
        }

        if !self.process_write(&mut st, code) {
            self.close_locked(&mut st);
            return;
        }
        self.rearm(&st, Interest::Write);
    }

    /// Send as much of the prepared response as the socket takes.
    ///
    /// Returns false when the connection must be closed: a write error,
    /// or a finished response without keep-alive.
    pub fn write(&self) -> bool {
        let mut st = self.state.lock();
        if st.fd < 0 {
            return false;
        }

        if st.bytes_to_send == 0 {
            self.rearm(&st, Interest::Read);
            st.reset();
            return true;
        }

        loop {
            let res = {
                let header = st.write_buf.as_bytes();
                let body = st.file.as_ref().map(MappedFile::bytes).unwrap_or_default();
                let sent = st.bytes_have_send;
                if sent < header.len() {
                    writev(st.fd, &[&header[sent..], body])
                } else {
                    writev(st.fd, &[&body[sent - header.len()..]])
                }
            };

            match res {
                Ok(n) => {
                    st.bytes_have_send += n;
                    st.bytes_to_send = st.bytes_to_send.saturating_sub(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.rearm(&st, Interest::Write);
                    return true;
                }
                Err(e) => {
                    tracing::debug!(fd = st.fd, error = %e, "writev failed");
                    st.file = None;
                    return false;
                }
            }

            if st.bytes_to_send == 0 {
                st.file = None;
                self.rearm(&st, Interest::Read);
                if st.parser.request().linger {
                    st.reset();
                    return true;
                }
                return false;
            }
        }
    }

    fn process_read(&self, st: &mut ConnState, db: Option<&mut dyn UserStore>) -> HttpCode {
        let code = st.parser.process_read();
        if code != HttpCode::GetRequest {
            return code;
        }

        if !st.settings.close_log {
            let req = st.parser.request();
            tracing::info!(
                fd = st.fd,
                peer = ?st.address,
                method = req.method.as_str(),
                url = %req.url,
                "request"
            );
        }
        self.do_request(st, db)
    }

    fn do_request(&self, st: &mut ConnState, db: Option<&mut dyn UserStore>) -> HttpCode {
        let page = match routes::route(st.parser.request(), &self.users, db) {
            Ok(page) => page,
            Err(code) => return code,
        };
        match MappedFile::open(&st.settings.doc_root, &page) {
            Ok(file) => {
                st.file = Some(file);
                HttpCode::FileRequest
            }
            Err(code) => code,
        }
    }

    fn process_write(&self, st: &mut ConnState, code: HttpCode) -> bool {
        let keep_alive = st.parser.request().linger;
        st.write_buf.clear();
        st.bytes_have_send = 0;

        let composed = match code {
            HttpCode::InternalError => {
                compose_canned(&mut st.write_buf, 500, ERROR_500_TITLE, ERROR_500_FORM, keep_alive)
            }
            HttpCode::BadRequest => {
                compose_canned(&mut st.write_buf, 400, ERROR_400_TITLE, ERROR_400_FORM, keep_alive)
            }
            HttpCode::ForbiddenRequest => {
                compose_canned(&mut st.write_buf, 403, ERROR_403_TITLE, ERROR_403_FORM, keep_alive)
            }
            HttpCode::NoResource => {
                compose_canned(&mut st.write_buf, 404, ERROR_404_TITLE, ERROR_404_FORM, keep_alive)
            }
            HttpCode::FileRequest => {
                let size = st.file.as_ref().map_or(0, MappedFile::len);
                if size != 0 {
                    st.write_buf.add_status_line(200, OK_200_TITLE)
                        && st.write_buf.add_headers(size, keep_alive)
                } else {
                    st.file = None;
                    compose_canned(&mut st.write_buf, 200, OK_200_TITLE, EMPTY_FILE_BODY, keep_alive)
                }
            }
            HttpCode::NoRequest | HttpCode::GetRequest | HttpCode::ClosedConnection => {
                return false;
            }
        };

        if !composed {
            tracing::warn!(fd = st.fd, ?code, "response headers overflow; answering 500");
            st.file = None;
            st.write_buf.clear();
            if !compose_canned(&mut st.write_buf, 500, ERROR_500_TITLE, ERROR_500_FORM, keep_alive)
            {
                return false;
            }
        }

        let body_len = st.file.as_ref().map_or(0, MappedFile::len);
        st.bytes_to_send = st.write_buf.len() + body_len;
        true
    }

    fn rearm(&self, st: &ConnState, interest: Interest) {
        if st.fd < 0 {
            return;
        }
        if let Err(e) = self.epoll.rearm(st.fd, interest, st.settings.trig_mode) {
            tracing::debug!(fd = st.fd, ?interest, error = %e, "re-arm failed");
        }
    }

    fn close_locked(&self, st: &mut ConnState) {
        st.file = None;
        if st.fd < 0 {
            return;
        }
        if !st.settings.close_log {
            tracing::info!(fd = st.fd, peer = ?st.address, "close connection");
        }
        self.epoll.remove(st.fd);
        st.fd = -1;
        self.user_count.fetch_sub(1, Ordering::AcqRel);
    }
}

fn compose_canned(
    buf: &mut ResponseBuf,
    status: u16,
    title: &str,
    form: &str,
    keep_alive: bool,
) -> bool {
    buf.add_status_line(status, title) && buf.add_headers(form.len(), keep_alive) && buf.add_content(form)
}

impl Task for HttpConn {
    fn set_pending(&self, op: Pending) {
        self.pending.store(op as u8, Ordering::Release);
    }

    fn pending(&self) -> Pending {
        Pending::from_u8(self.pending.load(Ordering::Acquire))
    }

    fn read_once(&self) -> bool {
        HttpConn::read_once(self)
    }

    fn write(&self) -> bool {
        HttpConn::write(self)
    }

    fn process(&self, db: Option<&mut dyn UserStore>) {
        HttpConn::process(self, db)
    }

    fn mark_finished(&self) {
        self.completed.fetch_add(1, Ordering::AcqRel);
    }

    fn mark_failed(&self) {
        self.timer_flag.store(true, Ordering::Release);
    }
}
