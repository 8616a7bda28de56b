use std::fs;
use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tempfile::TempDir;
use tinyweb::core::epoll::TrigMode;
use tinyweb::db::{DbCredentials, MemoryDb, UserTable};
use tinyweb::pool::{ActorModel, ThreadPool};
use tinyweb::server::{Server, ServerConfig};

const INDEX: &str = "<h1>index</h1>";

struct Running {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    _root: TempDir,
}

impl Drop for Running {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn start(actor: ActorModel, listen_trig: TrigMode, conn_trig: TrigMode, tick: Option<Duration>) -> Running {
    let root = tempfile::tempdir().unwrap();
    fs::write(root.path().join("index.html"), INDEX).unwrap();

    let mut config = ServerConfig::default();
    config.port = 0;
    config.doc_root = root.path().to_path_buf();
    config.close_log = true;
    config.threads = 2;
    config.actor = actor;
    config.listen_trig = listen_trig;
    config.conn_trig = conn_trig;

    let db = Arc::new(MemoryDb::new(DbCredentials::default(), 2).unwrap());
    let users = Arc::new(UserTable::load(&*db).unwrap());
    let pool = ThreadPool::new(config.pool_config(), db).unwrap();
    let mut server = Server::bind(&config, pool, users).unwrap();
    if let Some(tick) = tick {
        server.set_tick(tick);
    }
    let port = server.local_addr().unwrap().port();

    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    let handle = thread::spawn(move || {
        server.run_until(&flag).unwrap();
    });

    Running {
        addr: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
        stop,
        handle: Some(handle),
        _root: root,
    }
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(3)))
        .unwrap();
    stream
}

fn read_response(stream: &mut TcpStream) -> (String, String) {
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    while !raw.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).unwrap();
        raw.push(byte[0]);
    }
    let head = String::from_utf8(raw).unwrap();
    let length: usize = head
        .lines()
        .find_map(|l| l.strip_prefix("Content-Length: "))
        .map(|v| v.trim().parse().unwrap())
        .unwrap();
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).unwrap();
    (head, String::from_utf8(body).unwrap())
}

fn assert_closed(stream: &mut TcpStream) {
    let mut rest = Vec::new();
    let n = stream.read_to_end(&mut rest).unwrap();
    assert_eq!(n, 0);
}

fn exercise(actor: ActorModel, listen_trig: TrigMode, conn_trig: TrigMode) {
    let server = start(actor, listen_trig, conn_trig, None);
    let mut client = connect(server.addr);

    let keep_alive = "GET /index.html HTTP/1.1\r\nHost: localhost\r\nConnection: keep-alive\r\n\r\n";
    for _ in 0..2 {
        client.write_all(keep_alive.as_bytes()).unwrap();
        let (head, body) = read_response(&mut client);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
        assert_eq!(body, INDEX);
    }

    client
        .write_all(b"GET /missing.html HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let (head, _) = read_response(&mut client);
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"), "{head}");
    assert_closed(&mut client);
}

#[test]
fn proactor_level_triggered() {
    exercise(ActorModel::Proactor, TrigMode::Level, TrigMode::Level);
}

#[test]
fn proactor_edge_triggered() {
    exercise(ActorModel::Proactor, TrigMode::Edge, TrigMode::Edge);
}

#[test]
fn reactor_level_triggered() {
    exercise(ActorModel::Reactor, TrigMode::Level, TrigMode::Level);
}

#[test]
fn reactor_edge_triggered() {
    exercise(ActorModel::Reactor, TrigMode::Level, TrigMode::Edge);
}

#[test]
fn concurrent_clients_are_all_served() {
    let server = start(ActorModel::Reactor, TrigMode::Edge, TrigMode::Level, None);
    let addr = server.addr;
    let clients: Vec<_> = (0..8)
        .map(|_| {
            thread::spawn(move || {
                let mut client = connect(addr);
                client
                    .write_all(b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n")
                    .unwrap();
                let (_, body) = read_response(&mut client);
                assert_eq!(body, INDEX);
                assert_closed(&mut client);
            })
        })
        .collect();
    for client in clients {
        client.join().unwrap();
    }
}

#[test]
fn idle_connections_are_evicted() {
    let server = start(
        ActorModel::Proactor,
        TrigMode::Level,
        TrigMode::Level,
        Some(Duration::from_millis(50)),
    );
    let mut client = connect(server.addr);
    assert_closed(&mut client);
}
