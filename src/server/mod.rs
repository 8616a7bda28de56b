//! Server front end: command-line configuration, the connection slab, idle
//! timers and the main epoll loop that ties them to the worker pool.

pub mod config;
pub mod connection_pool;
pub mod event_loop;
pub mod timer;

pub use config::ServerConfig;
pub use connection_pool::ConnectionPool;
pub use event_loop::Server;
pub use timer::IdleTimers;
