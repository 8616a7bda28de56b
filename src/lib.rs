//! tinyweb: a small pre-threaded HTTP/1.1 server.
//!
//! The main thread runs a one-shot epoll loop over the listening socket and
//! every client socket. Parsed requests are processed on a fixed worker
//! pool in either reactor mode (workers do their own socket I/O) or
//! proactor mode (the loop does the I/O, workers only process). Static
//! files are served from a memory map with a scatter write.

pub mod conn;
pub mod core;
pub mod db;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod util;

pub use error::{Result, ServerError};
