//! Connection state machine
//!
//! `HttpConn` owns one client socket: its read and write buffers, the
//! request parser, and the mapped file being served.

pub mod file;
pub mod http_conn;
pub mod routes;

pub use file::MappedFile;
pub use http_conn::{ConnSettings, HttpConn};
