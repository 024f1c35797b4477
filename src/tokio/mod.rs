//! Tokio adapter over the poll-driven [`Conn`](crate::Conn).
//!
//! The connection runs in non-blocking mode and every wait goes through the
//! runtime's reactor, so a task never parks a worker thread.

mod conn;

pub use conn::AsyncConn;
