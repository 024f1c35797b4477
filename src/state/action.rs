//! What a sans-I/O machine asks of its driver.

use crate::notify::{Notice, Notification};

/// Outcome of one connect or reset poll step.
///
/// After `NeedRead` / `NeedWrite` the caller waits until the socket is
/// readable / writable and polls again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    NeedRead,
    NeedWrite,
    /// Handshake finished; the connection accepts commands
    Ready,
    /// Handshake failed; see the connection's error message
    Failed,
}

/// Out-of-band message the server may send at any time.
#[derive(Debug, Clone)]
pub enum AsyncMessage {
    /// LISTEN/NOTIFY delivery
    Notification(Notification),
    /// Non-fatal notice or warning
    Notice(Notice),
    /// A reported run-time parameter changed
    ParameterChanged { name: String, value: String },
}
