//! Out-of-band query cancellation.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::protocol::frontend::write_cancel_request;
use crate::transport::Address;

/// Everything needed to ask the server to cancel a running command.
///
/// Detached from the connection, so it can be sent to another thread and used
/// while the connection is waiting for a result.
#[derive(Debug, Clone)]
pub struct CancelToken {
    target: Address,
    pid: u32,
    secret: u32,
    connect_timeout: Option<Duration>,
}

impl CancelToken {
    pub(crate) fn new(target: Address, pid: u32, secret: u32, connect_timeout: Option<Duration>) -> Self {
        Self {
            target,
            pid,
            secret,
            connect_timeout,
        }
    }

    /// Backend process the request is aimed at.
    pub fn backend_pid(&self) -> u32 {
        self.pid
    }

    /// Open a fresh connection and send a CancelRequest.
    ///
    /// Success only means the request was delivered. Whether the command
    /// actually stops is up to the server; the command's result tells.
    pub fn cancel(&self) -> Result<()> {
        let mut packet = Vec::with_capacity(16);
        write_cancel_request(&mut packet, self.pid, self.secret);
        tracing::debug!(pid = self.pid, "sending cancel request");

        let sent = match &self.target {
            Address::Tcp(addr) => {
                let stream = match self.connect_timeout {
                    Some(timeout) => TcpStream::connect_timeout(addr, timeout),
                    None => TcpStream::connect(addr),
                };
                stream.and_then(|s| deliver(s, &packet))
            }
            Address::Unix(path) => UnixStream::connect(path).and_then(|s| deliver(s, &packet)),
        };
        sent.map_err(|e| Error::CancelFailed(format!("could not send cancel request: {e}")))
    }
}

/// Write the packet and wait for the server to hang up.
fn deliver<S: Read + Write>(mut stream: S, packet: &[u8]) -> io::Result<()> {
    stream.write_all(packet)?;
    stream.flush()?;
    let mut sink = [0u8; 64];
    loop {
        match stream.read(&mut sink) {
            Ok(0) => return Ok(()),
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            // Some servers reset instead of closing cleanly.
            Err(err) if err.kind() == io::ErrorKind::ConnectionReset => return Ok(()),
            Err(err) => return Err(err),
        }
    }
}
