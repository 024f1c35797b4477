//! Waiting connect, reset and readiness.

use std::time::{Duration, Instant};

use crate::conn::Conn;
use crate::error::{Error, Result};
use crate::opts::Opts;
use crate::state::PollStatus;
use crate::transport::Interest;

fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|d| d.saturating_duration_since(Instant::now()))
}

impl Conn {
    /// Connect and wait until the session is ready.
    ///
    /// Same outcome as [`Conn::connect_start`] followed by a
    /// [`Conn::connect_poll`] loop. `connect_timeout` bounds the whole wait;
    /// running past it fails with [`Error::Timeout`] and leaves
    /// "timeout expired" in [`Conn::error_message`].
    pub fn connect<O: TryInto<Opts>>(opts: O) -> Result<Self>
    where
        Error: From<O::Error>,
    {
        let opts = opts.try_into()?;
        let deadline = opts.connect_timeout_duration().map(|t| Instant::now() + t);
        let mut conn = Self::connect_start_opts(opts)?;
        conn.drive_handshake(deadline)?;
        Ok(conn)
    }

    /// Reconnect with the original options and wait until ready.
    pub fn reset(&mut self) -> Result<()> {
        let deadline = self
            .opts()
            .connect_timeout_duration()
            .map(|t| Instant::now() + t);
        self.reset_start()?;
        self.drive_handshake(deadline)
    }

    fn drive_handshake(&mut self, deadline: Option<Instant>) -> Result<()> {
        loop {
            let interest = match self.connect_poll() {
                PollStatus::Ready => return Ok(()),
                PollStatus::Failed => return Err(self.handshake_error()),
                PollStatus::NeedRead => Interest::Read,
                PollStatus::NeedWrite => Interest::Write,
            };
            match self.wait_socket(interest, remaining(deadline)) {
                Ok(true) => {}
                Ok(false) => {
                    self.abort_handshake("timeout expired");
                    return Err(Error::Timeout);
                }
                Err(err) => {
                    self.abort_handshake(&err.to_string());
                    return Err(self.handshake_error());
                }
            }
        }
    }

    /// Wait until the current command has a result ready.
    ///
    /// Returns `false` if `timeout` passed first; the command is still
    /// pending and the call may be repeated, or the command cancelled.
    pub fn block(&mut self, timeout: Option<Duration>) -> Result<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.has_pending_output() {
                if let Err(err) = self.flush() {
                    if self.is_busy() {
                        return Err(err);
                    }
                }
            }
            if let Err(err) = self.consume_input() {
                if self.is_busy() {
                    return Err(err);
                }
            }
            if !self.is_busy() {
                return Ok(true);
            }
            let interest = if self.has_pending_output() {
                Interest::ReadWrite
            } else {
                Interest::Read
            };
            if !self.wait_socket(interest, remaining(deadline))? {
                return Ok(false);
            }
        }
    }
}
