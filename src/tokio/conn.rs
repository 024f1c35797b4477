//! Asynchronous PostgreSQL connection.

use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use tokio::io::Interest;
use tokio::io::unix::AsyncFd;

use crate::cancel::CancelToken;
use crate::conn::{Conn, CopyData, LastResult};
use crate::error::{Error, Result};
use crate::notify::Notification;
use crate::opts::Opts;
use crate::param::Param;
use crate::protocol::types::{FormatCode, Oid};
use crate::result::PgResult;
use crate::state::PollStatus;

/// Raw descriptor owned by the wrapped [`Conn`].
struct SocketFd(RawFd);

impl AsRawFd for SocketFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

fn register(conn: &Conn, interest: Interest) -> Result<AsyncFd<SocketFd>> {
    let fd = conn.fd().ok_or(Error::ConnectionClosed)?.as_raw_fd();
    Ok(AsyncFd::with_interest(SocketFd(fd), interest)?)
}

async fn wait(io: &AsyncFd<SocketFd>, interest: Interest) -> Result<()> {
    let mut guard = io.ready(interest).await?;
    guard.clear_ready();
    Ok(())
}

/// Asynchronous PostgreSQL connection.
pub struct AsyncConn {
    // Declared before `conn` so the registration goes away before the socket.
    io: Option<AsyncFd<SocketFd>>,
    conn: Conn,
}

impl AsyncConn {
    /// Connect to a PostgreSQL server.
    pub async fn connect<O: TryInto<Opts>>(opts: O) -> Result<Self>
    where
        Error: From<O::Error>,
    {
        let opts = opts.try_into()?;
        let timeout = opts.connect_timeout_duration();
        let mut conn = Conn::connect_start_opts(opts)?;
        drive_handshake(&mut conn, timeout).await?;
        Self::from_conn(conn)
    }

    /// Take over an established connection.
    pub fn from_conn(mut conn: Conn) -> Result<Self> {
        conn.set_nonblocking(true)?;
        let io = register(&conn, Interest::READABLE | Interest::WRITABLE)?;
        Ok(Self { io: Some(io), conn })
    }

    /// Reconnect with the original options.
    pub async fn reset(&mut self) -> Result<()> {
        self.io = None;
        let timeout = self.conn.opts().connect_timeout_duration();
        self.conn.reset_start()?;
        drive_handshake(&mut self.conn, timeout).await?;
        self.conn.set_nonblocking(true)?;
        self.io = Some(register(&self.conn, Interest::READABLE | Interest::WRITABLE)?);
        Ok(())
    }

    async fn ready(&self, interest: Interest) -> Result<()> {
        let io = self.io.as_ref().ok_or(Error::ConnectionClosed)?;
        wait(io, interest).await
    }

    fn interest(&self) -> Interest {
        if self.conn.has_pending_output() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    async fn wait_idle(&mut self) -> Result<()> {
        loop {
            if self.conn.has_pending_output() {
                if let Err(err) = self.conn.flush() {
                    if self.conn.is_busy() {
                        return Err(err);
                    }
                }
            }
            if let Err(err) = self.conn.consume_input() {
                if self.conn.is_busy() {
                    return Err(err);
                }
            }
            if !self.conn.is_busy() {
                return Ok(());
            }
            self.ready(self.interest()).await?;
        }
    }

    /// Wait until a result is ready. `Ok(false)` if `timeout` passed first.
    pub async fn block(&mut self, timeout: Option<Duration>) -> Result<bool> {
        match timeout {
            None => self.wait_idle().await.map(|()| true),
            Some(limit) => match tokio::time::timeout(limit, self.wait_idle()).await {
                Ok(done) => done.map(|()| true),
                Err(_elapsed) => Ok(false),
            },
        }
    }

    /// Next result of the current command, or `None` once it is drained.
    pub async fn get_result(&mut self) -> Result<Option<PgResult>> {
        self.wait_idle().await?;
        self.conn.get_result()
    }

    /// Drain the current command and return its last result.
    pub async fn get_last_result(&mut self) -> Result<Option<PgResult>> {
        let mut drain = LastResult::default();
        while let Some(result) = self.get_result().await? {
            if !drain.push(result)? {
                break;
            }
        }
        drain.finish(&self.conn)
    }

    async fn last_result(&mut self) -> Result<PgResult> {
        self.get_last_result()
            .await?
            .ok_or_else(|| Error::Protocol("server returned no result".into()))
    }

    pub async fn exec(&mut self, sql: &str) -> Result<PgResult> {
        self.conn.send_query(sql)?;
        self.last_result().await
    }

    pub async fn exec_params(&mut self, sql: &str, params: &[Param], result_format: FormatCode) -> Result<PgResult> {
        self.conn.send_query_params(sql, params, result_format)?;
        self.last_result().await
    }

    pub async fn prepare(&mut self, name: &str, sql: &str, param_types: &[Oid]) -> Result<PgResult> {
        self.conn.send_prepare(name, sql, param_types)?;
        self.last_result().await
    }

    pub async fn exec_prepared(&mut self, name: &str, params: &[Param], result_format: FormatCode) -> Result<PgResult> {
        self.conn.send_query_prepared(name, params, result_format)?;
        self.last_result().await
    }

    pub async fn describe_prepared(&mut self, name: &str) -> Result<PgResult> {
        self.conn.send_describe_prepared(name)?;
        self.last_result().await
    }

    pub async fn describe_portal(&mut self, name: &str) -> Result<PgResult> {
        self.conn.send_describe_portal(name)?;
        self.last_result().await
    }

    /// Send a chunk of COPY FROM STDIN data, waiting for room if needed.
    pub async fn put_copy_data(&mut self, data: &[u8]) -> Result<()> {
        while !self.conn.put_copy_data(data)? {
            self.ready(Interest::WRITABLE).await?;
        }
        Ok(())
    }

    /// Finish or abort COPY FROM STDIN; the result follows from `get_result`.
    pub async fn put_copy_end(&mut self, error: Option<&str>) -> Result<()> {
        while !self.conn.put_copy_end(error)? {
            self.ready(Interest::WRITABLE).await?;
        }
        Ok(())
    }

    /// Next COPY TO STDOUT row, or `None` once the server is done sending.
    pub async fn get_copy_data(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            match self.conn.get_copy_data(true)? {
                CopyData::Data(data) => return Ok(Some(data)),
                CopyData::Done => return Ok(None),
                CopyData::WouldBlock => {
                    self.ready(Interest::READABLE).await?;
                    self.conn.consume_input()?;
                }
            }
        }
    }

    /// Wait for the next `NOTIFY`.
    pub async fn wait_notification(&mut self) -> Result<Notification> {
        loop {
            if let Some(notification) = self.conn.notifies() {
                return Ok(notification);
            }
            self.ready(Interest::READABLE).await?;
            self.conn.consume_input()?;
        }
    }

    pub fn cancel_token(&self) -> Option<CancelToken> {
        self.conn.cancel_token()
    }

    pub fn inner(&self) -> &Conn {
        &self.conn
    }

    /// The wrapped connection. Switching it to blocking mode stalls the runtime.
    pub fn inner_mut(&mut self) -> &mut Conn {
        &mut self.conn
    }

    pub fn close(&mut self) {
        self.io = None;
        self.conn.close();
    }
}

impl std::fmt::Debug for AsyncConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncConn").field("conn", &self.conn).finish()
    }
}

async fn poll_handshake(conn: &mut Conn) -> Result<()> {
    loop {
        let interest = match conn.connect_poll() {
            PollStatus::Ready => return Ok(()),
            PollStatus::Failed => return Err(conn.handshake_error()),
            PollStatus::NeedRead => Interest::READABLE,
            PollStatus::NeedWrite => Interest::WRITABLE,
        };
        // The socket changes when a connect attempt moves to the next
        // address, so each wait registers afresh.
        let io = register(conn, interest)?;
        wait(&io, interest).await?;
    }
}

async fn drive_handshake(conn: &mut Conn, timeout: Option<Duration>) -> Result<()> {
    let outcome = match timeout {
        Some(limit) => tokio::time::timeout(limit, poll_handshake(conn)).await.ok(),
        None => Some(poll_handshake(conn).await),
    };
    let Some(outcome) = outcome else {
        conn.abort_handshake("timeout expired");
        return Err(Error::Timeout);
    };
    if let Err(err) = &outcome {
        if !matches!(err, Error::Connect(_) | Error::Reset(_)) {
            conn.abort_handshake(&err.to_string());
            return Err(conn.handshake_error());
        }
    }
    outcome
}
