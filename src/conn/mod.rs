//! Non-blocking connection.
//!
//! [`Conn`] owns the socket and drives the startup machine and the command
//! pipeline from whatever bytes are available. None of its methods wait,
//! except [`Conn::get_result`] while a result is still outstanding and the
//! blocking helpers in [`crate::sync`].

mod command;
pub(crate) use command::LastResult;
mod copy;

pub use copy::CopyData;

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::error::{CommandError, Error, Result, Verbosity};
use crate::escape;
use crate::notify::{LoggingReceiver, Notice, NoticeProcessor, NoticeReceiver, Notification};
use crate::opts::{ConnOption, Opts, SslMode};
use crate::protocol::backend::{NotificationResponse, ParameterStatus, RawMessage, msg_type, parse_fields};
use crate::protocol::codec::split_message;
use crate::protocol::frontend::write_terminate;
use crate::protocol::types::tx_status;
use crate::result::{PgResult, ResultStatus};
use crate::state::{
    AsyncMessage, CommandPipeline, PipelineState, PollStatus, SslResponse, StartupMachine,
    StartupPhase, Step,
};
use crate::transport::{Address, Interest, PendingSocket, Stream, wait_ready};

pub(crate) const SERVER_CLOSED: &str = "server closed the connection unexpectedly\n\
    \tThis probably means the server terminated abnormally\n\
    \tbefore or while processing the request.";

const READ_CHUNK: usize = 8192;

/// Connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    Ok,
    Bad,
    /// Waiting for the socket to connect
    Started,
    /// Connected; the first packet is queued
    Made,
    /// Waiting for the server's authentication request or verdict
    AwaitingResponse,
    /// Authenticated; waiting for the backend to finish starting
    AuthOk,
    /// Negotiating SSL
    SslStartup,
    /// Negotiating environment-driven settings. Protocol 3.0 never needs it.
    SetEnv,
}

/// In-transaction status of the server session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Idle, not in a transaction block
    Idle,
    /// A command is in progress
    Active,
    /// Idle, in a valid transaction block
    InTransaction,
    /// Idle, in a failed transaction block
    InError,
    /// Connection is bad
    Unknown,
}

/// Per-session state that outlives individual commands.
struct Session {
    params: Vec<(String, String)>,
    notifications: VecDeque<Notification>,
    receiver: Option<NoticeReceiver>,
    processor: Option<NoticeProcessor>,
    trace: Option<Box<dyn Write + Send>>,
    verbosity: Verbosity,
}

impl Session {
    fn new() -> Self {
        Self {
            params: Vec::new(),
            notifications: VecDeque::new(),
            receiver: Some(Box::new(LoggingReceiver)),
            processor: None,
            trace: None,
            verbosity: Verbosity::Default,
        }
    }

    fn parameter(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn set_parameter(&mut self, name: &str, value: &str) {
        match self.params.iter_mut().find(|(k, _)| k == name) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.params.push((name.to_string(), value.to_string())),
        }
    }

    /// Route a NoticeResponse, NotificationResponse or ParameterStatus.
    fn on_async(&mut self, msg: RawMessage<'_>) -> Result<()> {
        let event = match msg.type_byte {
            msg_type::NOTICE_RESPONSE => {
                AsyncMessage::Notice(Notice::new(parse_fields(msg.payload)?, self.verbosity))
            }
            msg_type::NOTIFICATION_RESPONSE => {
                let n = NotificationResponse::parse(msg.payload)?;
                let notification = Notification {
                    relname: n.channel.to_string(),
                    be_pid: n.pid,
                    extra: n.payload.to_string(),
                };
                self.notifications.push_back(notification.clone());
                AsyncMessage::Notification(notification)
            }
            msg_type::PARAMETER_STATUS => {
                let p = ParameterStatus::parse(msg.payload)?;
                self.set_parameter(p.name, p.value);
                AsyncMessage::ParameterChanged {
                    name: p.name.to_string(),
                    value: p.value.to_string(),
                }
            }
            other => {
                return Err(Error::Protocol(format!(
                    "message type 0x{other:02x} is not asynchronous"
                )));
            }
        };
        match self.receiver.as_mut() {
            Some(receiver) => receiver.handle(&event),
            None if self.processor.is_some() => {}
            None => {
                if let AsyncMessage::Notice(notice) = &event {
                    tracing::warn!(notice = %notice.message.trim_end(), "notice dropped, no receiver installed");
                }
            }
        }
        if let (Some(processor), AsyncMessage::Notice(notice)) = (self.processor.as_mut(), &event) {
            processor(&notice.message);
        }
        Ok(())
    }

    fn trace_message(&mut self, direction: &str, type_byte: u8, total_len: usize) {
        if let Some(sink) = self.trace.as_mut() {
            let written = writeln!(sink, "{direction}> {} {}", type_byte as char, total_len - 1);
            if let Err(err) = written {
                tracing::debug!(error = %err, "protocol trace sink failed, tracing stopped");
                self.trace = None;
            }
        }
    }
}

/// State that exists only while connecting.
struct Handshake {
    startup: StartupMachine,
    addresses: Vec<Address>,
    next_address: usize,
    socket: Option<PendingSocket>,
    /// SSLRequest queued or sent; its answer is not read yet
    ssl_requested: bool,
    #[cfg(feature = "tls")]
    tls: Option<native_tls::MidHandshakeTlsStream<std::net::TcpStream>>,
}

impl Handshake {
    fn new(startup: StartupMachine, addresses: Vec<Address>) -> Self {
        Self {
            startup,
            addresses,
            next_address: 0,
            socket: None,
            ssl_requested: false,
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    /// Start connecting to the next untried address.
    fn connect_next(&mut self, mut last_error: Option<String>) -> Result<()> {
        while let Some(address) = self.addresses.get(self.next_address).cloned() {
            self.next_address += 1;
            match PendingSocket::start(address.clone()) {
                Ok(socket) => {
                    tracing::debug!(address = %address.describe(), "connecting");
                    self.socket = Some(socket);
                    return Ok(());
                }
                Err(err) => {
                    last_error = Some(format!("connection to {} failed: {err}", address.describe()));
                }
            }
        }
        Err(Error::Connect(
            last_error.unwrap_or_else(|| "no address to connect to".to_string()),
        ))
    }
}

fn wants_tls(mode: SslMode) -> bool {
    cfg!(feature = "tls")
        && matches!(
            mode,
            SslMode::Prefer | SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull
        )
}

/// Addresses to try, in order.
fn resolve(opts: &Opts) -> Result<Vec<Address>> {
    if let Some(path) = opts.unix_socket_path() {
        return Ok(vec![Address::Unix(path)]);
    }
    let port = opts.effective_port();
    if let Some(hostaddr) = &opts.hostaddr {
        let ip: IpAddr = hostaddr.parse().map_err(|_| {
            Error::Config(format!("could not parse network address \"{hostaddr}\""))
        })?;
        return Ok(vec![Address::Tcp(SocketAddr::new(ip, port))]);
    }
    let host = opts.effective_host();
    let addresses: Vec<Address> = (host, port)
        .to_socket_addrs()
        .map_err(|e| {
            Error::Connect(format!("could not translate host name \"{host}\" to address: {e}"))
        })?
        .map(Address::Tcp)
        .collect();
    if addresses.is_empty() {
        return Err(Error::Connect(format!(
            "could not translate host name \"{host}\" to address"
        )));
    }
    Ok(addresses)
}

/// `server_version` in integer form: 160002 for 16.2, 90603 for 9.6.3.
fn parse_server_version(text: &str) -> u32 {
    let end = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let mut parts = text[..end]
        .split('.')
        .map(|p| p.parse::<u32>().unwrap_or(0));
    let major = parts.next().unwrap_or(0);
    let minor = parts.next().unwrap_or(0);
    if major >= 10 {
        major * 10_000 + minor
    } else {
        major * 10_000 + minor * 100 + parts.next().unwrap_or(0)
    }
}

/// Non-blocking PostgreSQL connection.
pub struct Conn {
    opts: Opts,
    status: ConnStatus,
    stream: Option<Stream>,
    handshake: Option<Handshake>,
    pipeline: CommandPipeline,
    session: Session,
    inbuf: Vec<u8>,
    /// Bytes of `inbuf` already consumed
    in_start: usize,
    outbuf: Vec<u8>,
    backend_key: Option<(u32, u32)>,
    cancel_address: Option<Address>,
    error_message: String,
    nonblocking: bool,
    closed: bool,
    resetting: bool,
    /// Opened over a caller-supplied stream that cannot be reopened
    supplied_stream: bool,
    password_needed: bool,
    password_used: bool,
}

impl Conn {
    fn blank(opts: Opts) -> Self {
        Self {
            opts,
            status: ConnStatus::Bad,
            stream: None,
            handshake: None,
            pipeline: CommandPipeline::new(),
            session: Session::new(),
            inbuf: Vec::with_capacity(READ_CHUNK),
            in_start: 0,
            outbuf: Vec::new(),
            backend_key: None,
            cancel_address: None,
            error_message: String::new(),
            nonblocking: false,
            closed: false,
            resetting: false,
            supplied_stream: false,
            password_needed: false,
            password_used: false,
        }
    }

    /// Validate `opts` and start connecting without waiting.
    ///
    /// Drive the handshake with [`Conn::connect_poll`]. Malformed options fail
    /// with [`Error::Config`]; a socket that cannot even be opened fails with
    /// [`Error::Connect`].
    pub fn connect_start<O: TryInto<Opts>>(opts: O) -> Result<Self>
    where
        Error: From<O::Error>,
    {
        Self::connect_start_opts(opts.try_into()?)
    }

    pub(crate) fn connect_start_opts(opts: Opts) -> Result<Self> {
        opts.validate()?;
        let addresses = resolve(&opts)?;
        let mut conn = Self::blank(opts);
        conn.begin_handshake(addresses)?;
        Ok(conn)
    }

    /// Start the handshake over an already connected stream.
    ///
    /// SSL is never negotiated on such a stream, and [`Conn::reset_start`]
    /// cannot reopen it.
    pub fn connect_start_with_stream<O: TryInto<Opts>>(stream: Stream, opts: O) -> Result<Self>
    where
        Error: From<O::Error>,
    {
        let opts = opts.try_into()?;
        opts.validate()?;
        stream.set_nonblocking(true)?;
        let mut conn = Self::blank(opts);
        let startup = StartupMachine::new(&conn.opts, conn.session.verbosity)?;
        conn.cancel_address = stream.peer_addr().map(Address::Tcp);
        conn.supplied_stream = true;
        conn.stream = Some(stream);
        conn.handshake = Some(Handshake::new(startup, Vec::new()));
        conn.queue_first_packet(false);
        Ok(conn)
    }

    fn begin_handshake(&mut self, addresses: Vec<Address>) -> Result<()> {
        let startup = match StartupMachine::new(&self.opts, self.session.verbosity) {
            Ok(startup) => startup,
            Err(err) => {
                self.abort_handshake(&err.to_string());
                return Err(err);
            }
        };
        let mut handshake = Handshake::new(startup, addresses);
        let started = handshake.connect_next(None);
        self.handshake = Some(handshake);
        match started {
            Ok(()) => {
                self.set_status(ConnStatus::Started);
                Ok(())
            }
            Err(err) => {
                self.fail_handshake(&err);
                Err(self.handshake_error())
            }
        }
    }

    fn set_status(&mut self, status: ConnStatus) {
        if self.status != status {
            tracing::debug!(from = ?self.status, to = ?status, "connection status");
            self.status = status;
        }
    }

    /// Queue SSLRequest or StartupMessage on a freshly connected stream.
    fn queue_first_packet(&mut self, tls_allowed: bool) {
        let Some(handshake) = self.handshake.as_mut() else {
            return;
        };
        if tls_allowed && wants_tls(self.opts.sslmode()) {
            handshake.startup.send_ssl_request(&mut self.outbuf);
            handshake.ssl_requested = true;
        } else {
            handshake.startup.send_startup(&mut self.outbuf);
        }
        self.set_status(ConnStatus::Made);
    }

    /// Advance the connection handshake as far as the socket allows.
    ///
    /// After `NeedRead` / `NeedWrite`, wait until [`Conn::socket`] is readable
    /// / writable and call again. `Failed` is terminal for this attempt;
    /// [`Conn::error_message`] says why.
    pub fn connect_poll(&mut self) -> PollStatus {
        match self.poll_handshake() {
            Ok(status) => status,
            Err(err) => {
                self.fail_handshake(&err);
                PollStatus::Failed
            }
        }
    }

    /// Start replacing the transport, reusing the original options.
    ///
    /// Any command in flight is abandoned. Drive with [`Conn::reset_poll`].
    pub fn reset_start(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }
        if self.supplied_stream {
            return Err(Error::Reset("connection was opened over a supplied stream".into()));
        }
        self.send_terminate();
        self.drop_transport();
        self.pipeline.reset();
        self.session.params.clear();
        self.backend_key = None;
        self.cancel_address = None;
        self.resetting = true;
        let addresses = match resolve(&self.opts) {
            Ok(addresses) => addresses,
            Err(err) => {
                self.fail_handshake(&err);
                return Err(self.handshake_error());
            }
        };
        self.begin_handshake(addresses)
    }

    pub fn reset_poll(&mut self) -> PollStatus {
        self.connect_poll()
    }

    fn poll_handshake(&mut self) -> Result<PollStatus> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }
        loop {
            match self.status {
                ConnStatus::Ok => return Ok(PollStatus::Ready),
                ConnStatus::Bad => return Ok(PollStatus::Failed),
                ConnStatus::Started => {
                    if !self.poll_socket()? {
                        return Ok(PollStatus::NeedWrite);
                    }
                }
                ConnStatus::Made => {
                    if !self.write_out()? {
                        return Ok(PollStatus::NeedWrite);
                    }
                    let ssl = self.handshake.as_ref().is_some_and(|h| h.ssl_requested);
                    self.set_status(if ssl {
                        ConnStatus::SslStartup
                    } else {
                        ConnStatus::AwaitingResponse
                    });
                }
                ConnStatus::SslStartup => {
                    if let Some(status) = self.poll_ssl()? {
                        return Ok(status);
                    }
                }
                ConnStatus::AwaitingResponse | ConnStatus::AuthOk | ConnStatus::SetEnv => {
                    if let Some(status) = self.poll_startup()? {
                        return Ok(status);
                    }
                }
            }
        }
    }

    /// `Ok(false)` while the socket connect is still in flight.
    fn poll_socket(&mut self) -> Result<bool> {
        let Some(handshake) = self.handshake.as_mut() else {
            return Err(Error::InvalidUsage("no connection attempt in progress".into()));
        };
        let Some(socket) = handshake.socket.as_ref() else {
            return Err(Error::InvalidUsage("no socket is connecting".into()));
        };
        match socket.finished() {
            Ok(false) => Ok(false),
            Ok(true) => {
                if let Some(socket) = handshake.socket.take() {
                    self.cancel_address = Some(socket.target().clone());
                    self.stream = Some(socket.into_stream());
                }
                let tcp = matches!(self.stream, Some(Stream::Tcp(_)));
                self.queue_first_packet(tcp);
                Ok(true)
            }
            Err(err) => {
                let message = format!("connection to {} failed: {err}", socket.target().describe());
                handshake.socket = None;
                handshake.connect_next(Some(message))?;
                Ok(true)
            }
        }
    }

    fn poll_ssl(&mut self) -> Result<Option<PollStatus>> {
        #[cfg(feature = "tls")]
        if let Some(mid) = self.handshake.as_mut().and_then(|h| h.tls.take()) {
            return self.finish_tls(crate::transport::tls::resume(mid)?);
        }

        let stream = self.stream.as_mut().ok_or(Error::ConnectionClosed)?;
        let mut byte = [0u8; 1];
        let n = match stream.read(&mut byte) {
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                return Ok(Some(PollStatus::NeedRead));
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if n == 0 {
            return Err(Error::Connect(SERVER_CLOSED.into()));
        }
        let Some(handshake) = self.handshake.as_mut() else {
            return Err(Error::InvalidUsage("no connection attempt in progress".into()));
        };
        handshake.ssl_requested = false;
        let required = self.opts.sslmode().requires_tls();
        match handshake.startup.ssl_response(byte[0], required, &mut self.outbuf)? {
            SslResponse::Plain => {
                self.set_status(ConnStatus::Made);
                Ok(None)
            }
            SslResponse::Handshake => self.start_tls(),
        }
    }

    #[cfg(feature = "tls")]
    fn start_tls(&mut self) -> Result<Option<PollStatus>> {
        let Some(Stream::Tcp(tcp)) = self.stream.take() else {
            return Err(Error::Protocol("SSL negotiated on a non-TCP stream".into()));
        };
        let domain = self.opts.effective_host().to_string();
        self.finish_tls(crate::transport::tls::start(self.opts.sslmode(), &domain, tcp)?)
    }

    #[cfg(not(feature = "tls"))]
    fn start_tls(&mut self) -> Result<Option<PollStatus>> {
        Err(Error::Unsupported("SSL support is not compiled in".into()))
    }

    #[cfg(feature = "tls")]
    fn finish_tls(&mut self, handshake: crate::transport::tls::Handshake) -> Result<Option<PollStatus>> {
        use crate::transport::tls::Handshake as Tls;

        let Some(state) = self.handshake.as_mut() else {
            return Err(Error::InvalidUsage("no connection attempt in progress".into()));
        };
        match handshake {
            Tls::Pending(mid) => {
                let waiting = match crate::transport::tls::stalled_on(mid.get_ref().as_fd())? {
                    Interest::Write => PollStatus::NeedWrite,
                    Interest::Read | Interest::ReadWrite => PollStatus::NeedRead,
                };
                state.tls = Some(mid);
                Ok(Some(waiting))
            }
            Tls::Done(stream) => {
                tracing::debug!("SSL connection established");
                self.stream = Some(stream);
                state.startup.send_startup(&mut self.outbuf);
                self.set_status(ConnStatus::Made);
                Ok(None)
            }
        }
    }

    fn poll_startup(&mut self) -> Result<Option<PollStatus>> {
        if !self.write_out()? {
            return Ok(Some(PollStatus::NeedWrite));
        }
        let eof = self.read_input()?;
        while let Some((type_byte, payload, len)) = split_message(&self.inbuf[self.in_start..])? {
            self.in_start += len;
            self.session.trace_message("From backend", type_byte, len);
            let msg = RawMessage::new(type_byte, payload);
            if msg.is_async() {
                self.session.on_async(msg)?;
                continue;
            }
            let Some(handshake) = self.handshake.as_mut() else {
                return Err(Error::InvalidUsage("no connection attempt in progress".into()));
            };
            let step = handshake.startup.step(msg, &mut self.outbuf);
            self.password_needed = handshake.startup.password_needed();
            self.password_used = handshake.startup.password_used();
            let phase = handshake.startup.phase();
            if step? == Step::Ready {
                self.handshake_done();
                return Ok(Some(PollStatus::Ready));
            }
            if phase == StartupPhase::AwaitingReady {
                self.set_status(ConnStatus::AuthOk);
            }
        }
        if !self.outbuf.is_empty() {
            return Ok(None);
        }
        if eof {
            return Err(Error::Connect(SERVER_CLOSED.into()));
        }
        Ok(Some(PollStatus::NeedRead))
    }

    fn handshake_done(&mut self) {
        if let Some(handshake) = self.handshake.take() {
            self.backend_key = handshake.startup.backend_key();
            self.pipeline.reset();
            self.pipeline.set_transaction_status(handshake.startup.transaction_status());
        }
        self.resetting = false;
        self.error_message.clear();
        self.set_status(ConnStatus::Ok);
        tracing::debug!(pid = self.backend_pid(), "connection ready");
    }

    fn fail_handshake(&mut self, err: &Error) {
        let text = match err {
            Error::Connect(message) | Error::Reset(message) => message.clone(),
            other => other.to_string(),
        };
        self.abort_handshake(&text);
    }

    /// End the current connection attempt with `message`.
    pub(crate) fn abort_handshake(&mut self, message: &str) {
        tracing::debug!(error = %message.trim_end(), "connection attempt failed");
        self.error_message = format!("{}\n", message.trim_end());
        self.drop_transport();
        self.set_status(ConnStatus::Bad);
    }

    /// The error a failed connect or reset reports.
    pub(crate) fn handshake_error(&self) -> Error {
        let message = self.error_message.trim_end().to_string();
        if self.resetting {
            Error::Reset(message)
        } else {
            Error::Connect(message)
        }
    }

    fn drop_transport(&mut self) {
        self.stream = None;
        self.handshake = None;
        self.inbuf.clear();
        self.in_start = 0;
        self.outbuf.clear();
    }

    fn send_terminate(&mut self) {
        if self.status != ConnStatus::Ok {
            return;
        }
        if let Some(stream) = self.stream.as_mut() {
            let mut packet = Vec::with_capacity(5);
            write_terminate(&mut packet);
            // Best effort; the socket is closed right after either way.
            let _ = stream.write_all(&packet);
        }
    }

    /// Close the connection. Later operations fail with
    /// [`Error::ConnectionClosed`]. Calling it twice is harmless.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.send_terminate();
        self.drop_transport();
        self.pipeline.reset();
        self.closed = true;
        self.set_status(ConnStatus::Bad);
        tracing::debug!("connection closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// The server went away or the stream broke.
    fn connection_lost(&mut self, message: &str) {
        tracing::debug!(error = %message.trim_end(), "connection lost");
        self.error_message = format!("{}\n", message.trim_end());
        self.pipeline.connection_lost(message);
        self.stream = None;
        self.inbuf.clear();
        self.in_start = 0;
        self.outbuf.clear();
        self.set_status(ConnStatus::Bad);
    }

    /// Read everything the socket has buffered. `Ok(true)` at end of stream.
    fn read_input(&mut self) -> Result<bool> {
        if self.in_start > 0 {
            self.inbuf.drain(..self.in_start);
            self.in_start = 0;
        }
        let stream = self.stream.as_mut().ok_or(Error::ConnectionClosed)?;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(n) => self.inbuf.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Write as much queued output as the socket takes. `Ok(true)` once
    /// nothing is left.
    fn write_out(&mut self) -> Result<bool> {
        let stream = self.stream.as_mut().ok_or(Error::ConnectionClosed)?;
        while !self.outbuf.is_empty() {
            match stream.write(&self.outbuf) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => {
                    self.outbuf.drain(..n);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        match stream.flush() {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Parse buffered backend messages until the input runs dry or COPY-out
    /// data is next.
    fn parse_input(&mut self) -> Result<()> {
        while self.pipeline.state() != PipelineState::CopyOut {
            let Some((type_byte, payload, len)) = split_message(&self.inbuf[self.in_start..])? else {
                break;
            };
            self.in_start += len;
            self.session.trace_message("From backend", type_byte, len);
            tracing::trace!(msg = %(type_byte as char), len, "backend message");
            let msg = RawMessage::new(type_byte, payload);
            if msg.is_async() {
                self.session.on_async(msg)?;
            } else {
                self.pipeline.handle(msg)?;
            }
        }
        Ok(())
    }

    /// [`Conn::parse_input`], dropping the connection if the stream turns out
    /// to be garbage.
    fn parse_or_lose(&mut self) -> Result<()> {
        let parsed = self.parse_input();
        if let Err(err) = &parsed {
            self.connection_lost(&err.to_string());
        }
        parsed
    }

    fn check_ready(&self) -> Result<()> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }
        match self.status {
            ConnStatus::Ok => Ok(()),
            ConnStatus::Bad => Err(Error::ConnectionClosed),
            _ => Err(Error::InvalidUsage("connection is still being established".into())),
        }
    }

    /// Read whatever the server has sent and process it, without waiting.
    ///
    /// Safe to call speculatively. Notices and notifications found in the
    /// input reach the receiver and the [`Conn::notifies`] queue.
    pub fn consume_input(&mut self) -> Result<()> {
        self.check_ready()?;
        let eof = match self.read_input() {
            Ok(eof) => eof,
            Err(err) => {
                self.connection_lost(&err.to_string());
                return Err(err);
            }
        };
        self.parse_or_lose()?;
        if eof {
            self.connection_lost(SERVER_CLOSED);
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, SERVER_CLOSED).into());
        }
        Ok(())
    }

    /// Fetching the next result would have to wait for the server.
    pub fn is_busy(&self) -> bool {
        self.pipeline.is_busy()
    }

    /// Descriptor to wait on, if any.
    pub(crate) fn fd(&self) -> Option<BorrowedFd<'_>> {
        if let Some(stream) = &self.stream {
            return Some(stream.as_fd());
        }
        let handshake = self.handshake.as_ref()?;
        if let Some(socket) = &handshake.socket {
            return Some(socket.as_fd());
        }
        #[cfg(feature = "tls")]
        if let Some(mid) = &handshake.tls {
            return Some(mid.get_ref().as_fd());
        }
        None
    }

    /// Wait until the socket is ready. `Ok(false)` on timeout.
    pub(crate) fn wait_socket(&self, interest: Interest, timeout: Option<Duration>) -> Result<bool> {
        let fd = self.fd().ok_or(Error::ConnectionClosed)?;
        Ok(wait_ready(fd, interest, timeout)?)
    }

    /// Output is queued but not yet written.
    pub fn has_pending_output(&self) -> bool {
        !self.outbuf.is_empty()
    }

    /// Write all queued output, waiting for the socket as needed.
    ///
    /// Input is read meanwhile so a server blocked on its own send buffer
    /// cannot stall the write. `Ok(false)` once `deadline` passes.
    pub(crate) fn flush_until(&mut self, deadline: Option<Instant>) -> Result<bool> {
        loop {
            if self.write_out()? {
                return Ok(true);
            }
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if !self.wait_socket(Interest::ReadWrite, remaining)? {
                return Ok(false);
            }
            if self.read_input()? {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, SERVER_CLOSED).into());
            }
        }
    }

    // Accessors

    pub fn status(&self) -> ConnStatus {
        self.status
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        if self.status != ConnStatus::Ok {
            return TransactionStatus::Unknown;
        }
        if self.pipeline.state() != PipelineState::Idle {
            return TransactionStatus::Active;
        }
        match self.pipeline.transaction_status() {
            tx_status::IDLE => TransactionStatus::Idle,
            tx_status::IN_TRANSACTION => TransactionStatus::InTransaction,
            tx_status::FAILED => TransactionStatus::InError,
            _ => TransactionStatus::Unknown,
        }
    }

    /// Value of a parameter the server reported (`server_version`,
    /// `client_encoding`, `standard_conforming_strings`, ...).
    pub fn parameter_status(&self, name: &str) -> Option<&str> {
        self.session.parameter(name)
    }

    /// Frontend/backend protocol major version; 0 when not connected.
    pub fn protocol_version(&self) -> u32 {
        if self.status == ConnStatus::Ok { 3 } else { 0 }
    }

    /// Server version as an integer, e.g. 160002; 0 when unknown.
    pub fn server_version(&self) -> u32 {
        self.parameter_status("server_version")
            .map_or(0, parse_server_version)
    }

    /// Most recent error text produced by an operation on this connection.
    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    pub fn socket(&self) -> Option<RawFd> {
        self.fd().map(|fd| fd.as_raw_fd())
    }

    /// Backend process id; 0 before the server reported it.
    pub fn backend_pid(&self) -> u32 {
        self.backend_key.map_or(0, |(pid, _)| pid)
    }

    pub fn connection_needs_password(&self) -> bool {
        self.password_needed
    }

    pub fn connection_used_password(&self) -> bool {
        self.password_used
    }

    pub fn ssl_in_use(&self) -> bool {
        self.stream.as_ref().is_some_and(Stream::is_tls)
    }

    pub fn opts(&self) -> &Opts {
        &self.opts
    }

    pub fn db(&self) -> Option<String> {
        self.opts.effective_dbname().ok()
    }

    pub fn user(&self) -> Option<String> {
        self.opts.effective_user().ok()
    }

    pub fn pass(&self) -> Option<&str> {
        self.opts.password.as_deref()
    }

    pub fn host(&self) -> &str {
        self.opts.effective_host()
    }

    pub fn port(&self) -> u16 {
        self.opts.effective_port()
    }

    pub fn tty(&self) -> Option<&str> {
        self.opts.tty.as_deref()
    }

    pub fn options(&self) -> Option<&str> {
        self.opts.options.as_deref()
    }

    pub fn client_encoding(&self) -> Option<&str> {
        self.parameter_status("client_encoding")
    }

    /// In non-blocking mode, dispatch and COPY writes return without waiting
    /// and may leave bytes queued for [`Conn::flush`]. Switching back to
    /// blocking mode flushes them.
    pub fn set_nonblocking(&mut self, nonblocking: bool) -> Result<()> {
        if !nonblocking && self.nonblocking && self.status == ConnStatus::Ok {
            self.flush_until(None)?;
        }
        self.nonblocking = nonblocking;
        Ok(())
    }

    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking
    }

    /// Next queued LISTEN/NOTIFY delivery.
    pub fn notifies(&mut self) -> Option<Notification> {
        self.session.notifications.pop_front()
    }

    /// Install a receiver for notices and other out-of-band messages,
    /// returning the previous one. `None` leaves the slot empty; notices then
    /// reach only the notice processor, if one is installed.
    pub fn set_notice_receiver(&mut self, receiver: Option<NoticeReceiver>) -> Option<NoticeReceiver> {
        std::mem::replace(&mut self.session.receiver, receiver)
    }

    /// See [`crate::protocol::frontend::encrypt_password`].
    pub fn encrypt_password(password: &str, user: &str) -> String {
        crate::protocol::frontend::encrypt_password(password, user)
    }

    /// See [`crate::opts::conndefaults`].
    pub fn conndefaults() -> Vec<ConnOption> {
        crate::opts::conndefaults()
    }

    /// Install a callback for the text of each notice, returning the previous
    /// one. It runs after the notice receiver. `None` removes it.
    pub fn set_notice_processor(&mut self, processor: Option<NoticeProcessor>) -> Option<NoticeProcessor> {
        std::mem::replace(&mut self.session.processor, processor)
    }

    /// Set how much detail error messages carry, returning the old setting.
    pub fn set_error_verbosity(&mut self, verbosity: Verbosity) -> Verbosity {
        self.pipeline.set_verbosity(verbosity);
        std::mem::replace(&mut self.session.verbosity, verbosity)
    }

    /// Write one line per protocol message to `sink`.
    pub fn trace(&mut self, sink: Box<dyn Write + Send>) {
        self.session.trace = Some(sink);
    }

    pub fn untrace(&mut self) {
        self.session.trace = None;
    }

    fn trace_output(&mut self, from: usize) {
        if self.session.trace.is_none() {
            return;
        }
        let mut rest = &self.outbuf[from..];
        while let Ok(Some((type_byte, _, len))) = split_message(rest) {
            self.session.trace_message("To backend", type_byte, len);
            rest = &rest[len..];
        }
    }

    /// An empty result with `status`. Error statuses carry the connection's
    /// current error message.
    pub fn make_empty_result(&self, status: ResultStatus) -> PgResult {
        let mut result = PgResult::new(status);
        if status.is_error() {
            result.set_error_message(self.error_message.clone());
        }
        result
    }

    /// A detached handle for cancelling commands from elsewhere.
    ///
    /// `None` until the server sent its cancel key, and for connections made
    /// over a stream with no known address.
    pub fn cancel_token(&self) -> Option<CancelToken> {
        let (pid, secret) = self.backend_key?;
        let address = self.cancel_address.clone()?;
        Some(CancelToken::new(
            address,
            pid,
            secret,
            self.opts.connect_timeout_duration(),
        ))
    }

    /// Wrap an error result together with this connection's identity.
    pub(crate) fn command_error(&self, result: PgResult) -> Error {
        let message = match result.error_message() {
            Ok(message) if !message.is_empty() => message.to_string(),
            _ => result
                .res_status()
                .map_or_else(|_| "command failed".to_string(), str::to_string),
        };
        Error::Command(Box::new(CommandError {
            message,
            backend_pid: self.backend_pid(),
            conninfo: self.opts.to_conninfo_redacted(),
            result: Some(result),
        }))
    }

    pub fn escape_string(&self, s: &str) -> String {
        let standard = self.parameter_status("standard_conforming_strings") != Some("off");
        escape::escape_string(s, standard)
    }

    pub fn escape_literal(&self, s: &str) -> String {
        escape::escape_literal(s)
    }

    pub fn escape_identifier(&self, s: &str) -> Result<String> {
        escape::quote_ident(s)
    }

    pub fn escape_bytea(&self, data: &[u8]) -> String {
        escape::escape_bytea(data)
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("status", &self.status)
            .field("backend_pid", &self.backend_pid())
            .field("pipeline", &self.pipeline.state())
            .field("nonblocking", &self.nonblocking)
            .finish_non_exhaustive()
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_version_forms() {
        assert_eq!(parse_server_version("16.2"), 160_002);
        assert_eq!(parse_server_version("16.2 (Debian 16.2-1.pgdg120+2)"), 160_002);
        assert_eq!(parse_server_version("9.6.3"), 90_603);
        assert_eq!(parse_server_version("17beta1"), 170_000);
        assert_eq!(parse_server_version(""), 0);
    }

    #[test]
    fn resolve_unix_socket_dir() {
        let opts = Opts {
            host: Some("/var/run/postgresql".into()),
            port: Some(5433),
            ..Opts::default()
        };
        assert_eq!(
            resolve(&opts).unwrap(),
            vec![Address::Unix("/var/run/postgresql/.s.PGSQL.5433".into())]
        );
    }

    #[test]
    fn resolve_hostaddr_skips_lookup() {
        let opts = Opts {
            host: Some("db.invalid".into()),
            hostaddr: Some("127.0.0.1".into()),
            ..Opts::default()
        };
        assert_eq!(
            resolve(&opts).unwrap(),
            vec![Address::Tcp("127.0.0.1:5432".parse().unwrap())]
        );
    }

    #[test]
    fn connect_start_rejects_bad_options() {
        let opts = Opts {
            user: Some("u".into()),
            port: Some(0),
            ..Opts::default()
        };
        assert!(matches!(Conn::connect_start(opts), Err(Error::Config(_))));
    }

    #[test]
    fn missing_socket_fails_immediately() {
        let dir = std::env::temp_dir().join(format!("pgpoll-nosock-{}", std::process::id()));
        let opts = Opts {
            host: Some(dir.to_string_lossy().into_owned()),
            user: Some("u".into()),
            ..Opts::default()
        };
        let err = Conn::connect_start(opts).unwrap_err();
        assert!(matches!(err, Error::Connect(ref m) if m.contains(".s.PGSQL.5432")), "{err}");
    }

    #[test]
    fn session_tracks_parameters() {
        let mut session = Session::new();
        session.set_parameter("client_encoding", "UTF8");
        session.set_parameter("client_encoding", "LATIN1");
        assert_eq!(session.parameter("client_encoding"), Some("LATIN1"));
        assert_eq!(session.params.len(), 1);
    }

    #[test]
    fn notice_processor_sees_rendered_text() {
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut session = Session::new();
        session.receiver = None;
        let sink = seen.clone();
        session.processor = Some(Box::new(move |text: &str| sink.lock().unwrap().push(text.to_string())));

        let notice = RawMessage {
            type_byte: msg_type::NOTICE_RESPONSE,
            payload: b"SNOTICE\0VNOTICE\0C00000\0Mtable \"t\" does not exist, skipping\0\0",
        };
        session.on_async(notice).unwrap();
        let status = RawMessage {
            type_byte: msg_type::PARAMETER_STATUS,
            payload: b"TimeZone\0UTC\0",
        };
        session.on_async(status).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], "NOTICE:  table \"t\" does not exist, skipping\n");
    }
}
