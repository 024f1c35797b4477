//! Byte streams to the server and readiness waiting.
//!
//! Every stream a [`Conn`](crate::Conn) owns is switched to non-blocking mode.
//! The only place the crate waits is [`wait_ready`].

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::{Duration, Instant};

use polling::{Event, Events, Poller};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

/// A byte stream a connection can run over.
///
/// Implemented for TCP and Unix streams. Custom transports must report their
/// descriptor so readiness can be awaited on it.
pub trait Transport: Read + Write + AsFd + Send {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;
}

impl Transport for TcpStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        TcpStream::set_nonblocking(self, nonblocking)
    }
}

impl Transport for UnixStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        UnixStream::set_nonblocking(self, nonblocking)
    }
}

pub enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
    #[cfg(feature = "tls")]
    Tls(Box<native_tls::TlsStream<TcpStream>>),
    Other(Box<dyn Transport>),
}

impl Stream {
    pub fn tcp(stream: TcpStream) -> Self {
        Self::Tcp(stream)
    }

    pub fn unix(stream: UnixStream) -> Self {
        Self::Unix(stream)
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.set_nonblocking(nonblocking),
            Stream::Unix(s) => s.set_nonblocking(nonblocking),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.get_ref().set_nonblocking(nonblocking),
            Stream::Other(s) => s.set_nonblocking(nonblocking),
        }
    }

    pub fn is_tls(&self) -> bool {
        #[cfg(feature = "tls")]
        if let Stream::Tls(_) = self {
            return true;
        }
        false
    }

    /// Address a cancel request for this session should go to.
    pub(crate) fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            Stream::Tcp(s) => s.peer_addr().ok(),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.get_ref().peer_addr().ok(),
            Stream::Unix(_) | Stream::Other(_) => None,
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Unix(s) => s.read(buf),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.read(buf),
            Stream::Other(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            Stream::Unix(s) => s.write(buf),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.write(buf),
            Stream::Other(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            Stream::Unix(s) => s.flush(),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.flush(),
            Stream::Other(s) => s.flush(),
        }
    }
}

impl AsFd for Stream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Stream::Tcp(s) => s.as_fd(),
            Stream::Unix(s) => s.as_fd(),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.get_ref().as_fd(),
            Stream::Other(s) => s.as_fd(),
        }
    }
}

/// What to wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
    ReadWrite,
}

impl Interest {
    fn event(self) -> Event {
        const KEY: usize = 0;
        match self {
            Interest::Read => Event::readable(KEY),
            Interest::Write => Event::writable(KEY),
            Interest::ReadWrite => Event::all(KEY),
        }
    }
}

/// Wait until `fd` is ready for `interest`.
///
/// Returns `false` if `timeout` elapsed first. A zero timeout checks readiness
/// once without sleeping; `None` waits indefinitely. Hang-ups and socket errors
/// count as ready so the following read or write can observe them.
pub fn wait_ready(fd: BorrowedFd<'_>, interest: Interest, timeout: Option<Duration>) -> io::Result<bool> {
    let deadline = timeout.map(|t| Instant::now() + t);
    let poller = Poller::new()?;
    // SAFETY: `fd` stays borrowed for the whole call and is removed from the
    // poller before the borrow ends.
    unsafe { poller.add(fd.as_raw_fd(), interest.event())? };
    let ready = wait_events(&poller, deadline);
    let deleted = poller.delete(fd);
    let ready = ready?;
    deleted?;
    Ok(ready)
}

fn wait_events(poller: &Poller, deadline: Option<Instant>) -> io::Result<bool> {
    let mut events = Events::new();
    loop {
        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        events.clear();
        match poller.wait(&mut events, remaining) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
        if !events.is_empty() {
            return Ok(true);
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Ok(false);
        }
    }
}

/// Where a connection attempt goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Address {
    Tcp(SocketAddr),
    Unix(String),
}

impl Address {
    fn sock_addr(&self) -> io::Result<SockAddr> {
        match self {
            Address::Tcp(addr) => Ok(SockAddr::from(*addr)),
            Address::Unix(path) => SockAddr::unix(Path::new(path)),
        }
    }

    pub(crate) fn describe(&self) -> String {
        match self {
            Address::Tcp(addr) => format!("server at \"{}\", port {}", addr.ip(), addr.port()),
            Address::Unix(path) => format!("socket \"{path}\""),
        }
    }
}

/// A socket whose `connect()` may still be in flight.
pub(crate) struct PendingSocket {
    socket: Socket,
    target: Address,
}

fn connect_in_progress(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    ) || err.raw_os_error() == Some(libc::EINPROGRESS)
}

impl PendingSocket {
    /// Open a non-blocking socket and start connecting it.
    pub(crate) fn start(target: Address) -> io::Result<Self> {
        let socket = match &target {
            Address::Tcp(addr) => {
                Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?
            }
            Address::Unix(_) => Socket::new(Domain::UNIX, Type::STREAM, None)?,
        };
        socket.set_nonblocking(true)?;
        if let Address::Tcp(_) = target {
            socket.set_nodelay(true)?;
        }
        match socket.connect(&target.sock_addr()?) {
            Ok(()) => {}
            Err(err) if connect_in_progress(&err) => {}
            Err(err) => return Err(err),
        }
        Ok(Self { socket, target })
    }

    pub(crate) fn target(&self) -> &Address {
        &self.target
    }

    pub(crate) fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }

    /// `Ok(true)` once the connection is established.
    pub(crate) fn finished(&self) -> io::Result<bool> {
        if let Some(err) = self.socket.take_error()? {
            return Err(err);
        }
        match self.socket.peer_addr() {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub(crate) fn into_stream(self) -> Stream {
        match self.target {
            Address::Tcp(_) => Stream::Tcp(self.socket.into()),
            Address::Unix(_) => Stream::Unix(self.socket.into()),
        }
    }
}

#[cfg(feature = "tls")]
pub(crate) mod tls {
    use std::io;
    use std::net::TcpStream;
    use std::os::fd::BorrowedFd;
    use std::time::Duration;

    use native_tls::{HandshakeError, MidHandshakeTlsStream, TlsConnector};

    use super::{Interest, Stream, wait_ready};
    use crate::error::{Error, Result};
    use crate::opts::SslMode;

    pub(crate) enum Handshake {
        Done(Stream),
        Pending(MidHandshakeTlsStream<TcpStream>),
    }

    /// `require` encrypts without checking the certificate, `verify-ca`
    /// checks the chain only, `verify-full` checks chain and host name.
    pub(crate) fn connector(mode: SslMode) -> Result<TlsConnector> {
        let mut builder = TlsConnector::builder();
        match mode {
            SslMode::VerifyFull => {}
            SslMode::VerifyCa => {
                builder.danger_accept_invalid_hostnames(true);
            }
            SslMode::Disable | SslMode::Allow | SslMode::Prefer | SslMode::Require => {
                builder.danger_accept_invalid_certs(true);
                builder.danger_accept_invalid_hostnames(true);
            }
        }
        Ok(builder.build()?)
    }

    fn map(result: std::result::Result<native_tls::TlsStream<TcpStream>, HandshakeError<TcpStream>>) -> Result<Handshake> {
        match result {
            Ok(stream) => Ok(Handshake::Done(Stream::Tls(Box::new(stream)))),
            Err(HandshakeError::WouldBlock(mid)) => Ok(Handshake::Pending(mid)),
            Err(HandshakeError::Failure(err)) => Err(Error::Tls(err)),
        }
    }

    pub(crate) fn start(mode: SslMode, domain: &str, stream: TcpStream) -> Result<Handshake> {
        map(connector(mode)?.connect(domain, stream))
    }

    pub(crate) fn resume(mid: MidHandshakeTlsStream<TcpStream>) -> Result<Handshake> {
        map(mid.handshake())
    }

    /// What a stalled handshake waits for: a socket that cannot take more
    /// output held it up writing, otherwise it is waiting for the peer.
    pub(crate) fn stalled_on(fd: BorrowedFd<'_>) -> io::Result<Interest> {
        Ok(if wait_ready(fd, Interest::Write, Some(Duration::ZERO))? {
            Interest::Read
        } else {
            Interest::Write
        })
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_ready_times_out_without_data() {
        let (a, _b) = UnixStream::pair().unwrap();
        let ready = wait_ready(a.as_fd(), Interest::Read, Some(Duration::from_millis(20))).unwrap();
        assert!(!ready);
    }

    #[test]
    fn wait_ready_sees_pending_data() {
        let (a, mut b) = UnixStream::pair().unwrap();
        b.write_all(b"x").unwrap();
        assert!(wait_ready(a.as_fd(), Interest::Read, Some(Duration::ZERO)).unwrap());
    }

    #[test]
    fn fresh_socket_is_writable() {
        let (a, _b) = UnixStream::pair().unwrap();
        assert!(wait_ready(a.as_fd(), Interest::Write, None).unwrap());
    }

    #[test]
    fn hang_up_counts_as_readable() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(b);
        assert!(wait_ready(a.as_fd(), Interest::Read, Some(Duration::from_secs(1))).unwrap());
    }

    #[test]
    fn unix_connect_completes() {
        let dir = std::env::temp_dir().join(format!("pgpoll-transport-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("sock");
        let _ = std::fs::remove_file(&path);
        let listener = std::os::unix::net::UnixListener::bind(&path).unwrap();

        let pending = PendingSocket::start(Address::Unix(path.to_string_lossy().into_owned())).unwrap();
        let (_server, _) = listener.accept().unwrap();
        assert!(wait_ready(pending.as_fd(), Interest::Write, Some(Duration::from_secs(1))).unwrap());
        assert!(pending.finished().unwrap());
        let stream = pending.into_stream();
        assert!(matches!(stream, Stream::Unix(_)));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn refused_unix_connect_fails() {
        let path = std::env::temp_dir().join(format!("pgpoll-missing-{}", std::process::id()));
        let _ = std::fs::remove_file(&path);
        assert!(PendingSocket::start(Address::Unix(path.to_string_lossy().into_owned())).is_err());
    }
}
