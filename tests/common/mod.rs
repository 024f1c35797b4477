//! A scripted PostgreSQL backend on the far end of a socket pair.
#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use pgpoll::{Conn, ConnStatus, Opts, PollStatus, Stream};

pub const BACKEND_PID: u32 = 4242;
pub const BACKEND_SECRET: u32 = 99;

/// A socket the scripted backend can talk over.
pub trait Wire: Read + Write + Send {
    fn shutdown_both(&self);
}

impl Wire for UnixStream {
    fn shutdown_both(&self) {
        let _ = self.shutdown(Shutdown::Both);
    }
}

impl Wire for TcpStream {
    fn shutdown_both(&self) {
        let _ = self.shutdown(Shutdown::Both);
    }
}

pub struct Backend {
    stream: Box<dyn Wire>,
}

impl Backend {
    pub fn new(stream: impl Wire + 'static) -> Self {
        Self {
            stream: Box::new(stream),
        }
    }

    /// The StartupMessage body after its length word.
    pub fn read_startup(&mut self) -> Vec<u8> {
        let mut len = [0u8; 4];
        self.stream.read_exact(&mut len).unwrap();
        let mut body = vec![0u8; i32::from_be_bytes(len) as usize - 4];
        self.stream.read_exact(&mut body).unwrap();
        body
    }

    pub fn read_message(&mut self) -> (u8, Vec<u8>) {
        let mut header = [0u8; 5];
        self.stream.read_exact(&mut header).unwrap();
        let len = i32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
        let mut payload = vec![0u8; len - 4];
        self.stream.read_exact(&mut payload).unwrap();
        (header[0], payload)
    }

    /// Read one message and check its type.
    pub fn expect(&mut self, type_byte: u8) -> Vec<u8> {
        let (actual, payload) = self.read_message();
        assert_eq!(actual as char, type_byte as char, "unexpected frontend message");
        payload
    }

    /// Read the text of a simple Query.
    pub fn expect_query(&mut self) -> String {
        let payload = self.expect(b'Q');
        String::from_utf8(payload[..payload.len() - 1].to_vec()).unwrap()
    }

    /// Skip Parse/Bind/Describe/Execute up to and including Sync.
    pub fn expect_extended(&mut self) -> Vec<u8> {
        let mut types = Vec::new();
        loop {
            let (ty, _) = self.read_message();
            types.push(ty);
            if ty == b'S' {
                return types;
            }
        }
    }

    pub fn send(&mut self, type_byte: u8, payload: &[u8]) {
        let mut msg = vec![type_byte];
        msg.extend_from_slice(&(payload.len() as i32 + 4).to_be_bytes());
        msg.extend_from_slice(payload);
        self.stream.write_all(&msg).unwrap();
    }

    pub fn handshake_ok(&mut self) {
        let startup = self.read_startup();
        assert_eq!(&startup[..4], &196_608i32.to_be_bytes());
        self.send(b'R', &0i32.to_be_bytes());
        self.parameter_status("server_version", "16.2");
        self.parameter_status("standard_conforming_strings", "on");
        self.parameter_status("client_encoding", "UTF8");
        let mut key = BACKEND_PID.to_be_bytes().to_vec();
        key.extend_from_slice(&BACKEND_SECRET.to_be_bytes());
        self.send(b'K', &key);
        self.ready(b'I');
    }

    pub fn parameter_status(&mut self, name: &str, value: &str) {
        self.send(b'S', &cstrings(&[name, value]));
    }

    pub fn ready(&mut self, status: u8) {
        self.send(b'Z', &[status]);
    }

    pub fn row_description(&mut self, names: &[&str]) {
        let mut out = (names.len() as i16).to_be_bytes().to_vec();
        for name in names {
            out.extend_from_slice(name.as_bytes());
            out.push(0);
            out.extend_from_slice(&0u32.to_be_bytes()); // table oid
            out.extend_from_slice(&0i16.to_be_bytes()); // column
            out.extend_from_slice(&25u32.to_be_bytes()); // text
            out.extend_from_slice(&(-1i16).to_be_bytes());
            out.extend_from_slice(&(-1i32).to_be_bytes());
            out.extend_from_slice(&0i16.to_be_bytes());
        }
        self.send(b'T', &out);
    }

    pub fn data_row(&mut self, values: &[Option<&str>]) {
        let mut out = (values.len() as i16).to_be_bytes().to_vec();
        for value in values {
            match value {
                None => out.extend_from_slice(&(-1i32).to_be_bytes()),
                Some(v) => {
                    out.extend_from_slice(&(v.len() as i32).to_be_bytes());
                    out.extend_from_slice(v.as_bytes());
                }
            }
        }
        self.send(b'D', &out);
    }

    pub fn command_complete(&mut self, tag: &str) {
        self.send(b'C', &cstrings(&[tag]));
    }

    pub fn error(&mut self, code: &str, message: &str) {
        self.send(b'E', &fields("ERROR", code, message));
    }

    pub fn notice(&mut self, message: &str) {
        self.send(b'N', &fields("NOTICE", "00000", message));
    }

    pub fn notification(&mut self, pid: u32, channel: &str, payload: &str) {
        let mut out = pid.to_be_bytes().to_vec();
        out.extend_from_slice(&cstrings(&[channel, payload]));
        self.send(b'A', &out);
    }

    pub fn copy_in_response(&mut self, columns: i16) {
        self.send(b'G', &copy_response(columns));
    }

    pub fn copy_out_response(&mut self, columns: i16) {
        self.send(b'H', &copy_response(columns));
    }

    /// Answer a one-row, one-column SELECT.
    pub fn single_value(&mut self, column: &str, value: &str) {
        self.row_description(&[column]);
        self.data_row(&[Some(value)]);
        self.command_complete("SELECT 1");
        self.ready(b'I');
    }

    /// Close the server side as if the backend died.
    pub fn hang_up(&mut self) {
        self.stream.shutdown_both();
    }

    /// Consume whatever the client still sends until it disconnects.
    pub fn drain_until_closed(&mut self) {
        let mut buf = [0u8; 1024];
        while matches!(self.stream.read(&mut buf), Ok(n) if n > 0) {}
    }
}

fn cstrings(parts: &[&str]) -> Vec<u8> {
    let mut out = Vec::new();
    for part in parts {
        out.extend_from_slice(part.as_bytes());
        out.push(0);
    }
    out
}

fn fields(severity: &str, code: &str, message: &str) -> Vec<u8> {
    let mut out = Vec::new();
    for (tag, value) in [(b'S', severity), (b'V', severity), (b'C', code), (b'M', message)] {
        out.push(tag);
        out.extend_from_slice(value.as_bytes());
        out.push(0);
    }
    out.push(0);
    out
}

fn copy_response(columns: i16) -> Vec<u8> {
    let mut out = vec![0u8];
    out.extend_from_slice(&columns.to_be_bytes());
    for _ in 0..columns {
        out.extend_from_slice(&0i16.to_be_bytes());
    }
    out
}

pub fn opts() -> Opts {
    Opts {
        user: Some("alice".into()),
        dbname: Some("app".into()),
        ..Opts::default()
    }
}

/// A fresh directory to put a listening socket in.
pub fn socket_dir() -> PathBuf {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    let dir = std::env::temp_dir().join(format!(
        "pgpoll-{}-{}",
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    ));
    std::fs::create_dir_all(&dir).unwrap();
    let _ = std::fs::remove_file(dir.join(".s.PGSQL.5432"));
    dir
}

/// A connection in the middle of its handshake, plus the server end.
pub fn start() -> (Conn, Backend) {
    let (client, server) = UnixStream::pair().unwrap();
    let conn = Conn::connect_start_with_stream(Stream::unix(client), opts()).unwrap();
    (conn, Backend::new(server))
}

/// Drive `connect_poll` until the handshake settles.
pub fn poll_until_settled(conn: &mut Conn) -> PollStatus {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match conn.connect_poll() {
            status @ (PollStatus::Ready | PollStatus::Failed) => return status,
            PollStatus::NeedRead | PollStatus::NeedWrite => {
                assert!(Instant::now() < deadline, "handshake did not finish");
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }
}

/// A ready connection whose server runs `script` after the handshake.
///
/// The server thread finishes once the connection is dropped or closed.
pub fn connected<F>(script: F) -> (Conn, JoinHandle<()>)
where
    F: FnOnce(&mut Backend) + Send + 'static,
{
    let (mut conn, mut backend) = start();
    let server = std::thread::spawn(move || {
        backend.handshake_ok();
        script(&mut backend);
        backend.drain_until_closed();
    });
    assert_eq!(poll_until_settled(&mut conn), PollStatus::Ready);
    assert_eq!(conn.status(), ConnStatus::Ok);
    (conn, server)
}
