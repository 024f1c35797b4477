//! A non-blocking PostgreSQL client.
//!
//! # Features
//!
//! - **Poll-driven connections**: `connect_start`/`connect_poll` and
//!   `send_*`/`consume_input`/`get_result` never block, so a [`Conn`] fits
//!   any event loop
//! - **Sans-I/O state machines**: startup, authentication and the command
//!   pipeline only see framed messages and an output buffer
//! - **Blocking and tokio adapters**: `Conn::exec` and friends wait with
//!   `poll(2)`; [`tokio::AsyncConn`] waits on the reactor
//! - **Protocol coverage**: simple and extended query, COPY in both
//!   directions, notifications, cancellation, large objects
//!
//! # Example
//!
//! ```no_run
//! use pgpoll::{Conn, PollStatus};
//!
//! fn main() -> pgpoll::Result<()> {
//!     let mut conn = Conn::connect_start("postgres://postgres@localhost/app")?;
//!     loop {
//!         match conn.connect_poll() {
//!             PollStatus::Ready => break,
//!             PollStatus::Failed => return Err(pgpoll::Error::Connect(conn.error_message().into())),
//!             // Wait for the socket with your event loop here.
//!             PollStatus::NeedRead | PollStatus::NeedWrite => {}
//!         }
//!     }
//!
//!     conn.send_query("SELECT 1; SELECT 2")?;
//!     while let Some(result) = conn.get_result()? {
//!         println!("{:?}", result.get_str(0, 0)?);
//!     }
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod conn;
pub mod error;
pub mod escape;
pub mod notify;
pub mod opts;
pub mod param;
pub mod protocol;
pub mod result;
pub mod state;
pub mod sync;
pub mod transport;

#[cfg(feature = "tokio")]
pub mod tokio;

pub use cancel::CancelToken;
pub use conn::{Conn, ConnStatus, CopyData, TransactionStatus};
pub use error::{CommandError, Error, ErrorFields, Result, Verbosity};
pub use notify::{AsyncMessageHandler, LoggingReceiver, Notice, NoticeProcessor, NoticeReceiver, Notification};
pub use opts::{ConnOption, Opts, SslMode, conndefaults};
pub use param::Param;
pub use protocol::frontend::encrypt_password;
pub use protocol::types::{FormatCode, INVALID_OID, Oid};
pub use result::{Column, PgResult, ResultStatus, Row, Rows};
pub use state::{AsyncMessage, PollStatus};
pub use transport::{Stream, Transport};
