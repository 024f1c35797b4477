//! Blocking adapter.
//!
//! Everything here is composition over the non-blocking [`Conn`] API: send,
//! wait for the socket, consume input, repeat. No state lives here beyond a
//! single call.
//!
//! ```no_run
//! use pgpoll::{Conn, Param};
//!
//! fn main() -> pgpoll::Result<()> {
//!     let mut conn = Conn::connect("host=localhost user=postgres dbname=app")?;
//!     let res = conn.exec_params(
//!         "SELECT $1::int AS a, $2::text AS b",
//!         &[Param::text("5"), Param::null()],
//!         pgpoll::FormatCode::Text,
//!     )?;
//!     assert_eq!(res.get_str(0, 0)?, Some("5"));
//!     assert!(res.getisnull(0, 1)?);
//!     Ok(())
//! }
//! ```
//!
//! [`Conn`]: crate::Conn

mod block;
mod exec;
mod large_object;
mod transaction;

pub use large_object::{INV_READ, INV_WRITE, LargeObjectFd, Whence};
