//! PostgreSQL wire protocol (version 3.0).
//!
//! Only this module knows about message framing. Everything above it works
//! with parsed messages and encoded byte buffers.
//!
//! - `backend`: server → client messages (parsing)
//! - `frontend`: client → server messages (encoding)
//! - `codec`: byte cursor, message builder and frame splitting
//! - `types`: OIDs and format codes

pub mod backend;
pub mod codec;
pub mod frontend;
pub mod types;

pub use backend::RawMessage;
pub use types::{FormatCode, Oid};
