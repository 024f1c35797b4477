//! Frontend (client → server) message encoders.
//!
//! Every encoder appends one complete message to the caller's output buffer.

pub mod auth;
pub mod copy;
pub mod query;
pub mod startup;

pub use auth::{ScramClient, encrypt_password, md5_password, write_password, write_sasl_initial_response, write_sasl_response};
pub use copy::{write_copy_data, write_copy_done, write_copy_fail};
pub use query::{Target, write_bind, write_describe, write_execute, write_parse, write_query, write_sync};
pub use startup::{write_cancel_request, write_ssl_request, write_startup, write_terminate};

/// Frontend message type bytes.
pub mod msg_type {
    /// Password and every SASL response
    pub const PASSWORD: u8 = b'p';
    pub const QUERY: u8 = b'Q';
    pub const PARSE: u8 = b'P';
    pub const BIND: u8 = b'B';
    pub const EXECUTE: u8 = b'E';
    pub const DESCRIBE: u8 = b'D';
    pub const SYNC: u8 = b'S';
    pub const COPY_DATA: u8 = b'd';
    pub const COPY_DONE: u8 = b'c';
    pub const COPY_FAIL: u8 = b'f';
    pub const TERMINATE: u8 = b'X';
}
