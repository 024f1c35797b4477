//! Messages sent before or outside a session.

use crate::protocol::codec::MessageBuilder;

/// Protocol 3.0
pub const PROTOCOL_VERSION: i32 = 3 << 16;

/// Magic protocol number of SSLRequest.
pub const SSL_REQUEST_CODE: i32 = 80877103;

/// Magic protocol number of CancelRequest.
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

pub fn write_ssl_request(buf: &mut Vec<u8>) {
    let mut msg = MessageBuilder::untyped(buf);
    msg.i32(SSL_REQUEST_CODE);
    msg.finish();
}

/// StartupMessage with `(name, value)` session parameters.
pub fn write_startup(buf: &mut Vec<u8>, params: &[(&str, &str)]) {
    let mut msg = MessageBuilder::untyped(buf);
    msg.i32(PROTOCOL_VERSION);
    for (name, value) in params {
        msg.cstr(name).cstr(value);
    }
    msg.u8(0);
    msg.finish();
}

/// CancelRequest, sent on its own connection.
pub fn write_cancel_request(buf: &mut Vec<u8>, pid: u32, secret_key: u32) {
    let mut msg = MessageBuilder::untyped(buf);
    msg.i32(CANCEL_REQUEST_CODE).u32(pid).u32(secret_key);
    msg.finish();
}

pub fn write_terminate(buf: &mut Vec<u8>) {
    MessageBuilder::new(buf, super::msg_type::TERMINATE).finish();
}
