//! COPY-in messages.

use crate::protocol::codec::MessageBuilder;

pub fn write_copy_data(buf: &mut Vec<u8>, data: &[u8]) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::COPY_DATA);
    msg.bytes(data);
    msg.finish();
}

pub fn write_copy_done(buf: &mut Vec<u8>) {
    MessageBuilder::new(buf, super::msg_type::COPY_DONE).finish();
}

/// Abort COPY-in with an error message the server reports back.
pub fn write_copy_fail(buf: &mut Vec<u8>, message: &str) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::COPY_FAIL);
    msg.cstr(message);
    msg.finish();
}
