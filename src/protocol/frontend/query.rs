//! Simple and extended query messages.

use crate::param::Param;
use crate::protocol::codec::MessageBuilder;
use crate::protocol::types::FormatCode;

/// What a Describe or Close refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Statement,
    Portal,
}

impl Target {
    fn code(self) -> u8 {
        match self {
            Target::Statement => b'S',
            Target::Portal => b'P',
        }
    }
}

/// Simple query; may hold several `;`-separated statements.
pub fn write_query(buf: &mut Vec<u8>, sql: &str) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::QUERY);
    msg.cstr(sql);
    msg.finish();
}

/// Parse `sql` into statement `name` (`""` is the unnamed statement).
///
/// A zero OID leaves the parameter type to the server.
pub fn write_parse(buf: &mut Vec<u8>, name: &str, sql: &str, param_types: &[u32]) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::PARSE);
    msg.cstr(name).cstr(sql).i16(param_types.len() as i16);
    for &oid in param_types {
        msg.u32(oid);
    }
    msg.finish();
}

/// Bind `params` to `statement`, producing `portal`.
///
/// All result columns are requested in `result_format`.
pub fn write_bind(
    buf: &mut Vec<u8>,
    portal: &str,
    statement: &str,
    params: &[Param],
    result_format: FormatCode,
) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::BIND);
    msg.cstr(portal).cstr(statement);

    msg.i16(params.len() as i16);
    for param in params {
        msg.i16(param.format.code());
    }

    msg.i16(params.len() as i16);
    for param in params {
        match &param.value {
            None => {
                msg.i32(-1);
            }
            Some(value) => {
                msg.i32(value.len() as i32).bytes(value);
            }
        }
    }

    msg.i16(1).i16(result_format.code());
    msg.finish();
}

/// Run `portal`; `max_rows == 0` means no limit.
pub fn write_execute(buf: &mut Vec<u8>, portal: &str, max_rows: u32) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::EXECUTE);
    msg.cstr(portal).u32(max_rows);
    msg.finish();
}

pub fn write_describe(buf: &mut Vec<u8>, target: Target, name: &str) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::DESCRIBE);
    msg.u8(target.code()).cstr(name);
    msg.finish();
}

/// End of an extended-query cycle; the server answers with ReadyForQuery.
pub fn write_sync(buf: &mut Vec<u8>) {
    MessageBuilder::new(buf, super::msg_type::SYNC).finish();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_layout() {
        let mut buf = Vec::new();
        write_query(&mut buf, "SELECT 1");
        assert_eq!(buf[0], b'Q');
        assert_eq!(&buf[1..5], &13u32.to_be_bytes());
        assert_eq!(&buf[5..], b"SELECT 1\0");
    }

    #[test]
    fn parse_carries_param_types() {
        let mut buf = Vec::new();
        write_parse(&mut buf, "s1", "SELECT $1", &[23]);
        assert_eq!(buf[0], b'P');
        assert_eq!(&buf[5..], b"s1\0SELECT $1\0\0\x01\0\0\0\x17");
    }

    #[test]
    fn bind_encodes_null_as_minus_one() {
        let mut buf = Vec::new();
        let params = [Param::text("5"), Param::null()];
        write_bind(&mut buf, "", "", &params, FormatCode::Binary);
        let body = &buf[5..];
        let expected: &[u8] = &[
            0, 0, // portal, statement
            0, 2, 0, 0, 0, 0, // formats
            0, 2, 0, 0, 0, 1, b'5', 0xff, 0xff, 0xff, 0xff, // values
            0, 1, 0, 1, // result format
        ];
        assert_eq!(body, expected);
    }

    #[test]
    fn describe_portal() {
        let mut buf = Vec::new();
        write_describe(&mut buf, Target::Portal, "");
        assert_eq!(buf, [b'D', 0, 0, 0, 6, b'P', 0]);
    }

    #[test]
    fn sync_is_empty() {
        let mut buf = Vec::new();
        write_sync(&mut buf);
        assert_eq!(buf, [b'S', 0, 0, 0, 4]);
    }
}
