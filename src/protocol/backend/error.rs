//! ErrorResponse / NoticeResponse field parsing.

use crate::error::{ErrorFields, Result};
use crate::protocol::codec::Reader;

/// Error field type codes.
pub mod field_type {
    pub const SEVERITY: u8 = b'S';
    pub const SEVERITY_NON_LOCALIZED: u8 = b'V';
    pub const CODE: u8 = b'C';
    pub const MESSAGE: u8 = b'M';
    pub const DETAIL: u8 = b'D';
    pub const HINT: u8 = b'H';
    pub const POSITION: u8 = b'P';
    pub const INTERNAL_POSITION: u8 = b'p';
    pub const INTERNAL_QUERY: u8 = b'q';
    pub const WHERE: u8 = b'W';
    pub const SCHEMA: u8 = b's';
    pub const TABLE: u8 = b't';
    pub const COLUMN: u8 = b'c';
    pub const DATA_TYPE: u8 = b'd';
    pub const CONSTRAINT: u8 = b'n';
    pub const FILE: u8 = b'F';
    pub const LINE: u8 = b'L';
    pub const ROUTINE: u8 = b'R';
}

/// Parse the field list shared by ErrorResponse and NoticeResponse.
pub fn parse_fields(payload: &[u8]) -> Result<ErrorFields> {
    use field_type as ft;

    let mut fields = ErrorFields::default();
    let mut r = Reader::new(payload);
    loop {
        let code = r.u8()?;
        if code == 0 {
            break;
        }
        // Servers may send text in a non-UTF-8 client encoding.
        let value = String::from_utf8_lossy(r.cbytes()?).into_owned();
        let slot = match code {
            ft::SEVERITY => &mut fields.severity,
            ft::SEVERITY_NON_LOCALIZED => &mut fields.severity_non_localized,
            ft::CODE => &mut fields.code,
            ft::MESSAGE => &mut fields.message,
            ft::DETAIL => &mut fields.detail,
            ft::HINT => &mut fields.hint,
            ft::INTERNAL_QUERY => &mut fields.internal_query,
            ft::WHERE => &mut fields.where_,
            ft::SCHEMA => &mut fields.schema,
            ft::TABLE => &mut fields.table,
            ft::COLUMN => &mut fields.column,
            ft::DATA_TYPE => &mut fields.data_type,
            ft::CONSTRAINT => &mut fields.constraint,
            ft::FILE => &mut fields.file,
            ft::ROUTINE => &mut fields.routine,
            ft::POSITION => {
                fields.position = value.parse().ok();
                continue;
            }
            ft::INTERNAL_POSITION => {
                fields.internal_position = value.parse().ok();
                continue;
            }
            ft::LINE => {
                fields.line = value.parse().ok();
                continue;
            }
            other => {
                tracing::debug!("Unknown error field type: {}", other as char);
                continue;
            }
        };
        *slot = Some(value);
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_fields() {
        let payload = b"SERROR\0VERROR\0C22012\0Mdivision by zero\0P8\0Fint.c\0L841\0Rint4div\0\0";
        let fields = parse_fields(payload).unwrap();
        assert_eq!(fields.severity.as_deref(), Some("ERROR"));
        assert_eq!(fields.code.as_deref(), Some("22012"));
        assert_eq!(fields.message.as_deref(), Some("division by zero"));
        assert_eq!(fields.position, Some(8));
        assert_eq!(fields.line, Some(841));
        assert_eq!(fields.routine.as_deref(), Some("int4div"));
    }

    #[test]
    fn unknown_codes_are_skipped() {
        let payload = b"Xwhatever\0Mok\0\0";
        let fields = parse_fields(payload).unwrap();
        assert_eq!(fields.message.as_deref(), Some("ok"));
    }

    #[test]
    fn missing_terminator_fails() {
        assert!(parse_fields(b"Mno end").is_err());
    }
}
