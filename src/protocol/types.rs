//! Common protocol types.

/// PostgreSQL object identifier.
pub type Oid = u32;

/// Invalid / unspecified OID. As a parameter type it asks the server to infer.
pub const INVALID_OID: Oid = 0;

/// Wire format of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u16)]
pub enum FormatCode {
    /// Text format
    #[default]
    Text = 0,
    /// Binary format
    Binary = 1,
}

impl FormatCode {
    /// Any non-zero code is binary.
    pub fn from_u16(value: u16) -> Self {
        if value == 0 {
            FormatCode::Text
        } else {
            FormatCode::Binary
        }
    }

    /// The code as sent on the wire.
    pub fn code(self) -> i16 {
        self as i16
    }
}

impl From<u16> for FormatCode {
    fn from(value: u16) -> Self {
        Self::from_u16(value)
    }
}

/// Transaction status byte carried by ReadyForQuery.
pub mod tx_status {
    /// Not in a transaction block
    pub const IDLE: u8 = b'I';
    /// In a transaction block
    pub const IN_TRANSACTION: u8 = b'T';
    /// In a failed transaction block
    pub const FAILED: u8 = b'E';
}
