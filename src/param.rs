//! Positional query parameters.

use crate::protocol::types::{FormatCode, INVALID_OID, Oid};

/// One `$n` parameter value.
///
/// `value: None` is SQL NULL whatever the declared type. A zero `type_oid`
/// leaves type inference to the server.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Param {
    pub type_oid: Oid,
    pub value: Option<Vec<u8>>,
    pub format: FormatCode,
}

impl Param {
    /// Text-format value with an inferred type.
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            type_oid: INVALID_OID,
            value: Some(value.into().into_bytes()),
            format: FormatCode::Text,
        }
    }

    /// Binary-format value. The server needs the type to decode it, so pass
    /// one with [`Param::with_type`] unless the context fixes it.
    pub fn binary(value: impl Into<Vec<u8>>) -> Self {
        Self {
            type_oid: INVALID_OID,
            value: Some(value.into()),
            format: FormatCode::Binary,
        }
    }

    pub fn null() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, type_oid: Oid) -> Self {
        self.type_oid = type_oid;
        self
    }

    pub fn is_null(&self) -> bool {
        self.value.is_none()
    }
}

impl From<&str> for Param {
    fn from(value: &str) -> Self {
        Param::text(value)
    }
}

impl From<String> for Param {
    fn from(value: String) -> Self {
        Param::text(value)
    }
}

impl<T: Into<Param>> From<Option<T>> for Param {
    fn from(value: Option<T>) -> Self {
        value.map_or_else(Param::null, Into::into)
    }
}

impl From<&[u8]> for Param {
    fn from(value: &[u8]) -> Self {
        Param::binary(value.to_vec())
    }
}

/// Parameter type OIDs, in order, for a Parse message.
pub(crate) fn type_oids(params: &[Param]) -> Vec<Oid> {
    params.iter().map(|p| p.type_oid).collect()
}
