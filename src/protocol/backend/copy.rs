//! COPY sub-protocol responses.

use crate::error::Result;
use crate::protocol::codec::Reader;
use crate::protocol::types::FormatCode;

/// CopyInResponse, CopyOutResponse and CopyBothResponse share one layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyResponse {
    /// Overall format
    pub format: FormatCode,
    /// Per-column formats
    pub column_formats: Vec<FormatCode>,
}

impl CopyResponse {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let format = FormatCode::from_u16(r.u8()? as u16);
        let count = r.u16()? as usize;
        let column_formats = (0..count)
            .map(|_| r.u16().map(FormatCode::from_u16))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            format,
            column_formats,
        })
    }
}
