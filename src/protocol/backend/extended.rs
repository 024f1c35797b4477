//! Extended-query backend messages with a payload.
//!
//! ParseComplete, BindComplete, CloseComplete, NoData and PortalSuspended
//! carry nothing and are matched on their type byte alone.

use crate::error::Result;
use crate::protocol::codec::Reader;
use crate::protocol::types::Oid;

/// Parameter types of a prepared statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterDescription {
    pub oids: Vec<Oid>,
}

impl ParameterDescription {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let count = r.u16()? as usize;
        let oids = (0..count).map(|_| r.u32()).collect::<Result<Vec<_>>>()?;
        Ok(Self { oids })
    }
}
