//! Row and command-completion messages.

use std::mem::size_of;

use zerocopy::byteorder::big_endian::{I16 as I16BE, I32 as I32BE, U16 as U16BE, U32 as U32BE};
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::error::{Error, Result};
use crate::protocol::codec::Reader;
use crate::protocol::types::{FormatCode, Oid};

/// Fixed 18-byte part of a column descriptor.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
struct FieldTail {
    table_oid: U32BE,
    column_id: I16BE,
    type_oid: U32BE,
    type_size: I16BE,
    type_modifier: I32BE,
    format: U16BE,
}

/// One column of a RowDescription.
#[derive(Debug, Clone, Copy)]
pub struct FieldDescription<'a> {
    pub name: &'a str,
    pub table_oid: Oid,
    pub column_id: i16,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: FormatCode,
}

/// Column layout of the rows that follow.
#[derive(Debug)]
pub struct RowDescription<'a> {
    pub fields: Vec<FieldDescription<'a>>,
}

impl<'a> RowDescription<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let count = r.u16()? as usize;
        let mut fields = Vec::with_capacity(count);
        for _ in 0..count {
            let name = r.cstr()?;
            let tail = FieldTail::read_from_bytes(r.take(size_of::<FieldTail>())?)?;
            fields.push(FieldDescription {
                name,
                table_oid: tail.table_oid.get(),
                column_id: tail.column_id.get(),
                type_oid: tail.type_oid.get(),
                type_size: tail.type_size.get(),
                type_modifier: tail.type_modifier.get(),
                format: FormatCode::from_u16(tail.format.get()),
            });
        }
        Ok(Self { fields })
    }
}

/// One row of values; `None` is SQL NULL.
#[derive(Debug, Clone, Copy)]
pub struct DataRow<'a> {
    count: u16,
    body: &'a [u8],
}

impl<'a> DataRow<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let count = r.u16()?;
        Ok(Self {
            count,
            body: r.rest(),
        })
    }

    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Visit every value in column order.
    pub fn for_each_value(&self, mut f: impl FnMut(Option<&'a [u8]>)) -> Result<()> {
        let mut r = Reader::new(self.body);
        for _ in 0..self.count {
            let len = r.i32()?;
            if len < 0 {
                f(None);
            } else {
                f(Some(r.take(len as usize)?));
            }
        }
        if !r.is_empty() {
            return Err(Error::Protocol("DataRow has trailing bytes".into()));
        }
        Ok(())
    }
}

/// Successful end of one statement.
#[derive(Debug, Clone, Copy)]
pub struct CommandComplete<'a> {
    /// e.g. `SELECT 5`, `INSERT 0 1`
    pub tag: &'a str,
}

impl<'a> CommandComplete<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        Ok(Self {
            tag: Reader::new(payload).cstr()?,
        })
    }
}
