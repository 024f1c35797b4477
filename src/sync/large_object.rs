//! Large objects through the server's `lo_*` functions.
//!
//! Descriptors from [`Conn::lo_open`] live until the end of the current
//! transaction, so open, read, write and close inside one
//! [`Conn::transaction`].

use std::path::Path;

use crate::conn::Conn;
use crate::error::{Error, Result};
use crate::param::Param;
use crate::protocol::types::{FormatCode, Oid};
use crate::result::PgResult;

pub const INV_WRITE: i32 = 0x0002_0000;
pub const INV_READ: i32 = 0x0004_0000;

const INT4: Oid = 23;
const INT8: Oid = 20;
const OID: Oid = 26;
const BYTEA: Oid = 17;

/// Origin of [`Conn::lo_lseek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set = 0,
    Cur = 1,
    End = 2,
}

/// An open large-object descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LargeObjectFd(i32);

impl LargeObjectFd {
    pub fn raw(self) -> i32 {
        self.0
    }
}

fn int4(value: i32) -> Param {
    Param::text(value.to_string()).with_type(INT4)
}

fn int8(value: i64) -> Param {
    Param::text(value.to_string()).with_type(INT8)
}

fn oid(value: Oid) -> Param {
    Param::text(value.to_string()).with_type(OID)
}

fn bytea(data: &[u8]) -> Param {
    Param::binary(data.to_vec()).with_type(BYTEA)
}

/// First column of the first row, as text.
fn scalar<T: std::str::FromStr>(result: &PgResult, function: &str) -> Result<T> {
    let text = result
        .get_str(0, 0)?
        .ok_or_else(|| Error::Protocol(format!("{function} returned NULL")))?;
    text.parse()
        .map_err(|_| Error::Protocol(format!("{function} returned \"{text}\"")))
}

impl Conn {
    fn lo_call<T: std::str::FromStr>(&mut self, function: &str, sql: &str, params: &[Param]) -> Result<T> {
        let result = self.exec_params(sql, params, FormatCode::Text)?;
        scalar(&result, function)
    }

    /// Create an empty large object. `mode` is ignored by current servers.
    pub fn lo_creat(&mut self, mode: i32) -> Result<Oid> {
        self.lo_call("lo_creat", "SELECT pg_catalog.lo_creat($1)", &[int4(mode)])
    }

    /// Create an empty large object with a chosen oid (0 lets the server pick).
    pub fn lo_create(&mut self, id: Oid) -> Result<Oid> {
        self.lo_call("lo_create", "SELECT pg_catalog.lo_create($1)", &[oid(id)])
    }

    /// Store a client-side file as a new large object.
    pub fn lo_import(&mut self, path: impl AsRef<Path>) -> Result<Oid> {
        let data = std::fs::read(path)?;
        self.lo_call(
            "lo_from_bytea",
            "SELECT pg_catalog.lo_from_bytea(0, $1)",
            &[bytea(&data)],
        )
    }

    /// Write a large object's contents to a client-side file.
    pub fn lo_export(&mut self, id: Oid, path: impl AsRef<Path>) -> Result<()> {
        let result = self.exec_params("SELECT pg_catalog.lo_get($1)", &[oid(id)], FormatCode::Binary)?;
        let data = result
            .getvalue(0, 0)?
            .ok_or_else(|| Error::Protocol("lo_get returned NULL".into()))?;
        std::fs::write(path, data)?;
        Ok(())
    }

    pub fn lo_open(&mut self, id: Oid, mode: i32) -> Result<LargeObjectFd> {
        let fd = self.lo_call("lo_open", "SELECT pg_catalog.lo_open($1, $2)", &[oid(id), int4(mode)])?;
        Ok(LargeObjectFd(fd))
    }

    /// Returns the number of bytes written.
    pub fn lo_write(&mut self, fd: LargeObjectFd, data: &[u8]) -> Result<usize> {
        self.lo_call("lowrite", "SELECT pg_catalog.lowrite($1, $2)", &[int4(fd.0), bytea(data)])
    }

    /// Read up to `len` bytes from the current position.
    pub fn lo_read(&mut self, fd: LargeObjectFd, len: usize) -> Result<Vec<u8>> {
        let len = i32::try_from(len)
            .map_err(|_| Error::InvalidUsage(format!("read length {len} is too large")))?;
        let result = self.exec_params(
            "SELECT pg_catalog.loread($1, $2)",
            &[int4(fd.0), int4(len)],
            FormatCode::Binary,
        )?;
        Ok(result.getvalue(0, 0)?.map(<[u8]>::to_vec).unwrap_or_default())
    }

    /// Move the position; returns the new position.
    pub fn lo_lseek(&mut self, fd: LargeObjectFd, offset: i64, whence: Whence) -> Result<i64> {
        self.lo_call(
            "lo_lseek64",
            "SELECT pg_catalog.lo_lseek64($1, $2, $3)",
            &[int4(fd.0), int8(offset), int4(whence as i32)],
        )
    }

    pub fn lo_tell(&mut self, fd: LargeObjectFd) -> Result<i64> {
        self.lo_call("lo_tell64", "SELECT pg_catalog.lo_tell64($1)", &[int4(fd.0)])
    }

    pub fn lo_truncate(&mut self, fd: LargeObjectFd, len: i64) -> Result<()> {
        self.exec_params(
            "SELECT pg_catalog.lo_truncate64($1, $2)",
            &[int4(fd.0), int8(len)],
            FormatCode::Text,
        )?;
        Ok(())
    }

    pub fn lo_close(&mut self, fd: LargeObjectFd) -> Result<()> {
        self.exec_params("SELECT pg_catalog.lo_close($1)", &[int4(fd.0)], FormatCode::Text)?;
        Ok(())
    }

    pub fn lo_unlink(&mut self, id: Oid) -> Result<()> {
        self.exec_params("SELECT pg_catalog.lo_unlink($1)", &[oid(id)], FormatCode::Text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_flags_match_server_values() {
        assert_eq!(INV_WRITE, 131_072);
        assert_eq!(INV_READ, 262_144);
        assert_eq!(Whence::End as i32, 2);
    }

    #[test]
    fn integer_params_carry_types() {
        assert_eq!(int4(7).type_oid, INT4);
        assert_eq!(int8(-1).value.as_deref(), Some(&b"-1"[..]));
        assert_eq!(bytea(b"\x00").format, FormatCode::Binary);
    }
}
