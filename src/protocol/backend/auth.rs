//! Startup-phase and session-level backend messages.

use zerocopy::byteorder::big_endian::U32 as U32BE;
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::error::{Error, Result};
use crate::protocol::codec::Reader;

/// Authentication request codes.
pub mod auth_type {
    pub const OK: i32 = 0;
    pub const KERBEROS_V5: i32 = 2;
    pub const CLEARTEXT_PASSWORD: i32 = 3;
    pub const MD5_PASSWORD: i32 = 5;
    pub const GSS: i32 = 7;
    pub const GSS_CONTINUE: i32 = 8;
    pub const SSPI: i32 = 9;
    pub const SASL: i32 = 10;
    pub const SASL_CONTINUE: i32 = 11;
    pub const SASL_FINAL: i32 = 12;
}

/// Authentication request from the server.
#[derive(Debug)]
pub enum Authentication<'a> {
    Ok,
    CleartextPassword,
    Md5Password { salt: [u8; 4] },
    Sasl { mechanisms: Vec<&'a str> },
    SaslContinue { data: &'a [u8] },
    SaslFinal { data: &'a [u8] },
    /// Kerberos, GSSAPI or SSPI; carries the request code
    Unsupported(i32),
}

impl<'a> Authentication<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let code = r.i32()?;
        Ok(match code {
            auth_type::OK => Authentication::Ok,
            auth_type::CLEARTEXT_PASSWORD => Authentication::CleartextPassword,
            auth_type::MD5_PASSWORD => {
                let mut salt = [0u8; 4];
                salt.copy_from_slice(r.take(4)?);
                Authentication::Md5Password { salt }
            }
            auth_type::SASL => {
                let mut mechanisms = Vec::new();
                while !r.is_empty() && r.rest()[0] != 0 {
                    mechanisms.push(r.cstr()?);
                }
                Authentication::Sasl { mechanisms }
            }
            auth_type::SASL_CONTINUE => Authentication::SaslContinue { data: r.rest() },
            auth_type::SASL_FINAL => Authentication::SaslFinal { data: r.rest() },
            auth_type::KERBEROS_V5 | auth_type::GSS | auth_type::GSS_CONTINUE | auth_type::SSPI => {
                Authentication::Unsupported(code)
            }
            other => {
                return Err(Error::Protocol(format!(
                    "unknown authentication request {other}"
                )));
            }
        })
    }
}

/// Process id and secret key identifying the session for cancellation.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
pub struct BackendKeyData {
    pid: U32BE,
    secret_key: U32BE,
}

impl BackendKeyData {
    pub fn parse(payload: &[u8]) -> Result<&Self> {
        // Protocol 3.2 allows longer keys; only the 4-byte form is understood.
        Ok(Self::ref_from_bytes(payload)?)
    }

    pub fn process_id(&self) -> u32 {
        self.pid.get()
    }

    pub fn secret_key(&self) -> u32 {
        self.secret_key.get()
    }
}

/// Run-time parameter reported by the server.
#[derive(Debug, Clone, Copy)]
pub struct ParameterStatus<'a> {
    pub name: &'a str,
    pub value: &'a str,
}

impl<'a> ParameterStatus<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let name = r.cstr()?;
        let value = r.cstr()?;
        Ok(Self { name, value })
    }
}

/// End of a command cycle.
#[derive(Debug, Clone, Copy)]
pub struct ReadyForQuery {
    /// `'I'`, `'T'` or `'E'`
    pub status: u8,
}

impl ReadyForQuery {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let status = Reader::new(payload).u8()?;
        Ok(Self { status })
    }
}

/// LISTEN/NOTIFY delivery.
#[derive(Debug, Clone, Copy)]
pub struct NotificationResponse<'a> {
    pub pid: u32,
    pub channel: &'a str,
    pub payload: &'a str,
}

impl<'a> NotificationResponse<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let pid = r.u32()?;
        let channel = r.cstr()?;
        let payload = r.cstr()?;
        Ok(Self { pid, channel, payload })
    }
}
