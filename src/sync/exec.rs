//! Send-and-wait command execution.

use std::time::Duration;

use crate::conn::{Conn, LastResult};
use crate::error::{Error, Result};
use crate::escape::escape_literal;
use crate::param::Param;
use crate::protocol::types::{FormatCode, Oid};
use crate::result::PgResult;

impl Conn {
    /// Run `sql` and return its last result.
    ///
    /// Error results become [`Error::Command`]. With several statements in
    /// `sql`, all results are drained and the first error wins.
    pub fn exec(&mut self, sql: &str) -> Result<PgResult> {
        self.send_query(sql)?;
        self.last_result()
    }

    /// Run one statement with `$n` parameters.
    pub fn exec_params(&mut self, sql: &str, params: &[Param], result_format: FormatCode) -> Result<PgResult> {
        self.send_query_params(sql, params, result_format)?;
        self.last_result()
    }

    pub fn prepare(&mut self, name: &str, sql: &str, param_types: &[Oid]) -> Result<PgResult> {
        self.send_prepare(name, sql, param_types)?;
        self.last_result()
    }

    pub fn exec_prepared(&mut self, name: &str, params: &[Param], result_format: FormatCode) -> Result<PgResult> {
        self.send_query_prepared(name, params, result_format)?;
        self.last_result()
    }

    pub fn describe_prepared(&mut self, name: &str) -> Result<PgResult> {
        self.send_describe_prepared(name)?;
        self.last_result()
    }

    pub fn describe_portal(&mut self, name: &str) -> Result<PgResult> {
        self.send_describe_portal(name)?;
        self.last_result()
    }

    /// [`Conn::exec`] (or [`Conn::exec_params`] when `params` is non-empty)
    /// that waits in [`Conn::block`] slices of `poll_interval`, so a caller
    /// can cancel from another thread meanwhile through a
    /// [`CancelToken`](crate::CancelToken).
    pub fn async_exec(&mut self, sql: &str, params: &[Param], poll_interval: Duration) -> Result<PgResult> {
        if params.is_empty() {
            self.send_query(sql)?;
        } else {
            self.send_query_params(sql, params, FormatCode::Text)?;
        }
        while !self.block(Some(poll_interval))? {
            tracing::trace!("command still running");
        }
        self.last_result()
    }

    /// Drain every result of the current command and return the last one.
    ///
    /// Stops early at a COPY result, which hands control to the COPY calls.
    /// `Ok(None)` when nothing was pending.
    pub fn get_last_result(&mut self) -> Result<Option<PgResult>> {
        let mut drain = LastResult::default();
        while let Some(result) = self.get_result()? {
            if !drain.push(result)? {
                break;
            }
        }
        drain.finish(self)
    }

    fn last_result(&mut self) -> Result<PgResult> {
        self.get_last_result()?
            .ok_or_else(|| Error::Protocol("server returned no result".into()))
    }

    /// `SET client_encoding`.
    pub fn set_client_encoding(&mut self, encoding: &str) -> Result<()> {
        self.exec(&format!("SET client_encoding TO {}", escape_literal(encoding)))?;
        Ok(())
    }
}
