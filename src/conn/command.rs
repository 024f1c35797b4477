//! Command dispatch and result retrieval.

use crate::error::{Error, Result};
use crate::param::Param;
use crate::protocol::frontend::Target;
use crate::protocol::types::{FormatCode, Oid};
use crate::result::{PgResult, ResultStatus};
use crate::state::{CommandPipeline, PipelineState};
use crate::transport::Interest;

use super::{Conn, ConnStatus};

impl Conn {
    /// Send one or more SQL statements through the simple query protocol.
    ///
    /// Each statement yields its own result; drain them all with
    /// [`Conn::get_result`] before sending the next command.
    pub fn send_query(&mut self, sql: &str) -> Result<()> {
        self.dispatch(|pipeline, out| pipeline.begin_query(out, sql))
    }

    /// Send a single statement with `$n` parameters.
    pub fn send_query_params(
        &mut self,
        sql: &str,
        params: &[Param],
        result_format: FormatCode,
    ) -> Result<()> {
        self.dispatch(|pipeline, out| pipeline.begin_query_params(out, sql, params, result_format))
    }

    /// Create a named prepared statement. An empty name replaces the unnamed one.
    pub fn send_prepare(&mut self, name: &str, sql: &str, param_types: &[Oid]) -> Result<()> {
        self.dispatch(|pipeline, out| pipeline.begin_prepare(out, name, sql, param_types))
    }

    pub fn send_query_prepared(
        &mut self,
        name: &str,
        params: &[Param],
        result_format: FormatCode,
    ) -> Result<()> {
        self.dispatch(|pipeline, out| pipeline.begin_query_prepared(out, name, params, result_format))
    }

    /// Ask for a prepared statement's parameter types and result columns.
    pub fn send_describe_prepared(&mut self, name: &str) -> Result<()> {
        self.dispatch(|pipeline, out| pipeline.begin_describe(out, Target::Statement, name))
    }

    /// Ask for a portal's result columns.
    pub fn send_describe_portal(&mut self, name: &str) -> Result<()> {
        self.dispatch(|pipeline, out| pipeline.begin_describe(out, Target::Portal, name))
    }

    fn dispatch<F>(&mut self, encode: F) -> Result<()>
    where
        F: FnOnce(&mut CommandPipeline, &mut Vec<u8>) -> Result<()>,
    {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }
        if self.status != ConnStatus::Ok {
            return Err(Error::Dispatch("no connection to the server".into()));
        }
        let start = self.outbuf.len();
        encode(&mut self.pipeline, &mut self.outbuf)?;
        self.error_message.clear();
        self.trace_output(start);
        self.send_output()
            .map_err(|err| Error::Dispatch(err.to_string()))
    }

    /// Blocking mode writes everything; non-blocking mode writes what the
    /// socket takes right now.
    pub(super) fn send_output(&mut self) -> Result<()> {
        let sent = if self.nonblocking {
            self.write_out().map(drop)
        } else {
            self.flush_until(None).map(drop)
        };
        if let Err(err) = &sent {
            self.connection_lost(&err.to_string());
        }
        sent
    }

    /// Try to write queued output without waiting. `Ok(true)` once the output
    /// buffer is empty; call again when the socket is writable otherwise.
    pub fn flush(&mut self) -> Result<bool> {
        self.check_ready()?;
        let flushed = self.write_out();
        if let Err(err) = &flushed {
            self.connection_lost(&err.to_string());
        }
        flushed
    }

    /// Next result of the current command, or `None` once it is drained.
    ///
    /// Waits for the server while [`Conn::is_busy`] is true. `None` keeps
    /// coming back after the last result. While a COPY is running this
    /// returns a COPY result each time.
    pub fn get_result(&mut self) -> Result<Option<PgResult>> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }
        while self.pipeline.is_busy() {
            if self.has_pending_output() {
                if let Err(err) = self.flush_until(None) {
                    self.connection_lost(&err.to_string());
                    continue;
                }
            }
            self.wait_socket(Interest::Read, None)?;
            if let Err(err) = self.consume_input() {
                if self.pipeline.is_busy() {
                    return Err(err);
                }
            }
        }
        Ok(self.pipeline.next_result())
    }

    /// Ask the server to abandon the command in flight.
    ///
    /// Best effort: the command's results must still be drained, and may or
    /// may not report the cancellation.
    pub fn cancel(&self) -> Result<()> {
        if self.pipeline.state() == PipelineState::Idle {
            return Err(Error::CancelFailed("no command in progress".into()));
        }
        let token = self.cancel_token().ok_or_else(|| {
            Error::CancelFailed("no cancel key or server address for this connection".into())
        })?;
        token.cancel()
    }
}

/// Folds a command's results into the one a send-and-wait call reports.
///
/// The first error result wins; otherwise the last result does. A COPY
/// result ends the drain since the COPY calls take over from there.
#[derive(Debug, Default)]
pub(crate) struct LastResult {
    last: Option<PgResult>,
    error: Option<PgResult>,
}

impl LastResult {
    /// Returns `false` once draining should stop.
    pub(crate) fn push(&mut self, result: PgResult) -> Result<bool> {
        let status = result.status()?;
        if status.is_error() {
            if self.error.is_none() {
                self.error = Some(result);
            }
            return Ok(true);
        }
        self.last = Some(result);
        Ok(!matches!(status, ResultStatus::CopyIn | ResultStatus::CopyOut))
    }

    pub(crate) fn finish(self, conn: &Conn) -> Result<Option<PgResult>> {
        match self.error {
            Some(result) => Err(conn.command_error(result)),
            None => Ok(self.last),
        }
    }
}
