//! Command pipeline state machine.
//!
//! Encodes one command at a time into the caller's output buffer and turns the
//! server's response messages into [`PgResult`]s. Only one command may be in
//! flight; a second `begin_*` before the first is drained is refused.

use std::collections::VecDeque;

use crate::error::{Error, ErrorFields, Result, Verbosity};
use crate::param::{Param, type_oids};
use crate::protocol::backend::{
    CommandComplete, CopyResponse, DataRow, ParameterDescription, RawMessage, ReadyForQuery,
    RowDescription, msg_type, parse_fields,
};
use crate::protocol::frontend::{
    Target, write_bind, write_copy_data, write_copy_done, write_copy_fail, write_describe,
    write_execute, write_parse, write_query, write_sync,
};
use crate::protocol::types::{FormatCode, Oid, tx_status};
use crate::result::{PgResult, ResultStatus};

/// Pipeline sub-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// No command in flight
    Idle,
    /// Waiting for the server
    Busy,
    /// COPY FROM STDIN: the caller streams data to the server
    CopyIn,
    /// COPY TO STDOUT: the server streams data to the caller
    CopyOut,
}

/// Which sub-protocol the in-flight command used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryClass {
    Simple,
    Extended,
    Prepare,
    Describe,
}

/// Most parameters a Bind message can carry.
pub const MAX_PARAMS: usize = i16::MAX as usize;

pub struct CommandPipeline {
    state: PipelineState,
    class: QueryClass,
    ready: VecDeque<PgResult>,
    /// TuplesOk result collecting DataRows
    building: Option<PgResult>,
    /// ParameterDescription of a statement Describe, waiting for its row shape
    described_params: Option<Vec<Oid>>,
    /// ErrorResponse that ended an extended-protocol COPY-in, held until
    /// [`CommandPipeline::copy_end`] sends the Sync the server waits for
    copy_error: Option<PgResult>,
    transaction_status: u8,
    verbosity: Verbosity,
}

impl Default for CommandPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandPipeline {
    pub fn new() -> Self {
        Self {
            state: PipelineState::Idle,
            class: QueryClass::Simple,
            ready: VecDeque::new(),
            building: None,
            described_params: None,
            copy_error: None,
            transaction_status: tx_status::IDLE,
            verbosity: Verbosity::Default,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn class(&self) -> QueryClass {
        self.class
    }

    /// Status byte of the last ReadyForQuery.
    pub fn transaction_status(&self) -> u8 {
        self.transaction_status
    }

    pub fn set_transaction_status(&mut self, status: u8) {
        self.transaction_status = status;
    }

    pub fn set_verbosity(&mut self, verbosity: Verbosity) {
        self.verbosity = verbosity;
    }

    /// Taking the next result would have to wait for the server.
    pub fn is_busy(&self) -> bool {
        self.ready.is_empty() && self.state == PipelineState::Busy
    }

    /// Forget everything, e.g. after the transport was replaced.
    pub fn reset(&mut self) {
        *self = Self {
            verbosity: self.verbosity,
            ..Self::new()
        };
    }

    fn begin(&mut self, class: QueryClass) -> Result<()> {
        if self.state != PipelineState::Idle || !self.ready.is_empty() {
            return Err(Error::Dispatch("another command is already in progress".into()));
        }
        self.class = class;
        self.building = None;
        self.described_params = None;
        self.copy_error = None;
        Ok(())
    }

    fn check_params(params: &[Param]) -> Result<()> {
        if params.len() > MAX_PARAMS {
            return Err(Error::Dispatch(format!(
                "number of parameters must be between 0 and {MAX_PARAMS}"
            )));
        }
        Ok(())
    }

    /// Strings go out NUL-terminated, so an embedded NUL would cut them short.
    fn check_cstr(what: &str, text: &str) -> Result<()> {
        if text.contains('\0') {
            return Err(Error::InvalidUsage(format!("{what} contains a NUL byte")));
        }
        Ok(())
    }

    /// Commit to the command whose bytes were just encoded.
    fn dispatched(&mut self) {
        self.state = PipelineState::Busy;
        tracing::debug!(class = ?self.class, "command dispatched");
    }

    pub fn begin_query(&mut self, out: &mut Vec<u8>, sql: &str) -> Result<()> {
        Self::check_cstr("query", sql)?;
        self.begin(QueryClass::Simple)?;
        write_query(out, sql);
        self.dispatched();
        Ok(())
    }

    /// Parse/Bind/Describe/Execute/Sync through the unnamed statement.
    pub fn begin_query_params(
        &mut self,
        out: &mut Vec<u8>,
        sql: &str,
        params: &[Param],
        result_format: FormatCode,
    ) -> Result<()> {
        Self::check_params(params)?;
        Self::check_cstr("query", sql)?;
        self.begin(QueryClass::Extended)?;
        write_parse(out, "", sql, &type_oids(params));
        write_bind(out, "", "", params, result_format);
        write_describe(out, Target::Portal, "");
        write_execute(out, "", 0);
        write_sync(out);
        self.dispatched();
        Ok(())
    }

    pub fn begin_prepare(
        &mut self,
        out: &mut Vec<u8>,
        name: &str,
        sql: &str,
        param_types: &[Oid],
    ) -> Result<()> {
        if param_types.len() > MAX_PARAMS {
            return Err(Error::Dispatch(format!(
                "number of parameters must be between 0 and {MAX_PARAMS}"
            )));
        }
        Self::check_cstr("statement name", name)?;
        Self::check_cstr("query", sql)?;
        self.begin(QueryClass::Prepare)?;
        write_parse(out, name, sql, param_types);
        write_sync(out);
        self.dispatched();
        Ok(())
    }

    pub fn begin_query_prepared(
        &mut self,
        out: &mut Vec<u8>,
        name: &str,
        params: &[Param],
        result_format: FormatCode,
    ) -> Result<()> {
        Self::check_params(params)?;
        Self::check_cstr("statement name", name)?;
        self.begin(QueryClass::Extended)?;
        write_bind(out, "", name, params, result_format);
        write_describe(out, Target::Portal, "");
        write_execute(out, "", 0);
        write_sync(out);
        self.dispatched();
        Ok(())
    }

    pub fn begin_describe(&mut self, out: &mut Vec<u8>, target: Target, name: &str) -> Result<()> {
        Self::check_cstr("name", name)?;
        self.begin(QueryClass::Describe)?;
        write_describe(out, target, name);
        write_sync(out);
        self.dispatched();
        Ok(())
    }

    /// Queue one CopyData message.
    pub fn copy_data(&mut self, out: &mut Vec<u8>, data: &[u8]) -> Result<()> {
        if self.state != PipelineState::CopyIn {
            return Err(Error::InvalidUsage("no COPY in progress".into()));
        }
        if self.copy_error.is_none() {
            write_copy_data(out, data);
        }
        Ok(())
    }

    /// Finish COPY-in with CopyDone, or abort it with CopyFail.
    pub fn copy_end(&mut self, out: &mut Vec<u8>, error: Option<&str>) -> Result<()> {
        if self.state != PipelineState::CopyIn {
            return Err(Error::InvalidUsage("no COPY in progress".into()));
        }
        if let Some(message) = error {
            Self::check_cstr("COPY failure message", message)?;
        }
        self.state = PipelineState::Busy;
        if let Some(failed) = self.copy_error.take() {
            tracing::debug!("COPY already failed on the server, sending Sync only");
            write_sync(out);
            self.push(failed);
            return Ok(());
        }
        match error {
            Some(message) => write_copy_fail(out, message),
            None => write_copy_done(out),
        }
        // The Sync sent with the command was ignored during COPY.
        if self.class != QueryClass::Simple {
            write_sync(out);
        }
        Ok(())
    }

    /// The server sent CopyDone; COPY-out is over.
    pub fn copy_out_finished(&mut self) {
        if self.state == PipelineState::CopyOut {
            self.state = PipelineState::Busy;
        }
    }

    /// Next result, if one is available without waiting.
    ///
    /// While a COPY is active this yields a fresh COPY result each time. Once
    /// the command is drained it yields `None`, and keeps doing so.
    pub fn next_result(&mut self) -> Option<PgResult> {
        if let Some(result) = self.ready.pop_front() {
            return Some(result);
        }
        match self.state {
            PipelineState::CopyIn => Some(PgResult::new(ResultStatus::CopyIn)),
            PipelineState::CopyOut => Some(PgResult::new(ResultStatus::CopyOut)),
            PipelineState::Idle | PipelineState::Busy => None,
        }
    }

    fn push(&mut self, result: PgResult) {
        if let Ok(status) = result.status() {
            tracing::debug!(status = status.name(), "result ready");
        }
        self.ready.push_back(result);
    }

    /// Abort the in-flight command because the connection failed.
    ///
    /// `message` becomes the error text of a final FatalError result.
    pub fn connection_lost(&mut self, message: &str) {
        self.building = None;
        if let Some(failed) = self.copy_error.take() {
            self.push(failed);
        }
        if self.state != PipelineState::Idle {
            let fields = ErrorFields::client("FATAL", message);
            let mut result = PgResult::from_error(ResultStatus::FatalError, fields, self.verbosity);
            result.set_error_message(format!("{}\n", message.trim_end()));
            self.push(result);
        }
        self.state = PipelineState::Idle;
    }

    /// Process one non-asynchronous backend message.
    ///
    /// An error return means the stream can no longer be trusted; the caller
    /// should drop the connection.
    pub fn handle(&mut self, msg: RawMessage<'_>) -> Result<()> {
        match self.handle_inner(msg) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.building = None;
                let text = err.to_string();
                let fields = ErrorFields::client("ERROR", text.clone());
                let mut result =
                    PgResult::from_error(ResultStatus::BadResponse, fields, self.verbosity);
                result.set_error_message(format!("{text}\n"));
                self.push(result);
                self.state = PipelineState::Idle;
                Err(err)
            }
        }
    }

    fn handle_inner(&mut self, msg: RawMessage<'_>) -> Result<()> {
        if self.state == PipelineState::Idle {
            // The server may report a fatal error (e.g. admin shutdown) while idle.
            if msg.type_byte == msg_type::ERROR_RESPONSE {
                let fields = parse_fields(msg.payload)?;
                self.push(PgResult::from_error(ResultStatus::FatalError, fields, self.verbosity));
                return Ok(());
            }
            return Err(Error::Protocol(format!(
                "message type 0x{:02x} arrived from server while idle",
                msg.type_byte
            )));
        }

        match msg.type_byte {
            msg_type::PARSE_COMPLETE => {
                if self.class == QueryClass::Prepare {
                    self.push(PgResult::new(ResultStatus::CommandOk));
                }
            }
            msg_type::BIND_COMPLETE | msg_type::CLOSE_COMPLETE | msg_type::PORTAL_SUSPENDED => {}
            msg_type::PARAMETER_DESCRIPTION => {
                let desc = ParameterDescription::parse(msg.payload)?;
                self.described_params = Some(desc.oids);
            }
            msg_type::ROW_DESCRIPTION => {
                let desc = RowDescription::parse(msg.payload)?;
                if self.class == QueryClass::Describe {
                    let mut result = PgResult::with_columns(ResultStatus::CommandOk, &desc.fields);
                    result.set_param_types(self.described_params.take().unwrap_or_default());
                    self.push(result);
                } else {
                    self.building = Some(PgResult::with_columns(ResultStatus::TuplesOk, &desc.fields));
                }
            }
            msg_type::NO_DATA => {
                if self.class == QueryClass::Describe {
                    let mut result = PgResult::new(ResultStatus::CommandOk);
                    result.set_param_types(self.described_params.take().unwrap_or_default());
                    self.push(result);
                }
            }
            msg_type::DATA_ROW => {
                let row = DataRow::parse(msg.payload)?;
                let building = self
                    .building
                    .as_mut()
                    .ok_or_else(|| Error::Protocol("server sent data (\"D\" message) without prior row description (\"T\" message)".into()))?;
                building.push_row(&row)?;
            }
            msg_type::COMMAND_COMPLETE => {
                let complete = CommandComplete::parse(msg.payload)?;
                let mut result = self
                    .building
                    .take()
                    .unwrap_or_else(|| PgResult::new(ResultStatus::CommandOk));
                result.set_cmd_status(complete.tag);
                self.push(result);
            }
            msg_type::EMPTY_QUERY_RESPONSE => {
                self.push(PgResult::new(ResultStatus::EmptyQuery));
            }
            msg_type::ERROR_RESPONSE => {
                let fields = parse_fields(msg.payload)?;
                self.building = None;
                let failed = PgResult::from_error(ResultStatus::FatalError, fields, self.verbosity);
                match self.state {
                    // The server discards input until a Sync; stay in COPY
                    // so that `copy_end` still sends one.
                    PipelineState::CopyIn if self.class != QueryClass::Simple => {
                        self.copy_error.get_or_insert(failed);
                    }
                    PipelineState::CopyIn | PipelineState::CopyOut => {
                        self.push(failed);
                        self.state = PipelineState::Busy;
                    }
                    PipelineState::Idle | PipelineState::Busy => self.push(failed),
                }
            }
            msg_type::COPY_IN_RESPONSE => {
                CopyResponse::parse(msg.payload)?;
                self.building = None;
                self.push(PgResult::new(ResultStatus::CopyIn));
                self.state = PipelineState::CopyIn;
            }
            msg_type::COPY_OUT_RESPONSE => {
                CopyResponse::parse(msg.payload)?;
                self.building = None;
                self.push(PgResult::new(ResultStatus::CopyOut));
                self.state = PipelineState::CopyOut;
            }
            msg_type::COPY_BOTH_RESPONSE => {
                return Err(Error::Unsupported("COPY BOTH (replication) is not supported".into()));
            }
            msg_type::COPY_DONE => self.copy_out_finished(),
            msg_type::READY_FOR_QUERY => {
                let ready = ReadyForQuery::parse(msg.payload)?;
                if self.building.is_some() {
                    return Err(Error::Protocol("ReadyForQuery before CommandComplete".into()));
                }
                self.transaction_status = ready.status;
                self.state = PipelineState::Idle;
                tracing::debug!(tx = %(ready.status as char), "command finished");
            }
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected response from server; first received character was \"{}\"",
                    other as char
                )));
            }
        }
        Ok(())
    }
}
